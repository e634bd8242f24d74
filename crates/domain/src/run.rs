use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Voluntarily released by a gracefully-shutting-down worker; any
    /// worker may reclaim it.
    Resumable,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Resumable => "resumable",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "resumable" => Some(Self::Resumable),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run request (input stream payload)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a turn's tool calls are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolExecutionStrategy {
    #[default]
    Sequential,
    Parallel,
}

/// Per-run agent configuration carried in the request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub tool_execution_strategy: ToolExecutionStrategy,
    /// How many turns may auto-continue after a text-only response.
    #[serde(default = "d_auto_continues")]
    pub native_max_auto_continues: u32,
    /// Optional system-prompt override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Restrict the run to these tools (None = tier default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_tools: Option<Vec<String>>,
}

fn d_auto_continues() -> u32 {
    25
}

/// A run request pulled from the input stream by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub run_id: String,
    pub thread_id: String,
    pub project_id: String,
    pub account_id: String,
    pub model_name: String,
    #[serde(default)]
    pub agent_config: AgentConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
    #[serde(default)]
    pub skip_limits_check: bool,
    #[serde(default = "Utc::now")]
    pub enqueued_at: DateTime<Utc>,
}

impl RunRequest {
    /// The per-run client output stream key.
    pub fn stream_key(&self) -> String {
        format!("agent_run:{}:stream", self.run_id)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tier info (consumed, not owned)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-account limit bundle resolved by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierInfo {
    pub tier_name: String,
    pub concurrent_runs_limit: u32,
    /// Models this tier may use. Empty = all models.
    #[serde(default)]
    pub allowed_models: Vec<String>,
    /// Tools this tier may invoke. Empty = all tools.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
}

impl TierInfo {
    pub fn allows_model(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == model)
    }

    pub fn allows_tool(&self, tool: &str) -> bool {
        self.allowed_tools.is_empty() || self.allowed_tools.iter().any(|t| t == tool)
    }
}

impl Default for TierInfo {
    fn default() -> Self {
        Self {
            tier_name: "free".into(),
            concurrent_runs_limit: 1,
            allowed_models: Vec::new(),
            allowed_tools: Vec::new(),
        }
    }
}
