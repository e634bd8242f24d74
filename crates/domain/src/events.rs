//! Client-facing events published on the per-run output stream
//! (`agent_run:{id}:stream`). Delivery is best-effort: the stream is
//! maxlen-capped with approximate trimming and lossy under backpressure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errmap::UserAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Per-stage latency breakdown attached to an `estimate` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimateBreakdown {
    pub prep: f64,
    pub llm: f64,
    pub tools: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutputEvent {
    #[serde(rename = "ack")]
    Ack {
        agent_run_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "estimate")]
    Estimate {
        estimated_seconds: f64,
        confidence: Confidence,
        #[serde(skip_serializing_if = "Option::is_none")]
        breakdown: Option<EstimateBreakdown>,
        message: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "prep_stage")]
    PrepStage {
        stage: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<u32>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "thinking")]
    Thinking {
        message: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "summarizing context")]
    SummarizingContext {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tokens_before: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tokens_after: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        messages_before: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        messages_after: Option<usize>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "context_usage")]
    ContextUsage {
        current_tokens: u64,
        message_count: usize,
        compressed: bool,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "degradation")]
    Degradation {
        component: String,
        message: String,
        severity: Severity,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_impact: Option<String>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "error")]
    Error {
        error: String,
        error_code: String,
        recoverable: bool,
        actions: Vec<UserAction>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "status")]
    Status {
        status: String,
        timestamp: DateTime<Utc>,
    },
}

impl OutputEvent {
    pub fn ack(agent_run_id: impl Into<String>) -> Self {
        Self::Ack {
            agent_run_id: agent_run_id.into(),
            message: "Working on your request...".into(),
            timestamp: Utc::now(),
        }
    }

    pub fn thinking() -> Self {
        Self::Thinking {
            message: "AI is processing your request...".into(),
            timestamp: Utc::now(),
        }
    }

    pub fn status(status: impl Into<String>) -> Self {
        Self::Status {
            status: status.into(),
            timestamp: Utc::now(),
        }
    }

    /// Event type label, as serialized in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ack { .. } => "ack",
            Self::Estimate { .. } => "estimate",
            Self::PrepStage { .. } => "prep_stage",
            Self::Thinking { .. } => "thinking",
            Self::SummarizingContext { .. } => "summarizing context",
            Self::ContextUsage { .. } => "context_usage",
            Self::Degradation { .. } => "degradation",
            Self::Error { .. } => "error",
            Self::Status { .. } => "status",
        }
    }
}
