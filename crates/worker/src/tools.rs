//! Tool registry and dispatch.
//!
//! Tool implementations live outside the coordination core; the engine
//! sees them through the [`Tool`] trait. Dispatch enforces per-tier
//! access, supports sequential or parallel execution per the agent
//! config, and recognizes the terminating tools (`ask`, `complete`)
//! that end the run after their result is appended.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;

use fd_domain::message::{ToolCall, ToolDefinition};
use fd_domain::run::{TierInfo, ToolExecutionStrategy};
use fd_domain::Result;

use crate::cancel::CancelToken;

/// Tools whose invocation ends the run.
pub const TERMINATING_TOOLS: &[&str] = &["ask", "complete"];

pub fn is_terminating(tool_name: &str) -> bool {
    TERMINATING_TOOLS.contains(&tool_name)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the tool's parameters.
    fn parameters(&self) -> serde_json::Value;
    async fn execute(&self, arguments: &serde_json::Value, cancel: &CancelToken)
        -> Result<ToolOutcome>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Built-in terminating tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `ask` — the agent pauses the run with a question for the user.
pub struct AskTool;

#[async_trait::async_trait]
impl Tool for AskTool {
    fn name(&self) -> &str {
        "ask"
    }
    fn description(&self) -> &str {
        "Ask the user a question and end the run awaiting their reply."
    }
    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": {"type": "string", "description": "The question for the user"}
            },
            "required": ["text"]
        })
    }
    async fn execute(
        &self,
        arguments: &serde_json::Value,
        _cancel: &CancelToken,
    ) -> Result<ToolOutcome> {
        let text = arguments.get("text").and_then(|v| v.as_str()).unwrap_or("");
        Ok(ToolOutcome::ok(
            serde_json::json!({"status": "awaiting_user", "question": text}).to_string(),
        ))
    }
}

/// `complete` — the agent declares the task finished.
pub struct CompleteTool;

#[async_trait::async_trait]
impl Tool for CompleteTool {
    fn name(&self) -> &str {
        "complete"
    }
    fn description(&self) -> &str {
        "Mark the task as complete and end the run."
    }
    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "summary": {"type": "string", "description": "What was accomplished"}
            }
        })
    }
    async fn execute(
        &self,
        arguments: &serde_json::Value,
        _cancel: &CancelToken,
    ) -> Result<ToolOutcome> {
        let summary = arguments
            .get("summary")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        Ok(ToolOutcome::ok(
            serde_json::json!({"status": "complete", "summary": summary}).to_string(),
        ))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard registry: terminating tools are always present.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(AskTool));
        registry.register(Arc::new(CompleteTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_owned(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Schemas exposed to the LLM, filtered by the run's enabled set.
    pub fn definitions(&self, enabled: Option<&[String]>) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .filter(|t| {
                enabled.is_none_or(|set| set.iter().any(|n| n == t.name()))
            })
            .map(|t| ToolDefinition {
                name: t.name().to_owned(),
                description: t.description().to_owned(),
                parameters: t.parameters(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn dispatch_one(
    registry: &ToolRegistry,
    tier: &TierInfo,
    call: &ToolCall,
    cancel: &CancelToken,
) -> ToolOutcome {
    if !tier.allows_tool(&call.tool_name) {
        return ToolOutcome::error(
            serde_json::json!({
                "error": "access_denied",
                "message": format!(
                    "Tool '{}' is not available on the {} tier",
                    call.tool_name, tier.tier_name
                ),
            })
            .to_string(),
        );
    }

    let Some(tool) = registry.get(&call.tool_name) else {
        return ToolOutcome::error(
            serde_json::json!({
                "error": "unknown_tool",
                "message": format!("Tool '{}' is not registered", call.tool_name),
            })
            .to_string(),
        );
    };

    match tool.execute(&call.arguments, cancel).await {
        Ok(outcome) => outcome,
        // Tool errors are never fatal: they become error-shaped results.
        Err(e) => ToolOutcome::error(
            serde_json::json!({
                "error": "tool_execution_failed",
                "message": e.to_string(),
            })
            .to_string(),
        ),
    }
}

/// Execute a turn's tool calls. Results come back in call order for both
/// strategies. Cancellation between sequential calls yields error
/// results for the remaining calls (work already done is kept).
pub async fn execute_calls(
    registry: &ToolRegistry,
    tier: &TierInfo,
    strategy: ToolExecutionStrategy,
    calls: &[ToolCall],
    cancel: &CancelToken,
) -> Vec<(ToolCall, ToolOutcome)> {
    match strategy {
        ToolExecutionStrategy::Sequential => {
            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                if cancel.is_cancelled() {
                    results.push((
                        call.clone(),
                        ToolOutcome::error(
                            serde_json::json!({"error": "cancelled"}).to_string(),
                        ),
                    ));
                    continue;
                }
                let outcome = dispatch_one(registry, tier, call, cancel).await;
                results.push((call.clone(), outcome));
            }
            results
        }
        ToolExecutionStrategy::Parallel => {
            let futures = calls.iter().map(|call| async move {
                let outcome = dispatch_one(registry, tier, call, cancel).await;
                (call.clone(), outcome)
            });
            join_all(futures).await
        }
    }
}
