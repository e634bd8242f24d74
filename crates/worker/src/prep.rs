//! Preparation pipeline — the parallel precheck fan-out that gates every
//! run before ownership is claimed.
//!
//! All prechecks launch concurrently; total wall time is bounded by the
//! slowest one. Billing and limits failures carry their specific codes
//! (`INSUFFICIENT_CREDITS`, `AGENT_RUN_LIMIT_EXCEEDED`,
//! `MODEL_ACCESS_DENIED`); every other failure collapses to `PREP_ERROR`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use fd_domain::message::{Message, ToolDefinition};
use fd_domain::run::{RunRequest, TierInfo};
use fd_store::Database;

use crate::tools::ToolRegistry;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-task results
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct BillingResult {
    pub can_run: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimitsResult {
    pub can_run: bool,
    pub message: String,
    pub concurrent_runs: u32,
    pub concurrent_limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MessagesResult {
    pub messages: Vec<Message>,
    pub from_cache: bool,
    pub fetch_time_ms: f64,
}

#[derive(Debug, Clone)]
pub struct PromptResult {
    pub system_prompt: String,
    pub build_time_ms: f64,
}

#[derive(Debug, Clone)]
pub struct ToolsResult {
    pub schemas: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, Serialize)]
pub struct McpResult {
    pub initialized: bool,
    pub tool_count: usize,
}

/// Narrow seam to the JIT MCP loader; the platform wires a real one,
/// tests and bare workers run without.
#[async_trait::async_trait]
pub trait McpLoader: Send + Sync {
    /// Warm the loader (from cache when possible); returns the number of
    /// MCP tools discovered.
    async fn warm(&self, account_id: &str) -> fd_domain::Result<usize>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Aggregate result
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct PrepResult {
    pub billing: BillingResult,
    pub limits: LimitsResult,
    pub messages: MessagesResult,
    pub prompt: PromptResult,
    pub tools: ToolsResult,
    pub mcp: McpResult,
    pub tier: TierInfo,
    pub errors: Vec<String>,
    pub total_prep_time_ms: f64,
}

impl PrepResult {
    pub fn can_proceed(&self) -> bool {
        self.errors.is_empty() && self.billing.can_run && self.limits.can_run
    }

    /// `(error, error_code)` for the failing precheck, mirroring the
    /// `{type: "error", error, error_code}` response shape.
    pub fn error_response(&self) -> (String, String) {
        if !self.billing.can_run {
            return (
                self.billing.message.clone(),
                self.billing
                    .error_code
                    .clone()
                    .unwrap_or_else(|| "BILLING_ERROR".into()),
            );
        }
        if !self.limits.can_run {
            return (
                self.limits.message.clone(),
                self.limits
                    .error_code
                    .clone()
                    .unwrap_or_else(|| "LIMIT_EXCEEDED".into()),
            );
        }
        if !self.errors.is_empty() {
            return (self.errors.join("; "), "PREP_ERROR".into());
        }
        ("Unknown error during preparation".into(), "UNKNOWN_ERROR".into())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Individual prechecks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn prep_billing(db: &dyn Database, account_id: &str, local_mode: bool) -> BillingResult {
    if local_mode {
        return BillingResult {
            can_run: true,
            message: "Local mode".into(),
            balance: Some(999_999.0),
            error_code: None,
        };
    }

    match db.credit_balance(account_id).await {
        Ok(balance) if balance > 0.0 => BillingResult {
            can_run: true,
            message: "Credits reserved".into(),
            balance: Some(balance),
            error_code: None,
        },
        Ok(balance) => BillingResult {
            can_run: false,
            message: "Insufficient credits for this run.".into(),
            balance: Some(balance),
            error_code: Some("INSUFFICIENT_CREDITS".into()),
        },
        Err(e) => BillingResult {
            can_run: false,
            message: format!("Billing check failed: {e}"),
            balance: None,
            error_code: Some("BILLING_ERROR".into()),
        },
    }
}

async fn prep_limits(
    db: &dyn Database,
    request: &RunRequest,
    local_mode: bool,
) -> (LimitsResult, TierInfo) {
    let tier = db
        .tier_info(&request.account_id)
        .await
        .ok()
        .flatten()
        .unwrap_or_default();

    if request.skip_limits_check || local_mode {
        return (
            LimitsResult {
                can_run: true,
                message: "Limits check skipped".into(),
                concurrent_runs: 0,
                concurrent_limit: tier.concurrent_runs_limit,
                error_code: None,
            },
            tier,
        );
    }

    if !tier.allows_model(&request.model_name) {
        return (
            LimitsResult {
                can_run: false,
                message: format!(
                    "Model {} is not available on the {} tier.",
                    request.model_name, tier.tier_name
                ),
                concurrent_runs: 0,
                concurrent_limit: tier.concurrent_runs_limit,
                error_code: Some("MODEL_ACCESS_DENIED".into()),
            },
            tier,
        );
    }

    let running = match db.count_running_runs(&request.account_id).await {
        Ok(count) => count,
        Err(e) => {
            // Fail open: a limits-infra hiccup should not block users.
            tracing::error!(account_id = %request.account_id, error = %e, "limits check failed, allowing");
            return (
                LimitsResult {
                    can_run: true,
                    message: format!("Limits check failed (allowing): {e}"),
                    concurrent_runs: 0,
                    concurrent_limit: tier.concurrent_runs_limit,
                    error_code: None,
                },
                tier,
            );
        }
    };

    if running >= tier.concurrent_runs_limit {
        return (
            LimitsResult {
                can_run: false,
                message: format!(
                    "Maximum of {} concurrent runs. You have {} running.",
                    tier.concurrent_runs_limit, running
                ),
                concurrent_runs: running,
                concurrent_limit: tier.concurrent_runs_limit,
                error_code: Some("AGENT_RUN_LIMIT_EXCEEDED".into()),
            },
            tier,
        );
    }

    (
        LimitsResult {
            can_run: true,
            message: "Within limits".into(),
            concurrent_runs: running,
            concurrent_limit: tier.concurrent_runs_limit,
            error_code: None,
        },
        tier,
    )
}

/// Message-history fetch. A prefetch handle started by the dispatcher is
/// consumed when available; otherwise the fetch runs here, bounded by
/// the configured timeout.
async fn prep_messages(
    db: &Arc<dyn Database>,
    thread_id: &str,
    prefetch: Option<tokio::task::JoinHandle<Vec<Message>>>,
    fetch_timeout: Duration,
) -> (MessagesResult, Option<String>) {
    let start = Instant::now();

    if let Some(handle) = prefetch {
        match tokio::time::timeout(fetch_timeout, handle).await {
            Ok(Ok(messages)) => {
                return (
                    MessagesResult {
                        messages,
                        from_cache: true,
                        fetch_time_ms: start.elapsed().as_secs_f64() * 1000.0,
                    },
                    None,
                )
            }
            Ok(Err(e)) => tracing::warn!(thread_id, error = %e, "message prefetch panicked"),
            Err(_) => tracing::warn!(thread_id, "message prefetch timed out"),
        }
    }

    let fetch = db.fetch_messages(thread_id);
    match tokio::time::timeout(fetch_timeout, fetch).await {
        Ok(Ok(messages)) => (
            MessagesResult {
                messages,
                from_cache: false,
                fetch_time_ms: start.elapsed().as_secs_f64() * 1000.0,
            },
            None,
        ),
        Ok(Err(e)) => (
            MessagesResult {
                messages: Vec::new(),
                from_cache: false,
                fetch_time_ms: start.elapsed().as_secs_f64() * 1000.0,
            },
            Some(format!("message fetch failed: {e}")),
        ),
        Err(_) => (
            MessagesResult {
                messages: Vec::new(),
                from_cache: false,
                fetch_time_ms: start.elapsed().as_secs_f64() * 1000.0,
            },
            Some("message fetch timed out".into()),
        ),
    }
}

fn prep_prompt(request: &RunRequest) -> PromptResult {
    let start = Instant::now();
    let system_prompt = match &request.agent_config.system_prompt {
        Some(prompt) => prompt.clone(),
        None => format!(
            "You are a capable AI agent working inside project {}. \
             Use the available tools to accomplish the user's task. \
             Call `ask` when you need input from the user and `complete` \
             when the task is done.",
            request.project_id
        ),
    };
    PromptResult {
        system_prompt,
        build_time_ms: start.elapsed().as_secs_f64() * 1000.0,
    }
}

async fn prep_mcp(loader: Option<&Arc<dyn McpLoader>>, account_id: &str) -> (McpResult, Option<String>) {
    match loader {
        None => (
            McpResult {
                initialized: false,
                tool_count: 0,
            },
            None,
        ),
        Some(loader) => match loader.warm(account_id).await {
            Ok(tool_count) => (
                McpResult {
                    initialized: true,
                    tool_count,
                },
                None,
            ),
            // MCP is optional enrichment; the run continues without it.
            Err(e) => {
                tracing::warn!(account_id, error = %e, "MCP warm-up failed");
                (
                    McpResult {
                        initialized: false,
                        tool_count: 0,
                    },
                    None,
                )
            }
        },
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fan-out
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PrepInputs<'a> {
    pub db: &'a Arc<dyn Database>,
    pub registry: &'a ToolRegistry,
    pub mcp: Option<&'a Arc<dyn McpLoader>>,
    pub local_mode: bool,
    pub message_fetch_timeout: Duration,
    /// History window: only the most recent N messages enter the context.
    pub max_messages: usize,
    pub prefetched_messages: Option<tokio::task::JoinHandle<Vec<Message>>>,
}

/// Run all prechecks concurrently and aggregate the result.
pub async fn run_prepare(request: &RunRequest, inputs: PrepInputs<'_>) -> PrepResult {
    let start = Instant::now();

    let (billing, (limits, tier), (mut messages, messages_error), (mcp, mcp_error)) = tokio::join!(
        prep_billing(inputs.db.as_ref(), &request.account_id, inputs.local_mode),
        prep_limits(inputs.db.as_ref(), request, inputs.local_mode),
        prep_messages(
            inputs.db,
            &request.thread_id,
            inputs.prefetched_messages,
            inputs.message_fetch_timeout,
        ),
        prep_mcp(inputs.mcp, &request.account_id),
    );

    // Window the history: only the most recent messages reach the LLM.
    if messages.messages.len() > inputs.max_messages {
        let start = messages.messages.len() - inputs.max_messages;
        messages.messages.drain(..start);
    }

    // Prompt build and tool-schema materialization are compute-only.
    let prompt = prep_prompt(request);
    let tools = ToolsResult {
        schemas: inputs
            .registry
            .definitions(request.agent_config.enabled_tools.as_deref()),
    };

    let mut errors = Vec::new();
    if let Some(e) = messages_error {
        errors.push(e);
    }
    if let Some(e) = mcp_error {
        errors.push(e);
    }

    PrepResult {
        billing,
        limits,
        messages,
        prompt,
        tools,
        mcp,
        tier,
        errors,
        total_prep_time_ms: start.elapsed().as_secs_f64() * 1000.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fd_domain::run::AgentConfig;
    use fd_store::MemoryStore;

    fn request(account: &str, model: &str) -> RunRequest {
        RunRequest {
            run_id: "r1".into(),
            thread_id: "t1".into(),
            project_id: "p1".into(),
            account_id: account.into(),
            model_name: model.into(),
            agent_config: AgentConfig::default(),
            user_message: Some("do the thing".into()),
            skip_limits_check: false,
            enqueued_at: chrono::Utc::now(),
        }
    }

    fn inputs<'a>(
        db: &'a Arc<dyn Database>,
        registry: &'a ToolRegistry,
    ) -> PrepInputs<'a> {
        PrepInputs {
            db,
            registry,
            mcp: None,
            local_mode: false,
            message_fetch_timeout: Duration::from_secs(10),
            max_messages: 50,
            prefetched_messages: None,
        }
    }

    #[tokio::test]
    async fn history_is_windowed_to_max_messages() {
        let store = Arc::new(MemoryStore::new());
        store.set_balance("acct", 10.0);
        for i in 0..60 {
            store.seed_message(Message::user("t1", format!("msg {i}")));
        }
        let db: Arc<dyn Database> = store;
        let registry = ToolRegistry::with_builtins();

        let mut i = inputs(&db, &registry);
        i.max_messages = 10;
        let prep = run_prepare(&request("acct", "gpt-4o"), i).await;
        assert_eq!(prep.messages.messages.len(), 10);
        // The newest messages survive.
        assert_eq!(
            prep.messages.messages.last().unwrap().content.extract_all_text(),
            "msg 59"
        );
        assert_eq!(
            prep.messages.messages[0].content.extract_all_text(),
            "msg 50"
        );
    }

    #[tokio::test]
    async fn happy_path_proceeds() {
        let store = Arc::new(MemoryStore::new());
        store.set_balance("acct", 10.0);
        store.set_tier(
            "acct",
            TierInfo {
                tier_name: "pro".into(),
                concurrent_runs_limit: 5,
                allowed_models: vec![],
                allowed_tools: vec![],
            },
        );
        store.seed_message(Message::user("t1", "earlier message"));
        let db: Arc<dyn Database> = store.clone();
        let registry = ToolRegistry::with_builtins();

        let prep = run_prepare(&request("acct", "gpt-4o"), inputs(&db, &registry)).await;
        assert!(prep.can_proceed(), "{:?}", prep.errors);
        assert_eq!(prep.messages.messages.len(), 1);
        assert_eq!(prep.tools.schemas.len(), 2);
        assert!(prep.prompt.system_prompt.contains("p1"));
        assert_eq!(prep.tier.tier_name, "pro");
    }

    #[tokio::test]
    async fn zero_balance_blocks_with_insufficient_credits() {
        let store = Arc::new(MemoryStore::new());
        store.set_balance("acct", 0.0);
        let db: Arc<dyn Database> = store;
        let registry = ToolRegistry::with_builtins();

        let prep = run_prepare(&request("acct", "gpt-4o"), inputs(&db, &registry)).await;
        assert!(!prep.can_proceed());
        let (_, code) = prep.error_response();
        assert_eq!(code, "INSUFFICIENT_CREDITS");
    }

    #[tokio::test]
    async fn at_concurrent_limit_blocks() {
        let store = Arc::new(MemoryStore::new());
        store.set_balance("acct", 10.0);
        store.set_tier(
            "acct",
            TierInfo {
                tier_name: "free".into(),
                concurrent_runs_limit: 2,
                allowed_models: vec![],
                allowed_tools: vec![],
            },
        );
        // Exactly at the limit → refused.
        store.set_running_runs("acct", 2);
        let db: Arc<dyn Database> = store.clone();
        let registry = ToolRegistry::with_builtins();

        let prep = run_prepare(&request("acct", "gpt-4o"), inputs(&db, &registry)).await;
        assert!(!prep.can_proceed());
        let (message, code) = prep.error_response();
        assert_eq!(code, "AGENT_RUN_LIMIT_EXCEEDED");
        assert!(message.contains("2 concurrent"));

        // One below the limit → allowed.
        store.set_running_runs("acct", 1);
        let prep = run_prepare(&request("acct", "gpt-4o"), inputs(&db, &registry)).await;
        assert!(prep.can_proceed());
    }

    #[tokio::test]
    async fn disallowed_model_blocks() {
        let store = Arc::new(MemoryStore::new());
        store.set_balance("acct", 10.0);
        store.set_tier(
            "acct",
            TierInfo {
                tier_name: "free".into(),
                concurrent_runs_limit: 5,
                allowed_models: vec!["gpt-4o-mini".into()],
                allowed_tools: vec![],
            },
        );
        let db: Arc<dyn Database> = store;
        let registry = ToolRegistry::with_builtins();

        let prep = run_prepare(&request("acct", "gpt-4o"), inputs(&db, &registry)).await;
        assert!(!prep.can_proceed());
        let (_, code) = prep.error_response();
        assert_eq!(code, "MODEL_ACCESS_DENIED");
    }

    #[tokio::test]
    async fn local_mode_bypasses_billing_and_limits() {
        let store = Arc::new(MemoryStore::new());
        // Zero balance and over limit — local mode ignores both.
        store.set_balance("acct", 0.0);
        store.set_running_runs("acct", 99);
        let db: Arc<dyn Database> = store;
        let registry = ToolRegistry::with_builtins();

        let mut i = inputs(&db, &registry);
        i.local_mode = true;
        let prep = run_prepare(&request("acct", "gpt-4o"), i).await;
        assert!(prep.can_proceed());
    }

    #[tokio::test]
    async fn prefetched_messages_are_preferred() {
        let store = Arc::new(MemoryStore::new());
        store.set_balance("acct", 10.0);
        let db: Arc<dyn Database> = store;
        let registry = ToolRegistry::with_builtins();

        let prefetch = tokio::spawn(async { vec![Message::user("t1", "prefetched")] });
        let mut i = inputs(&db, &registry);
        i.prefetched_messages = Some(prefetch);

        let prep = run_prepare(&request("acct", "gpt-4o"), i).await;
        assert!(prep.messages.from_cache);
        assert_eq!(
            prep.messages.messages[0].content.extract_all_text(),
            "prefetched"
        );
    }

    #[tokio::test]
    async fn enabled_tools_filter_schemas() {
        let store = Arc::new(MemoryStore::new());
        store.set_balance("acct", 10.0);
        let db: Arc<dyn Database> = store;
        let registry = ToolRegistry::with_builtins();

        let mut req = request("acct", "gpt-4o");
        req.agent_config.enabled_tools = Some(vec!["complete".into()]);
        let prep = run_prepare(&req, inputs(&db, &registry)).await;
        assert_eq!(prep.tools.schemas.len(), 1);
        assert_eq!(prep.tools.schemas[0].name, "complete");
    }
}
