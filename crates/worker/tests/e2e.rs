//! End-to-end scenarios over the in-memory broker, store, and a scripted
//! LLM provider: the full dispatch → prep → claim → execute → flush →
//! release path, plus crash recovery and the DLQ route.

use std::sync::Arc;
use std::time::Duration;

use fd_broker::{Broker, MemoryBroker};
use fd_domain::config::Config;
use fd_domain::message::{Message, ToolCall};
use fd_domain::run::{AgentConfig, RunRequest, RunStatus};
use fd_providers::{ScriptedProvider, ScriptedTurn};
use fd_store::{Database, MemoryStore};
use fd_worker::dispatcher::{admit_and_run, request_key};
use fd_worker::recovery::RecoverySweeper;
use fd_worker::state::WorkerState;
use fd_worker::tools::ToolRegistry;
use fd_worker::wal::WriteType;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Cluster {
    broker: Arc<MemoryBroker>,
    store: Arc<MemoryStore>,
}

impl Cluster {
    fn new() -> Self {
        let cluster = Self {
            broker: Arc::new(MemoryBroker::new()),
            store: Arc::new(MemoryStore::new()),
        };
        cluster.store.set_balance("acct", 100.0);
        cluster
    }

    /// Build one worker attached to the shared broker/store.
    fn worker(&self, worker_id: &str, turns: Vec<ScriptedTurn>) -> WorkerState {
        let mut config = Config::default();
        config.worker.worker_id = Some(worker_id.into());
        config.flusher.retry_base_delay_seconds = 0.001;
        config.flusher.retry_max_delay_seconds = 0.005;
        WorkerState::build(
            Arc::new(config),
            self.broker.clone() as Arc<dyn Broker>,
            self.store.clone() as Arc<dyn Database>,
            Arc::new(ScriptedProvider::new(turns)),
            Arc::new(ToolRegistry::with_builtins()),
            None,
        )
    }
}

fn request(run_id: &str, thread_id: &str) -> RunRequest {
    RunRequest {
        run_id: run_id.into(),
        thread_id: thread_id.into(),
        project_id: "p1".into(),
        account_id: "acct".into(),
        model_name: "gpt-4o".into(),
        agent_config: AgentConfig::default(),
        user_message: Some("please do the task".into()),
        skip_limits_check: false,
        enqueued_at: chrono::Utc::now(),
    }
}

async fn wait_for_status(broker: &MemoryBroker, run_id: &str, expected: &str) {
    for _ in 0..300 {
        if broker
            .get(&format!("run:{run_id}:status"))
            .await
            .unwrap()
            .as_deref()
            == Some(expected)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} never reached status {expected}");
}

async fn stream_events(broker: &MemoryBroker, run_id: &str) -> Vec<serde_json::Value> {
    broker
        .xrange(&format!("agent_run:{run_id}:stream"))
        .await
        .unwrap()
        .iter()
        .map(|e| serde_json::from_str(&e.payload).unwrap())
        .collect()
}

fn event_kinds(events: &[serde_json::Value]) -> Vec<String> {
    events
        .iter()
        .map(|e| e["type"].as_str().unwrap().to_owned())
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: happy path, no tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn happy_path_text_only() {
    let cluster = Cluster::new();
    cluster.store.seed_message(Message::user("t1", "earlier"));
    cluster.store.seed_message(Message::assistant("t1", "reply"));
    let state = cluster.worker("worker-a", vec![ScriptedTurn::text("hello")]);

    admit_and_run(state.clone(), request("r1", "t1")).await;
    wait_for_status(&cluster.broker, "r1", "completed").await;

    // One assistant message persisted (plus the triggering user message).
    let rows = cluster.store.messages_of("t1");
    let assistants: Vec<_> = rows
        .iter()
        .filter(|r| r.kind == "assistant" && r.content.to_string().contains("hello"))
        .collect();
    assert_eq!(assistants.len(), 1);

    // One aggregated credit deduction applied.
    let deductions = cluster.store.deductions();
    assert_eq!(deductions.len(), 1);
    assert_eq!(deductions[0].run_id, "r1");
    assert!(deductions[0].amount > 0.0);

    // Run record marked completed in the DB.
    assert_eq!(
        cluster.store.run_status("r1").unwrap().0,
        RunStatus::Completed
    );

    // WAL fully drained and cleaned.
    assert!(state.wal.get_pending("r1").await.unwrap().is_empty());

    // Stream carries ack, thinking, and a final status event.
    let events = stream_events(&cluster.broker, "r1").await;
    let kinds = event_kinds(&events);
    assert!(kinds.contains(&"ack".into()));
    assert!(kinds.contains(&"thinking".into()));
    assert_eq!(kinds.last().unwrap(), "status");
    assert_eq!(events.last().unwrap()["status"], "completed");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: tool turn with termination
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn terminating_tool_ends_the_loop() {
    let cluster = Cluster::new();
    let state = cluster.worker(
        "worker-a",
        vec![
            ScriptedTurn::with_tool_calls(
                "Wrapping up.",
                vec![ToolCall {
                    call_id: "tc_done".into(),
                    tool_name: "complete".into(),
                    arguments: serde_json::json!({"summary": "all set"}),
                }],
            ),
            // Would be consumed by a second turn — must stay untouched.
            ScriptedTurn::text("should never run"),
        ],
    );

    admit_and_run(state.clone(), request("r1", "t1")).await;
    wait_for_status(&cluster.broker, "r1", "completed").await;

    let rows = cluster.store.messages_of("t1");
    let assistant = rows
        .iter()
        .find(|r| r.kind == "assistant")
        .expect("assistant row");
    let meta = assistant.metadata.as_ref().expect("tool_calls metadata");
    assert_eq!(meta["tool_calls"][0]["tool_name"], "complete");

    let tool_rows: Vec<_> = rows.iter().filter(|r| r.kind == "tool").collect();
    assert_eq!(tool_rows.len(), 1);
    assert!(tool_rows[0].content.to_string().contains("all set"));

    // Exactly one LLM call: the loop exited after the terminal tool.
    assert!(state.wal.get_pending("r1").await.unwrap().is_empty());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: worker crash mid-run, another worker recovers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn crashed_worker_run_is_recovered() {
    let cluster = Cluster::new();

    // Worker A claims the run, appends turn-1 writes to the WAL, then
    // dies before flushing (SIGKILL: no release, no flush).
    let worker_a = cluster.worker("worker-a", vec![]);
    assert!(worker_a.ownership.claim("r1").await);
    let stashed = request("r1", "t1");
    cluster
        .broker
        .set(
            &request_key("r1"),
            &serde_json::to_string(&stashed).unwrap(),
            None,
        )
        .await
        .unwrap();
    worker_a
        .wal
        .append(
            "r1",
            WriteType::Message,
            serde_json::json!({
                "message_id": "m-turn1",
                "thread_id": "t1",
                "kind": "assistant",
                "content": {"text": "turn one output"},
                "metadata": null,
                "agent_id": null,
                "is_llm_message": true,
                "created_at": chrono::Utc::now(),
            }),
        )
        .await
        .unwrap();
    worker_a.idempotency.mark_step("r1", 1).await;

    // The heartbeat expires (simulated by deleting the TTL'd key).
    cluster.broker.delete("run:r1:heartbeat").await.unwrap();

    // Worker B's sweeper finds and reclaims the orphan.
    let worker_b = cluster.worker(
        "worker-b",
        vec![ScriptedTurn::with_tool_calls(
            "Resuming where we left off.",
            vec![ToolCall {
                call_id: "tc_done".into(),
                tool_name: "complete".into(),
                arguments: serde_json::json!({"summary": "recovered"}),
            }],
        )],
    );
    let sweeper = RecoverySweeper::new(worker_b.clone());
    let report = sweeper.sweep().await;
    assert_eq!(report.orphans_found, 1);
    assert_eq!(report.reclaimed, 1);

    wait_for_status(&cluster.broker, "r1", "completed").await;

    // B now owns nothing (released) and A's WAL entries reached the DB.
    let rows = cluster.store.messages_of("t1");
    assert!(
        rows.iter().any(|r| r.message_id == "m-turn1"),
        "turn-1 write from the dead worker must be persisted"
    );
    // B's own turn also landed.
    assert!(rows
        .iter()
        .any(|r| r.content.to_string().contains("Resuming where we left off")));
    assert_eq!(worker_b.metrics.runs_recovered.get(), 1);
    assert!(worker_b.wal.get_pending("r1").await.unwrap().is_empty());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: graceful shutdown hand-off via resumable
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn resumable_run_is_reclaimed_at_startup() {
    let cluster = Cluster::new();

    let worker_a = cluster.worker("worker-a", vec![]);
    assert!(worker_a.ownership.claim("r1").await);
    cluster
        .broker
        .set(
            &request_key("r1"),
            &serde_json::to_string(&request("r1", "t1")).unwrap(),
            None,
        )
        .await
        .unwrap();
    // Graceful shutdown marks the run resumable instead of terminal.
    assert!(worker_a.ownership.mark_resumable("r1").await);

    let worker_b = cluster.worker(
        "worker-b",
        vec![ScriptedTurn::text("picked up after restart")],
    );
    let sweeper = RecoverySweeper::new(worker_b.clone());
    let resumed = sweeper.recover_on_startup().await;
    assert_eq!(resumed, 1);

    wait_for_status(&cluster.broker, "r1", "completed").await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: compression cascade
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn oversized_context_is_compressed_before_the_call() {
    let cluster = Cluster::new();

    // Fill the thread past gpt-4o's 112k-token safety threshold even
    // after the 50-message history window (12000 chars ≈ 3000 tokens
    // per message).
    let blob = "x".repeat(12_000);
    for i in 0..60 {
        let message = if i % 2 == 0 {
            Message::user("t1", blob.clone())
        } else {
            Message::assistant("t1", blob.clone())
        };
        cluster.store.seed_message(message);
    }

    let state = cluster.worker(
        "worker-a",
        vec![
            // First chat() is the summarizer.
            ScriptedTurn::text("SUMMARY: a very long exchange. FACTS: none new."),
            // Then the actual turn proceeds on the compressed context.
            ScriptedTurn::text("answer on compressed context"),
        ],
    );

    admit_and_run(state.clone(), request("r1", "t1")).await;
    wait_for_status(&cluster.broker, "r1", "completed").await;

    let events = stream_events(&cluster.broker, "r1").await;
    let summarizing = events
        .iter()
        .find(|e| e["type"] == "summarizing context")
        .expect("summarizing context event");
    let before = summarizing["tokens_before"].as_u64().unwrap();
    let after = summarizing["tokens_after"].as_u64().unwrap();
    assert!(before > after, "compression must shrink the context");
    assert!(before > 112_000);

    let usage = events
        .iter()
        .find(|e| e["type"] == "context_usage")
        .expect("context_usage event");
    assert_eq!(usage["compressed"], true);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: insufficient credits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn insufficient_credits_blocks_before_any_side_effect() {
    let cluster = Cluster::new();
    cluster.store.set_balance("acct", 0.0);
    let state = cluster.worker("worker-a", vec![]);

    admit_and_run(state.clone(), request("r1", "t1")).await;

    // No ownership claim, no WAL entries, no DB writes.
    assert!(cluster.broker.get("run:r1:owner").await.unwrap().is_none());
    assert!(state.wal.get_pending("r1").await.unwrap().is_empty());
    assert_eq!(cluster.store.message_count("t1"), 0);
    assert!(cluster.store.deductions().is_empty());

    let events = stream_events(&cluster.broker, "r1").await;
    let error = events.iter().find(|e| e["type"] == "error").unwrap();
    assert_eq!(error["error_code"], "CREDIT_EXHAUSTED");
    let labels: Vec<&str> = error["actions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["label"].as_str().unwrap())
        .collect();
    assert_eq!(labels, vec!["Upgrade plan", "View usage"]);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: DLQ path
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn permanently_failing_write_routes_to_dlq() {
    let cluster = Cluster::new();
    let state = cluster.worker("worker-a", vec![]);
    state.write_buffer.register_run("r1", "acct");

    // Non-retryable DB failure for every attempt.
    cluster
        .store
        .fail_next_inserts(100, "unique constraint violated");
    state
        .wal
        .append(
            "r1",
            WriteType::Message,
            serde_json::json!({
                "message_id": "m-doomed",
                "thread_id": "t1",
                "kind": "assistant",
                "content": {"text": "never lands"},
                "metadata": null,
                "agent_id": null,
                "is_llm_message": true,
                "created_at": chrono::Utc::now(),
            }),
        )
        .await
        .unwrap();

    // Three flush cycles exhaust the retry budget.
    for _ in 0..3 {
        state.write_buffer.flush_one("r1").await;
    }

    let entries = state.dlq.get_entries(10, Some("r1")).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].attempt_count, 3);
    assert!(entries[0].error.contains("unique constraint"));

    // The WAL slot is freed and nothing counts as dropped.
    assert!(state.wal.get_pending("r1").await.unwrap().is_empty());
    assert_eq!(state.metrics.writes_dropped.get(), 0);

    // Operator retries the entry once the fault is gone.
    cluster.store.fail_next_inserts(0, "");
    assert!(state
        .dlq
        .retry_entry(&entries[0].entry_id, &state.wal)
        .await
        .unwrap());
    state.write_buffer.flush_one("r1").await;
    assert_eq!(cluster.store.message_count("t1"), 1);
    assert!(state.dlq.get_entries(10, None).await.is_empty());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: cancellation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn cancelled_run_releases_with_cancelled_status() {
    let cluster = Cluster::new();
    // Multi-turn script: echo tool keeps the loop alive so there is a
    // turn boundary for the cancellation to land on.
    let state = cluster.worker(
        "worker-a",
        vec![ScriptedTurn::with_tool_calls(
            "working...",
            vec![ToolCall {
                call_id: "tc_ask".into(),
                tool_name: "ask".into(),
                arguments: serde_json::json!({"text": "should I continue?"}),
            }],
        )],
    );

    // Cancel before the run starts: the first turn gate catches it.
    let cancel = state.cancel_map.register("r1");
    cancel.cancel();

    let prep = fd_worker::prep::run_prepare(
        &request("r1", "t1"),
        fd_worker::prep::PrepInputs {
            db: &state.db,
            registry: &state.tools,
            mcp: None,
            local_mode: false,
            message_fetch_timeout: Duration::from_secs(5),
            max_messages: 50,
            prefetched_messages: None,
        },
    )
    .await;
    assert!(state.ownership.claim("r1").await);
    let status =
        fd_worker::engine::run_agent(&state, &request("r1", "t1"), prep, cancel, 0).await;

    assert_eq!(status, RunStatus::Cancelled);
    assert_eq!(
        cluster
            .broker
            .get("run:r1:status")
            .await
            .unwrap()
            .as_deref(),
        Some("cancelled")
    );
    // The triggering user message was already appended; cancellation
    // never discards completed work.
    let rows = cluster.store.messages_of("t1");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].kind, "user");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: transient LLM failure retries in-turn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn transient_llm_errors_retry_then_succeed() {
    let cluster = Cluster::new();
    let state = cluster.worker(
        "worker-a",
        vec![
            ScriptedTurn::Fail("server overloaded".into()),
            ScriptedTurn::Fail("server overloaded".into()),
            ScriptedTurn::text("finally made it"),
        ],
    );

    admit_and_run(state.clone(), request("r1", "t1")).await;
    wait_for_status(&cluster.broker, "r1", "completed").await;

    let events = stream_events(&cluster.broker, "r1").await;
    // The second retry surfaces a degradation event.
    assert!(events.iter().any(|e| e["type"] == "degradation"));
    let rows = cluster.store.messages_of("t1");
    assert!(rows
        .iter()
        .any(|r| r.content.to_string().contains("finally made it")));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: XML dialect tool call
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn xml_tool_call_is_parsed_and_executed() {
    let cluster = Cluster::new();
    let xml_turn = "Done with everything.\n<function_calls>\n<invoke name=\"complete\">\n<parameter name=\"summary\">wrapped up via xml</parameter>\n</invoke>\n</function_calls>";
    let state = cluster.worker("worker-a", vec![ScriptedTurn::text(xml_turn)]);

    admit_and_run(state.clone(), request("r1", "t1")).await;
    wait_for_status(&cluster.broker, "r1", "completed").await;

    let rows = cluster.store.messages_of("t1");
    let assistant = rows.iter().find(|r| r.kind == "assistant").unwrap();
    // The XML block is stripped from the stored text.
    assert!(!assistant.content.to_string().contains("function_calls"));
    let meta = assistant.metadata.as_ref().unwrap();
    assert_eq!(meta["tool_calls"][0]["tool_name"], "complete");
    assert!(meta["tool_calls"][0]["call_id"]
        .as_str()
        .unwrap()
        .starts_with("xml_tool_index0_"));

    let tool_row = rows.iter().find(|r| r.kind == "tool").unwrap();
    assert!(tool_row.content.to_string().contains("wrapped up via xml"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: step cap
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn step_cap_fails_the_run() {
    let cluster = Cluster::new();
    // Every turn calls the non-terminating echo-ish `ask`? No — `ask`
    // terminates. Use an unknown tool: the loop continues on error
    // results, burning steps until the cap trips.
    let turns: Vec<ScriptedTurn> = (0..10)
        .map(|i| {
            ScriptedTurn::with_tool_calls(
                "looping",
                vec![ToolCall {
                    call_id: format!("tc_{i}"),
                    tool_name: "does_not_exist".into(),
                    arguments: serde_json::json!({}),
                }],
            )
        })
        .collect();

    let mut config = Config::default();
    config.worker.worker_id = Some("worker-a".into());
    config.coordination.max_steps = 3;
    config.flusher.retry_base_delay_seconds = 0.001;
    let state = WorkerState::build(
        Arc::new(config),
        cluster.broker.clone() as Arc<dyn Broker>,
        cluster.store.clone() as Arc<dyn Database>,
        Arc::new(ScriptedProvider::new(turns)),
        Arc::new(ToolRegistry::with_builtins()),
        None,
    );

    admit_and_run(state.clone(), request("r1", "t1")).await;
    wait_for_status(&cluster.broker, "r1", "failed").await;

    let events = stream_events(&cluster.broker, "r1").await;
    let error = events.iter().find(|e| e["type"] == "error").unwrap();
    assert_eq!(error["error_code"], "INTERNAL_ERROR");
}
