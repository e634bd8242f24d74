//! Execution engine — the agent turn loop.
//!
//! Per turn: check cancellation → compress if needed → stream the LLM
//! call → parse tool calls (native and XML dialect) → execute tools →
//! append every side effect to the WAL → decide whether to loop.
//! Terminating tools (`ask`, `complete`) end the run; step and wall-clock
//! caps bound it; every terminal path appends a status write, flushes,
//! and releases ownership.

pub mod xml;

use std::time::{Duration, Instant};

use futures_util::StreamExt;
use uuid::Uuid;

use fd_domain::errmap::ErrorCode;
use fd_domain::events::Severity;
use fd_domain::message::{Message, Role, ToolCall};
use fd_domain::run::{RunRequest, RunStatus};
use fd_domain::stream::{StreamEvent, Usage};
use fd_domain::Error;
use fd_providers::ChatRequest;

use crate::cancel::CancelToken;
use crate::prep::PrepResult;
use crate::state::WorkerState;
use crate::tools;
use crate::wal::WriteType;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn-local state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Carries the auto-continue window across turns of one invocation.
struct AutoContinueState {
    count: u32,
    accumulated_content: String,
    error_retry_count: u32,
    tool_result_tokens: u64,
}

/// What one streamed LLM call produced.
struct TurnOutput {
    text: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
    cancelled: bool,
}

/// Why the engine stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    Cancelled,
    Failed(String),
}

impl StopReason {
    fn status(&self) -> RunStatus {
        match self {
            Self::Completed => RunStatus::Completed,
            Self::Cancelled => RunStatus::Cancelled,
            Self::Failed(_) => RunStatus::Failed,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run the agent loop for a claimed run. Assumes ownership is already
/// held; releases it on every exit path. `resume_from_step` is 0 for
/// fresh runs and `last_step + 1` when a sweeper resumes an orphan.
pub async fn run_agent(
    state: &WorkerState,
    request: &RunRequest,
    prep: PrepResult,
    cancel: CancelToken,
    resume_from_step: u32,
) -> RunStatus {
    let run_id = request.run_id.as_str();
    let thread_id = request.thread_id.as_str();
    let stream_key = request.stream_key();
    let start = Instant::now();
    let coordination = &state.config.coordination;

    state.write_buffer.register_run(run_id, &request.account_id);
    state.metrics.record_run_started();

    // The triggering user message joins the context and the WAL.
    let mut messages = prep.messages.messages;
    if let Some(user_text) = &request.user_message {
        let user_message = Message::user(thread_id, user_text.clone());
        if state
            .idempotency
            .check_and_mark(run_id, resume_from_step, "user_message")
            .await
        {
            append_message(state, run_id, &user_message).await;
        }
        messages.push(user_message);
    }

    let system_prompt = prep.prompt.system_prompt;
    let tool_defs = prep.tools.schemas;
    let tier = prep.tier;

    let mut auto = AutoContinueState {
        count: 0,
        accumulated_content: String::new(),
        error_retry_count: 0,
        tool_result_tokens: 0,
    };
    let mut step = resume_from_step;
    let mut prep_recorded = false;
    let mut llm_seconds_total = 0.0;
    let mut tool_seconds_total = 0.0;
    let mut total_usage = Usage::default();

    let stop = 'turns: loop {
        // ── Global caps ──────────────────────────────────────────────
        if step >= coordination.max_steps {
            break StopReason::Failed("step_cap".into());
        }
        if start.elapsed().as_secs() >= coordination.max_duration_seconds {
            break StopReason::Failed("duration_cap".into());
        }

        // ── Cancellation gate ────────────────────────────────────────
        if cancel.is_cancelled() {
            break StopReason::Cancelled;
        }

        step += 1;
        let step_start = Instant::now();

        // ── Compression gate ─────────────────────────────────────────
        let outcome = state
            .compressor
            .check_and_compress(messages, &system_prompt, &request.model_name)
            .await;
        if outcome.compressed {
            state
                .publisher
                .summarizing(
                    &stream_key,
                    "completed",
                    outcome.tokens_before,
                    Some(outcome.actual_tokens),
                    Some(outcome.messages_before),
                    Some(outcome.messages.len()),
                )
                .await;
        }
        let mut current_tokens = outcome.actual_tokens;
        messages = outcome.messages;
        let mut compressed_this_turn = outcome.compressed;

        // Late pass: tool schemas ride along with the request and can
        // push an under-threshold conversation over. Re-count once.
        if !compressed_this_turn {
            let schema_overhead = tool_defs
                .iter()
                .map(|d| {
                    state.compressor.counter().count_text(
                        &request.model_name,
                        &serde_json::to_string(d).unwrap_or_default(),
                    )
                })
                .sum::<u64>();
            if current_tokens + schema_overhead
                >= state.compressor.threshold_for(&request.model_name)
            {
                let late = state
                    .compressor
                    .force_compress(messages, &system_prompt, &request.model_name)
                    .await;
                if late.compressed {
                    state
                        .publisher
                        .summarizing(
                            &stream_key,
                            "completed",
                            late.tokens_before,
                            Some(late.actual_tokens),
                            Some(late.messages_before),
                            Some(late.messages.len()),
                        )
                        .await;
                    current_tokens = late.actual_tokens;
                    compressed_this_turn = true;
                }
                messages = late.messages;
            }
        }

        state
            .publisher
            .context_usage(&stream_key, current_tokens, messages.len(), compressed_this_turn)
            .await;
        state.publisher.thinking(&stream_key).await;

        // ── LLM call with in-turn retries ────────────────────────────
        let llm_start = Instant::now();
        let turn = loop {
            let req = ChatRequest {
                messages: messages.clone(),
                tools: tool_defs.clone(),
                temperature: Some(0.2),
                max_tokens: None,
                model: Some(request.model_name.clone()),
            };

            match stream_llm_turn(state, &req, &cancel).await {
                Ok(turn) => break turn,
                Err(e) => {
                    let message = e.to_string();

                    if is_context_length_error(&message) {
                        // Force one compression retry, then give up.
                        if compressed_this_turn {
                            break 'turns StopReason::Failed("CONTEXT_TOO_LONG".into());
                        }
                        state
                            .publisher
                            .summarizing(&stream_key, "started", Some(current_tokens), None, None, None)
                            .await;
                        let forced = state
                            .compressor
                            .force_compress(messages, &system_prompt, &request.model_name)
                            .await;
                        if !forced.compressed {
                            break 'turns StopReason::Failed("CONTEXT_TOO_LONG".into());
                        }
                        current_tokens = forced.actual_tokens;
                        messages = forced.messages;
                        compressed_this_turn = true;
                        continue;
                    }

                    if e.is_transient()
                        && auto.error_retry_count < state.config.llm.error_retry_count
                    {
                        auto.error_retry_count += 1;
                        if auto.error_retry_count >= 2 {
                            state
                                .publisher
                                .degradation(
                                    &stream_key,
                                    "llm",
                                    "The AI service is responding slowly; retrying.",
                                    Severity::Warning,
                                )
                                .await;
                        }
                        let delay = Duration::from_millis(
                            500 * 2u64.pow(auto.error_retry_count.saturating_sub(1)),
                        );
                        tracing::warn!(
                            run_id,
                            attempt = auto.error_retry_count,
                            error = %message,
                            "transient LLM failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    break 'turns StopReason::Failed(message);
                }
            }
        };
        auto.error_retry_count = 0;
        llm_seconds_total += llm_start.elapsed().as_secs_f64();

        if turn.cancelled {
            break StopReason::Cancelled;
        }

        if let Some(usage) = &turn.usage {
            total_usage.add(usage);
        }

        // ── Parse tool calls: native first, XML dialect fallback ─────
        let assistant_message_id = Uuid::new_v4().to_string();
        let (assistant_text, mut tool_calls) = if turn.tool_calls.is_empty()
            && xml::contains_xml_tool_calls(&turn.text)
        {
            let calls = xml::parse_xml_tool_calls(&turn.text, &assistant_message_id);
            (xml::strip_xml_tool_calls(&turn.text), calls)
        } else {
            (turn.text.clone(), turn.tool_calls)
        };
        if tool_calls.len() > coordination.max_tool_results {
            tracing::warn!(
                run_id,
                requested = tool_calls.len(),
                cap = coordination.max_tool_results,
                "tool calls exceed per-turn cap, truncating"
            );
            tool_calls.truncate(coordination.max_tool_results);
        }

        // ── Append assistant message ─────────────────────────────────
        let mut assistant_message =
            Message::assistant_with_tool_calls(thread_id, &assistant_text, &tool_calls);
        assistant_message.message_id = assistant_message_id;
        if state
            .idempotency
            .check_and_mark(run_id, step, "assistant")
            .await
        {
            append_message(state, run_id, &assistant_message).await;
        }
        messages.push(assistant_message);

        // ── Execute tool calls ───────────────────────────────────────
        let mut terminal_tool = false;
        if !tool_calls.is_empty() {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }

            let tool_start = Instant::now();
            let results = tools::execute_calls(
                &state.tools,
                &tier,
                request.agent_config.tool_execution_strategy,
                &tool_calls,
                &cancel,
            )
            .await;
            tool_seconds_total += tool_start.elapsed().as_secs_f64();

            for (call, outcome) in results {
                if tools::is_terminating(&call.tool_name) && !outcome.is_error {
                    terminal_tool = true;
                }

                let content = clamp_content(&outcome.content, coordination.max_content_length);
                auto.tool_result_tokens += state
                    .compressor
                    .counter()
                    .count_text(&request.model_name, &content);

                let result_message =
                    Message::tool_result(thread_id, &call.call_id, content, outcome.is_error);
                let op = format!("tool:{}", call.call_id);
                if state.idempotency.check_and_mark(run_id, step, &op).await {
                    append_message(state, run_id, &result_message).await;
                }
                messages.push(result_message);
            }
        }

        // ── Credit entry for the turn ────────────────────────────────
        if let Some(usage) = &turn.usage {
            let amount = state
                .config
                .llm
                .model_info(&request.model_name)
                .map(|m| m.estimate_cost(usage.prompt_tokens, usage.completion_tokens))
                .unwrap_or(0.0);
            if state.idempotency.check_and_mark(run_id, step, "credit").await {
                let data = serde_json::json!({
                    "amount": amount,
                    "thread_id": thread_id,
                    "run_id": run_id,
                    "model": request.model_name,
                    "prompt_tokens": usage.prompt_tokens,
                    "completion_tokens": usage.completion_tokens,
                });
                if let Err(e) = state.wal.append(run_id, WriteType::Credit, data).await {
                    tracing::error!(run_id, error = %e, "credit append failed");
                }
            }
        }

        state.idempotency.mark_step(run_id, step).await;
        state
            .metrics
            .step_latency
            .observe(step_start.elapsed().as_secs_f64());

        if !prep_recorded {
            // First turn done: feed the estimator with real latencies.
            state.estimator.record(
                &request.model_name,
                prep.total_prep_time_ms / 1000.0,
                llm_seconds_total,
                tool_seconds_total,
            );
            prep_recorded = true;
        }

        // ── Loop decision ────────────────────────────────────────────
        if terminal_tool {
            break StopReason::Completed;
        }
        if !tool_calls.is_empty() {
            continue;
        }

        // No tool calls: a truncated generation may auto-continue,
        // anything else is the final answer.
        if turn.finish_reason.as_deref() == Some("length")
            && auto.count < request.agent_config.native_max_auto_continues
        {
            auto.count += 1;
            auto.accumulated_content.push_str(&assistant_text);
            tracing::debug!(run_id, auto_continues = auto.count, "auto-continuing truncated turn");
            continue;
        }
        break StopReason::Completed;
    };

    tracing::debug!(
        run_id,
        auto_continues = auto.count,
        accumulated_chars = auto.accumulated_content.len(),
        tool_result_tokens = auto.tool_result_tokens,
        "turn loop exited"
    );
    finish_run(state, request, &stream_key, stop, step, start).await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Issue one streaming LLM call and accumulate its events. Cancellation
/// abandons the stream by dropping the handle.
async fn stream_llm_turn(
    state: &WorkerState,
    req: &ChatRequest,
    cancel: &CancelToken,
) -> fd_domain::Result<TurnOutput> {
    let call_timeout = Duration::from_secs(state.config.llm.call_timeout_seconds);
    let consume = async {
        let mut stream = state.llm.chat_stream(req).await?;

        let mut text = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut usage: Option<Usage> = None;
        let mut finish_reason: Option<String> = None;
        // In-flight calls as (call_id, name, argument fragments), in
        // arrival order. OpenAI-shaped providers never send a Finished
        // event, so these are assembled after the stream closes.
        let mut partial: Vec<(String, String, String)> = Vec::new();

        while let Some(event) = stream.next().await {
            if cancel.is_cancelled() {
                return Ok(TurnOutput {
                    text,
                    tool_calls,
                    usage,
                    finish_reason,
                    cancelled: true,
                });
            }
            match event? {
                StreamEvent::Token { text: t } => text.push_str(&t),
                StreamEvent::Thinking { .. } => {}
                StreamEvent::ToolCallStarted { call_id, tool_name } => {
                    partial.push((call_id, tool_name, String::new()));
                }
                StreamEvent::ToolCallDelta { call_id, delta } => {
                    match partial.iter_mut().find(|(id, _, _)| *id == call_id) {
                        Some((_, _, args)) => args.push_str(&delta),
                        // A fragment for a call we never saw start is
                        // kept rather than dropped; the name may arrive
                        // later or the call surfaces as unknown-tool.
                        None => partial.push((call_id, String::new(), delta)),
                    }
                }
                StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                } => {
                    partial.retain(|(id, _, _)| *id != call_id);
                    tool_calls.push(ToolCall {
                        call_id,
                        tool_name,
                        arguments,
                    });
                }
                StreamEvent::Done {
                    usage: u,
                    finish_reason: fr,
                } => {
                    if u.is_some() {
                        usage = u;
                    }
                    if fr.is_some() {
                        finish_reason = fr;
                    }
                }
                StreamEvent::Error { message } => {
                    return Err(Error::Provider {
                        provider: "stream".into(),
                        message,
                    })
                }
            }
        }

        // Assemble calls that never saw a Finished event, in the order
        // their first fragment arrived.
        for (call_id, tool_name, args) in partial.drain(..) {
            let arguments = if args.trim().is_empty() {
                serde_json::Value::Object(Default::default())
            } else {
                serde_json::from_str(&args).unwrap_or_else(|e| {
                    tracing::warn!(call_id = %call_id, error = %e, "tool call arguments are not valid JSON");
                    serde_json::Value::Object(Default::default())
                })
            };
            if tool_name.is_empty() {
                tracing::warn!(call_id = %call_id, "tool call fragments arrived without a start event");
            }
            tool_calls.push(ToolCall {
                call_id,
                tool_name,
                arguments,
            });
        }

        Ok(TurnOutput {
            text,
            tool_calls,
            usage,
            finish_reason,
            cancelled: false,
        })
    };

    match tokio::time::timeout(call_timeout, consume).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!(
            "LLM call exceeded {}s",
            call_timeout.as_secs()
        ))),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Terminal path
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Every exit goes through here: append the status write, flush, clean
/// the WAL when drained, release ownership, emit the final event.
async fn finish_run(
    state: &WorkerState,
    request: &RunRequest,
    stream_key: &str,
    stop: StopReason,
    step: u32,
    start: Instant,
) -> RunStatus {
    let run_id = request.run_id.as_str();
    let status = stop.status();
    let error = match &stop {
        StopReason::Failed(e) => Some(e.clone()),
        _ => None,
    };

    // Status write is durable through the same WAL as everything else.
    if state.idempotency.check_and_mark(run_id, step, "status").await {
        let data = serde_json::json!({
            "status": status.as_str(),
            "error": error,
        });
        if let Err(e) = state.wal.append(run_id, WriteType::Status, data).await {
            tracing::error!(run_id, error = %e, "status append failed");
        }
    }

    let flush = state.write_buffer.flush_one(run_id).await;
    let drained = state
        .wal
        .get_pending(run_id)
        .await
        .map(|p| p.is_empty())
        .unwrap_or(false);
    if drained {
        let _ = state.wal.cleanup_run(run_id).await;
        state.write_buffer.unregister_run(run_id);
    } else {
        tracing::warn!(
            run_id,
            failed = flush.failed_count,
            "terminal flush left pending entries, keeping run registered"
        );
    }

    state.ownership.release(run_id, status).await;
    state.cancel_map.remove(run_id);

    let duration = start.elapsed().as_secs_f64();
    match &stop {
        StopReason::Completed => state.metrics.record_run_completed(duration),
        StopReason::Cancelled => state.metrics.record_run_cancelled(duration),
        StopReason::Failed(_) => state.metrics.record_run_failed(duration),
    }

    match &stop {
        StopReason::Failed(message) => {
            let code = match message.as_str() {
                "CONTEXT_TOO_LONG" => Some(ErrorCode::ContextTooLong),
                "step_cap" | "duration_cap" => Some(ErrorCode::InternalError),
                _ => None,
            };
            let mapped = state.mapper.map_message(message, code);
            state.publisher.user_error(stream_key, &mapped).await;
        }
        StopReason::Cancelled => {
            state.publisher.status(stream_key, "cancelled").await;
        }
        StopReason::Completed => {}
    }
    state.publisher.status(stream_key, status.as_str()).await;

    tracing::info!(
        run_id,
        status = status.as_str(),
        steps = step,
        duration_secs = duration,
        "run finished"
    );
    status
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn append_message(state: &WorkerState, run_id: &str, message: &Message) {
    let row = serde_json::json!({
        "message_id": message.message_id,
        "thread_id": message.thread_id,
        "kind": role_str(message.role),
        "content": message.content,
        "metadata": message.metadata,
        "agent_id": null,
        "is_llm_message": message.is_llm_message,
        "created_at": message.created_at,
    });
    if let Err(e) = state.wal.append(run_id, WriteType::Message, row).await {
        tracing::error!(run_id, error = %e, "message append failed");
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
        Role::Status => "status",
        Role::ImageContext => "image_context",
    }
}

fn clamp_content(content: &str, max: usize) -> String {
    if content.len() <= max {
        return content.to_owned();
    }
    let mut end = max;
    while !content.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    format!("{}\n[truncated {} bytes]", &content[..end], content.len() - end)
}

fn is_context_length_error(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("context length")
        || m.contains("context_length")
        || m.contains("maximum context")
        || m.contains("token limit")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_length_detection() {
        assert!(is_context_length_error(
            "This model's maximum context length is 128000 tokens"
        ));
        assert!(is_context_length_error("context_length_exceeded"));
        assert!(!is_context_length_error("rate limit reached"));
    }

    #[test]
    fn clamp_keeps_short_content() {
        assert_eq!(clamp_content("short", 100), "short");
    }

    #[test]
    fn clamp_truncates_on_char_boundary() {
        let long = "é".repeat(100);
        let clamped = clamp_content(&long, 33);
        assert!(clamped.starts_with(&"é".repeat(16)));
        assert!(clamped.contains("[truncated"));
    }

    #[test]
    fn stop_reason_maps_to_status() {
        assert_eq!(StopReason::Completed.status(), RunStatus::Completed);
        assert_eq!(StopReason::Cancelled.status(), RunStatus::Cancelled);
        assert_eq!(
            StopReason::Failed("x".into()).status(),
            RunStatus::Failed
        );
    }
}
