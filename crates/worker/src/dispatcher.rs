//! Dispatcher — pulls run requests off the input stream and admits them.
//!
//! Admission: backpressure gate → ack + estimate events → parallel
//! prechecks → per-thread lock → ownership claim → spawn the engine.
//! Double-delivery across workers is harmless: the ownership claim is
//! the authoritative exclusion point.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use fd_domain::errmap::ErrorCode;
use fd_domain::run::RunRequest;

use crate::engine;
use crate::prep::{run_prepare, PrepInputs};
use crate::state::WorkerState;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// TTL'd broker copy of the request so a sweeper can rebuild context
/// when it reclaims an orphan.
pub fn request_key(run_id: &str) -> String {
    format!("run:{run_id}:request")
}

pub struct Dispatcher {
    state: WorkerState,
    shutdown: Notify,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(state: WorkerState) -> Self {
        Self {
            state,
            shutdown: Notify::new(),
            task: Mutex::new(None),
        }
    }

    /// Start the input-stream poll loop.
    pub fn start(self: &Arc<Self>) {
        let dispatcher = self.clone();
        let handle = tokio::spawn(async move {
            let stream = dispatcher.state.config.broker.request_stream.clone();
            loop {
                tokio::select! {
                    _ = dispatcher.shutdown.notified() => break,
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
                dispatcher.poll_once(&stream).await;
            }
            tracing::info!("dispatcher stopped");
        });
        *self.task.lock() = Some(handle);
        tracing::info!("dispatcher started");
    }

    pub async fn stop(&self) {
        self.shutdown.notify_waiters();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn poll_once(&self, stream: &str) {
        let entries = match self.state.broker.xrange(stream).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "request stream read failed");
                return;
            }
        };

        for entry in entries {
            // Take the entry before working on it; a competing worker
            // that read the same entry loses at the ownership claim.
            if let Err(e) = self.state.broker.xdel(stream, &entry.id).await {
                tracing::warn!(error = %e, "request dequeue failed");
                continue;
            }

            let request: RunRequest = match serde_json::from_str(&entry.payload) {
                Ok(request) => request,
                Err(e) => {
                    tracing::error!(error = %e, "malformed run request dropped");
                    continue;
                }
            };

            let state = self.state.clone();
            tokio::spawn(async move {
                admit_and_run(state, request).await;
            });
        }
    }
}

/// The full admission path for one request.
pub async fn admit_and_run(state: WorkerState, request: RunRequest) {
    let run_id = request.run_id.clone();
    let stream_key = request.stream_key();

    // ── Backpressure gate ────────────────────────────────────────────
    if !state.backpressure.should_accept_work() {
        tracing::warn!(run_id = %run_id, "admission rejected, load critical");
        let mapped = state.mapper.map_code(ErrorCode::RateLimit);
        state.publisher.user_error(&stream_key, &mapped).await;
        return;
    }

    // ── Ack + estimate ───────────────────────────────────────────────
    state.publisher.ack(&stream_key, &run_id).await;
    let estimate = state.estimator.estimate(&request.model_name);
    state
        .publisher
        .estimate(
            &stream_key,
            estimate.estimated_seconds,
            estimate.confidence,
            Some(estimate.breakdown),
        )
        .await;

    // ── Prefetch history while the other prechecks run ───────────────
    let prefetch = {
        let db = state.db.clone();
        let thread_id = request.thread_id.clone();
        tokio::spawn(async move { db.fetch_messages(&thread_id).await.unwrap_or_default() })
    };

    state
        .publisher
        .prep_stage(&stream_key, "prechecks", None)
        .await;

    let prep = run_prepare(
        &request,
        PrepInputs {
            db: &state.db,
            registry: &state.tools,
            mcp: state.mcp.as_ref(),
            local_mode: state.config.worker.local_mode,
            message_fetch_timeout: Duration::from_secs(
                state.config.database.message_fetch_timeout_seconds,
            ),
            max_messages: state.config.coordination.max_messages,
            prefetched_messages: Some(prefetch),
        },
    )
    .await;

    if !prep.can_proceed() {
        let (error, code) = prep.error_response();
        tracing::info!(run_id = %run_id, code = %code, detail = %error, "admission refused by prechecks");
        // Users get the stable catalog record for the code.
        let mapped = state.mapper.map_precheck_code(&code);
        state.publisher.user_error(&stream_key, &mapped).await;
        return;
    }

    state
        .publisher
        .prep_stage(&stream_key, "claiming", None)
        .await;

    // ── Per-thread exclusivity within this worker ────────────────────
    let thread_permit = match state.thread_locks.acquire(&request.thread_id).await {
        Ok(permit) => permit,
        Err(e) => {
            tracing::warn!(run_id = %run_id, error = %e, "thread lock unavailable");
            let mapped = state.mapper.map_code(ErrorCode::ConcurrentLimit);
            state.publisher.user_error(&stream_key, &mapped).await;
            return;
        }
    };

    // ── Ownership claim (cross-worker exclusion) ─────────────────────
    if !state.ownership.claim(&run_id).await {
        tracing::info!(run_id = %run_id, "another worker owns this run, skipping");
        return;
    }

    // Stash the request for recovery-by-another-worker.
    if let Ok(payload) = serde_json::to_string(&request) {
        let ttl = Duration::from_secs(state.config.coordination.claim_ttl_seconds);
        let _ = state
            .broker
            .set(&request_key(&run_id), &payload, Some(ttl))
            .await;
    }

    spawn_run(state, request, prep, 0, thread_permit);
}

/// Spawn the engine task and track it for shutdown draining.
pub fn spawn_run(
    state: WorkerState,
    request: RunRequest,
    prep: crate::prep::PrepResult,
    resume_from_step: u32,
    thread_permit: tokio::sync::OwnedSemaphorePermit,
) {
    let run_id = request.run_id.clone();
    let cancel = state.cancel_map.register(&run_id);

    let task_state = state.clone();
    let handle = tokio::spawn(async move {
        let _permit = thread_permit;
        engine::run_agent(&task_state, &request, prep, cancel, resume_from_step).await;
    });

    let mut tasks = state.run_tasks.lock();
    // Opportunistic prune keeps the map from accumulating finished runs.
    tasks.retain(|_, h| !h.is_finished());
    tasks.insert(run_id, handle);
}
