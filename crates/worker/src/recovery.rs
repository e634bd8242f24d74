//! Recovery sweeper — finds orphaned runs and brings them home.
//!
//! The periodic sweep reclaims runs whose owner's heartbeat expired; a
//! startup pass reclaims runs marked `resumable` by gracefully-stopped
//! workers. Operators can force-resume, force-complete, or force-fail a
//! specific run through the admin surface.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use fd_domain::run::{RunRequest, RunStatus};

use crate::dispatcher::{request_key, spawn_run};
use crate::ownership::{RunInfo, ACTIVE_SET};
use crate::prep::{run_prepare, PrepInputs};
use crate::state::WorkerState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reports
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub orphans_found: usize,
    pub reclaimed: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryAction {
    pub run_id: String,
    pub success: bool,
    pub action: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StuckRun {
    #[serde(flatten)]
    pub info: RunInfo,
    pub reason: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sweeper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RecoverySweeper {
    state: WorkerState,
    shutdown: Notify,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RecoverySweeper {
    pub fn new(state: WorkerState) -> Self {
        Self {
            state,
            shutdown: Notify::new(),
            task: Mutex::new(None),
        }
    }

    /// Start the periodic sweep loop.
    pub fn start(self: &Arc<Self>) {
        let sweeper = self.clone();
        let interval = Duration::from_secs(
            self.state.config.coordination.recovery_sweep_interval_seconds,
        );
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sweeper.shutdown.notified() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let report = sweeper.sweep().await;
                if report.orphans_found > 0 {
                    tracing::info!(
                        orphans = report.orphans_found,
                        reclaimed = report.reclaimed,
                        skipped = report.skipped,
                        "recovery sweep"
                    );
                }
            }
            tracing::info!("recovery sweeper stopped");
        });
        *self.task.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        self.shutdown.notify_waiters();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// One pass: reclaim every orphan we can claim.
    pub async fn sweep(&self) -> SweepReport {
        let orphans = self.state.ownership.find_orphans().await;
        let mut report = SweepReport {
            orphans_found: orphans.len(),
            ..SweepReport::default()
        };

        for run_id in orphans {
            match self.resume_run(&run_id).await {
                ResumeOutcome::Resumed => report.reclaimed += 1,
                ResumeOutcome::LostRace => report.skipped += 1,
                ResumeOutcome::Unrecoverable => report.failed += 1,
            }
        }
        report
    }

    /// Startup pass: reclaim runs a previous incarnation marked
    /// resumable. Returns the number of runs resumed.
    pub async fn recover_on_startup(&self) -> usize {
        let active = self
            .state
            .broker
            .smembers(ACTIVE_SET)
            .await
            .unwrap_or_default();
        let mut resumed = 0;

        for run_id in active {
            let status = self
                .state
                .broker
                .get(&format!("run:{run_id}:status"))
                .await
                .ok()
                .flatten()
                .and_then(|s| RunStatus::parse(&s));
            if status != Some(RunStatus::Resumable) {
                continue;
            }
            if matches!(self.resume_run(&run_id).await, ResumeOutcome::Resumed) {
                resumed += 1;
            }
        }

        if resumed > 0 {
            tracing::info!(resumed, "startup recovery reclaimed resumable runs");
        }
        resumed
    }

    /// Claim an orphan and re-enter the execution loop from the step
    /// after the last idempotency-tracked one.
    ///
    /// The dead worker's `owner` key may still be alive (claim TTL far
    /// exceeds the orphan threshold), so it is cleared first; the expired
    /// heartbeat is the evidence that the owner is gone. Competing
    /// sweepers still race safely on the set-if-absent claim.
    async fn resume_run(&self, run_id: &str) -> ResumeOutcome {
        // Re-check between scan and steal: a competing sweeper may have
        // reclaimed the run already (running status + fresh heartbeat).
        let status = self
            .state
            .broker
            .get(&format!("run:{run_id}:status"))
            .await
            .ok()
            .flatten()
            .and_then(|s| RunStatus::parse(&s));
        if status == Some(RunStatus::Running) {
            let heartbeat_alive = self
                .state
                .broker
                .get(&format!("run:{run_id}:heartbeat"))
                .await
                .ok()
                .flatten()
                .and_then(|hb| hb.parse::<f64>().ok())
                .map(|hb| {
                    let age = chrono::Utc::now().timestamp_millis() as f64 / 1000.0 - hb;
                    age <= self.state.config.coordination.orphan_threshold_seconds as f64
                })
                .unwrap_or(false);
            if heartbeat_alive {
                return ResumeOutcome::LostRace;
            }
        }

        let _ = self
            .state
            .broker
            .delete(&format!("run:{run_id}:owner"))
            .await;
        if !self.state.ownership.claim(run_id).await {
            return ResumeOutcome::LostRace;
        }

        // Rebuild context from the stashed request.
        let request: Option<RunRequest> = self
            .state
            .broker
            .get(&request_key(run_id))
            .await
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_str(&raw).ok());

        let Some(mut request) = request else {
            // Nothing to rebuild from: fail the run cleanly.
            tracing::error!(run_id, "orphan has no stashed request, failing");
            self.state
                .ownership
                .release(run_id, RunStatus::Failed)
                .await;
            let mapped = self
                .state
                .mapper
                .map_code(fd_domain::errmap::ErrorCode::InternalError);
            self.state
                .publisher
                .user_error(&format!("agent_run:{run_id}:stream"), &mapped)
                .await;
            return ResumeOutcome::Unrecoverable;
        };

        // The triggering message already sits in the thread history.
        request.user_message = None;
        // A reclaimed run was already admitted once.
        request.skip_limits_check = true;

        let prep = run_prepare(
            &request,
            PrepInputs {
                db: &self.state.db,
                registry: &self.state.tools,
                mcp: self.state.mcp.as_ref(),
                local_mode: self.state.config.worker.local_mode,
                message_fetch_timeout: Duration::from_secs(
                    self.state.config.database.message_fetch_timeout_seconds,
                ),
                max_messages: self.state.config.coordination.max_messages,
                prefetched_messages: None,
            },
        )
        .await;

        let thread_permit = match self.state.thread_locks.acquire(&request.thread_id).await {
            Ok(permit) => permit,
            Err(e) => {
                tracing::warn!(run_id, error = %e, "resume blocked on thread lock");
                self.state.ownership.mark_resumable(run_id).await;
                return ResumeOutcome::LostRace;
            }
        };

        let resume_from_step = self.state.idempotency.last_step(run_id).await;
        self.state.metrics.runs_recovered.inc();
        tracing::info!(run_id, resume_from_step, "resuming orphaned run");

        spawn_run(
            self.state.clone(),
            request,
            prep,
            resume_from_step,
            thread_permit,
        );
        ResumeOutcome::Resumed
    }

    // ── Operator actions ─────────────────────────────────────────────

    /// Runs that look wedged: non-terminal and older than `min_age`
    /// minutes, or with an expired heartbeat.
    pub async fn get_stuck(&self, min_age_minutes: u64) -> Vec<StuckRun> {
        let active = self
            .state
            .broker
            .smembers(ACTIVE_SET)
            .await
            .unwrap_or_default();
        let min_age_secs = (min_age_minutes * 60) as f64;
        let orphan_threshold =
            self.state.config.coordination.orphan_threshold_seconds as f64;

        let mut stuck = Vec::new();
        for run_id in active {
            let Some(info) = self.state.ownership.get_info(&run_id).await else {
                continue;
            };
            let terminal = info
                .status
                .as_deref()
                .and_then(RunStatus::parse)
                .map(RunStatus::is_terminal)
                .unwrap_or(false);
            if terminal {
                continue;
            }

            let reason = if info
                .heartbeat_age
                .map(|age| age > orphan_threshold)
                .unwrap_or(true)
            {
                Some("heartbeat expired".to_string())
            } else if info.duration.map(|d| d > min_age_secs).unwrap_or(false) {
                Some(format!("running longer than {min_age_minutes}m"))
            } else {
                None
            };

            if let Some(reason) = reason {
                stuck.push(StuckRun { info, reason });
            }
        }
        stuck
    }

    pub async fn force_resume(&self, run_id: &str) -> RecoveryAction {
        match self.resume_run(run_id).await {
            ResumeOutcome::Resumed => RecoveryAction {
                run_id: run_id.into(),
                success: true,
                action: "resume".into(),
                message: "run reclaimed and resumed".into(),
                error: None,
            },
            ResumeOutcome::LostRace => RecoveryAction {
                run_id: run_id.into(),
                success: false,
                action: "resume".into(),
                message: "another worker holds the run".into(),
                error: None,
            },
            ResumeOutcome::Unrecoverable => RecoveryAction {
                run_id: run_id.into(),
                success: false,
                action: "resume".into(),
                message: "run context is gone; run was failed".into(),
                error: Some("missing stashed request".into()),
            },
        }
    }

    pub async fn force_complete(&self, run_id: &str, reason: &str) -> RecoveryAction {
        self.terminate(run_id, RunStatus::Completed, reason).await
    }

    pub async fn force_fail(&self, run_id: &str, error: &str) -> RecoveryAction {
        self.terminate(run_id, RunStatus::Failed, error).await
    }

    async fn terminate(&self, run_id: &str, status: RunStatus, note: &str) -> RecoveryAction {
        // Stop local execution if we happen to be the owner.
        self.state.cancel_map.cancel(run_id);

        let released = self.state.ownership.release(run_id, status).await;
        let db_result = self
            .state
            .db
            .update_run_status(run_id, status, Some(note))
            .await;
        // Flush whatever is still buffered before dropping the stream.
        let _ = self.state.write_buffer.flush_one(run_id).await;
        let _ = self.state.wal.cleanup_run(run_id).await;
        self.state.write_buffer.unregister_run(run_id);

        let action = match status {
            RunStatus::Completed => "complete",
            _ => "fail",
        };
        match (released, db_result) {
            (true, Ok(())) => RecoveryAction {
                run_id: run_id.into(),
                success: true,
                action: action.into(),
                message: format!("run forced to {}", status.as_str()),
                error: None,
            },
            (_, Err(e)) => RecoveryAction {
                run_id: run_id.into(),
                success: false,
                action: action.into(),
                message: "database update failed".into(),
                error: Some(e.to_string()),
            },
            (false, Ok(())) => RecoveryAction {
                run_id: run_id.into(),
                success: false,
                action: action.into(),
                message: "broker release failed".into(),
                error: None,
            },
        }
    }
}

enum ResumeOutcome {
    Resumed,
    LostRace,
    Unrecoverable,
}
