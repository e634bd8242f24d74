//! Run ownership — at-most-one worker per run, with heartbeat liveness.
//!
//! Ownership is expressed entirely in broker keys so any worker can pick
//! up any run after a crash:
//!   `run:{id}:owner`     worker id, TTL = claim TTL
//!   `run:{id}:status`    running | resumable | completed | failed | cancelled
//!   `run:{id}:heartbeat` unix seconds, TTL ≈ 45s
//!   `run:{id}:start`     unix seconds
//!   `runs:active`        set of non-terminal run ids
//!
//! A missed heartbeat is the sole signal of worker death.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use fd_broker::Broker;
use fd_domain::config::CoordinationConfig;
use fd_domain::run::RunStatus;
use fd_domain::Result;

pub const ACTIVE_SET: &str = "runs:active";

fn owner_key(run_id: &str) -> String {
    format!("run:{run_id}:owner")
}
fn status_key(run_id: &str) -> String {
    format!("run:{run_id}:status")
}
fn heartbeat_key(run_id: &str) -> String {
    format!("run:{run_id}:heartbeat")
}
fn start_key(run_id: &str) -> String {
    format!("run:{run_id}:start")
}

fn now_secs() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run info (admin surface)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct RunInfo {
    pub run_id: String,
    pub owner: Option<String>,
    pub status: Option<String>,
    pub heartbeat: Option<f64>,
    pub heartbeat_age: Option<f64>,
    pub start: Option<f64>,
    pub duration: Option<f64>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RunOwnership
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RunOwnership {
    worker_id: String,
    broker: Arc<dyn Broker>,
    config: CoordinationConfig,
    /// run_id → claim unix-time, for the heartbeat loop.
    owned: Mutex<HashMap<String, f64>>,
    shutdown: Notify,
    heartbeat_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RunOwnership {
    pub fn new(worker_id: String, broker: Arc<dyn Broker>, config: CoordinationConfig) -> Self {
        Self {
            worker_id,
            broker,
            config,
            owned: Mutex::new(HashMap::new()),
            shutdown: Notify::new(),
            heartbeat_task: Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn owned_count(&self) -> usize {
        self.owned.lock().len()
    }

    pub fn owned_runs(&self) -> Vec<String> {
        self.owned.lock().keys().cloned().collect()
    }

    fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.config.claim_ttl_seconds)
    }

    /// Atomically claim a run. Returns true when this worker owns it
    /// afterwards (including the idempotent re-claim case).
    pub async fn claim(&self, run_id: &str) -> bool {
        let claimed = match self
            .broker
            .set_nx(&owner_key(run_id), &self.worker_id, Some(self.claim_ttl()))
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                tracing::error!(run_id, error = %e, "claim failed");
                return false;
            }
        };

        if claimed {
            if let Err(e) = self.finish_claim(run_id).await {
                // A partially-claimed run is un-owned again; the caller
                // retries the whole claim.
                tracing::error!(run_id, error = %e, "claim bookkeeping failed, releasing");
                let _ = self.broker.delete(&owner_key(run_id)).await;
                return false;
            }
            self.owned.lock().insert(run_id.to_owned(), now_secs());
            tracing::info!(run_id, worker_id = %self.worker_id, "claimed run");
            return true;
        }

        // Conflict: idempotent if the current owner is us.
        match self.broker.get(&owner_key(run_id)).await {
            Ok(Some(owner)) if owner == self.worker_id => true,
            _ => false,
        }
    }

    async fn finish_claim(&self, run_id: &str) -> Result<()> {
        let ttl = Some(self.claim_ttl());
        self.broker
            .set(&status_key(run_id), RunStatus::Running.as_str(), ttl)
            .await?;
        self.broker
            .set(&start_key(run_id), &now_secs().to_string(), ttl)
            .await?;
        self.broker.sadd(ACTIVE_SET, run_id).await?;
        self.heartbeat(run_id).await;
        Ok(())
    }

    /// Set the terminal status and clear ownership. Terminal statuses
    /// leave `runs:active`; `resumable` would not go through here.
    pub async fn release(&self, run_id: &str, status: RunStatus) -> bool {
        let result: Result<()> = async {
            self.broker
                .set(&status_key(run_id), status.as_str(), Some(self.claim_ttl()))
                .await?;
            self.broker.delete(&owner_key(run_id)).await?;
            if status.is_terminal() {
                self.broker.srem(ACTIVE_SET, run_id).await?;
            }
            Ok(())
        }
        .await;

        self.owned.lock().remove(run_id);
        match result {
            Ok(()) => {
                tracing::info!(run_id, status = status.as_str(), "released run");
                true
            }
            Err(e) => {
                tracing::error!(run_id, error = %e, "release failed");
                false
            }
        }
    }

    /// Graceful-shutdown path: give the run back to the fleet. Stays in
    /// `runs:active` so a sweeper reclaims it.
    pub async fn mark_resumable(&self, run_id: &str) -> bool {
        let result: Result<()> = async {
            self.broker
                .set(
                    &status_key(run_id),
                    RunStatus::Resumable.as_str(),
                    Some(self.claim_ttl()),
                )
                .await?;
            self.broker.delete(&owner_key(run_id)).await?;
            Ok(())
        }
        .await;

        self.owned.lock().remove(run_id);
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(run_id, error = %e, "mark resumable failed");
                false
            }
        }
    }

    async fn heartbeat(&self, run_id: &str) {
        if let Err(e) = self
            .broker
            .set(
                &heartbeat_key(run_id),
                &now_secs().to_string(),
                Some(Duration::from_secs(self.config.heartbeat_ttl_seconds)),
            )
            .await
        {
            tracing::warn!(run_id, error = %e, "heartbeat failed");
        }
    }

    /// Start the background heartbeat loop.
    pub fn start_heartbeats(self: &Arc<Self>) {
        let ownership = self.clone();
        let interval = Duration::from_secs(self.config.heartbeat_interval_seconds);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ownership.shutdown.notified() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let run_ids = ownership.owned_runs();
                for run_id in run_ids {
                    ownership.heartbeat(&run_id).await;
                }
            }
        });
        *self.heartbeat_task.lock() = Some(handle);
        tracing::info!(worker_id = %self.worker_id, "heartbeats started");
    }

    pub async fn stop_heartbeats(&self) {
        self.shutdown.notify_waiters();
        let handle = self.heartbeat_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Non-terminal runs whose heartbeat is missing or older than the
    /// orphan threshold.
    pub async fn find_orphans(&self) -> Vec<String> {
        let active = match self.broker.smembers(ACTIVE_SET).await {
            Ok(active) => active,
            Err(e) => {
                tracing::error!(error = %e, "orphan scan failed");
                return Vec::new();
            }
        };

        let mut orphans = Vec::new();
        for run_id in active {
            let status = self
                .broker
                .get(&status_key(&run_id))
                .await
                .ok()
                .flatten()
                .and_then(|s| RunStatus::parse(&s));
            if !matches!(status, Some(RunStatus::Running) | Some(RunStatus::Resumable)) {
                continue;
            }

            match self.broker.get(&heartbeat_key(&run_id)).await {
                Ok(Some(hb)) => {
                    let age = now_secs() - hb.parse::<f64>().unwrap_or(0.0);
                    if age > self.config.orphan_threshold_seconds as f64 {
                        orphans.push(run_id);
                    }
                }
                Ok(None) => orphans.push(run_id),
                Err(e) => tracing::warn!(run_id, error = %e, "heartbeat read failed"),
            }
        }
        orphans
    }

    /// Broker-side view of one run, for operators.
    pub async fn get_info(&self, run_id: &str) -> Option<RunInfo> {
        let owner = self.broker.get(&owner_key(run_id)).await.ok().flatten();
        let status = self.broker.get(&status_key(run_id)).await.ok().flatten();
        let heartbeat = self
            .broker
            .get(&heartbeat_key(run_id))
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse::<f64>().ok());
        let start = self
            .broker
            .get(&start_key(run_id))
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse::<f64>().ok());

        if owner.is_none() && status.is_none() && heartbeat.is_none() && start.is_none() {
            return None;
        }

        let now = now_secs();
        Some(RunInfo {
            run_id: run_id.to_owned(),
            owner,
            status,
            heartbeat,
            heartbeat_age: heartbeat.map(|hb| now - hb),
            start,
            duration: start.map(|s| now - s),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Idempotency tracker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Guarantees each `(run, step, op)` triple commits at most once across
/// worker restarts, via set-if-absent markers with a 1h TTL.
pub struct IdempotencyTracker {
    broker: Arc<dyn Broker>,
    ttl: Duration,
}

impl IdempotencyTracker {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            ttl: Duration::from_secs(3600),
        }
    }

    /// Returns true exactly once per triple. Broker failures err on the
    /// side of executing (duplicates beat lost work).
    pub async fn check_and_mark(&self, run_id: &str, step: u32, op: &str) -> bool {
        let key = format!("run:{run_id}:idem:{step}:{op}");
        self.broker
            .set_nx(&key, "1", Some(self.ttl))
            .await
            .unwrap_or(true)
    }

    pub async fn mark_step(&self, run_id: &str, step: u32) {
        let key = format!("run:{run_id}:step:{step}");
        if let Err(e) = self
            .broker
            .set(&key, &now_secs().to_string(), Some(self.ttl))
            .await
        {
            tracing::warn!(run_id, step, error = %e, "step marker failed");
        }
    }

    /// Highest committed step for a run (0 when none).
    pub async fn last_step(&self, run_id: &str) -> u32 {
        let pattern = format!("run:{run_id}:step:*");
        let keys = self.broker.scan_keys(&pattern).await.unwrap_or_default();
        keys.iter()
            .filter_map(|k| k.rsplit(':').next()?.parse::<u32>().ok())
            .max()
            .unwrap_or(0)
    }
}
