//! Write-ahead log — durable, ordered per-run buffer of writes.
//!
//! Primary path: the broker's per-run stream `wal:run:{id}` (capped,
//! TTL'd). Fallback path: when the broker is unreachable, entries land in
//! a bounded local buffer. Local-buffer overflow evicts *whole runs*
//! (LRU), never individual entries, so per-run ordering survives; each
//! eviction logs at error level and bumps `writes_dropped`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fd_broker::Broker;
use fd_domain::config::WalConfig;
use fd_domain::Result;

use crate::metrics::WorkerMetrics;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteType {
    Message,
    Credit,
    Status,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub entry_id: String,
    pub run_id: String,
    pub write_type: WriteType,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl WalEntry {
    fn new(run_id: &str, write_type: WriteType, data: serde_json::Value) -> Self {
        Self {
            entry_id: Uuid::new_v4().to_string(),
            run_id: run_id.to_owned(),
            write_type,
            data,
            created_at: Utc::now(),
            attempt_count: 0,
            last_attempt_at: None,
            last_error: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Local fallback buffer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-run deques plus a recency list for whole-run LRU eviction.
#[derive(Default)]
struct LocalBuffer {
    runs: HashMap<String, VecDeque<WalEntry>>,
    /// Least-recently-appended first.
    recency: VecDeque<String>,
}

impl LocalBuffer {
    fn touch(&mut self, run_id: &str) {
        if let Some(pos) = self.recency.iter().position(|r| r == run_id) {
            self.recency.remove(pos);
        }
        self.recency.push_back(run_id.to_owned());
    }

    fn evict_lru(&mut self) -> Option<(String, usize)> {
        let run_id = self.recency.pop_front()?;
        let dropped = self.runs.remove(&run_id).map(|q| q.len()).unwrap_or(0);
        Some((run_id, dropped))
    }

    fn remove(&mut self, run_id: &str) -> usize {
        self.recency.retain(|r| r != run_id);
        self.runs.remove(run_id).map(|q| q.len()).unwrap_or(0)
    }

    fn pending(&self) -> usize {
        self.runs.values().map(|q| q.len()).sum()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// WAL
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct WalStats {
    pub total_pending: usize,
    pub runs_with_pending: usize,
    pub local_buffer_runs: usize,
}

pub struct WriteAheadLog {
    broker: Arc<dyn Broker>,
    config: WalConfig,
    metrics: Arc<WorkerMetrics>,
    local: Mutex<LocalBuffer>,
}

impl WriteAheadLog {
    pub fn new(broker: Arc<dyn Broker>, config: WalConfig, metrics: Arc<WorkerMetrics>) -> Self {
        Self {
            broker,
            config,
            metrics,
            local: Mutex::new(LocalBuffer::default()),
        }
    }

    fn stream_key(run_id: &str) -> String {
        format!("wal:run:{run_id}")
    }

    /// Append a write. Broker first; the local buffer only when the
    /// broker errors. Returns the entry id either way — callers learn
    /// about local-path risk via counters, not the return value.
    pub async fn append(
        &self,
        run_id: &str,
        write_type: WriteType,
        data: serde_json::Value,
    ) -> Result<String> {
        let entry = WalEntry::new(run_id, write_type, data);
        let payload = serde_json::to_string(&entry)?;
        let stream_key = Self::stream_key(run_id);

        match self
            .broker
            .xadd(&stream_key, &payload, self.config.stream_maxlen, false)
            .await
        {
            Ok(_) => {
                let _ = self
                    .broker
                    .expire(
                        &stream_key,
                        Duration::from_secs(self.config.entry_ttl_seconds),
                    )
                    .await;
                return Ok(entry.entry_id);
            }
            Err(e) => {
                tracing::warn!(run_id, error = %e, "broker append failed, using local buffer");
            }
        }

        let entry_id = entry.entry_id.clone();
        let mut local = self.local.lock();
        if !local.runs.contains_key(run_id) {
            while local.runs.len() >= self.config.max_local_buffer_runs {
                if let Some((evicted, dropped)) = local.evict_lru() {
                    tracing::error!(
                        evicted_run = %evicted,
                        dropped,
                        "local WAL buffer full, evicting whole run"
                    );
                    self.metrics.writes_dropped.inc_by(dropped as u64);
                } else {
                    break;
                }
            }
        }
        local.touch(run_id);
        let queue = local.runs.entry(run_id.to_owned()).or_default();
        queue.push_back(entry);
        while queue.len() > self.config.max_local_buffer_per_run {
            queue.pop_front();
            self.metrics.writes_dropped.inc();
        }
        Ok(entry_id)
    }

    /// All pending entries for a run: broker stream first, then the local
    /// buffer. Order is preserved within each source.
    pub async fn get_pending(&self, run_id: &str) -> Result<Vec<WalEntry>> {
        let mut entries = Vec::new();

        match self.broker.xrange(&Self::stream_key(run_id)).await {
            Ok(raw) => {
                for item in raw {
                    match serde_json::from_str::<WalEntry>(&item.payload) {
                        Ok(entry) => entries.push(entry),
                        Err(e) => {
                            tracing::warn!(run_id, error = %e, "skipping malformed WAL payload")
                        }
                    }
                }
            }
            Err(e) => tracing::warn!(run_id, error = %e, "broker read failed"),
        }

        let local = self.local.lock();
        if let Some(queue) = local.runs.get(run_id) {
            entries.extend(queue.iter().cloned());
        }
        Ok(entries)
    }

    /// Delete acknowledged entries from broker and local buffer.
    pub async fn mark_completed(&self, run_id: &str, entry_ids: &[String]) -> Result<usize> {
        if entry_ids.is_empty() {
            return Ok(0);
        }
        let id_set: std::collections::HashSet<&str> =
            entry_ids.iter().map(String::as_str).collect();
        let stream_key = Self::stream_key(run_id);
        let mut completed = 0;

        match self.broker.xrange(&stream_key).await {
            Ok(raw) => {
                for item in raw {
                    let acknowledged = serde_json::from_str::<WalEntry>(&item.payload)
                        .map(|e| id_set.contains(e.entry_id.as_str()))
                        .unwrap_or(false);
                    if acknowledged && self.broker.xdel(&stream_key, &item.id).await.is_ok() {
                        completed += 1;
                    }
                }
            }
            Err(e) => tracing::warn!(run_id, error = %e, "broker delete failed"),
        }

        let mut local = self.local.lock();
        if let Some(queue) = local.runs.get_mut(run_id) {
            let before = queue.len();
            queue.retain(|e| !id_set.contains(e.entry_id.as_str()));
            completed += before - queue.len();
        }
        Ok(completed)
    }

    /// Record a failed flush attempt: bump `attempt_count`, remember the
    /// error. The entry stays pending.
    pub async fn mark_failed(&self, run_id: &str, entry_id: &str, error: &str) -> Result<bool> {
        let stream_key = Self::stream_key(run_id);

        match self.broker.xrange(&stream_key).await {
            Ok(raw) => {
                for item in raw {
                    if let Ok(mut entry) = serde_json::from_str::<WalEntry>(&item.payload) {
                        if entry.entry_id == entry_id {
                            entry.attempt_count += 1;
                            entry.last_attempt_at = Some(Utc::now());
                            entry.last_error = Some(error.to_owned());
                            let payload = serde_json::to_string(&entry)?;
                            self.broker.xdel(&stream_key, &item.id).await?;
                            self.broker
                                .xadd(&stream_key, &payload, self.config.stream_maxlen, false)
                                .await?;
                            return Ok(true);
                        }
                    }
                }
            }
            Err(e) => tracing::warn!(run_id, error = %e, "mark_failed broker read failed"),
        }

        let mut local = self.local.lock();
        if let Some(queue) = local.runs.get_mut(run_id) {
            for entry in queue.iter_mut() {
                if entry.entry_id == entry_id {
                    entry.attempt_count += 1;
                    entry.last_attempt_at = Some(Utc::now());
                    entry.last_error = Some(error.to_owned());
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Delete the stream and any local buffer; called after terminal flush.
    pub async fn cleanup_run(&self, run_id: &str) -> Result<usize> {
        let mut deleted = 0;
        if let Err(e) = self.broker.delete(&Self::stream_key(run_id)).await {
            tracing::warn!(run_id, error = %e, "WAL cleanup failed");
        } else {
            deleted += 1;
        }
        deleted += self.local.lock().remove(run_id);
        Ok(deleted)
    }

    pub async fn stats(&self) -> WalStats {
        let (mut total_pending, mut runs_with_pending, local_buffer_runs) = {
            let local = self.local.lock();
            let pending = local.pending();
            let runs = local.runs.values().filter(|q| !q.is_empty()).count();
            (pending, runs, local.runs.len())
        };

        if let Ok(keys) = self.broker.scan_keys("wal:run:*").await {
            for key in keys {
                if let Ok(len) = self.broker.xlen(&key).await {
                    if len > 0 {
                        runs_with_pending += 1;
                        total_pending += len;
                    }
                }
            }
        }

        WalStats {
            total_pending,
            runs_with_pending,
            local_buffer_runs,
        }
    }
}
