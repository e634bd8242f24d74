//! Dead-letter queue — long-term holding area for writes that exhausted
//! their retries. Delivery here is best-effort: a failure to DLQ is
//! logged and counted, never re-queued.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use fd_broker::Broker;
use fd_domain::config::DlqConfig;
use fd_domain::Result;

use crate::metrics::WorkerMetrics;
use crate::wal::{WalEntry, WriteAheadLog};

pub const DLQ_STREAM: &str = "dlq:failed_writes";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub entry_id: String,
    pub run_id: String,
    pub write_type: String,
    pub data: serde_json::Value,
    pub error: String,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DlqStats {
    pub total_entries: usize,
    pub unique_runs: usize,
}

type Handler = Box<dyn Fn(&DlqEntry) + Send + Sync>;

pub struct DeadLetterQueue {
    broker: Arc<dyn Broker>,
    config: DlqConfig,
    metrics: Arc<WorkerMetrics>,
    handlers: Mutex<Vec<Handler>>,
}

impl DeadLetterQueue {
    pub fn new(broker: Arc<dyn Broker>, config: DlqConfig, metrics: Arc<WorkerMetrics>) -> Self {
        Self {
            broker,
            config,
            metrics,
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Register an alert hook invoked for every entry that lands here.
    pub fn on_entry(&self, handler: impl Fn(&DlqEntry) + Send + Sync + 'static) {
        self.handlers.lock().push(Box::new(handler));
    }

    /// Move a retry-exhausted WAL entry into the queue.
    pub async fn send(&self, entry: &WalEntry, error: &str) -> bool {
        let dlq_entry = DlqEntry {
            entry_id: entry.entry_id.clone(),
            run_id: entry.run_id.clone(),
            write_type: serde_json::to_value(entry.write_type)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_else(|| "message".into()),
            data: entry.data.clone(),
            error: error.to_owned(),
            attempt_count: entry.attempt_count,
            created_at: entry.created_at,
            failed_at: Utc::now(),
        };

        let payload = match serde_json::to_string(&dlq_entry) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "DLQ entry serialization failed");
                return false;
            }
        };

        match self
            .broker
            .xadd(DLQ_STREAM, &payload, self.config.max_entries, false)
            .await
        {
            Ok(_) => {
                let _ = self
                    .broker
                    .expire(
                        DLQ_STREAM,
                        Duration::from_secs(self.config.entry_ttl_seconds),
                    )
                    .await;
                self.metrics.dlq_entries.inc();

                for handler in self.handlers.lock().iter() {
                    handler(&dlq_entry);
                }

                tracing::warn!(
                    run_id = %dlq_entry.run_id,
                    write_type = %dlq_entry.write_type,
                    error = %truncate(error, 100),
                    "entry moved to DLQ"
                );
                true
            }
            Err(e) => {
                tracing::error!(run_id = %entry.run_id, error = %e, "DLQ write failed");
                false
            }
        }
    }

    /// Operator inspection: up to `count` entries, optionally one run's.
    pub async fn get_entries(&self, count: usize, run_id: Option<&str>) -> Vec<DlqEntry> {
        let mut out = Vec::new();
        match self.broker.xrange(DLQ_STREAM).await {
            Ok(raw) => {
                for item in raw {
                    if let Ok(entry) = serde_json::from_str::<DlqEntry>(&item.payload) {
                        if run_id.is_none_or(|r| entry.run_id == r) {
                            out.push(entry);
                            if out.len() >= count {
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "DLQ read failed"),
        }
        out
    }

    /// Re-inject an entry into its run's WAL and delete the DLQ record.
    /// The caller triggers a flush afterwards.
    pub async fn retry_entry(&self, entry_id: &str, wal: &WriteAheadLog) -> Result<bool> {
        let raw = self.broker.xrange(DLQ_STREAM).await?;
        for item in raw {
            let Ok(entry) = serde_json::from_str::<DlqEntry>(&item.payload) else {
                continue;
            };
            if entry.entry_id != entry_id {
                continue;
            }
            let write_type = serde_json::from_value(serde_json::Value::String(
                entry.write_type.clone(),
            ))
            .unwrap_or(crate::wal::WriteType::Message);
            wal.append(&entry.run_id, write_type, entry.data.clone())
                .await?;
            self.broker.xdel(DLQ_STREAM, &item.id).await?;
            tracing::info!(entry_id, run_id = %entry.run_id, "DLQ entry re-queued to WAL");
            return Ok(true);
        }
        Ok(false)
    }

    /// Delete everything, or only entries that failed before the cutoff.
    pub async fn purge(&self, older_than: Option<Duration>) -> Result<usize> {
        let Some(older_than) = older_than else {
            self.broker.delete(DLQ_STREAM).await?;
            return Ok(1);
        };

        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));
        let mut deleted = 0;
        for item in self.broker.xrange(DLQ_STREAM).await? {
            if let Ok(entry) = serde_json::from_str::<DlqEntry>(&item.payload) {
                if entry.failed_at < cutoff {
                    self.broker.xdel(DLQ_STREAM, &item.id).await?;
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    pub async fn stats(&self) -> DlqStats {
        let entries = self.get_entries(100, None).await;
        let total = self.broker.xlen(DLQ_STREAM).await.unwrap_or(entries.len());
        let unique_runs = entries
            .iter()
            .map(|e| e.run_id.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len();
        DlqStats {
            total_entries: total,
            unique_runs,
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::WriteType;
    use fd_broker::MemoryBroker;
    use fd_domain::config::WalConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (Arc<MemoryBroker>, DeadLetterQueue, WriteAheadLog) {
        let broker: Arc<MemoryBroker> = Arc::new(MemoryBroker::new());
        let metrics = Arc::new(WorkerMetrics::new());
        let dlq = DeadLetterQueue::new(broker.clone(), DlqConfig::default(), metrics.clone());
        let wal = WriteAheadLog::new(broker.clone(), WalConfig::default(), metrics);
        (broker, dlq, wal)
    }

    fn failed_entry(run_id: &str) -> WalEntry {
        WalEntry {
            entry_id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            write_type: WriteType::Message,
            data: serde_json::json!({"thread_id": "t1", "content": "x"}),
            created_at: Utc::now(),
            attempt_count: 3,
            last_attempt_at: Some(Utc::now()),
            last_error: Some("insert failed".into()),
        }
    }

    #[tokio::test]
    async fn send_and_inspect() {
        let (_, dlq, _) = setup();
        let entry = failed_entry("r1");
        assert!(dlq.send(&entry, "permanent failure").await);

        let entries = dlq.get_entries(10, None).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_id, entry.entry_id);
        assert_eq!(entries[0].attempt_count, 3);
        assert_eq!(entries[0].error, "permanent failure");

        let filtered = dlq.get_entries(10, Some("other")).await;
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn handlers_fire_on_send() {
        let (_, dlq, _) = setup();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        dlq.on_entry(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        dlq.send(&failed_entry("r1"), "oops").await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_reinjects_into_wal() {
        let (_, dlq, wal) = setup();
        let entry = failed_entry("r1");
        dlq.send(&entry, "oops").await;

        let retried = dlq.retry_entry(&entry.entry_id, &wal).await.unwrap();
        assert!(retried);
        // The DLQ record is gone; the WAL holds the payload again.
        assert!(dlq.get_entries(10, None).await.is_empty());
        let pending = wal.get_pending("r1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].data, entry.data);
        // Fresh WAL entry starts its retry budget over.
        assert_eq!(pending[0].attempt_count, 0);
    }

    #[tokio::test]
    async fn retry_unknown_entry_is_noop() {
        let (_, dlq, wal) = setup();
        assert!(!dlq.retry_entry("nope", &wal).await.unwrap());
    }

    #[tokio::test]
    async fn purge_all_and_by_age() {
        let (_, dlq, _) = setup();
        dlq.send(&failed_entry("r1"), "a").await;
        dlq.send(&failed_entry("r2"), "b").await;

        // Nothing is older than an hour yet.
        let deleted = dlq.purge(Some(Duration::from_secs(3600))).await.unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(dlq.stats().await.total_entries, 2);

        dlq.purge(None).await.unwrap();
        assert_eq!(dlq.stats().await.total_entries, 0);
    }
}
