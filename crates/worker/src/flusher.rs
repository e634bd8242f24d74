//! Batch flusher — moves pending WAL entries into the authoritative store.
//!
//! Each drain cycle partitions a run's entries by write type: message
//! inserts run bounded-parallel under a semaphore, credit entries collapse
//! into one aggregate deduction, status entries update the run record.
//! Entries that exhaust their retry budget route to the DLQ and their WAL
//! slot is acknowledged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, Semaphore};

use fd_domain::config::FlusherConfig;
use fd_domain::run::RunStatus;
use fd_store::{CreditDeduction, Database, NewMessage};

use crate::backpressure::BackpressureController;
use crate::breaker::CircuitBreaker;
use crate::dlq::DeadLetterQueue;
use crate::metrics::WorkerMetrics;
use crate::retry::{with_retry, ExponentialBackoff};
use crate::wal::{WalEntry, WriteAheadLog, WriteType};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Batch result
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchResult {
    pub success_count: usize,
    pub failed_count: usize,
    pub dlq_count: usize,
    pub duration_ms: f64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// BatchWriter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct BatchWriter {
    wal: Arc<WriteAheadLog>,
    dlq: Arc<DeadLetterQueue>,
    db: Arc<dyn Database>,
    metrics: Arc<WorkerMetrics>,
    breaker: CircuitBreaker,
    config: FlusherConfig,
    persist_semaphore: Arc<Semaphore>,
    retry: ExponentialBackoff,
}

impl BatchWriter {
    pub fn new(
        wal: Arc<WriteAheadLog>,
        dlq: Arc<DeadLetterQueue>,
        db: Arc<dyn Database>,
        metrics: Arc<WorkerMetrics>,
        config: FlusherConfig,
    ) -> Self {
        let retry = ExponentialBackoff::new(
            Duration::from_secs_f64(config.retry_base_delay_seconds),
            Duration::from_secs_f64(config.retry_max_delay_seconds),
            config.max_retries,
        );
        Self {
            wal,
            dlq,
            db,
            metrics,
            breaker: CircuitBreaker::default(),
            persist_semaphore: Arc::new(Semaphore::new(config.max_concurrent_persists)),
            retry,
            config,
        }
    }

    /// Drain one run's pending entries.
    pub async fn flush_run(&self, run_id: &str, account_id: &str) -> BatchResult {
        if !self.breaker.allow() {
            tracing::debug!(run_id, "flush skipped, circuit breaker open");
            return BatchResult::default();
        }

        let start = Instant::now();
        let entries = match self.wal.get_pending(run_id).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(run_id, error = %e, "flush read failed");
                return BatchResult::default();
            }
        };
        if entries.is_empty() {
            return BatchResult::default();
        }

        let messages: Vec<&WalEntry> = entries
            .iter()
            .filter(|e| e.write_type == WriteType::Message)
            .collect();
        let credits: Vec<&WalEntry> = entries
            .iter()
            .filter(|e| e.write_type == WriteType::Credit)
            .collect();
        let statuses: Vec<&WalEntry> = entries
            .iter()
            .filter(|e| e.write_type == WriteType::Status)
            .collect();

        let mut result = BatchResult::default();
        let mut completed_ids: Vec<String> = Vec::new();
        let mut failures: Vec<(&WalEntry, String)> = Vec::new();

        // ── Messages: bounded-parallel inserts in batch_size windows ──
        for window in messages.chunks(self.config.batch_size.max(1)) {
            let inserts = window.iter().map(|entry| {
                let semaphore = self.persist_semaphore.clone();
                async move {
                    let _permit = semaphore.acquire().await;
                    let outcome = self.persist_message(entry).await;
                    (*entry, outcome)
                }
            });
            for (entry, outcome) in join_all(inserts).await {
                match outcome {
                    Ok(()) => completed_ids.push(entry.entry_id.clone()),
                    Err(e) => failures.push((entry, e)),
                }
            }
        }

        // ── Credits: one aggregate deduction per cycle ────────────────
        match self.flush_credits(&credits, run_id, account_id).await {
            Ok(ids) => completed_ids.extend(ids),
            Err(e) => {
                for entry in &credits {
                    failures.push((*entry, e.clone()));
                }
            }
        }

        // ── Statuses: apply run-record updates ────────────────────────
        for entry in &statuses {
            match self.persist_status(entry).await {
                Ok(()) => completed_ids.push(entry.entry_id.clone()),
                Err(e) => failures.push((*entry, e)),
            }
        }

        result.success_count = completed_ids.len();
        if failures.is_empty() {
            self.breaker.record_success();
        } else {
            self.breaker.record_failure();
        }

        for (entry, error) in failures {
            result.failed_count += 1;
            if self.handle_failure(entry, &error).await {
                result.dlq_count += 1;
            }
        }

        if !completed_ids.is_empty() {
            if let Err(e) = self.wal.mark_completed(run_id, &completed_ids).await {
                tracing::warn!(run_id, error = %e, "mark_completed failed");
            }
        }

        result.duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.metrics
            .record_writes_flushed(result.success_count as u64, start.elapsed().as_secs_f64());
        result
    }

    async fn persist_message(&self, entry: &WalEntry) -> Result<(), String> {
        let row: NewMessage =
            serde_json::from_value(entry.data.clone()).map_err(|e| e.to_string())?;
        with_retry(&self.retry, || async { self.db.insert_message(&row).await })
            .await
            .map_err(|e| e.to_string())
    }

    async fn flush_credits(
        &self,
        entries: &[&WalEntry],
        run_id: &str,
        account_id: &str,
    ) -> Result<Vec<String>, String> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let total: f64 = entries
            .iter()
            .map(|e| e.data.get("amount").and_then(|v| v.as_f64()).unwrap_or(0.0))
            .sum();
        let ids: Vec<String> = entries.iter().map(|e| e.entry_id.clone()).collect();

        // Nothing to charge: acknowledge without a DB call.
        if total <= 0.0 {
            return Ok(ids);
        }

        let thread_id = entries[0]
            .data
            .get("thread_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned();

        let deduction = CreditDeduction {
            account_id: account_id.to_owned(),
            amount: total,
            thread_id,
            run_id: run_id.to_owned(),
            description: format!("Agent run {run_id}"),
        };

        with_retry(&self.retry, || async {
            self.db.deduct_credits(&deduction).await
        })
        .await
        .map_err(|e| e.to_string())?;
        Ok(ids)
    }

    async fn persist_status(&self, entry: &WalEntry) -> Result<(), String> {
        let status = entry
            .data
            .get("status")
            .and_then(|v| v.as_str())
            .and_then(RunStatus::parse)
            .ok_or_else(|| "malformed status entry".to_string())?;
        let error = entry.data.get("error").and_then(|v| v.as_str());
        with_retry(&self.retry, || async {
            self.db
                .update_run_status(&entry.run_id, status, error)
                .await
        })
        .await
        .map_err(|e| e.to_string())
    }

    /// Route a failed entry: DLQ once retries are spent, otherwise keep it
    /// pending with an incremented attempt count. Returns true on DLQ.
    async fn handle_failure(&self, entry: &WalEntry, error: &str) -> bool {
        let attempts = entry.attempt_count + 1;
        if attempts >= self.config.max_retries {
            let mut spent = entry.clone();
            spent.attempt_count = attempts;
            let _ = self.dlq.send(&spent, error).await;
            // The DLQ now owns the payload; free the WAL slot either way
            // to avoid an eternal retry loop.
            let _ = self
                .wal
                .mark_completed(&entry.run_id, std::slice::from_ref(&entry.entry_id))
                .await;
            true
        } else {
            let _ = self
                .wal
                .mark_failed(&entry.run_id, &entry.entry_id, error)
                .await;
            false
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// WriteBuffer — the background drain loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct WriteBuffer {
    writer: Arc<BatchWriter>,
    backpressure: Arc<BackpressureController>,
    metrics: Arc<WorkerMetrics>,
    wal: Arc<WriteAheadLog>,
    max_flush_tasks: usize,
    /// run_id → account_id for every run this worker is flushing.
    runs: Mutex<HashMap<String, String>>,
    shutdown: Notify,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WriteBuffer {
    pub fn new(
        writer: Arc<BatchWriter>,
        wal: Arc<WriteAheadLog>,
        backpressure: Arc<BackpressureController>,
        metrics: Arc<WorkerMetrics>,
        max_flush_tasks: usize,
    ) -> Self {
        Self {
            writer,
            backpressure,
            metrics,
            wal,
            max_flush_tasks: max_flush_tasks.max(1),
            runs: Mutex::new(HashMap::new()),
            shutdown: Notify::new(),
            task: Mutex::new(None),
        }
    }

    pub fn register_run(&self, run_id: &str, account_id: &str) {
        self.runs
            .lock()
            .insert(run_id.to_owned(), account_id.to_owned());
    }

    pub fn unregister_run(&self, run_id: &str) {
        self.runs.lock().remove(run_id);
    }

    pub fn tracked_runs(&self) -> usize {
        self.runs.lock().len()
    }

    /// Start the periodic drain loop. The interval follows the
    /// backpressure-recommended cadence each cycle.
    pub fn start(self: &Arc<Self>) {
        let buffer = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let interval = buffer.backpressure.recommended_flush_interval();
                tokio::select! {
                    _ = buffer.shutdown.notified() => break,
                    _ = tokio::time::sleep(Duration::from_secs_f64(interval)) => {}
                }
                buffer.drain_cycle().await;
            }
            tracing::info!("write buffer drain loop stopped");
        });
        *self.task.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        self.shutdown.notify_waiters();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        // Final drain so a graceful shutdown leaves nothing buffered.
        self.flush_all().await;
    }

    async fn drain_cycle(&self) {
        let results = self.flush_all().await;
        let total_flushed: usize = results.values().map(|r| r.success_count).sum();
        if total_flushed > 0 {
            tracing::debug!(runs = results.len(), total_flushed, "drain cycle complete");
        }

        // Feed the controller with fresh pressure readings.
        let stats = self.wal.stats().await;
        self.metrics.pending_writes.set(stats.total_pending as i64);
        let max_latency_ms = results
            .values()
            .map(|r| r.duration_ms)
            .fold(0.0_f64, f64::max);
        self.backpressure.update_metrics(
            stats.total_pending as u64,
            self.metrics.active_runs.get().max(0) as u64,
            max_latency_ms,
            None,
        );
    }

    /// Flush every tracked run, bounded by `max_flush_tasks`.
    pub async fn flush_all(&self) -> HashMap<String, BatchResult> {
        let runs: Vec<(String, String)> = self
            .runs
            .lock()
            .iter()
            .map(|(r, a)| (r.clone(), a.clone()))
            .collect();

        futures_util::stream::iter(runs.into_iter().map(|(run_id, account_id)| {
            let writer = self.writer.clone();
            async move {
                let result = writer.flush_run(&run_id, &account_id).await;
                (run_id, result)
            }
        }))
        .buffer_unordered(self.max_flush_tasks)
        .collect()
        .await
    }

    /// Flush a single run immediately (graceful shutdown, admin action).
    pub async fn flush_one(&self, run_id: &str) -> BatchResult {
        let account_id = self.runs.lock().get(run_id).cloned();
        match account_id {
            Some(account_id) => self.writer.flush_run(run_id, &account_id).await,
            None => BatchResult::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fd_broker::MemoryBroker;
    use fd_domain::config::{DlqConfig, WalConfig};
    use fd_store::MemoryStore;

    struct Fixture {
        wal: Arc<WriteAheadLog>,
        dlq: Arc<DeadLetterQueue>,
        store: Arc<MemoryStore>,
        writer: BatchWriter,
        metrics: Arc<WorkerMetrics>,
    }

    fn fixture() -> Fixture {
        let broker: Arc<MemoryBroker> = Arc::new(MemoryBroker::new());
        let metrics = Arc::new(WorkerMetrics::new());
        let wal = Arc::new(WriteAheadLog::new(
            broker.clone(),
            WalConfig::default(),
            metrics.clone(),
        ));
        let dlq = Arc::new(DeadLetterQueue::new(
            broker.clone(),
            DlqConfig::default(),
            metrics.clone(),
        ));
        let store = Arc::new(MemoryStore::new());
        let writer = BatchWriter::new(
            wal.clone(),
            dlq.clone(),
            store.clone(),
            metrics.clone(),
            FlusherConfig {
                retry_base_delay_seconds: 0.001,
                retry_max_delay_seconds: 0.005,
                ..FlusherConfig::default()
            },
        );
        Fixture {
            wal,
            dlq,
            store,
            writer,
            metrics,
        }
    }

    fn message_data(thread_id: &str, message_id: &str) -> serde_json::Value {
        serde_json::json!({
            "message_id": message_id,
            "thread_id": thread_id,
            "kind": "assistant",
            "content": {"text": "hi"},
            "metadata": null,
            "agent_id": null,
            "is_llm_message": true,
            "created_at": chrono::Utc::now(),
        })
    }

    #[tokio::test]
    async fn flush_persists_messages_and_acks_wal() {
        let f = fixture();
        f.wal
            .append("r1", WriteType::Message, message_data("t1", "m1"))
            .await
            .unwrap();
        f.wal
            .append("r1", WriteType::Message, message_data("t1", "m2"))
            .await
            .unwrap();

        let result = f.writer.flush_run("r1", "acct").await;
        assert_eq!(result.success_count, 2);
        assert_eq!(result.failed_count, 0);
        assert_eq!(f.store.message_count("t1"), 2);
        assert!(f.wal.get_pending("r1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn credits_collapse_into_one_deduction() {
        let f = fixture();
        for amount in [0.2, 0.3, 0.5] {
            f.wal
                .append(
                    "r1",
                    WriteType::Credit,
                    serde_json::json!({"amount": amount, "thread_id": "t1"}),
                )
                .await
                .unwrap();
        }

        let result = f.writer.flush_run("r1", "acct").await;
        assert_eq!(result.success_count, 3);
        let deductions = f.store.deductions();
        assert_eq!(deductions.len(), 1);
        assert!((deductions[0].amount - 1.0).abs() < 1e-9);
        assert_eq!(deductions[0].run_id, "r1");
        assert_eq!(deductions[0].description, "Agent run r1");
    }

    #[tokio::test]
    async fn zero_credit_acks_without_db_call() {
        let f = fixture();
        f.wal
            .append(
                "r1",
                WriteType::Credit,
                serde_json::json!({"amount": 0.0, "thread_id": "t1"}),
            )
            .await
            .unwrap();
        let result = f.writer.flush_run("r1", "acct").await;
        assert_eq!(result.success_count, 1);
        assert!(f.store.deductions().is_empty());
    }

    #[tokio::test]
    async fn status_entries_update_run_record() {
        let f = fixture();
        f.wal
            .append(
                "r1",
                WriteType::Status,
                serde_json::json!({"status": "completed", "error": null}),
            )
            .await
            .unwrap();
        let result = f.writer.flush_run("r1", "acct").await;
        assert_eq!(result.success_count, 1);
        assert_eq!(
            f.store.run_status("r1").unwrap().0,
            fd_domain::run::RunStatus::Completed
        );
    }

    #[tokio::test]
    async fn transient_failures_retry_in_call() {
        let f = fixture();
        // Two transient failures, third in-call attempt succeeds.
        f.store.fail_next_inserts(2, "connection reset");
        f.wal
            .append("r1", WriteType::Message, message_data("t1", "m1"))
            .await
            .unwrap();

        let result = f.writer.flush_run("r1", "acct").await;
        assert_eq!(result.success_count, 1);
        assert_eq!(result.dlq_count, 0);
        assert_eq!(f.store.message_count("t1"), 1);
    }

    #[tokio::test]
    async fn permanent_failure_exhausts_to_dlq() {
        let f = fixture();
        // Non-transient error: no in-call retry, one attempt per cycle.
        f.store.fail_next_inserts(100, "unique constraint violated");
        f.wal
            .append("r1", WriteType::Message, message_data("t1", "m1"))
            .await
            .unwrap();

        // Cycle 1 and 2: failure, attempt_count climbs, entry stays.
        let r1 = f.writer.flush_run("r1", "acct").await;
        assert_eq!(r1.failed_count, 1);
        assert_eq!(r1.dlq_count, 0);
        let r2 = f.writer.flush_run("r1", "acct").await;
        assert_eq!(r2.dlq_count, 0);

        // Cycle 3: attempts reach max_retries → DLQ, WAL slot freed.
        let r3 = f.writer.flush_run("r1", "acct").await;
        assert_eq!(r3.dlq_count, 1);
        assert!(f.wal.get_pending("r1").await.unwrap().is_empty());

        let entries = f.dlq.get_entries(10, Some("r1")).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempt_count, 3);
        assert!(entries[0].error.contains("unique constraint"));
        // DLQ routing is not a drop.
        assert_eq!(f.metrics.writes_dropped.get(), 0);
        assert_eq!(f.metrics.dlq_entries.get(), 1);
    }

    #[tokio::test]
    async fn empty_run_flushes_to_nothing() {
        let f = fixture();
        let result = f.writer.flush_run("ghost", "acct").await;
        assert_eq!(result.success_count, 0);
        assert_eq!(result.failed_count, 0);
    }

    #[tokio::test]
    async fn write_buffer_flush_one_and_unregister() {
        let f = fixture();
        let writer = Arc::new(f.writer);
        let backpressure = Arc::new(BackpressureController::default());
        let buffer = Arc::new(WriteBuffer::new(
            writer,
            f.wal.clone(),
            backpressure,
            f.metrics.clone(),
            4,
        ));

        buffer.register_run("r1", "acct");
        f.wal
            .append("r1", WriteType::Message, message_data("t1", "m1"))
            .await
            .unwrap();

        let result = buffer.flush_one("r1").await;
        assert_eq!(result.success_count, 1);
        assert_eq!(f.store.message_count("t1"), 1);

        buffer.unregister_run("r1");
        assert_eq!(buffer.tracked_runs(), 0);
        // Unregistered runs flush to nothing.
        let result = buffer.flush_one("r1").await;
        assert_eq!(result.success_count, 0);
    }
}
