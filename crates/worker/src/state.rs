//! Shared worker state passed to every component.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use fd_broker::Broker;
use fd_domain::config::Config;
use fd_domain::errmap::ErrorMapper;
use fd_providers::LlmProvider;
use fd_store::Database;

use crate::backpressure::BackpressureController;
use crate::cancel::CancelMap;
use crate::compressor::ContextCompressor;
use crate::dlq::DeadLetterQueue;
use crate::estimator::TimeEstimator;
use crate::events::EventPublisher;
use crate::flusher::{BatchWriter, WriteBuffer};
use crate::metrics::WorkerMetrics;
use crate::ownership::{IdempotencyTracker, RunOwnership};
use crate::prep::McpLoader;
use crate::thread_lock::ThreadLockMap;
use crate::tools::ToolRegistry;
use crate::wal::WriteAheadLog;

/// Shared state, grouped by concern:
/// - **External seams** — config, broker, database, LLM provider
/// - **Persistence** — WAL, DLQ, write buffer
/// - **Coordination** — ownership, idempotency, backpressure, locks
/// - **Run plumbing** — cancel map, publisher, compressor, estimator
#[derive(Clone)]
pub struct WorkerState {
    // ── External seams ───────────────────────────────────────────────
    pub config: Arc<Config>,
    pub broker: Arc<dyn Broker>,
    pub db: Arc<dyn Database>,
    pub llm: Arc<dyn LlmProvider>,
    pub tools: Arc<ToolRegistry>,
    pub mcp: Option<Arc<dyn McpLoader>>,

    // ── Persistence ──────────────────────────────────────────────────
    pub wal: Arc<WriteAheadLog>,
    pub dlq: Arc<DeadLetterQueue>,
    pub write_buffer: Arc<WriteBuffer>,

    // ── Coordination ─────────────────────────────────────────────────
    pub ownership: Arc<RunOwnership>,
    pub idempotency: Arc<IdempotencyTracker>,
    pub backpressure: Arc<BackpressureController>,
    pub thread_locks: Arc<ThreadLockMap>,
    pub metrics: Arc<WorkerMetrics>,

    // ── Run plumbing ─────────────────────────────────────────────────
    pub cancel_map: Arc<CancelMap>,
    pub publisher: Arc<EventPublisher>,
    pub compressor: Arc<ContextCompressor>,
    pub estimator: Arc<TimeEstimator>,
    pub mapper: Arc<ErrorMapper>,
    /// run_id → executing task, for drain on shutdown.
    pub run_tasks: Arc<Mutex<HashMap<String, tokio::task::JoinHandle<()>>>>,
}

impl WorkerState {
    /// Wire up a worker from its four external seams. The summarizer
    /// shares the main provider unless the config names another model.
    pub fn build(
        config: Arc<Config>,
        broker: Arc<dyn Broker>,
        db: Arc<dyn Database>,
        llm: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        mcp: Option<Arc<dyn McpLoader>>,
    ) -> Self {
        let metrics = Arc::new(WorkerMetrics::new());
        let backpressure = Arc::new(BackpressureController::new(config.backpressure.clone()));

        let wal = Arc::new(WriteAheadLog::new(
            broker.clone(),
            config.wal.clone(),
            metrics.clone(),
        ));
        let dlq = Arc::new(DeadLetterQueue::new(
            broker.clone(),
            config.dlq.clone(),
            metrics.clone(),
        ));
        let writer = Arc::new(BatchWriter::new(
            wal.clone(),
            dlq.clone(),
            db.clone(),
            metrics.clone(),
            config.flusher.clone(),
        ));
        let write_buffer = Arc::new(WriteBuffer::new(
            writer,
            wal.clone(),
            backpressure.clone(),
            metrics.clone(),
            config.coordination.max_flush_tasks,
        ));

        let worker_id = config.worker.resolve_worker_id();
        let ownership = Arc::new(RunOwnership::new(
            worker_id,
            broker.clone(),
            config.coordination.clone(),
        ));
        let idempotency = Arc::new(IdempotencyTracker::new(broker.clone()));

        let compressor = Arc::new(ContextCompressor::new(
            config.llm.clone(),
            config.compression.clone(),
            llm.clone(),
        ));

        Self {
            thread_locks: Arc::new(ThreadLockMap::new(config.coordination.max_thread_locks)),
            publisher: Arc::new(EventPublisher::new(broker.clone())),
            cancel_map: Arc::new(CancelMap::new()),
            estimator: Arc::new(TimeEstimator::new()),
            mapper: Arc::new(ErrorMapper::new()),
            run_tasks: Arc::new(Mutex::new(HashMap::new())),
            config,
            broker,
            db,
            llm,
            tools,
            mcp,
            wal,
            dlq,
            write_buffer,
            ownership,
            idempotency,
            backpressure,
            metrics,
            compressor,
        }
    }
}
