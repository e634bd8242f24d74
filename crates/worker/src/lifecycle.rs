//! Worker lifecycle — ordered startup and shutdown.
//!
//! Startup: signals → flusher → heartbeats → recovery loop → one-time
//! startup recovery → user hooks → dispatcher.
//! Shutdown (25s budget): dispatcher stop → recovery stop → graceful
//! ownership release (flush + mark resumable, stop in-flight tasks) →
//! flusher stop → user hooks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use crate::dispatcher::Dispatcher;
use crate::metrics::HealthReport;
use crate::recovery::RecoverySweeper;
use crate::state::WorkerState;

type Hook = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleHealth {
    pub healthy: bool,
    pub ready: bool,
    pub initialized: bool,
    pub shutting_down: bool,
    pub worker_id: String,
    pub owned_runs: usize,
    pub tracked_flush_runs: usize,
    pub report: HealthReport,
}

pub struct WorkerLifecycle {
    state: WorkerState,
    dispatcher: Arc<Dispatcher>,
    recovery: Arc<RecoverySweeper>,
    shutdown_event: Arc<Notify>,
    shutdown_requested: Arc<AtomicBool>,
    initialized: AtomicBool,
    shutting_down: AtomicBool,
    startup_hooks: Mutex<Vec<Hook>>,
    shutdown_hooks: Mutex<Vec<Hook>>,
}

impl WorkerLifecycle {
    pub fn new(
        state: WorkerState,
        dispatcher: Arc<Dispatcher>,
        recovery: Arc<RecoverySweeper>,
    ) -> Self {
        Self {
            state,
            dispatcher,
            recovery,
            shutdown_event: Arc::new(Notify::new()),
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            initialized: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            startup_hooks: Mutex::new(Vec::new()),
            shutdown_hooks: Mutex::new(Vec::new()),
        }
    }

    pub fn on_startup(&self, hook: impl Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static) {
        self.startup_hooks.lock().push(Box::new(hook));
    }

    pub fn on_shutdown(&self, hook: impl Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static) {
        self.shutdown_hooks.lock().push(Box::new(hook));
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn is_healthy(&self) -> bool {
        self.is_initialized() && !self.is_shutting_down()
    }

    /// Ordered startup.
    pub async fn initialize(self: &Arc<Self>) {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return;
        }

        self.install_signal_handlers();
        tracing::info!("signal handlers installed");

        self.state.write_buffer.start();
        tracing::info!("flusher started");

        self.state.ownership.start_heartbeats();

        self.recovery.start();
        tracing::info!("recovery sweeper started");

        let resumed = self.recovery.recover_on_startup().await;
        tracing::info!(resumed, "startup orphan recovery complete");

        let hooks: Vec<BoxFuture<'static, ()>> =
            self.startup_hooks.lock().iter().map(|h| h()).collect();
        for hook in hooks {
            hook.await;
        }

        self.dispatcher.start();
        tracing::info!(worker_id = %self.state.ownership.worker_id(), "worker initialized");
    }

    fn install_signal_handlers(&self) {
        let event = self.shutdown_event.clone();
        let requested = self.shutdown_requested.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut term =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("SIGTERM handler");
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received SIGINT"),
                    _ = term.recv() => tracing::info!("received SIGTERM"),
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
                tracing::info!("received ctrl-c");
            }
            requested.store(true, Ordering::Release);
            event.notify_waiters();
        });
    }

    /// Block until a shutdown signal arrives.
    pub async fn wait_for_shutdown(&self) {
        if self.shutdown_requested.load(Ordering::Acquire) {
            return;
        }
        self.shutdown_event.notified().await;
    }

    /// Request shutdown programmatically (admin/testing path).
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
        self.shutdown_event.notify_waiters();
    }

    /// Ordered shutdown within the configured budget. Runs that cannot
    /// drain in time are force-marked resumable.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let budget =
            Duration::from_secs(self.state.config.coordination.shutdown_timeout_seconds);
        tracing::info!(budget_secs = budget.as_secs(), "shutdown starting");

        match tokio::time::timeout(budget, self.do_shutdown()).await {
            Ok(()) => tracing::info!("shutdown complete"),
            Err(_) => {
                tracing::error!("shutdown budget exceeded, force-marking owned runs resumable");
                for run_id in self.state.ownership.owned_runs() {
                    self.state.ownership.mark_resumable(&run_id).await;
                }
            }
        }
    }

    async fn do_shutdown(&self) {
        self.dispatcher.stop().await;
        self.recovery.stop().await;

        self.graceful_release_owned().await;

        self.state.write_buffer.stop().await;

        let hooks: Vec<BoxFuture<'static, ()>> =
            self.shutdown_hooks.lock().iter().map(|h| h()).collect();
        for hook in hooks {
            hook.await;
        }
    }

    /// For every owned run: signal cancellation, give the task a short
    /// window to reach a turn boundary, flush its WAL, mark it
    /// resumable for the fleet.
    async fn graceful_release_owned(&self) {
        self.state.ownership.stop_heartbeats().await;

        let owned = self.state.ownership.owned_runs();
        if owned.is_empty() {
            return;
        }
        tracing::info!(count = owned.len(), "releasing owned runs as resumable");

        let cancel_window = Duration::from_secs_f64(
            self.state.config.coordination.task_cancel_timeout_seconds,
        );
        for run_id in &owned {
            self.state.cancel_map.cancel(run_id);
        }

        let handles: Vec<(String, tokio::task::JoinHandle<()>)> = {
            let mut tasks = self.state.run_tasks.lock();
            owned
                .iter()
                .filter_map(|run_id| tasks.remove(run_id).map(|h| (run_id.clone(), h)))
                .collect()
        };
        for (run_id, mut handle) in handles {
            if tokio::time::timeout(cancel_window, &mut handle).await.is_err() {
                tracing::warn!(run_id = %run_id, "run task did not stop in time, aborting");
                handle.abort();
            }
        }

        // Cancelled tasks released ownership themselves; whatever is
        // still owned gets flushed and handed back to the fleet.
        for run_id in self.state.ownership.owned_runs() {
            let _ = self.state.write_buffer.flush_one(&run_id).await;
            self.state.ownership.mark_resumable(&run_id).await;
        }
    }

    pub async fn health(&self) -> LifecycleHealth {
        let report = self
            .state
            .metrics
            .check_health(&self.state.config.coordination);
        LifecycleHealth {
            healthy: self.is_healthy() && report.healthy,
            ready: self.is_healthy(),
            initialized: self.is_initialized(),
            shutting_down: self.is_shutting_down(),
            worker_id: self.state.ownership.worker_id().to_owned(),
            owned_runs: self.state.ownership.owned_count(),
            tracked_flush_runs: self.state.write_buffer.tracked_runs(),
            report,
        }
    }
}
