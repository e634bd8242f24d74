//! Worker metrics — counters, gauges, histograms, and the health check
//! derived from them. Rendered as Prometheus text at the admin endpoint.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use serde::Serialize;

use fd_domain::config::CoordinationConfig;

pub struct WorkerMetrics {
    registry: Registry,

    pub active_runs: IntGauge,
    pub owned_runs: IntGauge,
    pub pending_writes: IntGauge,

    pub runs_started: IntCounter,
    pub runs_completed: IntCounter,
    pub runs_failed: IntCounter,
    pub runs_cancelled: IntCounter,
    pub runs_recovered: IntCounter,
    pub writes_flushed: IntCounter,
    pub writes_dropped: IntCounter,
    pub dlq_entries: IntCounter,

    pub run_duration: Histogram,
    pub flush_latency: Histogram,
    pub step_latency: Histogram,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthAlert {
    pub level: &'static str,
    pub metric: &'static str,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub alerts: Vec<HealthAlert>,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
            let g = IntGauge::with_opts(Opts::new(name, help)).expect("static metric");
            registry.register(Box::new(g.clone())).expect("unique metric");
            g
        }
        fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
            let c = IntCounter::with_opts(Opts::new(name, help)).expect("static metric");
            registry.register(Box::new(c.clone())).expect("unique metric");
            c
        }
        fn histogram(registry: &Registry, name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
            let h = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
                .expect("static metric");
            registry.register(Box::new(h.clone())).expect("unique metric");
            h
        }

        Self {
            active_runs: gauge(&registry, "fd_active_runs", "Runs currently executing"),
            owned_runs: gauge(&registry, "fd_owned_runs", "Runs owned by this worker"),
            pending_writes: gauge(&registry, "fd_pending_writes", "WAL entries awaiting flush"),

            runs_started: counter(&registry, "fd_runs_started", "Runs accepted and started"),
            runs_completed: counter(&registry, "fd_runs_completed", "Runs completed"),
            runs_failed: counter(&registry, "fd_runs_failed", "Runs failed"),
            runs_cancelled: counter(&registry, "fd_runs_cancelled", "Runs cancelled"),
            runs_recovered: counter(&registry, "fd_runs_recovered", "Orphan runs reclaimed"),
            writes_flushed: counter(&registry, "fd_writes_flushed", "WAL entries persisted"),
            writes_dropped: counter(
                &registry,
                "fd_writes_dropped",
                "WAL entries lost to local-buffer eviction",
            ),
            dlq_entries: counter(&registry, "fd_dlq_entries", "Entries routed to the DLQ"),

            run_duration: histogram(
                &registry,
                "fd_run_duration_seconds",
                "End-to-end run duration",
                vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0],
            ),
            flush_latency: histogram(
                &registry,
                "fd_flush_latency_seconds",
                "Per-run flush cycle latency",
                vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            ),
            step_latency: histogram(
                &registry,
                "fd_step_latency_seconds",
                "Per-turn latency",
                vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            ),
            registry,
        }
    }

    // ── Recording shortcuts ──────────────────────────────────────────

    pub fn record_run_started(&self) {
        self.runs_started.inc();
        self.active_runs.inc();
    }

    pub fn record_run_completed(&self, duration_secs: f64) {
        self.runs_completed.inc();
        self.active_runs.dec();
        self.run_duration.observe(duration_secs);
    }

    pub fn record_run_failed(&self, duration_secs: f64) {
        self.runs_failed.inc();
        self.active_runs.dec();
        self.run_duration.observe(duration_secs);
    }

    pub fn record_run_cancelled(&self, duration_secs: f64) {
        self.runs_cancelled.inc();
        self.active_runs.dec();
        self.run_duration.observe(duration_secs);
    }

    pub fn record_writes_flushed(&self, count: u64, latency_secs: f64) {
        self.writes_flushed.inc_by(count);
        self.flush_latency.observe(latency_secs);
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(error = %e, "metrics encoding failed");
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Warning-level alerts against the configured thresholds. The worker
    /// is considered healthy unless a critical alert fires (none are
    /// defined today; warnings are operator signals).
    pub fn check_health(&self, config: &CoordinationConfig) -> HealthReport {
        let mut alerts = Vec::new();

        let pending = self.pending_writes.get();
        if pending > config.pending_writes_warning_threshold as i64 {
            alerts.push(HealthAlert {
                level: "warning",
                metric: "pending_writes",
                value: pending as f64,
            });
        }

        let flush_sum = self.flush_latency.get_sample_sum();
        let flush_count = self.flush_latency.get_sample_count();
        if flush_count > 0 {
            let avg = flush_sum / flush_count as f64;
            if avg > config.flush_latency_warning_threshold_seconds {
                alerts.push(HealthAlert {
                    level: "warning",
                    metric: "flush_latency_avg",
                    value: avg,
                });
            }
        }

        let active = self.active_runs.get();
        if active > config.active_runs_warning_threshold as i64 {
            alerts.push(HealthAlert {
                level: "warning",
                metric: "active_runs",
                value: active as f64,
            });
        }

        HealthReport {
            healthy: !alerts.iter().any(|a| a.level == "critical"),
            alerts,
        }
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
