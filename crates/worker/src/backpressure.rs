//! Backpressure controller — translates live metrics into an enforceable
//! load level.
//!
//! Four inputs (pending writes, active runs, flush latency, memory
//! occupancy) each map to a three-step level; the overall level is their
//! maximum. Derived knobs throttle admission and tune the flusher.

use parking_lot::Mutex;
use serde::Serialize;

use fd_domain::config::BackpressureThresholds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadLevel {
    Normal,
    Elevated,
    High,
    Critical,
}

impl LoadLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Elevated => "elevated",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackpressureState {
    pub level: LoadLevel,
    pub pending_writes: u64,
    pub active_runs: u64,
    pub flush_latency_ms: f64,
    pub memory_percent: f64,
    pub should_accept_work: bool,
    pub should_shed_load: bool,
    pub recommended_batch_size: usize,
    pub recommended_flush_interval: f64,
}

type LevelCallback = Box<dyn Fn(LoadLevel, LoadLevel) + Send + Sync>;

struct Metrics {
    pending_writes: u64,
    active_runs: u64,
    flush_latency_ms: f64,
    memory_percent: f64,
    level: LoadLevel,
}

pub struct BackpressureController {
    thresholds: BackpressureThresholds,
    metrics: Mutex<Metrics>,
    callbacks: Mutex<Vec<LevelCallback>>,
}

impl BackpressureController {
    pub fn new(thresholds: BackpressureThresholds) -> Self {
        Self {
            thresholds,
            metrics: Mutex::new(Metrics {
                pending_writes: 0,
                active_runs: 0,
                flush_latency_ms: 0.0,
                memory_percent: 0.0,
                level: LoadLevel::Normal,
            }),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn on_level_change(&self, callback: impl Fn(LoadLevel, LoadLevel) + Send + Sync + 'static) {
        self.callbacks.lock().push(Box::new(callback));
    }

    pub fn level(&self) -> LoadLevel {
        self.metrics.lock().level
    }

    /// Refresh the inputs and recompute the level. `memory_percent` falls
    /// back to a `/proc` reading when not supplied.
    pub fn update_metrics(
        &self,
        pending_writes: u64,
        active_runs: u64,
        flush_latency_ms: f64,
        memory_percent: Option<f64>,
    ) -> BackpressureState {
        let memory_percent = memory_percent.unwrap_or_else(process_memory_percent);

        let (old_level, new_level) = {
            let mut m = self.metrics.lock();
            m.pending_writes = pending_writes;
            m.active_runs = active_runs;
            m.flush_latency_ms = flush_latency_ms;
            m.memory_percent = memory_percent;
            let old = m.level;
            m.level = self.calculate_level(&m);
            (old, m.level)
        };

        if new_level != old_level {
            tracing::warn!(
                from = old_level.as_str(),
                to = new_level.as_str(),
                "backpressure level changed"
            );
            for callback in self.callbacks.lock().iter() {
                callback(old_level, new_level);
            }
        }

        self.state()
    }

    fn calculate_level(&self, m: &Metrics) -> LoadLevel {
        let t = &self.thresholds;

        fn step<N: PartialOrd>(value: N, elevated: N, high: N, critical: N) -> LoadLevel {
            if value >= critical {
                LoadLevel::Critical
            } else if value >= high {
                LoadLevel::High
            } else if value >= elevated {
                LoadLevel::Elevated
            } else {
                LoadLevel::Normal
            }
        }

        // Max of the per-metric levels.
        [
            step(
                m.pending_writes,
                t.pending_writes_elevated,
                t.pending_writes_high,
                t.pending_writes_critical,
            ),
            step(
                m.active_runs,
                t.active_runs_elevated,
                t.active_runs_high,
                t.active_runs_critical,
            ),
            step(
                m.flush_latency_ms,
                t.flush_latency_elevated_ms,
                t.flush_latency_high_ms,
                t.flush_latency_critical_ms,
            ),
            step(
                m.memory_percent,
                t.memory_percent_elevated,
                t.memory_percent_high,
                t.memory_percent_critical,
            ),
        ]
        .into_iter()
        .max()
        .unwrap_or(LoadLevel::Normal)
    }

    pub fn state(&self) -> BackpressureState {
        let m = self.metrics.lock();
        let level = m.level;

        let (batch_size, flush_interval) = match level {
            LoadLevel::Normal => (100, 5.0),
            LoadLevel::Elevated => (75, 3.0),
            LoadLevel::High => (50, 2.0),
            LoadLevel::Critical => (25, 1.0),
        };

        BackpressureState {
            level,
            pending_writes: m.pending_writes,
            active_runs: m.active_runs,
            flush_latency_ms: m.flush_latency_ms,
            memory_percent: m.memory_percent,
            should_accept_work: level != LoadLevel::Critical,
            should_shed_load: matches!(level, LoadLevel::High | LoadLevel::Critical),
            recommended_batch_size: batch_size,
            recommended_flush_interval: flush_interval,
        }
    }

    pub fn should_accept_work(&self) -> bool {
        self.state().should_accept_work
    }

    pub fn recommended_batch_size(&self) -> usize {
        self.state().recommended_batch_size
    }

    pub fn recommended_flush_interval(&self) -> f64 {
        self.state().recommended_flush_interval
    }
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::new(BackpressureThresholds::default())
    }
}

/// Resident-set share of total system memory, via /proc. Returns 0.0
/// where unavailable (non-Linux, containers without /proc).
pub fn process_memory_percent() -> f64 {
    fn read_kb(path: &str, key: &str) -> Option<f64> {
        let content = std::fs::read_to_string(path).ok()?;
        for line in content.lines() {
            if let Some(rest) = line.strip_prefix(key) {
                let kb: f64 = rest
                    .trim()
                    .trim_end_matches("kB")
                    .trim()
                    .parse()
                    .ok()?;
                return Some(kb);
            }
        }
        None
    }

    let rss = read_kb("/proc/self/status", "VmRSS:");
    let total = read_kb("/proc/meminfo", "MemTotal:");
    match (rss, total) {
        (Some(rss), Some(total)) if total > 0.0 => (rss / total) * 100.0,
        _ => 0.0,
    }
}
