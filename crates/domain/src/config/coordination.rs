use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Coordination constants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Knobs shared by ownership, the execution loop, recovery and lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    #[serde(default = "d_max_messages")]
    pub max_messages: usize,
    #[serde(default = "d_max_tool_results")]
    pub max_tool_results: usize,
    #[serde(default = "d_max_pending_writes")]
    pub max_pending_writes: usize,
    #[serde(default = "d_max_steps")]
    pub max_steps: u32,
    #[serde(default = "d_max_duration")]
    pub max_duration_seconds: u64,
    #[serde(default = "d_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "d_heartbeat_ttl")]
    pub heartbeat_ttl_seconds: u64,
    #[serde(default = "d_claim_ttl")]
    pub claim_ttl_seconds: u64,
    #[serde(default = "d_orphan_threshold")]
    pub orphan_threshold_seconds: u64,
    #[serde(default = "d_recovery_sweep_interval")]
    pub recovery_sweep_interval_seconds: u64,
    #[serde(default = "d_stuck_threshold")]
    pub stuck_run_threshold_seconds: u64,
    #[serde(default = "d_max_thread_locks")]
    pub max_thread_locks: usize,
    #[serde(default = "d_max_flush_tasks")]
    pub max_flush_tasks: usize,
    #[serde(default = "d_max_content_length")]
    pub max_content_length: usize,
    #[serde(default = "d_task_cancel_timeout")]
    pub task_cancel_timeout_seconds: f64,
    #[serde(default = "d_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
    #[serde(default = "d_pending_writes_warning")]
    pub pending_writes_warning_threshold: u64,
    #[serde(default = "d_flush_latency_warning")]
    pub flush_latency_warning_threshold_seconds: f64,
    #[serde(default = "d_active_runs_warning")]
    pub active_runs_warning_threshold: u64,
}

fn d_max_messages() -> usize {
    50
}
fn d_max_tool_results() -> usize {
    20
}
fn d_max_pending_writes() -> usize {
    100
}
fn d_max_steps() -> u32 {
    100
}
fn d_max_duration() -> u64 {
    3600
}
fn d_heartbeat_interval() -> u64 {
    15
}
fn d_heartbeat_ttl() -> u64 {
    45
}
fn d_claim_ttl() -> u64 {
    3600
}
fn d_orphan_threshold() -> u64 {
    90
}
fn d_recovery_sweep_interval() -> u64 {
    60
}
fn d_stuck_threshold() -> u64 {
    7200
}
fn d_max_thread_locks() -> usize {
    100
}
fn d_max_flush_tasks() -> usize {
    10
}
fn d_max_content_length() -> usize {
    100_000
}
fn d_task_cancel_timeout() -> f64 {
    2.0
}
fn d_shutdown_timeout() -> u64 {
    25
}
fn d_pending_writes_warning() -> u64 {
    80
}
fn d_flush_latency_warning() -> f64 {
    10.0
}
fn d_active_runs_warning() -> u64 {
    1000
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            max_messages: d_max_messages(),
            max_tool_results: d_max_tool_results(),
            max_pending_writes: d_max_pending_writes(),
            max_steps: d_max_steps(),
            max_duration_seconds: d_max_duration(),
            heartbeat_interval_seconds: d_heartbeat_interval(),
            heartbeat_ttl_seconds: d_heartbeat_ttl(),
            claim_ttl_seconds: d_claim_ttl(),
            orphan_threshold_seconds: d_orphan_threshold(),
            recovery_sweep_interval_seconds: d_recovery_sweep_interval(),
            stuck_run_threshold_seconds: d_stuck_threshold(),
            max_thread_locks: d_max_thread_locks(),
            max_flush_tasks: d_max_flush_tasks(),
            max_content_length: d_max_content_length(),
            task_cancel_timeout_seconds: d_task_cancel_timeout(),
            shutdown_timeout_seconds: d_shutdown_timeout(),
            pending_writes_warning_threshold: d_pending_writes_warning(),
            flush_latency_warning_threshold_seconds: d_flush_latency_warning(),
            active_runs_warning_threshold: d_active_runs_warning(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Write-ahead log
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Cap on each per-run broker stream.
    #[serde(default = "d_stream_maxlen")]
    pub stream_maxlen: usize,
    #[serde(default = "d_wal_entry_ttl")]
    pub entry_ttl_seconds: u64,
    /// Local fallback: entries kept per run when the broker is down.
    #[serde(default = "d_local_per_run")]
    pub max_local_buffer_per_run: usize,
    /// Local fallback: distinct runs kept before whole-run LRU eviction.
    #[serde(default = "d_local_runs")]
    pub max_local_buffer_runs: usize,
}

fn d_stream_maxlen() -> usize {
    1000
}
fn d_wal_entry_ttl() -> u64 {
    3600
}
fn d_local_per_run() -> usize {
    100
}
fn d_local_runs() -> usize {
    50
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            stream_maxlen: d_stream_maxlen(),
            entry_ttl_seconds: d_wal_entry_ttl(),
            max_local_buffer_per_run: d_local_per_run(),
            max_local_buffer_runs: d_local_runs(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Batch flusher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlusherConfig {
    #[serde(default = "d_flush_interval")]
    pub interval_seconds: f64,
    #[serde(default = "d_batch_size")]
    pub batch_size: usize,
    #[serde(default = "d_max_concurrent_persists")]
    pub max_concurrent_persists: usize,
    #[serde(default = "d_max_retries")]
    pub max_retries: u32,
    #[serde(default = "d_retry_base_delay")]
    pub retry_base_delay_seconds: f64,
    #[serde(default = "d_retry_max_delay")]
    pub retry_max_delay_seconds: f64,
}

fn d_flush_interval() -> f64 {
    5.0
}
fn d_batch_size() -> usize {
    50
}
fn d_max_concurrent_persists() -> usize {
    20
}
fn d_max_retries() -> u32 {
    3
}
fn d_retry_base_delay() -> f64 {
    0.1
}
fn d_retry_max_delay() -> f64 {
    5.0
}

impl Default for FlusherConfig {
    fn default() -> Self {
        Self {
            interval_seconds: d_flush_interval(),
            batch_size: d_batch_size(),
            max_concurrent_persists: d_max_concurrent_persists(),
            max_retries: d_max_retries(),
            retry_base_delay_seconds: d_retry_base_delay(),
            retry_max_delay_seconds: d_retry_max_delay(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dead-letter queue
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqConfig {
    #[serde(default = "d_dlq_max_entries")]
    pub max_entries: usize,
    #[serde(default = "d_dlq_ttl")]
    pub entry_ttl_seconds: u64,
}

fn d_dlq_max_entries() -> usize {
    10_000
}
fn d_dlq_ttl() -> u64 {
    86_400 * 7
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_entries: d_dlq_max_entries(),
            entry_ttl_seconds: d_dlq_ttl(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backpressure thresholds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Three-step thresholds per metric (elevated / high / critical).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureThresholds {
    #[serde(default = "d_pw_elevated")]
    pub pending_writes_elevated: u64,
    #[serde(default = "d_pw_high")]
    pub pending_writes_high: u64,
    #[serde(default = "d_pw_critical")]
    pub pending_writes_critical: u64,
    #[serde(default = "d_ar_elevated")]
    pub active_runs_elevated: u64,
    #[serde(default = "d_ar_high")]
    pub active_runs_high: u64,
    #[serde(default = "d_ar_critical")]
    pub active_runs_critical: u64,
    #[serde(default = "d_fl_elevated")]
    pub flush_latency_elevated_ms: f64,
    #[serde(default = "d_fl_high")]
    pub flush_latency_high_ms: f64,
    #[serde(default = "d_fl_critical")]
    pub flush_latency_critical_ms: f64,
    #[serde(default = "d_mem_elevated")]
    pub memory_percent_elevated: f64,
    #[serde(default = "d_mem_high")]
    pub memory_percent_high: f64,
    #[serde(default = "d_mem_critical")]
    pub memory_percent_critical: f64,
}

fn d_pw_elevated() -> u64 {
    50
}
fn d_pw_high() -> u64 {
    80
}
fn d_pw_critical() -> u64 {
    95
}
fn d_ar_elevated() -> u64 {
    300
}
fn d_ar_high() -> u64 {
    500
}
fn d_ar_critical() -> u64 {
    800
}
fn d_fl_elevated() -> f64 {
    500.0
}
fn d_fl_high() -> f64 {
    2000.0
}
fn d_fl_critical() -> f64 {
    5000.0
}
fn d_mem_elevated() -> f64 {
    60.0
}
fn d_mem_high() -> f64 {
    75.0
}
fn d_mem_critical() -> f64 {
    90.0
}

impl Default for BackpressureThresholds {
    fn default() -> Self {
        Self {
            pending_writes_elevated: d_pw_elevated(),
            pending_writes_high: d_pw_high(),
            pending_writes_critical: d_pw_critical(),
            active_runs_elevated: d_ar_elevated(),
            active_runs_high: d_ar_high(),
            active_runs_critical: d_ar_critical(),
            flush_latency_elevated_ms: d_fl_elevated(),
            flush_latency_high_ms: d_fl_high(),
            flush_latency_critical_ms: d_fl_critical(),
            memory_percent_elevated: d_mem_elevated(),
            memory_percent_high: d_mem_high(),
            memory_percent_critical: d_mem_critical(),
        }
    }
}
