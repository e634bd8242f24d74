mod coordination;
mod llm;
mod services;

pub use coordination::*;
pub use llm::*;
pub use services::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub wal: WalConfig,
    #[serde(default)]
    pub flusher: FlusherConfig,
    #[serde(default)]
    pub dlq: DlqConfig,
    #[serde(default)]
    pub backpressure: BackpressureThresholds,
    #[serde(default)]
    pub compression: CompressionConfig,
}

impl Config {
    /// Load a TOML config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.admin.port == 0 {
            issues.push(ConfigIssue::error("admin.port", "port must be greater than 0"));
        }
        if self.coordination.heartbeat_interval_seconds
            >= self.coordination.heartbeat_ttl_seconds
        {
            issues.push(ConfigIssue::error(
                "coordination.heartbeat_interval_seconds",
                "heartbeat interval must be shorter than the heartbeat TTL",
            ));
        }
        if self.coordination.orphan_threshold_seconds
            < self.coordination.heartbeat_ttl_seconds
        {
            issues.push(ConfigIssue::warning(
                "coordination.orphan_threshold_seconds",
                "orphan threshold below heartbeat TTL will flag live runs as orphans",
            ));
        }
        if self.flusher.max_retries == 0 {
            issues.push(ConfigIssue::error(
                "flusher.max_retries",
                "at least one attempt is required",
            ));
        }
        if self.wal.max_local_buffer_runs == 0 || self.wal.max_local_buffer_per_run == 0 {
            issues.push(ConfigIssue::error(
                "wal",
                "local buffer caps must be greater than 0",
            ));
        }
        if matches!(self.broker.backend, BrokerBackend::Redis) && self.broker.url.is_empty() {
            issues.push(ConfigIssue::error(
                "broker.url",
                "redis backend requires a url",
            ));
        }
        if matches!(self.database.backend, DatabaseBackend::Postgres)
            && self.database.url.is_empty()
        {
            issues.push(ConfigIssue::error(
                "database.url",
                "postgres backend requires a url",
            ));
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl ConfigIssue {
    fn error(field: &str, message: &str) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }

    fn warning(field: &str, message: &str) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_coordination_constants() {
        let c = Config::default();
        assert_eq!(c.coordination.max_steps, 100);
        assert_eq!(c.coordination.max_duration_seconds, 3600);
        assert_eq!(c.coordination.heartbeat_interval_seconds, 15);
        assert_eq!(c.coordination.heartbeat_ttl_seconds, 45);
        assert_eq!(c.coordination.claim_ttl_seconds, 3600);
        assert_eq!(c.coordination.orphan_threshold_seconds, 90);
        assert_eq!(c.coordination.recovery_sweep_interval_seconds, 60);
        assert_eq!(c.coordination.stuck_run_threshold_seconds, 7200);
        assert_eq!(c.wal.stream_maxlen, 1000);
        assert_eq!(c.flusher.batch_size, 50);
        assert_eq!(c.flusher.max_concurrent_persists, 20);
        assert_eq!(c.dlq.max_entries, 10_000);
    }

    #[test]
    fn defaults_are_valid() {
        let issues = Config::default().validate();
        assert!(
            issues
                .iter()
                .all(|i| i.severity != ConfigSeverity::Error),
            "{issues:?}"
        );
    }

    #[test]
    fn heartbeat_interval_must_undercut_ttl() {
        let mut c = Config::default();
        c.coordination.heartbeat_interval_seconds = 60;
        let issues = c.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error
                && i.field.contains("heartbeat_interval")));
    }

    #[test]
    fn parses_partial_toml() {
        let raw = r#"
            [coordination]
            max_steps = 10

            [flusher]
            batch_size = 5
        "#;
        let c: Config = toml::from_str(raw).unwrap();
        assert_eq!(c.coordination.max_steps, 10);
        assert_eq!(c.flusher.batch_size, 5);
        // Everything else keeps its default.
        assert_eq!(c.coordination.max_duration_seconds, 3600);
        assert_eq!(c.flusher.max_retries, 3);
    }

    #[test]
    fn redis_backend_requires_url() {
        let mut c = Config::default();
        c.broker.backend = BrokerBackend::Redis;
        c.broker.url = String::new();
        assert!(c
            .validate()
            .iter()
            .any(|i| i.field == "broker.url" && i.severity == ConfigSeverity::Error));
    }
}
