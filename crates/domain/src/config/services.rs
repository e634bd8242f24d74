use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker identity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkerSettings {
    /// Stable worker id. When unset, `WORKER_ID` from the environment is
    /// used, falling back to a random short id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Local mode skips billing and limits prechecks.
    #[serde(default)]
    pub local_mode: bool,
}

impl WorkerSettings {
    pub fn resolve_worker_id(&self) -> String {
        if let Some(id) = &self.worker_id {
            return id.clone();
        }
        if let Ok(id) = std::env::var("WORKER_ID") {
            if !id.is_empty() {
                return id;
            }
        }
        uuid::Uuid::new_v4().to_string()[..8].to_string()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Broker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerBackend {
    /// In-process broker — single-worker deployments and tests.
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub backend: BrokerBackend,
    #[serde(default = "d_redis_url")]
    pub url: String,
    /// Input stream the dispatcher consumes.
    #[serde(default = "d_request_stream")]
    pub request_stream: String,
}

fn d_redis_url() -> String {
    "redis://127.0.0.1:6379".into()
}
fn d_request_stream() -> String {
    "runs:requests".into()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::default(),
            url: d_redis_url(),
            request_stream: d_request_stream(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Database
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: DatabaseBackend,
    #[serde(default = "d_pg_url")]
    pub url: String,
    #[serde(default = "d_fetch_timeout")]
    pub message_fetch_timeout_seconds: u64,
}

fn d_pg_url() -> String {
    "postgres://localhost/flightdeck".into()
}
fn d_fetch_timeout() -> u64 {
    10
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::default(),
            url: d_pg_url(),
            message_fetch_timeout_seconds: d_fetch_timeout(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Admin control plane
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "d_admin_host")]
    pub host: String,
    #[serde(default = "d_admin_port")]
    pub port: u16,
    /// Environment variable holding the admin bearer token.
    /// If the env var is unset, admin endpoints run without auth.
    #[serde(default = "d_admin_token_env")]
    pub token_env: String,
}

fn d_admin_host() -> String {
    "127.0.0.1".into()
}
fn d_admin_port() -> u16 {
    9305
}
fn d_admin_token_env() -> String {
    "FD_ADMIN_TOKEN".into()
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            host: d_admin_host(),
            port: d_admin_port(),
            token_env: d_admin_token_env(),
        }
    }
}
