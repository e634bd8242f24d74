//! Broker contract — the only authoritative shared state between workers.
//!
//! Every cross-worker coordination primitive (run ownership, heartbeats,
//! the WAL, the DLQ, client output streams) is expressed over this small
//! surface: TTL'd keys with set-if-absent, sets, and capped append-only
//! streams. Two implementations exist: [`RedisBroker`] for fleets and
//! [`MemoryBroker`] for single-worker deployments and tests.

pub mod memory;
pub mod redis_broker;

pub use memory::MemoryBroker;
pub use redis_broker::RedisBroker;

use std::time::Duration;

use fd_domain::Result;

/// One entry read back from a stream: broker-assigned id + payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub payload: String,
}

#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    // ── Keys ─────────────────────────────────────────────────────────

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a key, optionally with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Set a key only if absent. Returns true when the write happened.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Keys matching a glob pattern (`run:*:step:*`).
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;

    // ── Sets ─────────────────────────────────────────────────────────

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;

    async fn srem(&self, key: &str, member: &str) -> Result<()>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    // ── Streams ──────────────────────────────────────────────────────

    /// Append to a capped stream. `approximate` allows the broker to trim
    /// lazily (`MAXLEN ~`). Returns the broker-assigned entry id.
    async fn xadd(
        &self,
        stream: &str,
        payload: &str,
        maxlen: usize,
        approximate: bool,
    ) -> Result<String>;

    /// All entries of a stream, oldest first.
    async fn xrange(&self, stream: &str) -> Result<Vec<StreamEntry>>;

    async fn xdel(&self, stream: &str, id: &str) -> Result<()>;

    async fn xlen(&self, stream: &str) -> Result<usize>;
}
