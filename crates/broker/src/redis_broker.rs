//! Redis broker backend.
//!
//! Uses a multiplexed [`ConnectionManager`] so every component can hold a
//! cheap clone. All commands are issued explicitly via `redis::cmd` to keep
//! the wire shapes obvious (SET NX EX, XADD MAXLEN ~, XRANGE - +).

use std::time::Duration;

use redis::aio::ConnectionManager;

use fd_domain::{Error, Result};

use crate::{Broker, StreamEntry};

#[derive(Clone)]
pub struct RedisBroker {
    manager: ConnectionManager,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(from_redis)?;
        let manager = ConnectionManager::new(client).await.map_err(from_redis)?;
        Ok(Self { manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn from_redis(e: redis::RedisError) -> Error {
    Error::Broker(e.to_string())
}

#[async_trait::async_trait]
impl Broker for RedisBroker {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(from_redis)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        cmd.query_async::<()>(&mut conn).await.map_err(from_redis)
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        // SET NX returns OK on success, nil when the key already exists.
        let reply: Option<String> = cmd.query_async(&mut conn).await.map_err(from_redis)?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .map_err(from_redis)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .query_async::<()>(&mut conn)
            .await
            .map_err(from_redis)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(from_redis)?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async::<()>(&mut conn)
            .await
            .map_err(from_redis)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async::<()>(&mut conn)
            .await
            .map_err(from_redis)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(from_redis)
    }

    async fn xadd(
        &self,
        stream: &str,
        payload: &str,
        maxlen: usize,
        approximate: bool,
    ) -> Result<String> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("MAXLEN");
        if approximate {
            cmd.arg("~");
        }
        cmd.arg(maxlen).arg("*").arg("payload").arg(payload);
        cmd.query_async(&mut conn).await.map_err(from_redis)
    }

    async fn xrange(&self, stream: &str) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn();
        let raw: Vec<(String, Vec<(String, String)>)> = redis::cmd("XRANGE")
            .arg(stream)
            .arg("-")
            .arg("+")
            .query_async(&mut conn)
            .await
            .map_err(from_redis)?;
        Ok(raw
            .into_iter()
            .filter_map(|(id, fields)| {
                fields
                    .into_iter()
                    .find(|(name, _)| name == "payload")
                    .map(|(_, payload)| StreamEntry { id, payload })
            })
            .collect())
    }

    async fn xdel(&self, stream: &str, id: &str) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("XDEL")
            .arg(stream)
            .arg(id)
            .query_async::<()>(&mut conn)
            .await
            .map_err(from_redis)
    }

    async fn xlen(&self, stream: &str) -> Result<usize> {
        let mut conn = self.conn();
        redis::cmd("XLEN")
            .arg(stream)
            .query_async(&mut conn)
            .await
            .map_err(from_redis)
    }
}
