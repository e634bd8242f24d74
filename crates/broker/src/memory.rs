//! In-process broker backend.
//!
//! Single mutex over a key space; TTLs are enforced lazily on access.
//! Stream ids are `{seq}-0` to stay shape-compatible with Redis ids.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use fd_domain::Result;

use crate::{Broker, StreamEntry};

enum Value {
    Str(String),
    Set(HashSet<String>),
    Stream(VecDeque<StreamEntry>),
}

struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Default)]
pub struct MemoryBroker {
    inner: Mutex<HashMap<String, Slot>>,
    seq: Mutex<u64>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> String {
        let mut seq = self.seq.lock();
        *seq += 1;
        format!("{}-0", *seq)
    }

    /// Drop a key if its TTL has lapsed; returns whether it still exists.
    fn reap<'a>(
        map: &'a mut HashMap<String, Slot>,
        key: &str,
    ) -> Option<&'a mut Slot> {
        if map.get(key).is_some_and(|s| s.expired()) {
            map.remove(key);
        }
        map.get_mut(key)
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut map = self.inner.lock();
        Ok(Self::reap(&mut map, key).and_then(|s| match &s.value {
            Value::Str(v) => Some(v.clone()),
            _ => None,
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut map = self.inner.lock();
        map.insert(
            key.to_owned(),
            Slot {
                value: Value::Str(value.to_owned()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut map = self.inner.lock();
        if Self::reap(&mut map, key).is_some() {
            return Ok(false);
        }
        map.insert(
            key.to_owned(),
            Slot {
                value: Value::Str(value.to_owned()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.lock().remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut map = self.inner.lock();
        if let Some(slot) = Self::reap(&mut map, key) {
            slot.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut map = self.inner.lock();
        map.retain(|_, s| !s.expired());
        Ok(map
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut map = self.inner.lock();
        if map.get(key).is_some_and(|s| s.expired()) {
            map.remove(key);
        }
        let slot = map.entry(key.to_owned()).or_insert_with(|| Slot {
            value: Value::Set(HashSet::new()),
            expires_at: None,
        });
        if !matches!(slot.value, Value::Set(_)) {
            slot.value = Value::Set(HashSet::new());
        }
        if let Value::Set(set) = &mut slot.value {
            set.insert(member.to_owned());
        }
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut map = self.inner.lock();
        if let Some(Slot {
            value: Value::Set(set),
            ..
        }) = Self::reap(&mut map, key)
        {
            set.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut map = self.inner.lock();
        Ok(match Self::reap(&mut map, key) {
            Some(Slot {
                value: Value::Set(set),
                ..
            }) => set.iter().cloned().collect(),
            _ => Vec::new(),
        })
    }

    async fn xadd(
        &self,
        stream: &str,
        payload: &str,
        maxlen: usize,
        _approximate: bool,
    ) -> Result<String> {
        let id = self.next_id();
        let mut map = self.inner.lock();
        if map.get(stream).is_some_and(|s| s.expired()) {
            map.remove(stream);
        }
        let slot = map.entry(stream.to_owned()).or_insert_with(|| Slot {
            value: Value::Stream(VecDeque::new()),
            expires_at: None,
        });
        if !matches!(slot.value, Value::Stream(_)) {
            slot.value = Value::Stream(VecDeque::new());
        }
        if let Value::Stream(entries) = &mut slot.value {
            entries.push_back(StreamEntry {
                id: id.clone(),
                payload: payload.to_owned(),
            });
            while entries.len() > maxlen {
                entries.pop_front();
            }
        }
        Ok(id)
    }

    async fn xrange(&self, stream: &str) -> Result<Vec<StreamEntry>> {
        let mut map = self.inner.lock();
        Ok(match Self::reap(&mut map, stream) {
            Some(Slot {
                value: Value::Stream(entries),
                ..
            }) => entries.iter().cloned().collect(),
            _ => Vec::new(),
        })
    }

    async fn xdel(&self, stream: &str, id: &str) -> Result<()> {
        let mut map = self.inner.lock();
        if let Some(Slot {
            value: Value::Stream(entries),
            ..
        }) = Self::reap(&mut map, stream)
        {
            entries.retain(|e| e.id != id);
        }
        Ok(())
    }

    async fn xlen(&self, stream: &str) -> Result<usize> {
        let mut map = self.inner.lock();
        Ok(match Self::reap(&mut map, stream) {
            Some(Slot {
                value: Value::Stream(entries),
                ..
            }) => entries.len(),
            _ => 0,
        })
    }
}

/// Minimal glob: `*` matches any run of characters. Enough for the
/// `run:{id}:step:*` shapes the worker scans for.
fn glob_match(pattern: &str, value: &str) -> bool {
    fn inner(p: &[u8], v: &[u8]) -> bool {
        match (p.first(), v.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], v) || (!v.is_empty() && inner(p, &v[1..]))
            }
            (Some(pc), Some(vc)) if pc == vc => inner(&p[1..], &v[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), value.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_is_exclusive() {
        let b = MemoryBroker::new();
        assert!(b.set_nx("k", "a", None).await.unwrap());
        assert!(!b.set_nx("k", "b", None).await.unwrap());
        assert_eq!(b.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn ttl_expires_keys() {
        let b = MemoryBroker::new();
        b.set("k", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(b.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(b.get("k").await.unwrap(), None);
        // Expired keys become claimable again.
        assert!(b.set_nx("k", "w", None).await.unwrap());
    }

    #[tokio::test]
    async fn sets_behave() {
        let b = MemoryBroker::new();
        b.sadd("s", "a").await.unwrap();
        b.sadd("s", "b").await.unwrap();
        b.sadd("s", "a").await.unwrap();
        let mut members = b.smembers("s").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["a", "b"]);
        b.srem("s", "a").await.unwrap();
        assert_eq!(b.smembers("s").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn stream_append_caps_at_maxlen() {
        let b = MemoryBroker::new();
        for i in 0..5 {
            b.xadd("st", &format!("p{i}"), 3, false).await.unwrap();
        }
        let entries = b.xrange("st").await.unwrap();
        assert_eq!(entries.len(), 3);
        // Oldest entries dropped.
        assert_eq!(entries[0].payload, "p2");
        assert_eq!(b.xlen("st").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn stream_delete_by_id() {
        let b = MemoryBroker::new();
        let id1 = b.xadd("st", "one", 10, false).await.unwrap();
        let _id2 = b.xadd("st", "two", 10, false).await.unwrap();
        b.xdel("st", &id1).await.unwrap();
        let entries = b.xrange("st").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, "two");
    }

    #[tokio::test]
    async fn scan_matches_glob() {
        let b = MemoryBroker::new();
        b.set("run:1:step:3", "x", None).await.unwrap();
        b.set("run:1:step:7", "x", None).await.unwrap();
        b.set("run:2:step:1", "x", None).await.unwrap();
        let mut keys = b.scan_keys("run:1:step:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["run:1:step:3", "run:1:step:7"]);
    }

    #[test]
    fn glob_edge_cases() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("a*c", "abc"));
        assert!(glob_match("a*c", "ac"));
        assert!(!glob_match("a*c", "ab"));
        assert!(glob_match("run:*:owner", "run:abc:owner"));
    }
}
