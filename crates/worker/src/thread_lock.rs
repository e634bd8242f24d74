//! Per-thread run exclusivity.
//!
//! No two turns of the same thread may run in parallel inside a worker.
//! Each thread id maps to a `Semaphore(1)`; the map itself is capped at
//! `max_thread_locks` distinct entries, with idle entries pruned first.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use fd_domain::{Error, Result};

pub struct ThreadLockMap {
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
    max_locks: usize,
}

impl ThreadLockMap {
    pub fn new(max_locks: usize) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            max_locks,
        }
    }

    /// Acquire the run lock for a thread. The permit auto-releases on drop.
    pub async fn acquire(&self, thread_id: &str) -> Result<OwnedSemaphorePermit> {
        let sem = {
            let mut locks = self.locks.lock();
            if !locks.contains_key(thread_id) && locks.len() >= self.max_locks {
                // Drop idle locks to make room before refusing.
                locks.retain(|_, sem| sem.available_permits() == 0);
                if locks.len() >= self.max_locks {
                    return Err(Error::Other(format!(
                        "thread lock map full ({} locks)",
                        self.max_locks
                    )));
                }
            }
            locks
                .entry(thread_id.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };

        sem.acquire_owned()
            .await
            .map_err(|_| Error::Other("thread lock closed".into()))
    }

    pub fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Remove locks that aren't actively held.
    pub fn prune_idle(&self) {
        self.locks
            .lock()
            .retain(|_, sem| sem.available_permits() == 0);
    }
}
