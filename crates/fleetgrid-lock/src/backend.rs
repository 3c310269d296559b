//! Lock backends — where lock records live.

use std::collections::HashMap;
use std::sync::Mutex;

use fleetgrid_state::{LockRecord, StateStore};

use crate::error::LockResult;

/// A store able to insert a lock record conditionally and atomically.
pub trait LockBackend: Send + Sync {
    /// Insert `record` unless a different owner holds an unexpired lock on
    /// the same key. Re-inserting with the same owner refreshes the expiry.
    fn try_acquire(&self, record: &LockRecord, now_ms: u64) -> LockResult<bool>;

    /// Remove the lock on `key` if `owner` holds it.
    fn release(&self, key: &str, owner: &str) -> LockResult<bool>;

    /// Every stored record, expired or not.
    fn list(&self) -> LockResult<Vec<LockRecord>>;
}

impl LockBackend for StateStore {
    fn try_acquire(&self, record: &LockRecord, now_ms: u64) -> LockResult<bool> {
        Ok(self.try_acquire_lock(record, now_ms)?)
    }

    fn release(&self, key: &str, owner: &str) -> LockResult<bool> {
        Ok(self.release_lock(key, owner)?)
    }

    fn list(&self) -> LockResult<Vec<LockRecord>> {
        Ok(self.list_locks()?)
    }
}

/// Process-local lock table.
#[derive(Debug, Default)]
pub struct MemoryLockBackend {
    locks: Mutex<HashMap<String, LockRecord>>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockBackend for MemoryLockBackend {
    fn try_acquire(&self, record: &LockRecord, now_ms: u64) -> LockResult<bool> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let free = match locks.get(&record.key) {
            None => true,
            Some(cur) => cur.owner == record.owner || cur.is_expired(now_ms),
        };
        if free {
            locks.insert(record.key.clone(), record.clone());
        }
        Ok(free)
    }

    fn release(&self, key: &str, owner: &str) -> LockResult<bool> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(key).is_some_and(|cur| cur.owner == owner) {
            locks.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    fn list(&self) -> LockResult<Vec<LockRecord>> {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Ok(locks.values().cloned().collect())
    }
}
