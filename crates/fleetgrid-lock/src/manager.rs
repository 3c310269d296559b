//! Lock manager — acquire with timeout, optional renewal, release.
//!
//! Acquisition polls the backend until the conditional insert succeeds or the
//! caller's timeout elapses. Every lock carries an expiry so a crashed holder
//! cannot block a resource forever; long operations take a renewing handle
//! whose background task pushes the expiry forward until release.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fleetgrid_state::LockRecord;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::LockBackend;
use crate::error::{LockError, LockResult};

/// Lock key guarding a whole deployment.
pub fn deployment_key(name: &str) -> String {
    format!("deployment/{name}")
}

/// Lock key guarding reservations on one network.
pub fn network_key(name: &str) -> String {
    format!("network/{name}")
}

/// Acquires and releases expiring locks.
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    expiry: Duration,
    poll_interval: Duration,
}

/// Proof of holding a lock. Dropping it stops renewal but leaves the record
/// to expire; call [`LockManager::release`] to free the resource promptly.
#[derive(Debug)]
pub struct LockHandle {
    key: String,
    owner: String,
    renewal: Option<Renewal>,
}

#[derive(Debug)]
struct Renewal {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Token identifying the holder; re-acquiring with it refreshes the lock.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn stop_renewal(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            let _ = renewal.stop.send(true);
            renewal.handle.abort();
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.stop_renewal();
    }
}

impl LockManager {
    /// Create a manager with a 60s expiry and 500ms poll interval.
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self {
            backend,
            expiry: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Acquire `key` under a fresh owner token.
    pub async fn acquire(&self, key: &str, timeout: Duration) -> LockResult<LockHandle> {
        let owner = uuid::Uuid::new_v4().to_string();
        self.acquire_as(key, &owner, timeout).await
    }

    /// Acquire `key` for `owner`. If `owner` already holds it, the expiry is
    /// refreshed and the call succeeds immediately.
    pub async fn acquire_as(
        &self,
        key: &str,
        owner: &str,
        timeout: Duration,
    ) -> LockResult<LockHandle> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_insert(key, owner)? {
                debug!(%key, %owner, "lock acquired");
                return Ok(LockHandle {
                    key: key.to_string(),
                    owner: owner.to_string(),
                    renewal: None,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(%key, ?timeout, "lock acquisition timed out");
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited: timeout,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Acquire `key` and keep it alive in the background until released.
    pub async fn acquire_renewing(&self, key: &str, timeout: Duration) -> LockResult<LockHandle> {
        let mut handle = self.acquire(key, timeout).await?;
        let (stop, mut stopped) = watch::channel(false);

        let backend = self.backend.clone();
        let expiry = self.expiry;
        let key_owned = handle.key.clone();
        let owner = handle.owner.clone();
        let period = (expiry / 2).max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        let record = LockRecord {
                            key: key_owned.clone(),
                            owner: owner.clone(),
                            expires_at_ms: epoch_millis() + expiry.as_millis() as u64,
                        };
                        match backend.try_acquire(&record, epoch_millis()) {
                            Ok(true) => debug!(key = %key_owned, "lock renewed"),
                            Ok(false) => {
                                warn!(key = %key_owned, "lock lost to another owner, renewal stopped");
                                break;
                            }
                            Err(e) => warn!(key = %key_owned, error = %e, "lock renewal failed"),
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }
        });

        handle.renewal = Some(Renewal { handle: task, stop });
        info!(%key, "lock acquired with renewal");
        Ok(handle)
    }

    /// Push the expiry of a held lock forward. Returns false if it was lost.
    pub fn refresh(&self, handle: &LockHandle) -> LockResult<bool> {
        self.try_insert(&handle.key, &handle.owner)
    }

    /// Release a held lock.
    pub fn release(&self, mut handle: LockHandle) -> LockResult<()> {
        handle.stop_renewal();
        if self.backend.release(&handle.key, &handle.owner)? {
            debug!(key = %handle.key, "lock released");
        } else {
            warn!(key = %handle.key, "lock already expired or taken over at release");
        }
        Ok(())
    }

    /// Unexpired locks.
    pub fn live_locks(&self) -> LockResult<Vec<LockRecord>> {
        let now = epoch_millis();
        let mut locks: Vec<LockRecord> = self
            .backend
            .list()?
            .into_iter()
            .filter(|l| !l.is_expired(now))
            .collect();
        locks.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(locks)
    }

    fn try_insert(&self, key: &str, owner: &str) -> LockResult<bool> {
        let now = epoch_millis();
        let record = LockRecord {
            key: key.to_string(),
            owner: owner.to_string(),
            expires_at_ms: now + self.expiry.as_millis() as u64,
        };
        self.backend.try_acquire(&record, now)
    }
}

/// Current Unix epoch in milliseconds.
fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryLockBackend;
    use fleetgrid_state::StateStore;

    fn manager() -> LockManager {
        LockManager::new(Arc::new(MemoryLockBackend::new()))
            .with_poll_interval(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn second_acquirer_times_out() {
        let locks = manager();
        let held = locks
            .acquire("deployment/cf", Duration::from_millis(50))
            .await
            .unwrap();

        let err = locks
            .acquire("deployment/cf", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { ref key, .. } if key == "deployment/cf"));

        locks.release(held).unwrap();
        locks
            .acquire("deployment/cf", Duration::from_millis(30))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unrelated_keys_do_not_contend() {
        let locks = manager();
        let _a = locks.acquire("deployment/a", Duration::ZERO).await.unwrap();
        let _b = locks.acquire("deployment/b", Duration::ZERO).await.unwrap();
        assert_eq!(locks.live_locks().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn waiter_gets_lock_after_release() {
        let locks = manager();
        let held = locks.acquire("network/p", Duration::ZERO).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("network/p", Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        locks.release(held).unwrap();

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken_over() {
        let locks = manager().with_expiry(Duration::from_millis(20));
        let stale = locks.acquire("deployment/cf", Duration::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let fresh = locks
            .acquire("deployment/cf", Duration::ZERO)
            .await
            .unwrap();
        assert_ne!(stale.owner(), fresh.owner());
        assert!(!locks.refresh(&stale).unwrap());
    }

    #[tokio::test]
    async fn same_owner_reacquires_and_refreshes() {
        let locks = manager();
        let first = locks.acquire("deployment/cf", Duration::ZERO).await.unwrap();
        let again = locks
            .acquire_as("deployment/cf", first.owner(), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(again.owner(), first.owner());
        assert!(locks.refresh(&first).unwrap());
    }

    #[tokio::test]
    async fn renewing_lock_outlives_expiry() {
        let locks = manager().with_expiry(Duration::from_millis(40));
        let held = locks
            .acquire_renewing("deployment/cf", Duration::ZERO)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(locks.acquire("deployment/cf", Duration::ZERO).await.is_err());
        locks.release(held).unwrap();
        assert!(locks.acquire("deployment/cf", Duration::ZERO).await.is_ok());
    }

    #[tokio::test]
    async fn works_over_state_store() {
        let store = StateStore::open_in_memory().unwrap();
        let locks = LockManager::new(Arc::new(store.clone()))
            .with_poll_interval(Duration::from_millis(5));
        let held = locks.acquire("deployment/cf", Duration::ZERO).await.unwrap();
        assert_eq!(store.get_lock("deployment/cf").unwrap().unwrap().owner, held.owner());
        locks.release(held).unwrap();
        assert!(store.get_lock("deployment/cf").unwrap().is_none());
    }

    #[test]
    fn key_helpers() {
        assert_eq!(deployment_key("cf"), "deployment/cf");
        assert_eq!(network_key("private"), "network/private");
    }
}
