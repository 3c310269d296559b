//! StateStore — redb-backed persistence for fleetgrid.
//!
//! Provides typed access to deployments, instances, reservations, orphaned
//! disks and locks. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Everything one convergence run changed, written atomically.
#[derive(Debug, Clone)]
pub struct DeploymentCommit {
    pub deployment: DeploymentRecord,
    /// Instances to insert or overwrite.
    pub instances: Vec<InstanceRecord>,
    /// Keys of instances that were deprovisioned.
    pub removed: Vec<String>,
    /// Disks orphaned during the run.
    pub orphaned: Vec<OrphanedDisk>,
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [DEPLOYMENTS, INSTANCES, RESERVATIONS, ORPHANED_DISKS, LOCKS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All values whose key starts with `prefix`.
    fn scan<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let record = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(record);
            }
        }
        Ok(results)
    }

    // ── Deployments ────────────────────────────────────────────────

    pub fn get_deployment(&self, name: &str) -> StateResult<Option<DeploymentRecord>> {
        self.get(DEPLOYMENTS, name)
    }

    pub fn list_deployments(&self) -> StateResult<Vec<DeploymentRecord>> {
        self.scan(DEPLOYMENTS, "")
    }

    // ── Instances ──────────────────────────────────────────────────

    /// All instances of a deployment, ordered by group then index.
    pub fn list_instances(&self, deployment: &str) -> StateResult<Vec<InstanceRecord>> {
        let mut instances: Vec<InstanceRecord> =
            self.scan(INSTANCES, &format!("{deployment}/"))?;
        instances.sort_by(|a, b| a.group.cmp(&b.group).then(a.index.cmp(&b.index)));
        Ok(instances)
    }

    // ── Reservations ───────────────────────────────────────────────

    /// Every persisted reservation across all deployments.
    pub fn list_reservations(&self) -> StateResult<Vec<Reservation>> {
        self.scan(RESERVATIONS, "")
    }

    pub fn list_reservations_for_network(&self, network: &str) -> StateResult<Vec<Reservation>> {
        self.scan(RESERVATIONS, &format!("{network}/"))
    }

    /// Record `reservation`. Callers hold the network lock and have checked
    /// that the address is free.
    pub fn put_reservation(&self, reservation: &Reservation) -> StateResult<()> {
        self.put(RESERVATIONS, &reservation.table_key(), reservation)
    }

    /// Remove `reservation` if its instance still holds the address.
    pub fn delete_reservation(&self, reservation: &Reservation) -> StateResult<bool> {
        let key = reservation.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed;
        {
            let mut table = txn.open_table(RESERVATIONS).map_err(map_err!(Table))?;
            let current: Option<Reservation> = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            removed = current.is_some_and(|cur| cur.instance == reservation.instance);
            if removed {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(removed)
    }

    // ── Orphaned disks ─────────────────────────────────────────────

    pub fn list_orphaned_disks(&self) -> StateResult<Vec<OrphanedDisk>> {
        self.scan(ORPHANED_DISKS, "")
    }

    /// Forget an orphaned disk once it has been reclaimed. Returns true if it existed.
    pub fn delete_orphaned_disk(&self, cid: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(ORPHANED_DISKS).map_err(map_err!(Table))?;
            existed = table.remove(cid).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(disk = %cid, existed, "orphaned disk forgotten");
        Ok(existed)
    }

    // ── Locks ──────────────────────────────────────────────────────

    /// Atomically insert `lock` unless another owner holds an unexpired lock
    /// on the same key. A record with the same owner is refreshed.
    pub fn try_acquire_lock(&self, lock: &LockRecord, now_ms: u64) -> StateResult<bool> {
        let value = serde_json::to_vec(lock).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let acquired;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let current: Option<LockRecord> = match table.get(lock.key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            acquired = match current {
                None => true,
                Some(cur) => cur.owner == lock.owner || cur.is_expired(now_ms),
            };
            if acquired {
                table
                    .insert(lock.key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(acquired)
    }

    /// Remove the lock on `key` if `owner` still holds it.
    pub fn release_lock(&self, key: &str, owner: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let released;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let current: Option<LockRecord> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            released = current.is_some_and(|cur| cur.owner == owner);
            if released {
                table.remove(key).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(released)
    }

    pub fn get_lock(&self, key: &str) -> StateResult<Option<LockRecord>> {
        self.get(LOCKS, key)
    }

    pub fn list_locks(&self) -> StateResult<Vec<LockRecord>> {
        self.scan(LOCKS, "")
    }

    // ── Commit ─────────────────────────────────────────────────────

    /// Write the outcome of a convergence run in one transaction.
    ///
    /// The deployment's reservations are replaced wholesale by the ones
    /// carried on `commit.instances`. An address held by an instance of
    /// another deployment aborts the commit with
    /// [`StateError::ReservationConflict`].
    pub fn commit_deployment(&self, commit: &DeploymentCommit) -> StateResult<()> {
        let name = commit.deployment.name.as_str();
        let prefix = format!("{name}/");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let value = serde_json::to_vec(&commit.deployment).map_err(map_err!(Serialize))?;
            deployments
                .insert(name, value.as_slice())
                .map_err(map_err!(Write))?;

            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            for key in &commit.removed {
                instances.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            for record in &commit.instances {
                let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
                instances
                    .insert(record.table_key().as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }

            let mut reservations = txn.open_table(RESERVATIONS).map_err(map_err!(Table))?;
            let mut stale = Vec::new();
            for entry in reservations.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let r: Reservation =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if r.instance.starts_with(&prefix) {
                    stale.push(key.value().to_string());
                }
            }
            for key in &stale {
                reservations.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            for r in commit.instances.iter().flat_map(|i| i.reservations.iter()) {
                let key = r.table_key();
                if let Some(guard) = reservations.get(key.as_str()).map_err(map_err!(Read))? {
                    let held: Reservation =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    if held.instance != r.instance {
                        return Err(StateError::ReservationConflict {
                            key,
                            holder: held.instance,
                            claimant: r.instance.clone(),
                        });
                    }
                }
                let value = serde_json::to_vec(r).map_err(map_err!(Serialize))?;
                reservations
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }

            let mut orphans = txn.open_table(ORPHANED_DISKS).map_err(map_err!(Table))?;
            for disk in &commit.orphaned {
                let value = serde_json::to_vec(disk).map_err(map_err!(Serialize))?;
                orphans
                    .insert(disk.table_key().as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            deployment = %name,
            instances = commit.instances.len(),
            removed = commit.removed.len(),
            orphaned = commit.orphaned.len(),
            "deployment committed"
        );
        Ok(())
    }
}
