//! Network reservation allocator.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleet_core::{NetworkKind, NetworkSpec};
use fleetgrid_lock::{LockManager, network_key};
use fleetgrid_state::Reservation;
use tracing::{debug, warn};

use crate::backend::ReservationBackend;
use crate::error::{NetworkError, NetworkResult};

/// Hands out addresses without double-assignment.
///
/// Cheap to clone; clones share the registered networks. Holdings are read
/// from the backend under the network lock on every call, so allocators in
/// different engines over one store agree on what is free.
#[derive(Clone)]
pub struct NetworkAllocator {
    locks: LockManager,
    backend: Arc<dyn ReservationBackend>,
    lock_timeout: Duration,
    networks: Arc<Mutex<HashMap<String, NetworkSpec>>>,
}

impl NetworkAllocator {
    pub fn new(
        locks: LockManager,
        backend: Arc<dyn ReservationBackend>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            locks,
            backend,
            lock_timeout,
            networks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Make `spec` available for reservations. Re-registering a network
    /// replaces its range; existing holdings are untouched.
    pub fn register(&self, spec: &NetworkSpec) {
        let mut networks = self.networks.lock().unwrap_or_else(|e| e.into_inner());
        if networks.get(&spec.name) != Some(spec) {
            debug!(network = %spec.name, kind = ?spec.kind, "network registered");
        }
        networks.insert(spec.name.clone(), spec.clone());
    }

    /// Reserve an address on `network` for `instance`.
    ///
    /// On a static network `requested` pins the address; without it, and on
    /// dynamic networks, the lowest free address is chosen. An instance that
    /// already holds an acceptable address keeps it.
    pub async fn reserve(
        &self,
        instance: &str,
        network: &str,
        requested: Option<Ipv4Addr>,
    ) -> NetworkResult<Reservation> {
        let lock = self
            .locks
            .acquire(&network_key(network), self.lock_timeout)
            .await?;
        let result = self.reserve_locked(instance, network, requested);
        self.locks.release(lock)?;
        result
    }

    fn reserve_locked(
        &self,
        instance: &str,
        network: &str,
        requested: Option<Ipv4Addr>,
    ) -> NetworkResult<Reservation> {
        let spec = self.spec(network)?;
        let held = self.held(network)?;

        let requested = match spec.kind {
            NetworkKind::Static => requested,
            NetworkKind::Dynamic => None,
        };
        let current = held
            .iter()
            .find(|(_, holder)| holder.as_str() == instance)
            .map(|(addr, _)| *addr);

        if let Some(addr) = current
            && requested.is_none_or(|want| want == addr)
            && spec.range.contains(addr)
        {
            debug!(%network, %instance, address = %addr, "reservation kept");
            return Ok(reservation(network, addr, instance));
        }

        let address = match requested {
            Some(want) => {
                if !spec.range.contains(want) {
                    return Err(NetworkError::AddressOutOfRange {
                        network: network.to_string(),
                        address: want,
                    });
                }
                if let Some(holder) = held.get(&want)
                    && holder != instance
                {
                    return Err(NetworkError::AddressInUse {
                        network: network.to_string(),
                        address: want,
                        holder: holder.clone(),
                    });
                }
                want
            }
            None => spec
                .range
                .iter()
                .find(|addr| !held.contains_key(addr))
                .ok_or_else(|| NetworkError::NoAvailableAddress {
                    network: network.to_string(),
                })?,
        };

        if let Some(old) = current {
            self.backend.forget(&reservation(network, old, instance))?;
            debug!(%network, %instance, address = %old, "superseded reservation dropped");
        }
        let reserved = reservation(network, address, instance);
        self.backend.record(&reserved)?;
        debug!(%network, %instance, %address, "address reserved");
        Ok(reserved)
    }

    /// Return an address to its pool.
    pub async fn release(&self, reservation: &Reservation) -> NetworkResult<()> {
        let lock = self
            .locks
            .acquire(&network_key(&reservation.network), self.lock_timeout)
            .await?;
        let result = self.backend.forget(reservation);
        self.locks.release(lock)?;
        if result? {
            debug!(
                network = %reservation.network,
                address = %reservation.address,
                instance = %reservation.instance,
                "address released"
            );
        } else {
            warn!(
                network = %reservation.network,
                address = %reservation.address,
                instance = %reservation.instance,
                "release skipped, address not held by this instance"
            );
        }
        Ok(())
    }

    /// Current holdings on `network`, ascending by address.
    pub fn reservations(&self, network: &str) -> NetworkResult<Vec<Reservation>> {
        let mut held = self.backend.load(network)?;
        held.sort_by_key(|r| r.address);
        Ok(held)
    }

    fn spec(&self, network: &str) -> NetworkResult<NetworkSpec> {
        let networks = self.networks.lock().unwrap_or_else(|e| e.into_inner());
        networks
            .get(network)
            .cloned()
            .ok_or_else(|| NetworkError::UnknownNetwork(network.to_string()))
    }

    /// Address → holding instance key.
    fn held(&self, network: &str) -> NetworkResult<BTreeMap<Ipv4Addr, String>> {
        Ok(self
            .backend
            .load(network)?
            .into_iter()
            .map(|r| (r.address, r.instance))
            .collect())
    }
}

fn reservation(network: &str, address: Ipv4Addr, instance: &str) -> Reservation {
    Reservation {
        network: network.to_string(),
        address,
        instance: instance.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::AddressRange;
    use fleetgrid_lock::MemoryLockBackend;
    use fleetgrid_state::StateStore;

    use crate::backend::MemoryReservations;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn net(name: &str, kind: NetworkKind, first: &str, last: &str) -> NetworkSpec {
        NetworkSpec {
            name: name.to_string(),
            kind,
            range: AddressRange::new(ip(first), ip(last)),
        }
    }

    fn allocator() -> NetworkAllocator {
        let locks = LockManager::new(Arc::new(MemoryLockBackend::new()))
            .with_poll_interval(Duration::from_millis(1));
        let alloc = NetworkAllocator::new(
            locks,
            Arc::new(MemoryReservations::new()),
            Duration::from_secs(5),
        );
        alloc.register(&net("private", NetworkKind::Static, "10.0.0.2", "10.0.0.4"));
        alloc.register(&net("pool", NetworkKind::Dynamic, "10.1.0.2", "10.1.0.3"));
        alloc
    }

    #[tokio::test]
    async fn static_request_is_honored() {
        let alloc = allocator();
        let r = alloc
            .reserve("cf/router/0", "private", Some(ip("10.0.0.3")))
            .await
            .unwrap();
        assert_eq!(r.address, ip("10.0.0.3"));
    }

    #[tokio::test]
    async fn static_request_conflicts() {
        let alloc = allocator();
        alloc
            .reserve("cf/router/0", "private", Some(ip("10.0.0.3")))
            .await
            .unwrap();

        let err = alloc
            .reserve("cf/router/1", "private", Some(ip("10.0.0.3")))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::AddressInUse { ref holder, .. } if holder == "cf/router/0"));

        let err = alloc
            .reserve("cf/router/1", "private", Some(ip("10.0.0.9")))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::AddressOutOfRange { .. }));
    }

    #[tokio::test]
    async fn dynamic_hands_out_lowest_free_and_ignores_request() {
        let alloc = allocator();
        let a = alloc
            .reserve("cf/db/0", "pool", Some(ip("10.1.0.3")))
            .await
            .unwrap();
        assert_eq!(a.address, ip("10.1.0.2"));
        let b = alloc.reserve("cf/db/1", "pool", None).await.unwrap();
        assert_eq!(b.address, ip("10.1.0.3"));

        let err = alloc.reserve("cf/db/2", "pool", None).await.unwrap_err();
        assert!(matches!(err, NetworkError::NoAvailableAddress { .. }));

        alloc.release(&a).await.unwrap();
        let c = alloc.reserve("cf/db/2", "pool", None).await.unwrap();
        assert_eq!(c.address, ip("10.1.0.2"));
    }

    #[tokio::test]
    async fn re_reserve_is_idempotent() {
        let alloc = allocator();
        let first = alloc.reserve("cf/db/0", "pool", None).await.unwrap();
        let again = alloc.reserve("cf/db/0", "pool", None).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(alloc.reservations("pool").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn changed_static_request_moves_the_reservation() {
        let alloc = allocator();
        alloc
            .reserve("cf/router/0", "private", Some(ip("10.0.0.2")))
            .await
            .unwrap();
        alloc
            .reserve("cf/router/0", "private", Some(ip("10.0.0.4")))
            .await
            .unwrap();
        let held = alloc.reservations("private").unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].address, ip("10.0.0.4"));
    }

    fn store_backed(store: &StateStore) -> NetworkAllocator {
        let locks = LockManager::new(Arc::new(store.clone()))
            .with_poll_interval(Duration::from_millis(1));
        let alloc = NetworkAllocator::new(locks, Arc::new(store.clone()), Duration::from_secs(10));
        alloc.register(&net("pool", NetworkKind::Dynamic, "10.1.0.2", "10.1.0.9"));
        alloc
    }

    #[tokio::test]
    async fn persisted_holdings_are_not_handed_out() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_reservation(&reservation("pool", ip("10.1.0.2"), "other/web/0"))
            .unwrap();
        let alloc = store_backed(&store);
        let r = alloc.reserve("cf/db/0", "pool", None).await.unwrap();
        assert_eq!(r.address, ip("10.1.0.3"));
        assert_eq!(store.list_reservations_for_network("pool").unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn allocators_sharing_a_store_never_collide() {
        let store = StateStore::open_in_memory().unwrap();
        let first = store_backed(&store);
        let second = store_backed(&store);

        let a = first.reserve("a/web/0", "pool", None).await.unwrap();
        let b = second.reserve("b/web/0", "pool", None).await.unwrap();
        assert_ne!(a.address, b.address);

        let mut tasks = Vec::new();
        for i in 1..4 {
            for (deployment, alloc) in [("a", first.clone()), ("b", second.clone())] {
                tasks.push(tokio::spawn(async move {
                    alloc
                        .reserve(&format!("{deployment}/web/{i}"), "pool", None)
                        .await
                }));
            }
        }
        let mut addresses = vec![a.address, b.address];
        for task in tasks {
            addresses.push(task.await.unwrap().unwrap().address);
        }
        addresses.sort();
        addresses.dedup();
        assert_eq!(addresses.len(), 8);

        second.release(&b).await.unwrap();
        assert_eq!(first.reservations("pool").unwrap().len(), 7);
    }

    #[tokio::test]
    async fn release_by_non_holder_is_ignored() {
        let alloc = allocator();
        let r = alloc.reserve("cf/db/0", "pool", None).await.unwrap();
        alloc
            .release(&reservation("pool", r.address, "cf/db/9"))
            .await
            .unwrap();
        assert_eq!(alloc.reservations("pool").unwrap(), vec![r]);
    }

    #[tokio::test]
    async fn unknown_network_is_rejected() {
        let alloc = allocator();
        let err = alloc.reserve("cf/db/0", "nope", None).await.unwrap_err();
        assert!(matches!(err, NetworkError::UnknownNetwork(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_are_unique() {
        let locks = LockManager::new(Arc::new(MemoryLockBackend::new()))
            .with_poll_interval(Duration::from_millis(1));
        let alloc = NetworkAllocator::new(
            locks,
            Arc::new(MemoryReservations::new()),
            Duration::from_secs(10),
        );
        alloc.register(&net("wide", NetworkKind::Static, "10.2.0.1", "10.2.0.10"));

        let mut tasks = Vec::new();
        for i in 0..20 {
            let alloc = alloc.clone();
            tasks.push(tokio::spawn(async move {
                alloc.reserve(&format!("cf/web/{i}"), "wide", None).await
            }));
        }

        let mut addresses = Vec::new();
        let mut exhausted = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(r) => addresses.push(r.address),
                Err(NetworkError::NoAvailableAddress { .. }) => exhausted += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        addresses.sort();
        addresses.dedup();
        assert_eq!(addresses.len(), 10);
        assert_eq!(exhausted, 10);
    }
}

