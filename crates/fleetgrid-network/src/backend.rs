//! Reservation backends — where held addresses live.

use std::collections::BTreeMap;
use std::sync::Mutex;

use fleetgrid_state::{Reservation, StateStore};

use crate::error::NetworkResult;

/// Storage for address reservations shared by every allocator using it.
///
/// The allocator only calls these under the `network/<name>` lock, so a
/// read followed by a write is never interleaved with another allocator
/// working on the same network.
pub trait ReservationBackend: Send + Sync {
    /// Every reservation held on `network`.
    fn load(&self, network: &str) -> NetworkResult<Vec<Reservation>>;

    fn record(&self, reservation: &Reservation) -> NetworkResult<()>;

    /// Drop `reservation` if its instance still holds the address.
    fn forget(&self, reservation: &Reservation) -> NetworkResult<bool>;
}

impl ReservationBackend for StateStore {
    fn load(&self, network: &str) -> NetworkResult<Vec<Reservation>> {
        Ok(self.list_reservations_for_network(network)?)
    }

    fn record(&self, reservation: &Reservation) -> NetworkResult<()> {
        Ok(self.put_reservation(reservation)?)
    }

    fn forget(&self, reservation: &Reservation) -> NetworkResult<bool> {
        Ok(self.delete_reservation(reservation)?)
    }
}

/// Process-local reservation table.
#[derive(Debug, Default)]
pub struct MemoryReservations {
    held: Mutex<BTreeMap<String, Reservation>>,
}

impl MemoryReservations {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReservationBackend for MemoryReservations {
    fn load(&self, network: &str) -> NetworkResult<Vec<Reservation>> {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        Ok(held
            .values()
            .filter(|r| r.network == network)
            .cloned()
            .collect())
    }

    fn record(&self, reservation: &Reservation) -> NetworkResult<()> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.insert(reservation.table_key(), reservation.clone());
        Ok(())
    }

    fn forget(&self, reservation: &Reservation) -> NetworkResult<bool> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        let key = reservation.table_key();
        if held
            .get(&key)
            .is_some_and(|cur| cur.instance == reservation.instance)
        {
            held.remove(&key);
            return Ok(true);
        }
        Ok(false)
    }
}
