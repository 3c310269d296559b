//! fleetgrid-network — per-instance address reservations.
//!
//! Held addresses live in a [`ReservationBackend`] shared by every allocator
//! over the same state store, across deployments. Each reserve and release
//! runs under the `network/<name>` lock and reads the network's holdings
//! from the backend afresh, so two engines never hand out the same address.
//!
//! - **`allocator`** — `NetworkAllocator` (register, reserve, release)
//! - **`backend`** — `ReservationBackend`, `MemoryReservations`
//! - **`error`** — `NetworkError`

pub mod allocator;
pub mod backend;
pub mod error;

pub use allocator::NetworkAllocator;
pub use backend::{MemoryReservations, ReservationBackend};
pub use error::{NetworkError, NetworkResult};
