use std::net::Ipv4Addr;

use fleetgrid_lock::LockError;
use fleetgrid_state::StateError;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("unknown network '{0}'")]
    UnknownNetwork(String),

    #[error("no available address on network '{network}'")]
    NoAvailableAddress { network: String },

    #[error("address {address} on network '{network}' is held by {holder}")]
    AddressInUse {
        network: String,
        address: Ipv4Addr,
        holder: String,
    },

    #[error("address {address} is outside the range of network '{network}'")]
    AddressOutOfRange { network: String, address: Ipv4Addr },

    #[error("network lock: {0}")]
    Lock(#[from] LockError),

    #[error("reservation store: {0}")]
    State(#[from] StateError),
}

pub type NetworkResult<T> = Result<T, NetworkError>;
