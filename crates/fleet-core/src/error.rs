//! Manifest validation errors.

use thiserror::Error;

/// Reasons a deployment manifest is rejected before convergence starts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("invalid name {0:?}: must be non-empty and must not contain '/'")]
    InvalidName(String),

    #[error("duplicate instance group: {0}")]
    DuplicateGroup(String),

    #[error("duplicate network: {0}")]
    DuplicateNetwork(String),

    #[error("network {network}: range {first} - {last} is empty")]
    EmptyRange {
        network: String,
        first: String,
        last: String,
    },

    #[error("instance group {group} references unknown network {network}")]
    UnknownNetwork { group: String, network: String },

    #[error("instance group {group}: static IPs are only allowed on static networks ({network})")]
    StaticIpOnDynamicNetwork { group: String, network: String },

    #[error("instance group {group}: network {network} lists {got} static IPs for {want} instances")]
    StaticIpCount {
        group: String,
        network: String,
        got: usize,
        want: u32,
    },

    #[error("instance group {group}: static IP {address} is outside network {network}")]
    StaticIpOutOfRange {
        group: String,
        network: String,
        address: String,
    },

    #[error("static IP {address} on network {network} is assigned more than once")]
    DuplicateStaticIp { network: String, address: String },

    #[error("update policy: {0}")]
    InvalidPolicy(String),

    #[error("persistent disk for {group} must have a non-zero size")]
    EmptyDisk { group: String },

    #[error("cannot fingerprint: {0}")]
    Fingerprint(String),
}
