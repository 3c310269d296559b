//! Content fingerprints — SHA-256 over the canonical JSON of a value.
//!
//! Every type hashed here uses ordered collections, so equal values always
//! produce equal fingerprints.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::ManifestError;

/// Hex-encoded SHA-256 of the JSON serialization of `value`.
pub fn fingerprint<T: Serialize + ?Sized>(value: &T) -> Result<String, ManifestError> {
    let bytes =
        serde_json::to_vec(value).map_err(|e| ManifestError::Fingerprint(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};

    #[test]
    fn equal_values_hash_equal() {
        let mut a = BTreeMap::new();
        a.insert("b", 2);
        a.insert("a", 1);
        let mut b = BTreeMap::new();
        b.insert("a", 1);
        b.insert("b", 2);
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
        assert_eq!(fingerprint(&a).unwrap().len(), 64);
    }

    #[test]
    fn different_values_hash_differently() {
        assert_ne!(fingerprint("v1").unwrap(), fingerprint("v2").unwrap());
    }

    #[test]
    fn unserializable_value_is_an_error() {
        // JSON object keys must be strings.
        let mut map = HashMap::new();
        map.insert((1, 2), "pair key");
        let err = fingerprint(&map).unwrap_err();
        assert!(matches!(err, ManifestError::Fingerprint(_)));
    }
}
