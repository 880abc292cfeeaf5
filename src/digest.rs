//! SHA-256 content addressing over canonical bytes.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::canon::{CanonError, canonical_json_bytes};

/// Hex-encoded SHA-256 of arbitrary bytes.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Raw SHA-256 digest of arbitrary bytes.
#[must_use]
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// Canonical bytes of a value together with their digest.
///
/// This is the one place that pairs serialization with hashing, so every
/// content address in the engine is computed over the same byte form that
/// gets persisted.
pub fn canonical_digest<T: Serialize + ?Sized>(value: &T) -> Result<(Vec<u8>, [u8; 32]), CanonError> {
    let bytes = canonical_json_bytes(value)?;
    let digest = sha256(&bytes);
    Ok((bytes, digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn digest_is_stable_over_key_order() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(
            canonical_digest(&a).unwrap().1,
            canonical_digest(&b).unwrap().1
        );
    }

    #[test]
    fn digest_matches_bytes() {
        let (bytes, digest) = canonical_digest(&json!({"k": "v"})).unwrap();
        assert_eq!(hex::encode(digest), sha256_hex(&bytes));
    }
}
