//! Persistent HMAC keyring with rotation.
//!
//! The keyring holds every key that has ever signed a token: one designated
//! signing key plus zero or more retired keys that still verify. Rotation
//! is expressed by adding a new signing key and retiring the old one; no
//! key is ever deleted while tokens signed by it may still be in flight.
//!
//! The keyring is loaded once at startup from `keyring/keys.json` under the
//! data directory and never mutated mid-request.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use miette::Diagnostic;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use ulid::Ulid;

/// Length in bytes of generated HMAC secrets.
pub const SECRET_LEN: usize = 32;

/// Errors from keyring persistence and lookup.
#[derive(Debug, Error, Diagnostic)]
pub enum KeyringError {
    /// Reading or writing `keys.json` failed.
    #[error("keyring I/O failed at {path}: {source}")]
    #[diagnostic(code(loomrail::keyring::io))]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The persisted keyring does not parse or decode.
    #[error("keyring file is malformed: {reason}")]
    #[diagnostic(
        code(loomrail::keyring::malformed),
        help("keys.json must hold base64url secrets and a signing_key_id present in keys.")
    )]
    Malformed { reason: String },

    /// `signing_key_id` names a key that is absent or retired.
    #[error("signing key {key_id} is not an active key")]
    #[diagnostic(code(loomrail::keyring::bad_signing_key))]
    BadSigningKey { key_id: String },
}

pub type Result<T> = std::result::Result<T, KeyringError>;

/// One HMAC-SHA-256 key.
#[derive(Debug, Clone)]
pub struct HmacKey {
    /// Stable identifier, never reused.
    pub key_id: String,
    /// Raw secret material.
    secret: Vec<u8>,
    /// Retired keys verify but never sign.
    pub retired: bool,
}

impl HmacKey {
    fn generate() -> Self {
        let mut secret = vec![0u8; SECRET_LEN];
        rand::rng().fill_bytes(&mut secret);
        Self {
            key_id: Ulid::new().to_string().to_ascii_lowercase(),
            secret,
            retired: false,
        }
    }

    /// Borrows the raw secret for MAC construction.
    #[must_use]
    pub fn secret(&self) -> &[u8] {
        &self.secret
    }
}

/// The set of keys the engine signs and verifies with.
#[derive(Debug, Clone)]
pub struct Keyring {
    keys: Vec<HmacKey>,
    signing_key_id: String,
}

#[derive(Serialize, Deserialize)]
struct PersistedKey {
    key_id: String,
    secret: String,
    #[serde(default)]
    retired: bool,
}

#[derive(Serialize, Deserialize)]
struct PersistedKeyring {
    v: u32,
    keys: Vec<PersistedKey>,
    signing_key_id: String,
}

impl Keyring {
    /// Creates a fresh keyring with a single generated signing key.
    #[must_use]
    pub fn generate() -> Self {
        let key = HmacKey::generate();
        let signing_key_id = key.key_id.clone();
        Self {
            keys: vec![key],
            signing_key_id,
        }
    }

    /// The key used to mint new tokens.
    #[must_use]
    pub fn signing_key(&self) -> &HmacKey {
        self.keys
            .iter()
            .find(|k| k.key_id == self.signing_key_id)
            .expect("keyring invariant: signing_key_id always present")
    }

    /// All keys eligible for verification, signing key first.
    pub fn verification_keys(&self) -> impl Iterator<Item = &HmacKey> {
        let signing = self.signing_key();
        std::iter::once(signing).chain(self.keys.iter().filter(move |k| k.key_id != signing.key_id))
    }

    /// Rotates: the current signing key is retired (still verifies) and a
    /// freshly generated key becomes the signer.
    pub fn rotate(&mut self) -> &HmacKey {
        let current = self.signing_key_id.clone();
        if let Some(old) = self.keys.iter_mut().find(|k| k.key_id == current) {
            old.retired = true;
        }
        let key = HmacKey::generate();
        self.signing_key_id = key.key_id.clone();
        self.keys.push(key);
        self.signing_key()
    }

    /// Loads the keyring from `path`, generating and persisting a fresh one
    /// on first run.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let ring = Self::generate();
            ring.save(path)?;
            Ok(ring)
        }
    }

    /// Loads a persisted keyring.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| KeyringError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let persisted: PersistedKeyring =
            serde_json::from_str(&raw).map_err(|e| KeyringError::Malformed {
                reason: e.to_string(),
            })?;
        if persisted.v != 1 {
            return Err(KeyringError::Malformed {
                reason: format!("unsupported keyring version {}", persisted.v),
            });
        }
        let mut keys = Vec::with_capacity(persisted.keys.len());
        for pk in persisted.keys {
            let secret =
                URL_SAFE_NO_PAD
                    .decode(pk.secret.as_bytes())
                    .map_err(|e| KeyringError::Malformed {
                        reason: format!("secret for {} is not base64url: {e}", pk.key_id),
                    })?;
            keys.push(HmacKey {
                key_id: pk.key_id,
                secret,
                retired: pk.retired,
            });
        }
        let ring = Self {
            keys,
            signing_key_id: persisted.signing_key_id,
        };
        match ring.keys.iter().find(|k| k.key_id == ring.signing_key_id) {
            Some(k) if !k.retired => Ok(ring),
            _ => Err(KeyringError::BadSigningKey {
                key_id: ring.signing_key_id,
            }),
        }
    }

    /// Persists the keyring, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| KeyringError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let persisted = PersistedKeyring {
            v: 1,
            keys: self
                .keys
                .iter()
                .map(|k| PersistedKey {
                    key_id: k.key_id.clone(),
                    secret: URL_SAFE_NO_PAD.encode(&k.secret),
                    retired: k.retired,
                })
                .collect(),
            signing_key_id: self.signing_key_id.clone(),
        };
        let body = serde_json::to_string_pretty(&persisted).map_err(|e| KeyringError::Malformed {
            reason: e.to_string(),
        })?;
        std::fs::write(path, body).map_err(|source| KeyringError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_retires_but_keeps_old_key() {
        let mut ring = Keyring::generate();
        let old_id = ring.signing_key().key_id.clone();
        ring.rotate();
        assert_ne!(ring.signing_key().key_id, old_id);
        let ids: Vec<_> = ring.verification_keys().map(|k| k.key_id.clone()).collect();
        assert!(ids.contains(&old_id));
        assert_eq!(ids[0], ring.signing_key().key_id, "signing key first");
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyring").join("keys.json");
        let mut ring = Keyring::generate();
        ring.rotate();
        ring.save(&path).unwrap();

        let loaded = Keyring::load(&path).unwrap();
        assert_eq!(loaded.signing_key().key_id, ring.signing_key().key_id);
        assert_eq!(
            loaded.signing_key().secret(),
            ring.signing_key().secret()
        );
        assert_eq!(
            loaded.verification_keys().count(),
            ring.verification_keys().count()
        );
    }

    #[test]
    fn load_rejects_retired_signing_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let ring = Keyring::generate();
        let mut bad = ring.clone();
        bad.keys[0].retired = true;
        bad.save(&path).unwrap();
        assert!(matches!(
            Keyring::load(&path),
            Err(KeyringError::BadSigningKey { .. })
        ));
    }
}
