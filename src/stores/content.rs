//! Generic content-addressed file store.
//!
//! Values are stored under the SHA-256 of their canonical JSON bytes.
//! `put` is idempotent (put-then-put of identical content is one file);
//! `get` re-hashes what it read and treats a mismatch as corruption.
//! Absence is a success value, not an error.
//!
//! Safe for concurrent readers with a single writer per key: writes land in
//! a temp file and are renamed into place, so a reader sees either nothing
//! or complete content.

use miette::Diagnostic;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use std::path::PathBuf;

use super::layout::fanout_path;
use crate::canon::CanonError;
use crate::digest::{canonical_digest, sha256_hex};

/// Errors from content-addressed storage.
#[derive(Debug, Error, Diagnostic)]
pub enum ContentStoreError {
    /// Filesystem failure.
    #[error("content store I/O failed at {path}: {source}")]
    #[diagnostic(code(loomrail::stores::content_io))]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Stored bytes no longer hash to their reference.
    #[error("content for {reference} is corrupt: {reason}")]
    #[diagnostic(
        code(loomrail::stores::content_corruption),
        help("The file was modified outside the engine; restore it from a replica or re-pin.")
    )]
    Corruption { reference: String, reason: String },

    /// The value could not be canonicalized.
    #[error(transparent)]
    #[diagnostic(code(loomrail::stores::content_canon))]
    Canon(#[from] CanonError),
}

pub type Result<T> = std::result::Result<T, ContentStoreError>;

/// A file-backed content-addressed store rooted at one directory.
#[derive(Debug, Clone)]
pub struct ContentStore {
    dir: PathBuf,
}

impl ContentStore {
    /// Roots a store at a directory (created lazily on first put).
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, hex: &str) -> PathBuf {
        fanout_path(&self.dir, hex)
    }

    /// Stores a value and returns the hex digest of its canonical bytes.
    ///
    /// Idempotent: existing content for the same digest is left untouched.
    pub async fn put<T: Serialize>(&self, value: &T) -> Result<String> {
        let (bytes, digest) = canonical_digest(value)?;
        let hex = hex::encode(digest);
        let path = self.path_for(&hex);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(hex);
        }
        let parent = path.parent().expect("fanout paths always have a parent");
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| ContentStoreError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        // Temp-then-rename so concurrent readers never see partial bytes;
        // the temp name is writer-unique so racing identical puts cannot
        // tear each other's staging file.
        let tmp = parent.join(format!(
            ".{hex}.{}.tmp",
            ulid::Ulid::new().to_string().to_ascii_lowercase()
        ));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|source| ContentStoreError::Io {
                path: tmp.display().to_string(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| ContentStoreError::Io {
                path: path.display().to_string(),
                source,
            })?;
        Ok(hex)
    }

    /// Reads the raw bytes for a digest, verifying them; `None` if absent.
    pub async fn get_bytes(&self, hex: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(hex);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ContentStoreError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        let actual = sha256_hex(&bytes);
        if actual != hex {
            return Err(ContentStoreError::Corruption {
                reference: hex.to_string(),
                reason: format!("stored bytes hash to {actual}"),
            });
        }
        Ok(Some(bytes))
    }

    /// Reads and deserializes the value for a digest; `None` if absent.
    pub async fn get<T: DeserializeOwned>(&self, hex: &str) -> Result<Option<T>> {
        let Some(bytes) = self.get_bytes(hex).await? else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&bytes).map_err(|e| ContentStoreError::Corruption {
            reference: hex.to_string(),
            reason: format!("stored bytes do not parse: {e}"),
        })?;
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let value = json!({"a": 1});
        let h1 = store.put(&value).await.unwrap();
        let h2 = store.put(&value).await.unwrap();
        assert_eq!(h1, h2);
        let loaded: serde_json::Value = store.get(&h1).await.unwrap().unwrap();
        assert_eq!(loaded, value);
    }

    #[tokio::test]
    async fn absent_is_a_success_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let missing = "0".repeat(64);
        assert!(store.get_bytes(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tampering_is_detected_on_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let hex = store.put(&json!({"a": 1})).await.unwrap();

        let path = fanout_path(dir.path(), &hex);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] ^= 0x01;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            store.get_bytes(&hex).await,
            Err(ContentStoreError::Corruption { .. })
        ));
    }
}
