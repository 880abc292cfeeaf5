//! The execution-snapshot store: a typed view over the content store.

use super::content::{ContentStore, ContentStoreError, Result};
use super::layout::DataLayout;
use crate::engine::snapshot::ExecutionSnapshot;
use crate::types::SnapshotRef;

/// Integrity verdict for one pinned snapshot, used by health checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotIntegrity {
    Intact,
    Absent,
    HashMismatch { reason: String },
}

/// Content-addressed store of [`ExecutionSnapshot`] values, shared by every
/// session.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    inner: ContentStore,
}

impl SnapshotStore {
    /// Opens the store under the layout's `snapshots/` directory.
    #[must_use]
    pub fn new(layout: &DataLayout) -> Self {
        Self {
            inner: ContentStore::new(layout.snapshots_dir()),
        }
    }

    /// Stores a snapshot; idempotent for identical content.
    pub async fn put(&self, snapshot: &ExecutionSnapshot) -> Result<SnapshotRef> {
        let hex = self.inner.put(snapshot).await?;
        Ok(SnapshotRef::parse(&format!("sha256:{hex}")).expect("store digests are well-formed"))
    }

    /// Loads a snapshot; `None` if absent.
    pub async fn get(&self, reference: &SnapshotRef) -> Result<Option<ExecutionSnapshot>> {
        self.inner.get(reference.hex()).await
    }

    /// Checks a pinned snapshot without surfacing corruption as an error,
    /// so health projection can fold it into a verdict.
    pub async fn verify(&self, reference: &SnapshotRef) -> Result<SnapshotIntegrity> {
        match self.inner.get_bytes(reference.hex()).await {
            Ok(Some(_)) => Ok(SnapshotIntegrity::Intact),
            Ok(None) => Ok(SnapshotIntegrity::Absent),
            Err(ContentStoreError::Corruption { reason, .. }) => {
                Ok(SnapshotIntegrity::HashMismatch { reason })
            }
            Err(e) => Err(e),
        }
    }
}
