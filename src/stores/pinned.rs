//! The pinned-workflow store.
//!
//! A run executes against a pinned snapshot of its workflow, addressed by
//! `workflow_hash = sha256(canonical_json(pinned_snapshot))`. Once pinned,
//! the definition is immutable for the life of every run referencing it.

use super::content::{ContentStore, Result};
use super::layout::DataLayout;
use crate::types::WorkflowHash;
use crate::workflow::WorkflowSnapshot;

/// Content-addressed store of [`WorkflowSnapshot`] values.
#[derive(Debug, Clone)]
pub struct PinnedWorkflowStore {
    inner: ContentStore,
}

impl PinnedWorkflowStore {
    /// Opens the store under the layout's `pinned-workflows/` directory.
    #[must_use]
    pub fn new(layout: &DataLayout) -> Self {
        Self {
            inner: ContentStore::new(layout.pinned_workflows_dir()),
        }
    }

    /// Pins a workflow snapshot; idempotent for identical content.
    pub async fn put(&self, snapshot: &WorkflowSnapshot) -> Result<WorkflowHash> {
        let hex = self.inner.put(snapshot).await?;
        Ok(WorkflowHash::parse(&format!("sha256:{hex}")).expect("store digests are well-formed"))
    }

    /// Loads a pinned snapshot; `None` if absent.
    pub async fn get(&self, hash: &WorkflowHash) -> Result<Option<WorkflowSnapshot>> {
        self.inner.get(hash.hex()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowBuilder;

    #[tokio::test]
    async fn pin_is_idempotent_and_matches_definition_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = PinnedWorkflowStore::new(&DataLayout::new(dir.path()));
        let workflow = WorkflowBuilder::new("w", "W")
            .step("a", "A", "p")
            .compile()
            .unwrap();

        let h1 = store.put(&workflow.pinned_snapshot()).await.unwrap();
        let h2 = store.put(&workflow.pinned_snapshot()).await.unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1, workflow.workflow_hash().unwrap());

        let loaded = store.get(&h1).await.unwrap().unwrap();
        assert_eq!(loaded.definition().unwrap(), &workflow);
    }
}
