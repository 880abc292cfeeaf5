//! Session health: the verdict the gate acts on.
//!
//! Health folds two checks into one verdict: the structural validity of the
//! event log (contiguity, dedupe uniqueness, pin coverage) and the
//! integrity of every pinned snapshot's bytes. A session is only writable
//! while both hold.

use serde::{Deserialize, Serialize};

use crate::stores::{
    CorruptionLocation, EventLogError, SessionEventLogStore, SnapshotIntegrity, SnapshotStore,
};
use crate::types::SessionId;

/// The health verdict for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "health", rename_all = "snake_case")]
pub enum SessionHealth {
    Healthy,
    #[serde(rename_all = "camelCase")]
    CorruptHead { reason: String },
    #[serde(rename_all = "camelCase")]
    CorruptTail { reason: String },
}

impl SessionHealth {
    /// Whether writes may proceed.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, SessionHealth::Healthy)
    }
}

/// Projects the health of a session: strict log validation plus byte-level
/// verification of every pinned snapshot.
///
/// I/O failures other than corruption propagate as errors; they are
/// retryable storage conditions, not a health verdict.
pub async fn project_session_health(
    store: &SessionEventLogStore,
    snapshots: &SnapshotStore,
    session_id: &SessionId,
) -> Result<SessionHealth, EventLogError> {
    let truth = match store.load(session_id).await {
        Ok(truth) => truth,
        Err(EventLogError::Corruption {
            location, reason, ..
        }) => {
            return Ok(match location {
                CorruptionLocation::Head => SessionHealth::CorruptHead { reason },
                CorruptionLocation::Tail => SessionHealth::CorruptTail { reason },
            });
        }
        Err(e) => return Err(e),
    };

    for pin in &truth.manifest.pins {
        match snapshots.verify(&pin.snapshot_ref).await {
            Ok(SnapshotIntegrity::Intact) => {}
            Ok(SnapshotIntegrity::Absent) => {
                return Ok(SessionHealth::CorruptTail {
                    reason: format!("snapshot_missing: {}", pin.snapshot_ref),
                });
            }
            Ok(SnapshotIntegrity::HashMismatch { .. }) => {
                return Ok(SessionHealth::CorruptTail {
                    reason: format!("snapshot_hash_mismatch: {}", pin.snapshot_ref),
                });
            }
            Err(crate::stores::ContentStoreError::Io { path, source }) => {
                return Err(EventLogError::Io { path, source });
            }
            Err(e) => {
                return Ok(SessionHealth::CorruptTail {
                    reason: e.to_string(),
                });
            }
        }
    }

    Ok(SessionHealth::Healthy)
}
