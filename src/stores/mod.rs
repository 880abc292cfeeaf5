//! Storage: the event log, content-addressed stores, and the session lock.
//!
//! Three durability domains share one data directory:
//!
//! - per-session: `sessions/<id>/{events.log, manifest.json, session.lock}`
//! - cross-session content-addressed: `snapshots/` and `pinned-workflows/`
//!   (fanned out by the first two hex chars of the digest)
//! - process-wide: `keyring/keys.json`
//!
//! The event log is the authority; the content stores are immutable values
//! it points into. Every `get` re-verifies the digest of what it read, so
//! on-disk tampering surfaces as corruption rather than silently flowing
//! into execution.

mod content;
mod event_log;
mod layout;
mod lock;
mod pinned;
mod snapshots;

pub use content::{ContentStore, ContentStoreError};
pub use event_log::{
    CorruptionLocation, EventLogError, SessionEventLogStore, SessionTruth, ValidatedPrefix,
};
pub use layout::DataLayout;
pub use lock::{LockError, LockHandle, SessionLockManager};
pub use pinned::PinnedWorkflowStore;
pub use snapshots::{SnapshotIntegrity, SnapshotStore};
