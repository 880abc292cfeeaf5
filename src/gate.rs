//! The execution gate: the single choke point for session writes.
//!
//! Every mutation of a session flows through
//! [`ExecutionGate::with_healthy_session_lock`], which in order:
//!
//! 1. rejects in-process re-entrancy,
//! 2. prechecks health lock-free (head corruption fails before any lock),
//! 3. acquires the per-session OS lock, fail-fast on contention,
//! 4. re-checks health strictly *under* the lock (the TOCTOU guard),
//! 5. mints an unforgeable [`Witness`] and hands it to the critical
//!    section together with the freshly loaded session truth,
//! 6. releases the lock and kills the witness on every exit path,
//!    including panics and cancellation.
//!
//! The event log store refuses writes without a live witness, so nothing
//! outside this module can append.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::instrument;

use crate::projections::{SessionHealth, project_session_health};
use crate::stores::{
    EventLogError, LockError, SessionEventLogStore, SessionTruth, SnapshotStore,
    SessionLockManager,
};
use crate::types::SessionId;

/// Errors from the gate.
#[derive(Debug, Error, Diagnostic)]
pub enum GateError {
    /// The calling task already holds this session's gate.
    #[error("session {session_id} gate is already held by this process")]
    #[diagnostic(code(loomrail::gate::reentrant))]
    Reentrant { session_id: SessionId },

    /// Another writer holds the session lock.
    #[error("session {session_id} is locked")]
    #[diagnostic(code(loomrail::gate::locked))]
    Locked {
        session_id: SessionId,
        retry_after_ms: u64,
    },

    /// The session is not healthy enough to write.
    #[error("session {session_id} is not healthy")]
    #[diagnostic(code(loomrail::gate::not_healthy))]
    NotHealthy {
        session_id: SessionId,
        health: SessionHealth,
    },

    /// Storage failure outside the health taxonomy.
    #[error(transparent)]
    #[diagnostic(code(loomrail::gate::storage))]
    Storage(#[from] EventLogError),

    /// Lock-file I/O failure.
    #[error(transparent)]
    #[diagnostic(code(loomrail::gate::lock_io))]
    Lock(#[from] LockError),
}

pub type Result<T> = std::result::Result<T, GateError>;

/// Proof that the gate holds a live, healthy lock for one session.
///
/// Only the gate can construct one, and it dies when the critical section
/// ends; a stored witness is useless to later writers.
#[derive(Debug, Clone)]
pub struct Witness {
    session_id: SessionId,
    live: Arc<AtomicBool>,
}

impl Witness {
    pub(crate) fn new(session_id: SessionId, live: Arc<AtomicBool>) -> Self {
        Self { session_id, live }
    }

    /// The session this witness authorizes writes for.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Whether the gate still holds the critical section.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

/// What the critical section receives.
pub struct GateContext {
    pub witness: Witness,
    /// Session truth loaded strictly under the lock; empty for creation.
    pub truth: SessionTruth,
}

type HolderMap = FxHashMap<SessionId, Option<tokio::task::Id>>;

struct ReentrancyGuard {
    session_id: SessionId,
    held: Arc<Mutex<HolderMap>>,
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        if let Ok(mut map) = self.held.lock() {
            map.remove(&self.session_id);
        }
    }
}

struct WitnessGuard {
    live: Arc<AtomicBool>,
}

impl Drop for WitnessGuard {
    fn drop(&mut self) {
        self.live.store(false, Ordering::Release);
    }
}

/// The gate over one data directory.
#[derive(Clone)]
pub struct ExecutionGate {
    store: Arc<SessionEventLogStore>,
    snapshots: Arc<SnapshotStore>,
    locks: SessionLockManager,
    held: Arc<Mutex<HolderMap>>,
}

impl ExecutionGate {
    /// Wires the gate over its stores and lock manager.
    #[must_use]
    pub fn new(
        store: Arc<SessionEventLogStore>,
        snapshots: Arc<SnapshotStore>,
        locks: SessionLockManager,
    ) -> Self {
        Self {
            store,
            snapshots,
            locks,
            held: Arc::new(Mutex::new(HolderMap::default())),
        }
    }

    /// Lock-free strict health check, also used by read-only rehydration.
    pub async fn check_health(&self, session_id: &SessionId) -> Result<SessionHealth> {
        Ok(project_session_health(&self.store, &self.snapshots, session_id).await?)
    }

    /// Runs `f` inside the healthy critical section of an existing session.
    #[instrument(skip(self, f), fields(session = %session_id))]
    pub async fn with_healthy_session_lock<T, E, F, Fut>(
        &self,
        session_id: &SessionId,
        f: F,
    ) -> std::result::Result<T, E>
    where
        E: From<GateError>,
        F: FnOnce(GateContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.enter(session_id, false, f).await
    }

    /// Runs `f` inside the critical section of a session being created.
    ///
    /// Skips the health checks (a brand-new session has no log yet) but
    /// still takes the lock, so two concurrent creations of the same id
    /// serialize.
    #[instrument(skip(self, f), fields(session = %session_id))]
    pub async fn with_new_session_lock<T, E, F, Fut>(
        &self,
        session_id: &SessionId,
        f: F,
    ) -> std::result::Result<T, E>
    where
        E: From<GateError>,
        F: FnOnce(GateContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.enter(session_id, true, f).await
    }

    async fn enter<T, E, F, Fut>(
        &self,
        session_id: &SessionId,
        creating: bool,
        f: F,
    ) -> std::result::Result<T, E>
    where
        E: From<GateError>,
        F: FnOnce(GateContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        // In-process re-entrancy check: the same task entering twice would
        // deadlock against its own OS lock. A *different* task falls
        // through to the fail-fast lock acquisition below.
        let current_task = tokio::task::try_id();
        {
            let map = self
                .held
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(holder) = map.get(session_id)
                && holder.is_some()
                && *holder == current_task
            {
                return Err(GateError::Reentrant {
                    session_id: session_id.clone(),
                }
                .into());
            }
        }

        // Lock-free precheck: fail before contending when the log can
        // never become writable.
        if !creating {
            let health = self.check_health(session_id).await.map_err(E::from)?;
            if !health.is_healthy() {
                return Err(GateError::NotHealthy {
                    session_id: session_id.clone(),
                    health,
                }
                .into());
            }
        }

        let handle = match self.locks.acquire(session_id) {
            Ok(handle) => handle,
            Err(LockError::Busy {
                session_id,
                retry_after_ms,
            }) => {
                return Err(GateError::Locked {
                    session_id,
                    retry_after_ms,
                }
                .into());
            }
            Err(e) => return Err(GateError::from(e).into()),
        };
        {
            let mut map = self
                .held
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            map.insert(session_id.clone(), current_task);
        }
        let _reentrancy = ReentrancyGuard {
            session_id: session_id.clone(),
            held: Arc::clone(&self.held),
        };

        // Re-check under the lock: another process may have written (or
        // corrupted) between precheck and acquisition.
        let truth = if creating {
            SessionTruth {
                session_id: session_id.clone(),
                events: Vec::new(),
                manifest: crate::events::SessionManifest { v: 1, pins: Vec::new() },
            }
        } else {
            let health = self.check_health(session_id).await.map_err(E::from)?;
            if !health.is_healthy() {
                return Err(GateError::NotHealthy {
                    session_id: session_id.clone(),
                    health,
                }
                .into());
            }
            self.store
                .load(session_id)
                .await
                .map_err(|e| E::from(GateError::from(e)))?
        };

        let live = Arc::new(AtomicBool::new(true));
        let _witness_guard = WitnessGuard {
            live: Arc::clone(&live),
        };
        let witness = Witness::new(session_id.clone(), live);

        let result = f(GateContext { witness, truth }).await;

        // Guards kill the witness and free the re-entrancy slot on every
        // exit path; the handle's Drop would also unlock, but an explicit
        // release lets unlock failures surface as retryable errors. Any
        // already-appended batch is safe: the retry replays from facts.
        match (result, handle.release()) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => {
                tracing::warn!(session = %session_id, error = %e, "lock release failed");
                Err(GateError::from(e).into())
            }
            (Err(e), _) => Err(e),
        }
    }
}
