//! The append-only session event log.
//!
//! One log per session, line-delimited canonical JSON, with a manifest of
//! snapshot pins alongside. The log is the authority: everything else is a
//! projection of it.
//!
//! Two read modes exist. [`load`](SessionEventLogStore::load) is strict:
//! any invariant violation is a corruption error locating the break at the
//! head or the tail. [`load_validated_prefix`](SessionEventLogStore::load_validated_prefix)
//! is permissive about the tail: it returns the longest valid prefix plus
//! the reason the tail failed, because a torn final write must not brick a
//! session whose earlier history is intact. Head corruption always fails
//! closed.
//!
//! Writes append events first and rewrite the manifest second (atomically,
//! temp-then-rename). A crash between the two leaves events whose pins are
//! missing; the validator truncates exactly there, so readers never act on
//! a half-applied batch.

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::layout::DataLayout;
use crate::canon::{CanonError, canonical_json_string};
use crate::events::{EventBatch, EventBody, SessionEvent, SessionManifest, SnapshotPin};
use crate::gate::Witness;
use crate::types::SessionId;

/// Where a corruption was located.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionLocation {
    /// The log's foundation is broken: `session_created` missing, index
    /// gaps from zero, or manifest integrity failures.
    Head,
    /// A later break in an otherwise valid log.
    Tail,
}

impl CorruptionLocation {
    /// Stable textual form for error details.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CorruptionLocation::Head => "head",
            CorruptionLocation::Tail => "tail",
        }
    }
}

/// Errors from the event log store.
#[derive(Debug, Error, Diagnostic)]
pub enum EventLogError {
    /// The session has no log on disk.
    #[error("session {session_id} not found")]
    #[diagnostic(code(loomrail::event_log::not_found))]
    SessionNotFound { session_id: SessionId },

    /// An invariant does not hold.
    #[error("session {session_id} log is corrupt at the {}: {reason}", location.as_str())]
    #[diagnostic(
        code(loomrail::event_log::corruption),
        help("The validated prefix may still be readable via load_validated_prefix.")
    )]
    Corruption {
        session_id: SessionId,
        location: CorruptionLocation,
        reason: String,
    },

    /// Filesystem failure.
    #[error("event log I/O failed at {path}: {source}")]
    #[diagnostic(code(loomrail::event_log::io))]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// An event could not be canonicalized for persistence.
    #[error(transparent)]
    #[diagnostic(code(loomrail::event_log::canon))]
    Canon(#[from] CanonError),

    /// The append witness does not prove a live lock for this session.
    #[error("append witness rejected: {reason}")]
    #[diagnostic(
        code(loomrail::event_log::witness),
        help("Writes must run inside the execution gate's critical section.")
    )]
    WitnessRejected { reason: String },
}

pub type Result<T> = std::result::Result<T, EventLogError>;

/// A session's validated events and manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTruth {
    pub session_id: SessionId,
    pub events: Vec<SessionEvent>,
    pub manifest: SessionManifest,
}

impl SessionTruth {
    /// The index the next appended event will receive.
    #[must_use]
    pub fn next_index(&self) -> u64 {
        self.events.len() as u64
    }

    /// Finds an event by dedupe key.
    #[must_use]
    pub fn find_dedupe(&self, key: &str) -> Option<&SessionEvent> {
        self.events.iter().find(|e| e.dedupe_key == key)
    }

    /// Whether a dedupe key has been recorded.
    #[must_use]
    pub fn has_dedupe(&self, key: &str) -> bool {
        self.find_dedupe(key).is_some()
    }
}

/// Result of a permissive load.
#[derive(Debug, Clone)]
pub struct ValidatedPrefix {
    pub truth: SessionTruth,
    /// True when the whole log validated.
    pub is_complete: bool,
    /// Why the tail was truncated, when it was.
    pub tail_reason: Option<String>,
}

enum WalkFailure {
    Head(String),
    Tail { at: usize, reason: String },
}

/// Store of per-session event logs under one data layout.
#[derive(Debug, Clone)]
pub struct SessionEventLogStore {
    layout: DataLayout,
}

impl SessionEventLogStore {
    /// Opens the store over a layout.
    #[must_use]
    pub fn new(layout: DataLayout) -> Self {
        Self { layout }
    }

    /// Whether the session has any log on disk.
    pub async fn session_exists(&self, session_id: &SessionId) -> bool {
        tokio::fs::try_exists(self.layout.events_log(session_id))
            .await
            .unwrap_or(false)
    }

    /// Lists sessions that have a log directory.
    pub async fn list_sessions(&self) -> Result<Vec<SessionId>> {
        let dir = self.layout.sessions_dir();
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(source) => {
                return Err(EventLogError::Io {
                    path: dir.display().to_string(),
                    source,
                });
            }
        };
        while let Some(entry) = entries.next_entry().await.map_err(|source| EventLogError::Io {
            path: dir.display().to_string(),
            source,
        })? {
            let file_name = entry.file_name();
            if let Some(name) = file_name.to_str()
                && let Ok(id) = SessionId::parse(name)
            {
                out.push(id);
            }
        }
        out.sort();
        Ok(out)
    }

    /// Strict load: every invariant must hold over the entire log.
    pub async fn load(&self, session_id: &SessionId) -> Result<SessionTruth> {
        let (lines, manifest) = self.read_raw(session_id).await?;
        let (events, failure) = walk(session_id, &lines, &manifest);
        match failure {
            None => Ok(SessionTruth {
                session_id: session_id.clone(),
                events,
                manifest,
            }),
            Some(WalkFailure::Head(reason)) => Err(EventLogError::Corruption {
                session_id: session_id.clone(),
                location: CorruptionLocation::Head,
                reason,
            }),
            Some(WalkFailure::Tail { reason, .. }) => Err(EventLogError::Corruption {
                session_id: session_id.clone(),
                location: CorruptionLocation::Tail,
                reason,
            }),
        }
    }

    /// Permissive load: the longest valid prefix, plus the tail failure.
    ///
    /// Head corruption still fails closed; a log whose foundation is
    /// broken has no authoritative prefix at all.
    pub async fn load_validated_prefix(&self, session_id: &SessionId) -> Result<ValidatedPrefix> {
        let (lines, manifest) = self.read_raw(session_id).await?;
        let (events, failure) = walk(session_id, &lines, &manifest);
        match failure {
            None => Ok(ValidatedPrefix {
                truth: SessionTruth {
                    session_id: session_id.clone(),
                    events,
                    manifest,
                },
                is_complete: true,
                tail_reason: None,
            }),
            Some(WalkFailure::Head(reason)) => Err(EventLogError::Corruption {
                session_id: session_id.clone(),
                location: CorruptionLocation::Head,
                reason,
            }),
            Some(WalkFailure::Tail { at, reason }) => {
                let prefix_len = at;
                let pins = manifest
                    .pins
                    .iter()
                    .filter(|p| (p.event_index as usize) < prefix_len)
                    .cloned()
                    .collect();
                Ok(ValidatedPrefix {
                    truth: SessionTruth {
                        session_id: session_id.clone(),
                        events,
                        manifest: SessionManifest {
                            v: manifest.v,
                            pins,
                        },
                    },
                    is_complete: false,
                    tail_reason: Some(reason),
                })
            }
        }
    }

    /// Appends a batch of events and pins as one unit.
    ///
    /// Requires a live gate witness for this session. Events whose dedupe
    /// key already exists are silently dropped, together with the pins they
    /// would have created, which is what makes every write path replayable.
    pub async fn append(&self, witness: &Witness, batch: EventBatch) -> Result<()> {
        if !witness.is_live() {
            return Err(EventLogError::WitnessRejected {
                reason: "witness is no longer live".to_string(),
            });
        }
        let session_id = witness.session_id().clone();

        let dir = self.layout.session_dir(&session_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| EventLogError::Io {
                path: dir.display().to_string(),
                source,
            })?;

        let (existing, mut manifest) = if self.session_exists(&session_id).await {
            let truth = self.load(&session_id).await?;
            (truth.events, truth.manifest)
        } else {
            (Vec::new(), SessionManifest { v: 1, pins: Vec::new() })
        };

        let mut seen: FxHashSet<String> =
            existing.iter().map(|e| e.dedupe_key.clone()).collect();
        let mut next_index = existing.len() as u64;

        let mut accepted = Vec::new();
        let mut dropped_event_ids = FxHashSet::default();
        for new_event in batch.events {
            if seen.contains(&new_event.dedupe_key) {
                debug!(
                    dedupe_key = %new_event.dedupe_key,
                    session = %session_id,
                    "dropping already-appended event"
                );
                dropped_event_ids.insert(new_event.event_id.clone());
                continue;
            }
            seen.insert(new_event.dedupe_key.clone());
            accepted.push(new_event.into_event(session_id.clone(), next_index));
            next_index += 1;
        }

        if accepted.is_empty() && batch.pins.is_empty() {
            return Ok(());
        }

        let index_of: FxHashMap<_, _> = accepted
            .iter()
            .map(|e| (e.event_id.clone(), e.event_index))
            .collect();
        let mut new_pins = Vec::new();
        for pin in batch.pins {
            if dropped_event_ids.contains(&pin.created_by_event_id) {
                continue;
            }
            let Some(&event_index) = index_of.get(&pin.created_by_event_id) else {
                return Err(EventLogError::WitnessRejected {
                    reason: format!(
                        "pin for {} names an event outside its batch",
                        pin.snapshot_ref
                    ),
                });
            };
            new_pins.push(SnapshotPin {
                snapshot_ref: pin.snapshot_ref,
                event_index,
                created_by_event_id: pin.created_by_event_id,
            });
        }

        // One write call for every line of the batch, then fsync; readers
        // of a torn write land on the validated-prefix path.
        let mut payload = String::new();
        for event in &accepted {
            payload.push_str(&canonical_json_string(event)?);
            payload.push('\n');
        }
        if !payload.is_empty() {
            let log_path = self.layout.events_log(&session_id);
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .await
                .map_err(|source| EventLogError::Io {
                    path: log_path.display().to_string(),
                    source,
                })?;
            file.write_all(payload.as_bytes())
                .await
                .map_err(|source| EventLogError::Io {
                    path: log_path.display().to_string(),
                    source,
                })?;
            file.sync_all().await.map_err(|source| EventLogError::Io {
                path: log_path.display().to_string(),
                source,
            })?;
        }

        if !new_pins.is_empty() {
            manifest.pins.extend(new_pins);
            self.write_manifest(&session_id, &manifest).await?;
        } else if existing.is_empty() {
            // First append persists an empty manifest so the session dir is
            // structurally complete.
            self.write_manifest(&session_id, &manifest).await?;
        }

        Ok(())
    }

    async fn write_manifest(
        &self,
        session_id: &SessionId,
        manifest: &SessionManifest,
    ) -> Result<()> {
        let path = self.layout.manifest(session_id);
        let tmp = path.with_extension("json.tmp");
        let body = canonical_json_string(manifest)?;
        tokio::fs::write(&tmp, body.as_bytes())
            .await
            .map_err(|source| EventLogError::Io {
                path: tmp.display().to_string(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| EventLogError::Io {
                path: path.display().to_string(),
                source,
            })?;
        Ok(())
    }

    async fn read_raw(&self, session_id: &SessionId) -> Result<(Vec<String>, SessionManifest)> {
        let log_path = self.layout.events_log(session_id);
        let raw = match tokio::fs::read_to_string(&log_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EventLogError::SessionNotFound {
                    session_id: session_id.clone(),
                });
            }
            Err(source) => {
                return Err(EventLogError::Io {
                    path: log_path.display().to_string(),
                    source,
                });
            }
        };
        let lines: Vec<String> = raw.lines().map(str::to_string).collect();

        let manifest_path = self.layout.manifest(session_id);
        let manifest = match tokio::fs::read_to_string(&manifest_path).await {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| EventLogError::Corruption {
                session_id: session_id.clone(),
                location: CorruptionLocation::Head,
                reason: format!("manifest does not parse: {e}"),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SessionManifest {
                v: 1,
                pins: Vec::new(),
            },
            Err(source) => {
                return Err(EventLogError::Io {
                    path: manifest_path.display().to_string(),
                    source,
                });
            }
        };
        Ok((lines, manifest))
    }
}

/// Validates events line by line; returns the valid prefix and the first
/// failure, classified as head or tail.
fn walk(
    session_id: &SessionId,
    lines: &[String],
    manifest: &SessionManifest,
) -> (Vec<SessionEvent>, Option<WalkFailure>) {
    // Manifest integrity relative to the raw log: pins must land inside it.
    for pin in &manifest.pins {
        if pin.event_index as usize >= lines.len() {
            return (
                Vec::new(),
                Some(WalkFailure::Head(format!(
                    "manifest pins event index {} beyond log length {}",
                    pin.event_index,
                    lines.len()
                ))),
            );
        }
    }

    let mut pins_by_index: FxHashMap<u64, Vec<&SnapshotPin>> = FxHashMap::default();
    for pin in &manifest.pins {
        pins_by_index.entry(pin.event_index).or_default().push(pin);
    }

    let mut events: Vec<SessionEvent> = Vec::with_capacity(lines.len());
    let mut seen_dedupe: FxHashSet<String> = FxHashSet::default();
    let mut pinned_refs: FxHashSet<&str> = FxHashSet::default();

    let fail = |at: usize, reason: String| {
        if at == 0 {
            Some(WalkFailure::Head(reason))
        } else {
            Some(WalkFailure::Tail { at, reason })
        }
    };

    if lines.is_empty() {
        return (
            events,
            Some(WalkFailure::Head("log is empty".to_string())),
        );
    }

    for (i, line) in lines.iter().enumerate() {
        let event: SessionEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                return (events, fail(i, format!("event line {i} does not parse: {e}")));
            }
        };
        if event.event_index != i as u64 {
            return (
                events,
                fail(
                    i,
                    format!("event index {} at line {i} breaks contiguity", event.event_index),
                ),
            );
        }
        if &event.session_id != session_id {
            return (
                events,
                fail(
                    i,
                    format!("event at index {i} belongs to session {}", event.session_id),
                ),
            );
        }
        if i == 0 && !matches!(event.body, EventBody::SessionCreated(_)) {
            return (
                events,
                Some(WalkFailure::Head(
                    "first event is not session_created".to_string(),
                )),
            );
        }
        if i > 0 && matches!(event.body, EventBody::SessionCreated(_)) {
            return (
                events,
                fail(i, format!("duplicate session_created at index {i}")),
            );
        }

        // Pins created by this event become usable from this index onward,
        // and must name this event.
        if let Some(pins) = pins_by_index.get(&(i as u64)) {
            for pin in pins {
                if pin.created_by_event_id != event.event_id {
                    return (
                        events,
                        Some(WalkFailure::Head(format!(
                            "pin for {} names event {} but index {i} holds {}",
                            pin.snapshot_ref, pin.created_by_event_id, event.event_id
                        ))),
                    );
                }
            }
        }

        for reference in event.body.referenced_snapshots() {
            let newly_pinned = pins_by_index
                .get(&(i as u64))
                .into_iter()
                .flatten()
                .any(|p| &p.snapshot_ref == reference);
            if !newly_pinned && !pinned_refs.contains(reference.as_str()) {
                return (
                    events,
                    fail(
                        i,
                        format!("event at index {i} references unpinned snapshot {reference}"),
                    ),
                );
            }
        }

        if !seen_dedupe.insert(event.dedupe_key.clone()) {
            return (
                events,
                fail(
                    i,
                    format!("dedupe key {:?} reappears at index {i}", event.dedupe_key),
                ),
            );
        }

        if let Some(pins) = pins_by_index.get(&(i as u64)) {
            for pin in pins {
                pinned_refs.insert(pin.snapshot_ref.as_str());
            }
        }
        events.push(event);
    }

    (events, None)
}
