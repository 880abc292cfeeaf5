//! On-disk path derivations.

use std::path::{Path, PathBuf};

use crate::types::SessionId;

/// Derives every path under the engine's data directory.
///
/// Pure path arithmetic; directories are created lazily by the stores that
/// write into them.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    /// Roots the layout at a data directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The data directory itself.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `sessions/` parent directory.
    #[must_use]
    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    /// One session's directory.
    #[must_use]
    pub fn session_dir(&self, session_id: &SessionId) -> PathBuf {
        self.sessions_dir().join(session_id.as_str())
    }

    /// The session's line-delimited event log.
    #[must_use]
    pub fn events_log(&self, session_id: &SessionId) -> PathBuf {
        self.session_dir(session_id).join("events.log")
    }

    /// The session's snapshot-pin manifest.
    #[must_use]
    pub fn manifest(&self, session_id: &SessionId) -> PathBuf {
        self.session_dir(session_id).join("manifest.json")
    }

    /// The session's exclusive lock file.
    #[must_use]
    pub fn lock_file(&self, session_id: &SessionId) -> PathBuf {
        self.session_dir(session_id).join("session.lock")
    }

    /// Root of the execution-snapshot content store.
    #[must_use]
    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    /// Root of the pinned-workflow content store.
    #[must_use]
    pub fn pinned_workflows_dir(&self) -> PathBuf {
        self.root.join("pinned-workflows")
    }

    /// The keyring file.
    #[must_use]
    pub fn keyring_file(&self) -> PathBuf {
        self.root.join("keyring").join("keys.json")
    }
}

/// Fans a 64-char hex digest out as `<dir>/<2 hex>/<62 hex>.json`.
#[must_use]
pub fn fanout_path(dir: &Path, hex: &str) -> PathBuf {
    dir.join(&hex[..2]).join(format!("{}.json", &hex[2..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_layout() {
        let layout = DataLayout::new("/data");
        let session = SessionId::parse("sess-1").unwrap();
        assert_eq!(
            layout.events_log(&session),
            PathBuf::from("/data/sessions/sess-1/events.log")
        );
        assert_eq!(
            layout.lock_file(&session),
            PathBuf::from("/data/sessions/sess-1/session.lock")
        );
        assert_eq!(layout.keyring_file(), PathBuf::from("/data/keyring/keys.json"));
    }

    #[test]
    fn fanout_splits_first_two_chars() {
        let hex = "ab".to_string() + &"c".repeat(62);
        let path = fanout_path(Path::new("/data/snapshots"), &hex);
        assert_eq!(
            path,
            PathBuf::from(format!("/data/snapshots/ab/{}.json", "c".repeat(62)))
        );
    }
}
