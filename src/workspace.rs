//! Best-effort workspace anchors.
//!
//! When a session starts we record where it is running: the git head sha,
//! the branch name, and a hash of the repository root path. Resume ranking
//! uses these to match a returning agent to the session it left behind.
//! Anchor resolution never blocks or fails a workflow start; anything we
//! cannot read is simply absent.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::digest::sha256_hex;

/// Closed-key workspace anchors captured at session start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceAnchors {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_head_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_root_hash: Option<String>,
}

impl WorkspaceAnchors {
    /// Whether any anchor resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.git_head_sha.is_none() && self.git_branch.is_none() && self.repo_root_hash.is_none()
    }
}

/// Captures anchors for a workspace path.
///
/// Reads `.git/HEAD` (and the ref file it points at) directly rather than
/// shelling out; a missing or unreadable repository yields empty anchors.
#[must_use]
pub fn capture_anchors(workspace_path: &Path) -> WorkspaceAnchors {
    let Some(repo_root) = find_repo_root(workspace_path) else {
        return WorkspaceAnchors::default();
    };

    let mut anchors = WorkspaceAnchors {
        repo_root_hash: Some(sha256_hex(repo_root.to_string_lossy().as_bytes())),
        ..WorkspaceAnchors::default()
    };

    let head_path = repo_root.join(".git").join("HEAD");
    let Ok(head) = std::fs::read_to_string(&head_path) else {
        return anchors;
    };
    let head = head.trim();

    if let Some(ref_name) = head.strip_prefix("ref: ") {
        anchors.git_branch = ref_name
            .strip_prefix("refs/heads/")
            .map(|b| b.to_string())
            .or_else(|| Some(ref_name.to_string()));
        let ref_file = repo_root.join(".git").join(ref_name);
        if let Ok(sha) = std::fs::read_to_string(&ref_file) {
            let sha = sha.trim();
            if looks_like_sha(sha) {
                anchors.git_head_sha = Some(sha.to_string());
            }
        } else if let Some(sha) = packed_ref_sha(&repo_root, ref_name) {
            anchors.git_head_sha = Some(sha);
        }
    } else if looks_like_sha(head) {
        // Detached head: HEAD holds the sha directly.
        anchors.git_head_sha = Some(head.to_string());
    }

    anchors
}

fn find_repo_root(start: &Path) -> Option<std::path::PathBuf> {
    let mut current = Some(start);
    while let Some(dir) = current {
        if dir.join(".git").is_dir() {
            return Some(dir.to_path_buf());
        }
        current = dir.parent();
    }
    None
}

fn looks_like_sha(s: &str) -> bool {
    s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn packed_ref_sha(repo_root: &Path, ref_name: &str) -> Option<String> {
    let packed = std::fs::read_to_string(repo_root.join(".git").join("packed-refs")).ok()?;
    for line in packed.lines() {
        if line.starts_with('#') || line.starts_with('^') {
            continue;
        }
        if let Some((sha, name)) = line.split_once(' ')
            && name.trim() == ref_name
            && looks_like_sha(sha)
        {
            return Some(sha.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_repo_yields_empty_anchors() {
        let dir = tempfile::tempdir().unwrap();
        let anchors = capture_anchors(dir.path());
        assert!(anchors.is_empty());
    }

    #[test]
    fn reads_branch_and_sha_from_git_dir() {
        let dir = tempfile::tempdir().unwrap();
        let git = dir.path().join(".git");
        std::fs::create_dir_all(git.join("refs/heads")).unwrap();
        std::fs::write(git.join("HEAD"), "ref: refs/heads/main\n").unwrap();
        let sha = "a".repeat(40);
        std::fs::write(git.join("refs/heads/main"), format!("{sha}\n")).unwrap();

        let anchors = capture_anchors(dir.path());
        assert_eq!(anchors.git_branch.as_deref(), Some("main"));
        assert_eq!(anchors.git_head_sha.as_deref(), Some(sha.as_str()));
        assert!(anchors.repo_root_hash.is_some());
    }

    #[test]
    fn detached_head_resolves_sha_only() {
        let dir = tempfile::tempdir().unwrap();
        let git = dir.path().join(".git");
        std::fs::create_dir_all(&git).unwrap();
        let sha = "b".repeat(40);
        std::fs::write(git.join("HEAD"), format!("{sha}\n")).unwrap();

        let anchors = capture_anchors(dir.path());
        assert_eq!(anchors.git_head_sha.as_deref(), Some(sha.as_str()));
        assert!(anchors.git_branch.is_none());
    }
}
