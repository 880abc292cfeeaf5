//! Resume ranking: which healthy session should a returning agent pick up?
//!
//! Anchors are compared in specificity order: a matching git head sha
//! outranks a matching branch, which outranks a matching repo-root hash.
//! Recency (the session's last event index) breaks remaining ties; a final
//! tie on the session id keeps the ordering total and deterministic.

use crate::types::SessionId;
use crate::workspace::WorkspaceAnchors;

/// One rankable session.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeCandidate {
    pub session_id: SessionId,
    pub anchors: WorkspaceAnchors,
    /// Index of the session's last event; proxies recency.
    pub last_event_index: u64,
}

fn anchor_score(candidate: &WorkspaceAnchors, target: &WorkspaceAnchors) -> u8 {
    let matches = |a: &Option<String>, b: &Option<String>| -> bool {
        matches!((a, b), (Some(x), Some(y)) if x == y)
    };
    if matches(&candidate.git_head_sha, &target.git_head_sha) {
        3
    } else if matches(&candidate.git_branch, &target.git_branch) {
        2
    } else if matches(&candidate.repo_root_hash, &target.repo_root_hash) {
        1
    } else {
        0
    }
}

/// Ranks candidates against the caller's current anchors, best first.
#[must_use]
pub fn rank_resume_candidates(
    mut candidates: Vec<ResumeCandidate>,
    target: &WorkspaceAnchors,
) -> Vec<ResumeCandidate> {
    candidates.sort_by(|a, b| {
        anchor_score(&b.anchors, target)
            .cmp(&anchor_score(&a.anchors, target))
            .then(b.last_event_index.cmp(&a.last_event_index))
            .then(a.session_id.cmp(&b.session_id))
    });
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, anchors: WorkspaceAnchors, last: u64) -> ResumeCandidate {
        ResumeCandidate {
            session_id: SessionId::parse(id).unwrap(),
            anchors,
            last_event_index: last,
        }
    }

    #[test]
    fn head_sha_outranks_branch_and_recency() {
        let target = WorkspaceAnchors {
            git_head_sha: Some("abc".into()),
            git_branch: Some("main".into()),
            repo_root_hash: Some("root".into()),
        };
        let ranked = rank_resume_candidates(
            vec![
                candidate(
                    "branch-match",
                    WorkspaceAnchors {
                        git_branch: Some("main".into()),
                        ..WorkspaceAnchors::default()
                    },
                    99,
                ),
                candidate(
                    "sha-match",
                    WorkspaceAnchors {
                        git_head_sha: Some("abc".into()),
                        ..WorkspaceAnchors::default()
                    },
                    1,
                ),
            ],
            &target,
        );
        assert_eq!(ranked[0].session_id.as_str(), "sha-match");
    }

    #[test]
    fn recency_breaks_equal_scores() {
        let target = WorkspaceAnchors::default();
        let ranked = rank_resume_candidates(
            vec![
                candidate("older", WorkspaceAnchors::default(), 3),
                candidate("newer", WorkspaceAnchors::default(), 7),
            ],
            &target,
        );
        assert_eq!(ranked[0].session_id.as_str(), "newer");
    }
}
