//! Token payloads and scope checks.

use serde::{Deserialize, Serialize};

use super::codec::TokenError;
use crate::types::{AttemptId, NodeId, RunId, SessionId, ShortHashRef};

/// Payload of a `state` token: the agent's resumable position.
///
/// Binds the workflow by short hash reference so a token minted against one
/// pinned workflow cannot rehydrate a session running a different one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTokenPayload {
    pub session_id: SessionId,
    pub run_id: RunId,
    pub node_id: NodeId,
    pub workflow_hash_ref: ShortHashRef,
}

/// Payload of an `ack` token: one specific submission slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckTokenPayload {
    pub session_id: SessionId,
    pub run_id: RunId,
    pub node_id: NodeId,
    pub attempt_id: AttemptId,
}

/// Payload of a `checkpoint` token: progress marking without advance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointTokenPayload {
    pub session_id: SessionId,
    pub run_id: RunId,
    pub node_id: NodeId,
    pub attempt_id: AttemptId,
}

/// Enforces that an ack token's `(session, run, node)` equals the state
/// token's.
///
/// An ack presented against a different node is an agent confusing two
/// in-flight conversations; it must fail closed before any lock is taken.
pub fn assert_token_scope_matches(
    state: &StateTokenPayload,
    ack: &AckTokenPayload,
) -> Result<(), TokenError> {
    if state.session_id != ack.session_id {
        return Err(TokenError::ScopeMismatch {
            reason: "ack token bound to a different session".to_string(),
        });
    }
    if state.run_id != ack.run_id {
        return Err(TokenError::ScopeMismatch {
            reason: "ack token bound to a different run".to_string(),
        });
    }
    if state.node_id != ack.node_id {
        return Err(TokenError::ScopeMismatch {
            reason: "ack token bound to a different node".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> StateTokenPayload {
        StateTokenPayload {
            session_id: SessionId::parse("sess-1").unwrap(),
            run_id: RunId::parse("run-1").unwrap(),
            node_id: NodeId::parse("node-1").unwrap(),
            workflow_hash_ref: ShortHashRef::parse("0123456789abcdef").unwrap(),
        }
    }

    fn ack() -> AckTokenPayload {
        AckTokenPayload {
            session_id: SessionId::parse("sess-1").unwrap(),
            run_id: RunId::parse("run-1").unwrap(),
            node_id: NodeId::parse("node-1").unwrap(),
            attempt_id: AttemptId::parse("attempt-1").unwrap(),
        }
    }

    #[test]
    fn matching_scopes_pass() {
        assert!(assert_token_scope_matches(&state(), &ack()).is_ok());
    }

    #[test]
    fn node_mismatch_fails() {
        let mut a = ack();
        a.node_id = NodeId::parse("node-2").unwrap();
        assert!(matches!(
            assert_token_scope_matches(&state(), &a),
            Err(TokenError::ScopeMismatch { .. })
        ));
    }
}
