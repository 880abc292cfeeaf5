//! Binary token framing, Bech32m text form, sign/verify.
//!
//! Wire layout (bit-exact):
//!
//! ```text
//! u8 version=1 || u8 kind ∈ {state=1, ack=2, checkpoint=3}
//!   || canonical_json(payload)
//!   || hmac_sha256(version || kind || canonical_json(payload))
//! ```
//!
//! The text form is Bech32m over those bytes with the kind's HRP, matching
//! `^(st|ack|chk)1[023456789acdefghjklmnpqrstuvwxyz]+$`. Decoders accept
//! only their expected HRP.

use bech32::primitives::decode::CheckedHrpstring;
use bech32::{Bech32m, Hrp};
use hmac::{Hmac, Mac};
use miette::Diagnostic;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::sync::Arc;
use thiserror::Error;

use super::payload::{AckTokenPayload, CheckpointTokenPayload, StateTokenPayload};
use crate::canon::canonical_json_bytes;
use crate::keyring::Keyring;
use crate::types::NodeId;

type HmacSha256 = Hmac<Sha256>;

/// Current token wire version.
pub const TOKEN_VERSION: u8 = 1;

const SIGNATURE_LEN: usize = 32;

/// Token kind discriminant, also the binary kind byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// `st…`: resumable position.
    State,
    /// `ack…`: single-use submission claim.
    Ack,
    /// `chk…`: progress marker.
    Checkpoint,
}

impl TokenKind {
    /// The binary kind byte.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            TokenKind::State => 1,
            TokenKind::Ack => 2,
            TokenKind::Checkpoint => 3,
        }
    }

    /// The Bech32m human-readable prefix.
    #[must_use]
    pub fn hrp(self) -> &'static str {
        match self {
            TokenKind::State => "st",
            TokenKind::Ack => "ack",
            TokenKind::Checkpoint => "chk",
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(TokenKind::State),
            2 => Some(TokenKind::Ack),
            3 => Some(TokenKind::Checkpoint),
            _ => None,
        }
    }
}

/// The closed token failure set.
#[derive(Debug, Clone, Error, Diagnostic, PartialEq, Eq)]
pub enum TokenError {
    /// Not Bech32m, wrong HRP, truncated frame, or unparseable payload.
    #[error("token is malformed: {reason}")]
    #[diagnostic(code(loomrail::tokens::invalid_format))]
    InvalidFormat { reason: String },

    /// The version byte is not [`TOKEN_VERSION`].
    #[error("unsupported token version {version}")]
    #[diagnostic(code(loomrail::tokens::unsupported_version))]
    UnsupportedVersion { version: u8 },

    /// No keyring key produced a matching HMAC.
    #[error("token signature does not verify")]
    #[diagnostic(code(loomrail::tokens::bad_signature))]
    BadSignature,

    /// Paired tokens disagree on session/run/node.
    #[error("token scope mismatch: {reason}")]
    #[diagnostic(code(loomrail::tokens::scope_mismatch))]
    ScopeMismatch { reason: String },

    /// The token names a node absent from the session's log.
    #[error("token references unknown node {node_id}")]
    #[diagnostic(code(loomrail::tokens::unknown_node))]
    UnknownNode { node_id: NodeId },

    /// The state token's workflow binding does not match the pinned
    /// workflow the session is running.
    #[error("token workflow hash does not match the session's pinned workflow")]
    #[diagnostic(code(loomrail::tokens::workflow_hash_mismatch))]
    WorkflowHashMismatch,
}

pub type Result<T> = std::result::Result<T, TokenError>;

/// Signs and verifies tokens against a startup-loaded keyring.
#[derive(Clone)]
pub struct TokenCodec {
    keyring: Arc<Keyring>,
}

impl TokenCodec {
    /// Wraps a keyring for token operations.
    #[must_use]
    pub fn new(keyring: Arc<Keyring>) -> Self {
        Self { keyring }
    }

    /// Mints a state token.
    pub fn sign_state(&self, payload: &StateTokenPayload) -> Result<String> {
        self.sign(TokenKind::State, payload)
    }

    /// Mints an ack token.
    pub fn sign_ack(&self, payload: &AckTokenPayload) -> Result<String> {
        self.sign(TokenKind::Ack, payload)
    }

    /// Mints a checkpoint token.
    pub fn sign_checkpoint(&self, payload: &CheckpointTokenPayload) -> Result<String> {
        self.sign(TokenKind::Checkpoint, payload)
    }

    /// Verifies a state token's text form.
    pub fn verify_state(&self, text: &str) -> Result<StateTokenPayload> {
        self.verify(TokenKind::State, text)
    }

    /// Verifies an ack token's text form.
    pub fn verify_ack(&self, text: &str) -> Result<AckTokenPayload> {
        self.verify(TokenKind::Ack, text)
    }

    /// Verifies a checkpoint token's text form.
    pub fn verify_checkpoint(&self, text: &str) -> Result<CheckpointTokenPayload> {
        self.verify(TokenKind::Checkpoint, text)
    }

    /// Signs a payload with the keyring's signing key.
    ///
    /// Deterministic: identical payload and signing key yield identical
    /// token text, which replay relies on.
    fn sign<T: Serialize>(&self, kind: TokenKind, payload: &T) -> Result<String> {
        let payload_bytes =
            canonical_json_bytes(payload).map_err(|e| TokenError::InvalidFormat {
                reason: format!("payload cannot be canonicalized: {e}"),
            })?;

        let mut frame = Vec::with_capacity(2 + payload_bytes.len() + SIGNATURE_LEN);
        frame.push(TOKEN_VERSION);
        frame.push(kind.code());
        frame.extend_from_slice(&payload_bytes);

        let mut mac = HmacSha256::new_from_slice(self.keyring.signing_key().secret())
            .expect("HMAC accepts keys of any length");
        mac.update(&frame);
        frame.extend_from_slice(&mac.finalize().into_bytes());

        let hrp = Hrp::parse(kind.hrp()).expect("static HRPs are valid");
        bech32::encode::<Bech32m>(hrp, &frame).map_err(|e| TokenError::InvalidFormat {
            reason: format!("bech32 encoding failed: {e}"),
        })
    }

    /// Verifies a token's text form and returns its payload.
    fn verify<T: DeserializeOwned>(&self, kind: TokenKind, text: &str) -> Result<T> {
        let checked =
            CheckedHrpstring::new::<Bech32m>(text).map_err(|e| TokenError::InvalidFormat {
                reason: format!("not a bech32m string: {e}"),
            })?;
        if checked.hrp() != Hrp::parse(kind.hrp()).expect("static HRPs are valid") {
            return Err(TokenError::InvalidFormat {
                reason: format!("expected HRP {:?}, got {}", kind.hrp(), checked.hrp()),
            });
        }
        let frame: Vec<u8> = checked.byte_iter().collect();
        if frame.len() < 2 + SIGNATURE_LEN {
            return Err(TokenError::InvalidFormat {
                reason: "token frame is truncated".to_string(),
            });
        }
        let version = frame[0];
        if version != TOKEN_VERSION {
            return Err(TokenError::UnsupportedVersion { version });
        }
        match TokenKind::from_code(frame[1]) {
            Some(k) if k == kind => {}
            _ => {
                return Err(TokenError::InvalidFormat {
                    reason: format!("kind byte {} does not match HRP {:?}", frame[1], kind.hrp()),
                });
            }
        }

        let signed_len = frame.len() - SIGNATURE_LEN;
        let (signed, signature) = frame.split_at(signed_len);

        let mut verified = false;
        for key in self.keyring.verification_keys() {
            let mut mac = HmacSha256::new_from_slice(key.secret())
                .expect("HMAC accepts keys of any length");
            mac.update(signed);
            if mac.verify_slice(signature).is_ok() {
                verified = true;
                break;
            }
        }
        if !verified {
            return Err(TokenError::BadSignature);
        }

        serde_json::from_slice(&signed[2..]).map_err(|e| TokenError::InvalidFormat {
            reason: format!("token payload does not parse: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AttemptId, RunId, SessionId, ShortHashRef};

    fn codec() -> TokenCodec {
        TokenCodec::new(Arc::new(Keyring::generate()))
    }

    fn state_payload() -> StateTokenPayload {
        StateTokenPayload {
            session_id: SessionId::parse("sess-1").unwrap(),
            run_id: RunId::parse("run-1").unwrap(),
            node_id: NodeId::parse("node-1").unwrap(),
            workflow_hash_ref: ShortHashRef::parse("0123456789abcdef").unwrap(),
        }
    }

    #[test]
    fn sign_verify_roundtrip() {
        let codec = codec();
        let token = codec.sign_state(&state_payload()).unwrap();
        assert!(token.starts_with("st1"));
        assert_eq!(codec.verify_state(&token).unwrap(), state_payload());
    }

    #[test]
    fn signing_is_deterministic() {
        let codec = codec();
        let a = codec.sign_state(&state_payload()).unwrap();
        let b = codec.sign_state(&state_payload()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_wrong_hrp() {
        let codec = codec();
        let token = codec.sign_state(&state_payload()).unwrap();
        assert!(matches!(
            codec.verify_ack(&token),
            Err(TokenError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn rejects_foreign_signature() {
        let minting = codec();
        let verifying = codec();
        let token = minting.sign_state(&state_payload()).unwrap();
        assert_eq!(
            verifying.verify_state(&token),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn retired_keys_still_verify() {
        let mut ring = Keyring::generate();
        let old_codec = TokenCodec::new(Arc::new(ring.clone()));
        let token = old_codec.sign_state(&state_payload()).unwrap();

        ring.rotate();
        let new_codec = TokenCodec::new(Arc::new(ring));
        assert_eq!(new_codec.verify_state(&token).unwrap(), state_payload());
    }

    #[test]
    fn rejects_tampered_text() {
        let codec = codec();
        let token = codec.sign_state(&state_payload()).unwrap();
        let mut chars: Vec<char> = token.chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == 'q' { 'p' } else { 'q' };
        let tampered: String = chars.into_iter().collect();
        assert!(codec.verify_state(&tampered).is_err());
    }

    #[test]
    fn checkpoint_tokens_carry_attempts() {
        let codec = codec();
        let payload = CheckpointTokenPayload {
            session_id: SessionId::parse("s").unwrap(),
            run_id: RunId::parse("r").unwrap(),
            node_id: NodeId::parse("n").unwrap(),
            attempt_id: AttemptId::parse("a").unwrap(),
        };
        let token = codec.sign_checkpoint(&payload).unwrap();
        assert!(token.starts_with("chk1"));
        assert_eq!(codec.verify_checkpoint(&token).unwrap(), payload);
    }
}
