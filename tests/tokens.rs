use std::sync::Arc;

use loomrail::keyring::Keyring;
use loomrail::tokens::{
    AckTokenPayload, CheckpointTokenPayload, StateTokenPayload, TokenCodec, TokenError,
};
use loomrail::types::{AttemptId, NodeId, RunId, SessionId, ShortHashRef};

fn codec() -> TokenCodec {
    TokenCodec::new(Arc::new(Keyring::generate()))
}

fn state_payload() -> StateTokenPayload {
    StateTokenPayload {
        session_id: SessionId::parse("01hqsessiona").unwrap(),
        run_id: RunId::parse("01hqrunb").unwrap(),
        node_id: NodeId::parse("01hqnodec").unwrap(),
        workflow_hash_ref: ShortHashRef::parse("00ff00ff00ff00ff").unwrap(),
    }
}

fn ack_payload() -> AckTokenPayload {
    AckTokenPayload {
        session_id: SessionId::parse("01hqsessiona").unwrap(),
        run_id: RunId::parse("01hqrunb").unwrap(),
        node_id: NodeId::parse("01hqnodec").unwrap(),
        attempt_id: AttemptId::parse("01hqattemptd").unwrap(),
    }
}

/// Every token kind round-trips through its own verifier.
#[test]
fn verify_of_sign_returns_the_payload_for_every_kind() {
    let codec = codec();

    let st = codec.sign_state(&state_payload()).unwrap();
    assert_eq!(codec.verify_state(&st).unwrap(), state_payload());

    let ack = codec.sign_ack(&ack_payload()).unwrap();
    assert_eq!(codec.verify_ack(&ack).unwrap(), ack_payload());

    let chk = codec
        .sign_checkpoint(&CheckpointTokenPayload {
            session_id: SessionId::parse("s").unwrap(),
            run_id: RunId::parse("r").unwrap(),
            node_id: NodeId::parse("n").unwrap(),
            attempt_id: AttemptId::parse("a").unwrap(),
        })
        .unwrap();
    assert!(codec.verify_checkpoint(&chk).is_ok());
}

/// Text tokens match the published wire regex and carry the right HRP.
#[test]
fn text_form_matches_the_wire_shape() {
    let codec = codec();
    let tokens = [
        (codec.sign_state(&state_payload()).unwrap(), "st1"),
        (codec.sign_ack(&ack_payload()).unwrap(), "ack1"),
    ];
    let alphabet = "023456789acdefghjklmnpqrstuvwxyz";
    for (token, prefix) in tokens {
        assert!(token.starts_with(prefix), "{token} lacks {prefix}");
        let data = &token[prefix.len()..];
        assert!(
            data.chars().all(|c| alphabet.contains(c)),
            "{token} uses characters outside the bech32 alphabet"
        );
    }
}

/// Signing is a pure function of payload and signing key.
#[test]
fn signing_is_deterministic_across_calls() {
    let codec = codec();
    let a = codec.sign_ack(&ack_payload()).unwrap();
    let b = codec.sign_ack(&ack_payload()).unwrap();
    assert_eq!(a, b);
}

/// Rotation keeps old tokens verifiable while new tokens use the new key.
#[test]
fn rotation_preserves_verification_of_old_tokens() {
    let mut ring = Keyring::generate();
    let old = TokenCodec::new(Arc::new(ring.clone()));
    let token = old.sign_state(&state_payload()).unwrap();

    ring.rotate();
    let rotated = TokenCodec::new(Arc::new(ring));
    assert_eq!(rotated.verify_state(&token).unwrap(), state_payload());

    let fresh = rotated.sign_state(&state_payload()).unwrap();
    assert_ne!(fresh, token, "new signing key produces a different token");
    assert_eq!(rotated.verify_state(&fresh).unwrap(), state_payload());
}

/// A decoder only accepts its own HRP.
#[test]
fn decoders_reject_foreign_kinds() {
    let codec = codec();
    let st = codec.sign_state(&state_payload()).unwrap();
    assert!(matches!(
        codec.verify_ack(&st),
        Err(TokenError::InvalidFormat { .. })
    ));
    assert!(matches!(
        codec.verify_checkpoint(&st),
        Err(TokenError::InvalidFormat { .. })
    ));
}

/// Garbage input is an invalid format, not a panic.
#[test]
fn garbage_inputs_fail_cleanly() {
    let codec = codec();
    for garbage in ["", "st1", "not-a-token", "st2abcdef", "ack1!!!!"] {
        assert!(codec.verify_state(garbage).is_err(), "accepted {garbage:?}");
    }
}
