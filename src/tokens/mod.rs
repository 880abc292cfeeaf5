//! Signed, opaque tokens binding an agent to its execution position.
//!
//! The agent never holds naked state: it holds tokens. A **state** token
//! answers "where am I" and is surrendered on every call; an **ack** token
//! is the single-use claim "this is *my* next submission"; a **checkpoint**
//! token marks progress without advancing. All three are HMAC-SHA-256
//! signed over canonical payload bytes and travel as Bech32m text with a
//! kind-specific human-readable prefix (`st`, `ack`, `chk`).
//!
//! Tokens are claims, not authority: the server re-verifies every token on
//! every call against the full keyring (active and retired keys), and only
//! the signing key mints new ones. Signing is a pure function of
//! `(payload, signing key)`, which is what makes fact-returning replay able
//! to re-mint byte-identical tokens.

mod codec;
mod payload;

pub use codec::{TOKEN_VERSION, TokenCodec, TokenError, TokenKind};
pub use payload::{
    AckTokenPayload, CheckpointTokenPayload, StateTokenPayload, assert_token_scope_matches,
};
