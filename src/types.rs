//! Tagged identifiers and content references.
//!
//! Every identifier in the engine is a distinct newtype so a session id can
//! never be passed where a node id is expected. All ids share one textual
//! discipline: lowercase, delimiter-safe (`[a-z0-9_-]`, at most 64 chars),
//! so colon-joined dedupe keys parse unambiguously.
//!
//! Random ids are ULIDs (lowercased); [`AttemptId`] additionally supports
//! deterministic chaining so a retry of the same submission derives the
//! same successor id on every replica.
//!
//! # Examples
//!
//! ```rust
//! use loomrail::types::{AttemptId, SessionId};
//!
//! let session = SessionId::generate();
//! assert!(SessionId::parse(session.as_str()).is_ok());
//!
//! let a0 = AttemptId::generate();
//! // Chaining is deterministic: both sides compute the same successor.
//! assert_eq!(a0.next(), a0.next());
//! assert_ne!(a0, a0.next());
//! ```

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use ulid::Ulid;

/// Maximum length of a delimiter-safe identifier.
pub const MAX_ID_LEN: usize = 64;

/// Errors from identifier parsing.
#[derive(Debug, Clone, Error, Diagnostic, PartialEq, Eq)]
pub enum IdError {
    /// The identifier is empty.
    #[error("identifier is empty")]
    #[diagnostic(code(loomrail::types::empty_id))]
    Empty,

    /// The identifier exceeds [`MAX_ID_LEN`].
    #[error("identifier is {len} chars, max is {MAX_ID_LEN}")]
    #[diagnostic(code(loomrail::types::id_too_long))]
    TooLong { len: usize },

    /// The identifier contains a character outside `[a-z0-9_-]`.
    #[error("identifier {id:?} contains invalid character {ch:?}")]
    #[diagnostic(
        code(loomrail::types::id_invalid_char),
        help("Identifiers must match [a-z0-9_-]+ so they survive colon-joined keys.")
    )]
    InvalidChar { id: String, ch: char },

    /// A `sha256:<hex>` reference failed to parse.
    #[error("malformed sha256 reference: {reason}")]
    #[diagnostic(code(loomrail::types::bad_sha256_ref))]
    BadSha256Ref { reason: String },
}

/// Validates the delimiter-safe id discipline shared by all id newtypes.
pub fn validate_delimiter_safe(s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }
    if s.len() > MAX_ID_LEN {
        return Err(IdError::TooLong { len: s.len() });
    }
    for ch in s.chars() {
        if !matches!(ch, 'a'..='z' | '0'..='9' | '_' | '-') {
            return Err(IdError::InvalidChar {
                id: s.to_string(),
                ch,
            });
        }
    }
    Ok(())
}

fn lowercase_ulid() -> String {
    Ulid::new().to_string().to_ascii_lowercase()
}

macro_rules! delimiter_safe_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Mints a fresh random identifier (lowercased ULID).
            #[must_use]
            pub fn generate() -> Self {
                Self(lowercase_ulid())
            }

            /// Parses and validates an identifier.
            pub fn parse(s: &str) -> Result<Self, IdError> {
                validate_delimiter_safe(s)?;
                Ok(Self(s.to_string()))
            }

            /// Borrows the identifier's textual form.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;
            fn try_from(s: String) -> Result<Self, IdError> {
                validate_delimiter_safe(&s)?;
                Ok(Self(s))
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }
    };
}

delimiter_safe_id! {
    /// Identifies one workflow execution session (owner of one event log).
    SessionId
}

delimiter_safe_id! {
    /// Identifies one run within a session.
    RunId
}

delimiter_safe_id! {
    /// Identifies one node in a run's DAG.
    NodeId
}

delimiter_safe_id! {
    /// Identifies one agent attempt at producing a step's output.
    AttemptId
}

delimiter_safe_id! {
    /// Identifies one event in a session's log.
    EventId
}

delimiter_safe_id! {
    /// A caller-supplied delimiter-safe identifier (workflow ids, step ids).
    DelimiterSafeId
}

impl AttemptId {
    /// Derives the successor attempt deterministically.
    ///
    /// Retries of a blocked submission must not collide with the blocked
    /// attempt's dedupe key, yet both sides of a replay must agree on what
    /// the retry id *is*. The successor is the lowercase hex of the first
    /// 16 bytes of `SHA-256("attempt:" + self)`.
    #[must_use]
    pub fn next(&self) -> AttemptId {
        let mut hasher = Sha256::new();
        hasher.update(b"attempt:");
        hasher.update(self.0.as_bytes());
        let digest = hasher.finalize();
        AttemptId(hex::encode(&digest[..16]))
    }
}

// ---------------------------------------------------------------------------
// sha256 content references
// ---------------------------------------------------------------------------

const SHA256_PREFIX: &str = "sha256:";
const SHA256_HEX_LEN: usize = 64;

/// Number of leading hex characters carried in a short hash reference.
pub const SHORT_REF_LEN: usize = 16;

fn validate_sha256_ref(s: &str) -> Result<(), IdError> {
    let Some(hex_part) = s.strip_prefix(SHA256_PREFIX) else {
        return Err(IdError::BadSha256Ref {
            reason: format!("missing {SHA256_PREFIX} prefix"),
        });
    };
    if hex_part.len() != SHA256_HEX_LEN {
        return Err(IdError::BadSha256Ref {
            reason: format!("expected {SHA256_HEX_LEN} hex chars, got {}", hex_part.len()),
        });
    }
    if !hex_part.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
        return Err(IdError::BadSha256Ref {
            reason: "non-lower-hex character in digest".to_string(),
        });
    }
    Ok(())
}

macro_rules! sha256_ref {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Wraps a raw SHA-256 digest.
            #[must_use]
            pub fn from_digest(digest: &[u8; 32]) -> Self {
                Self(format!("{SHA256_PREFIX}{}", hex::encode(digest)))
            }

            /// Hashes canonical bytes into a reference.
            #[must_use]
            pub fn from_canonical_bytes(bytes: &[u8]) -> Self {
                let digest: [u8; 32] = Sha256::digest(bytes).into();
                Self::from_digest(&digest)
            }

            /// Parses a `sha256:<64 lower-hex>` reference.
            pub fn parse(s: &str) -> Result<Self, IdError> {
                validate_sha256_ref(s)?;
                Ok(Self(s.to_string()))
            }

            /// Borrows the full `sha256:<hex>` form.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// The bare hex digest without the `sha256:` prefix.
            #[must_use]
            pub fn hex(&self) -> &str {
                &self.0[SHA256_PREFIX.len()..]
            }

            /// Short-form prefix of the digest for compact token binding.
            #[must_use]
            pub fn short_ref(&self) -> ShortHashRef {
                ShortHashRef(self.hex()[..SHORT_REF_LEN].to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;
            fn try_from(s: String) -> Result<Self, IdError> {
                validate_sha256_ref(&s)?;
                Ok(Self(s))
            }
        }

        impl From<$name> for String {
            fn from(r: $name) -> String {
                r.0
            }
        }
    };
}

sha256_ref! {
    /// Content address of a pinned workflow snapshot.
    WorkflowHash
}

sha256_ref! {
    /// Content address of an execution snapshot.
    SnapshotRef
}

/// Short-form digest prefix embedded in state tokens.
///
/// A state token binds its workflow by the first [`SHORT_REF_LEN`] hex
/// characters of the pinned workflow's hash rather than the full 64, which
/// keeps the token compact while still detecting cross-workflow token reuse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShortHashRef(String);

impl ShortHashRef {
    /// Parses a short reference (exactly [`SHORT_REF_LEN`] lower-hex chars).
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.len() != SHORT_REF_LEN || !s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
            return Err(IdError::BadSha256Ref {
                reason: format!("short ref must be {SHORT_REF_LEN} lower-hex chars"),
            });
        }
        Ok(Self(s.to_string()))
    }

    /// Borrows the textual form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this short reference is a prefix of the given full hash.
    #[must_use]
    pub fn matches(&self, full: &WorkflowHash) -> bool {
        full.hex().starts_with(&self.0)
    }
}

impl fmt::Display for ShortHashRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_delimiter_safe() {
        for _ in 0..50 {
            let id = SessionId::generate();
            assert!(SessionId::parse(id.as_str()).is_ok(), "bad id {id}");
        }
    }

    #[test]
    fn rejects_uppercase_and_delimiters() {
        assert!(matches!(
            NodeId::parse("Node"),
            Err(IdError::InvalidChar { ch: 'N', .. })
        ));
        assert!(matches!(
            NodeId::parse("a:b"),
            Err(IdError::InvalidChar { ch: ':', .. })
        ));
        assert_eq!(NodeId::parse(""), Err(IdError::Empty));
    }

    #[test]
    fn attempt_chaining_is_deterministic_and_safe() {
        let a = AttemptId::parse("01hqxv0z9wkd6s3m8p2r4t5e7a").unwrap();
        let b = a.next();
        assert_eq!(b, a.next());
        assert!(AttemptId::parse(b.as_str()).is_ok());
        assert_ne!(b, b.next());
    }

    #[test]
    fn sha256_ref_roundtrip() {
        let r = SnapshotRef::from_canonical_bytes(b"{}");
        let parsed = SnapshotRef::parse(r.as_str()).unwrap();
        assert_eq!(r, parsed);
        assert_eq!(r.hex().len(), 64);
        assert!(r.short_ref().as_str().len() == SHORT_REF_LEN);
    }

    #[test]
    fn sha256_ref_rejects_malformed() {
        assert!(SnapshotRef::parse("sha255:abcd").is_err());
        assert!(SnapshotRef::parse("sha256:abcd").is_err());
        let upper = format!("sha256:{}", "A".repeat(64));
        assert!(SnapshotRef::parse(&upper).is_err());
    }

    #[test]
    fn short_ref_matches_prefix() {
        let full = WorkflowHash::from_canonical_bytes(b"workflow");
        let short = full.short_ref();
        assert!(short.matches(&full));
        let other = WorkflowHash::from_canonical_bytes(b"different");
        assert!(!short.matches(&other));
    }
}
