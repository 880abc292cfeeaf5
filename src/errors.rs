//! The closed service error taxonomy.
//!
//! Inner modules raise their own typed errors; every one of them is
//! translated here at the service boundary into a closed `(code, retry)`
//! pair. Nothing else crosses the wire, and no inner error type leaks.
//!
//! Blockers are deliberately *not* errors: a blocked advance is a
//! successful response carrying `kind: "blocked"`.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::gate::GateError;
use crate::keyring::KeyringError;
use crate::stores::{ContentStoreError, EventLogError, LockError};
use crate::tokens::TokenError;
use crate::workflow::WorkflowError;

/// Retry hint after ~1s, used for transient storage and lock conditions.
const STORAGE_RETRY_MS: u64 = 1_000;

/// The closed error code set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Input
    ValidationError,
    NotFound,
    PreconditionFailed,
    Timeout,
    // Token
    TokenInvalidFormat,
    TokenUnsupportedVersion,
    TokenBadSignature,
    TokenScopeMismatch,
    TokenUnknownNode,
    TokenWorkflowHashMismatch,
    TokenSessionLocked,
    // Session
    SessionNotHealthy,
    StorageCorruptionDetected,
    // Catch-all
    InternalError,
}

/// Whether and how the caller may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryClass {
    NotRetryable,
    RetryableImmediate,
    #[serde(rename_all = "camelCase")]
    RetryableAfterMs { after_ms: u64 },
}

/// The one error type operations return.
#[derive(Debug, Clone, Error, Diagnostic, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[error("{code:?}: {message}")]
#[diagnostic(code(loomrail::service::error))]
pub struct ServiceError {
    pub code: ErrorCode,
    pub message: String,
    pub retry: RetryClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ServiceError {
    /// A non-retryable error.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry: RetryClass::NotRetryable,
            details: None,
        }
    }

    /// Overrides the retry class.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryClass) -> Self {
        self.retry = retry;
        self
    }

    /// Attaches structured details.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Input validation failure with structured details.
    #[must_use]
    pub fn validation(message: impl Into<String>, details: Value) -> Self {
        Self::new(ErrorCode::ValidationError, message).with_details(details)
    }

    /// Internal invariant violation; logged, never retried.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Transient storage failure; retryable after a pause.
    #[must_use]
    pub fn storage_io(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message).with_retry(RetryClass::RetryableAfterMs {
            after_ms: STORAGE_RETRY_MS,
        })
    }

    /// Call exceeded its outer time budget.
    #[must_use]
    pub fn timeout(budget_ms: u64) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("call exceeded its {budget_ms} ms budget"),
        )
        .with_retry(RetryClass::RetryableImmediate)
    }
}

/// The wire envelope for every operation result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope<T> {
    Success {
        data: T,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        code: ErrorCode,
        message: String,
        retry: RetryClass,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
}

impl<T> Envelope<T> {
    /// Wraps an operation result.
    #[must_use]
    pub fn from_result(result: Result<T, ServiceError>) -> Self {
        match result {
            Ok(data) => Envelope::Success { data },
            Err(e) => Envelope::Error {
                code: e.code,
                message: e.message,
                retry: e.retry,
                details: e.details,
            },
        }
    }
}

impl From<TokenError> for ServiceError {
    fn from(e: TokenError) -> Self {
        let code = match &e {
            TokenError::InvalidFormat { .. } => ErrorCode::TokenInvalidFormat,
            TokenError::UnsupportedVersion { .. } => ErrorCode::TokenUnsupportedVersion,
            TokenError::BadSignature => ErrorCode::TokenBadSignature,
            TokenError::ScopeMismatch { .. } => ErrorCode::TokenScopeMismatch,
            TokenError::UnknownNode { .. } => ErrorCode::TokenUnknownNode,
            TokenError::WorkflowHashMismatch => ErrorCode::TokenWorkflowHashMismatch,
        };
        ServiceError::new(code, e.to_string())
    }
}

impl From<EventLogError> for ServiceError {
    fn from(e: EventLogError) -> Self {
        match e {
            EventLogError::SessionNotFound { .. } => {
                ServiceError::new(ErrorCode::NotFound, e.to_string())
            }
            EventLogError::Corruption { .. } => {
                ServiceError::new(ErrorCode::StorageCorruptionDetected, e.to_string())
            }
            EventLogError::Io { .. } => ServiceError::storage_io(e.to_string()),
            EventLogError::Canon(_) | EventLogError::WitnessRejected { .. } => {
                ServiceError::internal(e.to_string())
            }
        }
    }
}

impl From<ContentStoreError> for ServiceError {
    fn from(e: ContentStoreError) -> Self {
        match e {
            ContentStoreError::Corruption { .. } => {
                ServiceError::new(ErrorCode::StorageCorruptionDetected, e.to_string())
            }
            ContentStoreError::Io { .. } => ServiceError::storage_io(e.to_string()),
            ContentStoreError::Canon(_) => ServiceError::internal(e.to_string()),
        }
    }
}

impl From<GateError> for ServiceError {
    fn from(e: GateError) -> Self {
        match e {
            GateError::Reentrant { .. } => ServiceError::internal(e.to_string()),
            GateError::Locked { retry_after_ms, .. } => {
                ServiceError::new(ErrorCode::TokenSessionLocked, e.to_string()).with_retry(
                    RetryClass::RetryableAfterMs {
                        after_ms: retry_after_ms,
                    },
                )
            }
            GateError::NotHealthy {
                ref health,
                ref session_id,
            } => {
                let details = serde_json::to_value(health).unwrap_or(Value::Null);
                ServiceError::new(
                    ErrorCode::SessionNotHealthy,
                    format!("session {session_id} is not healthy"),
                )
                .with_details(details)
            }
            GateError::Storage(inner) => inner.into(),
            GateError::Lock(inner) => inner.into(),
        }
    }
}

impl From<LockError> for ServiceError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Busy { retry_after_ms, .. } => {
                ServiceError::new(ErrorCode::TokenSessionLocked, e.to_string()).with_retry(
                    RetryClass::RetryableAfterMs {
                        after_ms: retry_after_ms,
                    },
                )
            }
            LockError::Io { .. } => ServiceError::storage_io(e.to_string()),
        }
    }
}

impl From<WorkflowError> for ServiceError {
    fn from(e: WorkflowError) -> Self {
        ServiceError::new(ErrorCode::ValidationError, e.to_string())
    }
}

impl From<KeyringError> for ServiceError {
    fn from(e: KeyringError) -> Self {
        ServiceError::internal(e.to_string())
    }
}

impl From<crate::canon::CanonError> for ServiceError {
    fn from(e: crate::canon::CanonError) -> Self {
        ServiceError::internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_shapes() {
        let ok = Envelope::from_result(Ok(serde_json::json!({"x": 1})));
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["type"], "success");
        assert_eq!(json["data"]["x"], 1);

        let err: Envelope<Value> = Envelope::from_result(Err(ServiceError::new(
            ErrorCode::TokenBadSignature,
            "nope",
        )));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "TOKEN_BAD_SIGNATURE");
        assert_eq!(json["retry"]["kind"], "not_retryable");
    }

    #[test]
    fn token_errors_are_never_retryable() {
        let e: ServiceError = TokenError::BadSignature.into();
        assert_eq!(e.retry, RetryClass::NotRetryable);
        assert_eq!(e.code, ErrorCode::TokenBadSignature);
    }

    #[test]
    fn lock_busy_maps_to_session_locked_with_hint() {
        let e: ServiceError = GateError::Locked {
            session_id: crate::types::SessionId::parse("s").unwrap(),
            retry_after_ms: 1_000,
        }
        .into();
        assert_eq!(e.code, ErrorCode::TokenSessionLocked);
        assert_eq!(e.retry, RetryClass::RetryableAfterMs { after_ms: 1_000 });
    }
}
