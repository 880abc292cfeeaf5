//! Context validation at the call boundary.
//!
//! The agent-supplied `context` object is checked on every call before it
//! can influence execution: it must be a JSON object, every leaf must be
//! JSON-safe, nesting must stay within the depth budget, and the canonical
//! byte size must fit the context budget. Parsed JSON is acyclic by
//! construction and cannot hold non-finite numbers, so those two legs of
//! the contract hold structurally; depth and size are enforced here.

use serde_json::{Value, json};

use crate::canon::canonical_json_bytes;
use crate::errors::ServiceError;

/// How a context object failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextViolation {
    NotAnObject,
    TooDeep { path: String, max_depth: usize },
    BudgetExceeded { measured_bytes: u64, max_bytes: u64 },
}

impl ContextViolation {
    /// Stable `details.kind` discriminator.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ContextViolation::NotAnObject => "context_not_an_object",
            ContextViolation::TooDeep { .. } => "context_too_deep",
            ContextViolation::BudgetExceeded { .. } => "context_budget_exceeded",
        }
    }

    /// Renders the violation as a `VALIDATION_ERROR`.
    #[must_use]
    pub fn into_service_error(self) -> ServiceError {
        let details = match &self {
            ContextViolation::NotAnObject => json!({"kind": self.kind()}),
            ContextViolation::TooDeep { path, max_depth } => {
                json!({"kind": self.kind(), "path": path, "maxDepth": max_depth})
            }
            ContextViolation::BudgetExceeded {
                measured_bytes,
                max_bytes,
            } => json!({
                "kind": self.kind(),
                "measuredBytes": measured_bytes,
                "maxBytes": max_bytes,
            }),
        };
        ServiceError::validation(
            match &self {
                ContextViolation::NotAnObject => "context must be a JSON object".to_string(),
                ContextViolation::TooDeep { path, max_depth } => {
                    format!("context nests deeper than {max_depth} at {path}")
                }
                ContextViolation::BudgetExceeded {
                    measured_bytes,
                    max_bytes,
                } => format!("context is {measured_bytes} canonical bytes, budget is {max_bytes}"),
            },
            details,
        )
    }
}

/// Validates a context object; returns its measured canonical size.
pub fn validate_context(
    context: &Value,
    max_depth: usize,
    max_bytes: usize,
) -> Result<u64, ContextViolation> {
    if !context.is_object() {
        return Err(ContextViolation::NotAnObject);
    }
    check_depth(context, 1, max_depth, "$")?;

    let bytes = canonical_json_bytes(context).map_err(|_| ContextViolation::NotAnObject)?;
    let measured = bytes.len() as u64;
    if measured > max_bytes as u64 {
        return Err(ContextViolation::BudgetExceeded {
            measured_bytes: measured,
            max_bytes: max_bytes as u64,
        });
    }
    Ok(measured)
}

fn check_depth(
    value: &Value,
    depth: usize,
    max_depth: usize,
    path: &str,
) -> Result<(), ContextViolation> {
    if depth > max_depth {
        return Err(ContextViolation::TooDeep {
            path: path.to_string(),
            max_depth,
        });
    }
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                check_depth(child, depth + 1, max_depth, &format!("{path}.{key}"))?;
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                check_depth(child, depth + 1, max_depth, &format!("{path}[{i}]"))?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Shallow-merges a new context object over the session's current one.
///
/// Top-level keys from `incoming` replace same-named keys in `base`;
/// everything else is preserved.
#[must_use]
pub fn merge_context(base: &Value, incoming: &Value) -> Value {
    match (base, incoming) {
        (Value::Object(base_map), Value::Object(incoming_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in incoming_map {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (_, incoming) => incoming.clone(),
    }
}

/// Context keys a step requires that the merged context lacks.
#[must_use]
pub fn missing_context_keys(context: &Value, required: &[String]) -> Vec<String> {
    let Some(map) = context.as_object() else {
        return required.to_vec();
    };
    required
        .iter()
        .filter(|key| !map.contains_key(*key))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_reasonable_context() {
        let ctx = json!({"ticket": "T-100", "env": {"name": "staging"}});
        let measured = validate_context(&ctx, 10, 32 * 1024).unwrap();
        assert!(measured > 0);
    }

    #[test]
    fn rejects_non_objects() {
        assert_eq!(
            validate_context(&json!([1, 2]), 10, 1024),
            Err(ContextViolation::NotAnObject)
        );
    }

    #[test]
    fn rejects_over_budget_with_measurements() {
        let ctx = json!({"blob": "x".repeat(100_000)});
        match validate_context(&ctx, 10, 32 * 1024) {
            Err(ContextViolation::BudgetExceeded {
                measured_bytes,
                max_bytes,
            }) => {
                assert!(measured_bytes > max_bytes);
                assert_eq!(max_bytes, 32 * 1024);
            }
            other => panic!("expected budget violation, got {other:?}"),
        }
    }

    #[test]
    fn rejects_excessive_depth_with_path() {
        let mut ctx = json!("leaf");
        for _ in 0..12 {
            ctx = json!({"inner": ctx});
        }
        match validate_context(&ctx, 10, 1024 * 1024) {
            Err(ContextViolation::TooDeep { path, .. }) => {
                assert!(path.starts_with("$.inner"));
            }
            other => panic!("expected depth violation, got {other:?}"),
        }
    }

    #[test]
    fn merge_replaces_top_level_keys() {
        let merged = merge_context(&json!({"a": 1, "b": 2}), &json!({"b": 3, "c": 4}));
        assert_eq!(merged, json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn missing_keys_are_reported() {
        let missing = missing_context_keys(
            &json!({"have": 1}),
            &["have".to_string(), "need".to_string()],
        );
        assert_eq!(missing, vec!["need".to_string()]);
    }
}
