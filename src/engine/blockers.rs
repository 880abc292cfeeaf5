//! Blocker detection: mapping execution deficits to a closed code set.
//!
//! A blocker is not an error. It is a successful response telling the agent
//! exactly which obligation its submission failed to meet and, where
//! possible, how to fix it. Codes and pointer kinds are closed sets; the
//! blocker list is capped at [`MAX_BLOCKERS`] and deterministically sorted
//! so identical deficits always render identically.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::DelimiterSafeId;
use crate::workflow::{OutputContract, WorkflowStep};

/// Maximum blockers surfaced per response.
pub const MAX_BLOCKERS: usize = 10;

/// Maximum UTF-8 bytes of a blocker message.
pub const MAX_MESSAGE_BYTES: usize = 512;

/// Maximum UTF-8 bytes of a suggested fix.
pub const MAX_FIX_BYTES: usize = 1024;

/// The closed blocker code set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockerCode {
    UserOnlyDependency,
    MissingRequiredOutput,
    InvalidRequiredOutput,
    MissingRequiredNotes,
    MissingContextKey,
    ContextBudgetExceeded,
    RequiredCapabilityUnknown,
    RequiredCapabilityUnavailable,
    InvariantViolation,
    StorageCorruptionDetected,
}

/// Broad family a blocker code belongs to; drives guardrail downgrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerCategory {
    Contract,
    UserOnly,
    Context,
    Capability,
    Invariant,
    Corruption,
}

impl BlockerCode {
    /// Stable string form used in sort keys.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BlockerCode::UserOnlyDependency => "USER_ONLY_DEPENDENCY",
            BlockerCode::MissingRequiredOutput => "MISSING_REQUIRED_OUTPUT",
            BlockerCode::InvalidRequiredOutput => "INVALID_REQUIRED_OUTPUT",
            BlockerCode::MissingRequiredNotes => "MISSING_REQUIRED_NOTES",
            BlockerCode::MissingContextKey => "MISSING_CONTEXT_KEY",
            BlockerCode::ContextBudgetExceeded => "CONTEXT_BUDGET_EXCEEDED",
            BlockerCode::RequiredCapabilityUnknown => "REQUIRED_CAPABILITY_UNKNOWN",
            BlockerCode::RequiredCapabilityUnavailable => "REQUIRED_CAPABILITY_UNAVAILABLE",
            BlockerCode::InvariantViolation => "INVARIANT_VIOLATION",
            BlockerCode::StorageCorruptionDetected => "STORAGE_CORRUPTION_DETECTED",
        }
    }

    /// The guardrail category of this code.
    #[must_use]
    pub fn category(self) -> BlockerCategory {
        match self {
            BlockerCode::UserOnlyDependency => BlockerCategory::UserOnly,
            BlockerCode::MissingRequiredOutput
            | BlockerCode::InvalidRequiredOutput
            | BlockerCode::MissingRequiredNotes => BlockerCategory::Contract,
            BlockerCode::MissingContextKey | BlockerCode::ContextBudgetExceeded => {
                BlockerCategory::Context
            }
            BlockerCode::RequiredCapabilityUnknown
            | BlockerCode::RequiredCapabilityUnavailable => BlockerCategory::Capability,
            BlockerCode::InvariantViolation => BlockerCategory::Invariant,
            BlockerCode::StorageCorruptionDetected => BlockerCategory::Corruption,
        }
    }
}

/// Typed location a blocker points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockerPointer {
    #[serde(rename_all = "camelCase")]
    ContextKey { key: String },
    #[serde(rename_all = "camelCase")]
    OutputContract { contract: String },
    #[serde(rename_all = "camelCase")]
    WorkflowStep { step_id: DelimiterSafeId },
    #[serde(rename_all = "camelCase")]
    Capability { capability: String },
    #[serde(rename_all = "camelCase")]
    ContextBudget { measured_bytes: u64, max_bytes: u64 },
}

impl BlockerPointer {
    /// Stable kind discriminator used in sort keys.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            BlockerPointer::ContextKey { .. } => "context_key",
            BlockerPointer::OutputContract { .. } => "output_contract",
            BlockerPointer::WorkflowStep { .. } => "workflow_step",
            BlockerPointer::Capability { .. } => "capability",
            BlockerPointer::ContextBudget { .. } => "context_budget",
        }
    }

    /// Stable payload form used in sort keys.
    #[must_use]
    pub fn sort_payload(&self) -> String {
        match self {
            BlockerPointer::ContextKey { key } => key.clone(),
            BlockerPointer::OutputContract { contract } => contract.clone(),
            BlockerPointer::WorkflowStep { step_id } => step_id.to_string(),
            BlockerPointer::Capability { capability } => capability.clone(),
            BlockerPointer::ContextBudget {
                measured_bytes,
                max_bytes,
            } => format!("{measured_bytes}:{max_bytes}"),
        }
    }
}

/// Whether a block can be retried by the same agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// The agent can fix its submission and retry.
    RetryableBlock,
    /// The run cannot proceed without outside intervention.
    TerminalBlock,
}

/// One detected blocker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blocker {
    pub code: BlockerCode,
    pub pointer: BlockerPointer,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
}

impl Blocker {
    /// Builds a blocker, clamping message and fix to their byte budgets on
    /// UTF-8 boundaries.
    #[must_use]
    pub fn new(code: BlockerCode, pointer: BlockerPointer, message: &str) -> Self {
        Self {
            code,
            pointer,
            message: clamp_utf8(message, MAX_MESSAGE_BYTES),
            suggested_fix: None,
        }
    }

    /// Attaches a suggested fix.
    #[must_use]
    pub fn with_fix(mut self, fix: &str) -> Self {
        self.suggested_fix = Some(clamp_utf8(fix, MAX_FIX_BYTES));
        self
    }
}

fn clamp_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Sorts blockers by `(code, pointer kind, pointer payload)` and caps the
/// list at [`MAX_BLOCKERS`].
#[must_use]
pub fn normalize_blockers(mut blockers: Vec<Blocker>) -> Vec<Blocker> {
    blockers.sort_by(|a, b| {
        (a.code.as_str(), a.pointer.kind(), a.pointer.sort_payload()).cmp(&(
            b.code.as_str(),
            b.pointer.kind(),
            b.pointer.sort_payload(),
        ))
    });
    blockers.truncate(MAX_BLOCKERS);
    blockers
}

/// Availability the agent declared for a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityStatus {
    Available,
    Unavailable,
}

/// Everything blocker detection looks at for one submission.
#[derive(Debug, Clone, Default)]
pub struct DetectionInputs {
    /// Markdown notes supplied by the agent, empty string meaning none.
    pub notes_markdown: Option<String>,
    /// Structured output supplied by the agent.
    pub structured_output: Option<Value>,
    /// Whether the user confirmed a confirmation-requiring step.
    pub user_confirmed: bool,
    /// Context keys the step requires that are absent.
    pub missing_context_keys: Vec<String>,
    /// `(measured, max)` when the context budget was exceeded.
    pub context_budget_exceeded: Option<(u64, u64)>,
    /// Capability statuses the agent declared.
    pub capabilities: rustc_hash::FxHashMap<String, CapabilityStatus>,
    /// User confirmation is enforced (guided autonomy).
    pub confirmation_enforced: bool,
}

/// Detects blockers for one submission against one step.
///
/// Output is already normalized (sorted, capped). Guardrail downgrades are
/// applied afterwards by [`crate::engine::guardrails::apply_guardrails`].
#[must_use]
pub fn detect_blockers(step: &WorkflowStep, inputs: &DetectionInputs) -> Vec<Blocker> {
    let mut found = Vec::new();

    if step.require_confirmation && inputs.confirmation_enforced && !inputs.user_confirmed {
        found.push(
            Blocker::new(
                BlockerCode::UserOnlyDependency,
                BlockerPointer::WorkflowStep {
                    step_id: step.id.clone(),
                },
                &format!("step {} requires explicit user confirmation", step.id),
            )
            .with_fix("Ask the user to confirm, then resubmit with userConfirmed set."),
        );
    }

    if step.notes_required() {
        let has_notes = inputs
            .notes_markdown
            .as_deref()
            .is_some_and(|n| !n.trim().is_empty());
        if !has_notes {
            found.push(
                Blocker::new(
                    BlockerCode::MissingRequiredNotes,
                    BlockerPointer::WorkflowStep {
                        step_id: step.id.clone(),
                    },
                    &format!("step {} requires markdown notes describing what was done", step.id),
                )
                .with_fix("Resubmit with a non-empty notesMarkdown recap."),
            );
        }
    }

    if let Some(contract) = step.output_contract {
        match &inputs.structured_output {
            None => {
                found.push(
                    Blocker::new(
                        BlockerCode::MissingRequiredOutput,
                        BlockerPointer::OutputContract {
                            contract: contract_name(contract).to_string(),
                        },
                        &format!("step {} requires structured output", step.id),
                    )
                    .with_fix("Supply the contract's JSON object in the output field."),
                );
            }
            Some(value) => {
                if let Err(reason) = check_contract(contract, value) {
                    found.push(
                        Blocker::new(
                            BlockerCode::InvalidRequiredOutput,
                            BlockerPointer::OutputContract {
                                contract: contract_name(contract).to_string(),
                            },
                            &format!("structured output for step {} is invalid: {reason}", step.id),
                        )
                        .with_fix("Correct the output shape and resubmit."),
                    );
                }
            }
        }
    }

    for key in &inputs.missing_context_keys {
        found.push(
            Blocker::new(
                BlockerCode::MissingContextKey,
                BlockerPointer::ContextKey { key: key.clone() },
                &format!("required context key {key:?} is absent"),
            )
            .with_fix("Include the key in the context object."),
        );
    }

    if let Some((measured, max)) = inputs.context_budget_exceeded {
        found.push(Blocker::new(
            BlockerCode::ContextBudgetExceeded,
            BlockerPointer::ContextBudget {
                measured_bytes: measured,
                max_bytes: max,
            },
            &format!("context is {measured} canonical bytes, budget is {max}"),
        ));
    }

    for capability in &step.required_capabilities {
        match inputs.capabilities.get(capability) {
            Some(CapabilityStatus::Available) => {}
            Some(CapabilityStatus::Unavailable) => {
                found.push(Blocker::new(
                    BlockerCode::RequiredCapabilityUnavailable,
                    BlockerPointer::Capability {
                        capability: capability.clone(),
                    },
                    &format!("required capability {capability:?} is unavailable"),
                ));
            }
            None => {
                found.push(Blocker::new(
                    BlockerCode::RequiredCapabilityUnknown,
                    BlockerPointer::Capability {
                        capability: capability.clone(),
                    },
                    &format!("required capability {capability:?} was not declared"),
                ));
            }
        }
    }

    normalize_blockers(found)
}

fn contract_name(contract: OutputContract) -> &'static str {
    match contract {
        OutputContract::LoopControl => "loop_control",
    }
}

/// Validates structured output against a contract shape.
fn check_contract(contract: OutputContract, value: &Value) -> Result<(), String> {
    match contract {
        OutputContract::LoopControl => match value.get("action").and_then(Value::as_str) {
            Some("continue") | Some("break") => Ok(()),
            Some(other) => Err(format!("action must be \"continue\" or \"break\", got {other:?}")),
            None => Err("object must carry a string \"action\" field".to_string()),
        },
    }
}

/// Reads the loop-control decision from validated structured output.
#[must_use]
pub fn loop_control_breaks(value: &Value) -> bool {
    value.get("action").and_then(Value::as_str) == Some("break")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowStep;

    fn step() -> WorkflowStep {
        WorkflowStep::new("collect", "Collect", "Collect inputs.").unwrap()
    }

    #[test]
    fn missing_notes_is_detected() {
        let blockers = detect_blockers(&step(), &DetectionInputs::default());
        assert_eq!(blockers.len(), 1);
        assert_eq!(blockers[0].code, BlockerCode::MissingRequiredNotes);
    }

    #[test]
    fn whitespace_notes_count_as_missing() {
        let inputs = DetectionInputs {
            notes_markdown: Some("   \n".to_string()),
            ..DetectionInputs::default()
        };
        let blockers = detect_blockers(&step(), &inputs);
        assert_eq!(blockers[0].code, BlockerCode::MissingRequiredNotes);
    }

    #[test]
    fn contract_steps_do_not_require_notes() {
        let step = step().with_output_contract(OutputContract::LoopControl);
        let inputs = DetectionInputs {
            structured_output: Some(serde_json::json!({"action": "break"})),
            ..DetectionInputs::default()
        };
        assert!(detect_blockers(&step, &inputs).is_empty());
    }

    #[test]
    fn invalid_loop_control_is_detected() {
        let step = step().with_output_contract(OutputContract::LoopControl);
        let inputs = DetectionInputs {
            structured_output: Some(serde_json::json!({"action": "maybe"})),
            ..DetectionInputs::default()
        };
        let blockers = detect_blockers(&step, &inputs);
        assert_eq!(blockers[0].code, BlockerCode::InvalidRequiredOutput);
    }

    #[test]
    fn blockers_are_sorted_and_capped() {
        let mut step = step().with_optional_notes();
        for i in 0..15 {
            step.required_context.push(format!("key_{i:02}"));
        }
        let inputs = DetectionInputs {
            missing_context_keys: step.required_context.clone(),
            ..DetectionInputs::default()
        };
        let blockers = detect_blockers(&step, &inputs);
        assert_eq!(blockers.len(), MAX_BLOCKERS);
        let mut sorted = blockers.clone();
        sorted = normalize_blockers(sorted);
        assert_eq!(blockers, sorted);
    }

    #[test]
    fn message_is_clamped_to_byte_budget() {
        let long = "é".repeat(600);
        let b = Blocker::new(
            BlockerCode::MissingContextKey,
            BlockerPointer::ContextKey { key: "k".into() },
            &long,
        );
        assert!(b.message.len() <= MAX_MESSAGE_BYTES);
        assert!(b.message.is_char_boundary(b.message.len()));
    }
}
