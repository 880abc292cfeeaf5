//! Guardrails: the risk-policy downgrade table.
//!
//! Some blockers are negotiable. A capability the agent did not declare may
//! be a tooling gap rather than a real deficit, so permissive risk policies
//! downgrade those blockers to warnings instead of stopping the run.
//! Contract, user-only, invariant, context, and corruption blockers are
//! never downgradable under any policy.

use crate::engine::blockers::{Blocker, BlockerCategory, BlockerCode};
use crate::events::RiskPolicy;

/// What the guardrail table decided for one blocker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardrailDecision {
    Block,
    DowngradeToWarning,
}

/// The `(risk policy, category)` decision table.
#[must_use]
pub fn decide(policy: RiskPolicy, code: BlockerCode) -> GuardrailDecision {
    match code.category() {
        BlockerCategory::Contract
        | BlockerCategory::UserOnly
        | BlockerCategory::Context
        | BlockerCategory::Invariant
        | BlockerCategory::Corruption => GuardrailDecision::Block,
        BlockerCategory::Capability => match (policy, code) {
            (RiskPolicy::Conservative, _) => GuardrailDecision::Block,
            (RiskPolicy::Balanced, BlockerCode::RequiredCapabilityUnknown) => {
                GuardrailDecision::DowngradeToWarning
            }
            (RiskPolicy::Balanced, _) => GuardrailDecision::Block,
            (RiskPolicy::Aggressive, _) => GuardrailDecision::DowngradeToWarning,
        },
    }
}

/// Split of a detection result after guardrails ran.
#[derive(Debug, Clone, Default)]
pub struct GuardrailOutcome {
    /// Blockers that stop the advance.
    pub blocking: Vec<Blocker>,
    /// Downgraded blockers surfaced as warnings.
    pub warnings: Vec<Blocker>,
}

/// Applies the decision table to a normalized blocker list.
#[must_use]
pub fn apply_guardrails(policy: RiskPolicy, blockers: Vec<Blocker>) -> GuardrailOutcome {
    let mut outcome = GuardrailOutcome::default();
    for blocker in blockers {
        match decide(policy, blocker.code) {
            GuardrailDecision::Block => outcome.blocking.push(blocker),
            GuardrailDecision::DowngradeToWarning => outcome.warnings.push(blocker),
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::blockers::BlockerPointer;

    fn capability_blocker(code: BlockerCode) -> Blocker {
        Blocker::new(
            code,
            BlockerPointer::Capability {
                capability: "shell".into(),
            },
            "capability deficit",
        )
    }

    #[test]
    fn conservative_blocks_all_capability_deficits() {
        for code in [
            BlockerCode::RequiredCapabilityUnknown,
            BlockerCode::RequiredCapabilityUnavailable,
        ] {
            assert_eq!(
                decide(RiskPolicy::Conservative, code),
                GuardrailDecision::Block
            );
        }
    }

    #[test]
    fn balanced_downgrades_unknown_only() {
        assert_eq!(
            decide(RiskPolicy::Balanced, BlockerCode::RequiredCapabilityUnknown),
            GuardrailDecision::DowngradeToWarning
        );
        assert_eq!(
            decide(
                RiskPolicy::Balanced,
                BlockerCode::RequiredCapabilityUnavailable
            ),
            GuardrailDecision::Block
        );
    }

    #[test]
    fn aggressive_downgrades_both() {
        for code in [
            BlockerCode::RequiredCapabilityUnknown,
            BlockerCode::RequiredCapabilityUnavailable,
        ] {
            assert_eq!(
                decide(RiskPolicy::Aggressive, code),
                GuardrailDecision::DowngradeToWarning
            );
        }
    }

    #[test]
    fn contract_blockers_never_downgrade() {
        for policy in [
            RiskPolicy::Conservative,
            RiskPolicy::Balanced,
            RiskPolicy::Aggressive,
        ] {
            assert_eq!(
                decide(policy, BlockerCode::MissingRequiredNotes),
                GuardrailDecision::Block
            );
            assert_eq!(
                decide(policy, BlockerCode::StorageCorruptionDetected),
                GuardrailDecision::Block
            );
        }
    }

    #[test]
    fn apply_splits_blocking_and_warnings() {
        let outcome = apply_guardrails(
            RiskPolicy::Aggressive,
            vec![
                capability_blocker(BlockerCode::RequiredCapabilityUnknown),
                Blocker::new(
                    BlockerCode::MissingRequiredNotes,
                    BlockerPointer::WorkflowStep {
                        step_id: crate::types::DelimiterSafeId::parse("s").unwrap(),
                    },
                    "notes missing",
                ),
            ],
        );
        assert_eq!(outcome.blocking.len(), 1);
        assert_eq!(outcome.warnings.len(), 1);
    }
}
