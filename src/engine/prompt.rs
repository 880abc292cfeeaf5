//! Prompt rendering: the text the agent receives for its next step.
//!
//! The base is always the authored step prompt, followed by a loop banner
//! when the step re-enters a loop body, the step's validation requirements,
//! output-contract requirements, and the notes requirement. On rehydration
//! a recovery appendix is added so an agent that lost its conversation can
//! re-orient: the ancestry recap, the downstream branch recap when the
//! preferred tip has moved past this node, and a sibling-branch summary for
//! non-tip nodes.
//!
//! The rendered text never exceeds the recovery budget; truncation lands on
//! a UTF-8 boundary and appends a `[TRUNCATED]` marker.

use rustc_hash::FxHashMap;

use crate::engine::snapshot::PendingStep;
use crate::projections::{NodeOutputs, RunDag};
use crate::types::NodeId;
use crate::workflow::{OutputContract, WorkflowDefinition};

/// Marker appended when the budget forces truncation.
pub const TRUNCATION_MARKER: &str = "\n[TRUNCATED]";

/// The rendered next-step text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub step_id: String,
    pub title: String,
    pub prompt: String,
}

/// Inputs for the rehydration recovery appendix.
pub struct RecoveryInputs<'a> {
    pub dag: &'a RunDag,
    pub outputs: &'a FxHashMap<NodeId, NodeOutputs>,
    pub node_id: &'a NodeId,
}

/// Renders the prompt for a pending step without recovery context.
#[must_use]
pub fn render_step_prompt(
    workflow: &WorkflowDefinition,
    pending: &PendingStep,
    budget_bytes: usize,
) -> RenderedPrompt {
    render(workflow, pending, None, budget_bytes)
}

/// Renders the prompt for a pending step with the recovery appendix.
#[must_use]
pub fn render_rehydrate_prompt(
    workflow: &WorkflowDefinition,
    pending: &PendingStep,
    recovery: RecoveryInputs<'_>,
    budget_bytes: usize,
) -> RenderedPrompt {
    render(workflow, pending, Some(recovery), budget_bytes)
}

fn render(
    workflow: &WorkflowDefinition,
    pending: &PendingStep,
    recovery: Option<RecoveryInputs<'_>>,
    budget_bytes: usize,
) -> RenderedPrompt {
    let step = workflow
        .step(&pending.step_id)
        .expect("pending steps come from the same pinned workflow");

    let mut text = String::new();
    text.push_str(&step.prompt);

    if let Some(entry) = pending.loop_path.last() {
        text.push_str(&format!(
            "\n\nYou are inside loop {:?}, iteration {}. Re-entering this step is intentional.",
            entry.loop_id.as_str(),
            entry.iteration
        ));
    }

    if !step.validation_criteria.is_empty() {
        text.push_str("\n\nValidation requirements:");
        for criterion in &step.validation_criteria {
            text.push_str(&format!("\n- {criterion}"));
        }
    }

    if let Some(contract) = step.output_contract {
        text.push_str("\n\nOutput contract: ");
        text.push_str(contract_requirements(contract));
    }

    if step.notes_required() {
        text.push_str(
            "\n\nWhen done, submit markdown notes recapping what you did and what you found.",
        );
    }

    if let Some(recovery) = recovery {
        render_recovery(&mut text, workflow, &recovery);
    }

    RenderedPrompt {
        step_id: step.id.to_string(),
        title: step.title.clone(),
        prompt: truncate_to_budget(text, budget_bytes),
    }
}

fn contract_requirements(contract: OutputContract) -> &'static str {
    match contract {
        OutputContract::LoopControl => {
            "submit a JSON object {\"action\": \"continue\"} to run the loop again \
             or {\"action\": \"break\"} to leave it."
        }
    }
}

fn render_recovery(text: &mut String, workflow: &WorkflowDefinition, recovery: &RecoveryInputs<'_>) {
    let RecoveryInputs {
        dag,
        outputs,
        node_id,
    } = recovery;

    let recap_of = |id: &NodeId| -> Option<String> {
        outputs
            .get(id)
            .and_then(NodeOutputs::recap)
            .map(str::to_string)
    };

    let step_title = |step: &Option<crate::types::DelimiterSafeId>| -> String {
        step.as_ref()
            .and_then(|id| workflow.step(id))
            .map(|s| s.title.clone())
            .unwrap_or_else(|| "(unknown step)".to_string())
    };

    let ancestry = dag.step_ancestry(node_id);
    if !ancestry.is_empty() {
        text.push_str("\n\n--- Recovery context ---\nWhat happened before this step:");
        for ancestor in &ancestry {
            let title = step_title(&ancestor.step_id);
            match recap_of(&ancestor.node_id) {
                Some(recap) => text.push_str(&format!("\n- {title}: {recap}")),
                None => text.push_str(&format!("\n- {title}: (no recap recorded)")),
            }
        }
    }

    // The preferred tip moving past this node means a newer branch already
    // continued the run; surface it so the agent does not silently fork.
    if let Some(tip) = &dag.preferred_tip
        && tip != *node_id
    {
        let downstream = dag.downstream_steps(node_id);
        if !downstream.is_empty() {
            text.push_str("\n\nThe run has already continued past this step:");
            for node in downstream.iter().take(3) {
                let title = step_title(&node.step_id);
                match recap_of(&node.node_id) {
                    Some(recap) => text.push_str(&format!("\n- {title}: {recap}")),
                    None => text.push_str(&format!("\n- {title}")),
                }
            }
        }
        let siblings = dag.sibling_branches(node_id);
        if !siblings.is_empty() {
            text.push_str("\n\nSibling branches off this step's parent:");
            for sibling in siblings.iter().take(3) {
                text.push_str(&format!(
                    "\n- node {} ({:?})",
                    sibling.node_id, sibling.node_kind
                ));
            }
        }
    }
}

/// Clamps text to the byte budget on a UTF-8 boundary, marking truncation.
#[must_use]
pub fn truncate_to_budget(text: String, budget_bytes: usize) -> String {
    if text.len() <= budget_bytes {
        return text;
    }
    let keep = budget_bytes.saturating_sub(TRUNCATION_MARKER.len());
    let mut end = keep;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = text[..end].to_string();
    out.push_str(TRUNCATION_MARKER);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::snapshot::LoopPathEntry;
    use crate::types::DelimiterSafeId;
    use crate::workflow::{WorkflowBuilder, WorkflowStep};

    fn workflow() -> WorkflowDefinition {
        WorkflowBuilder::new("w", "W")
            .push_step(
                WorkflowStep::new("gather", "Gather", "Gather the inputs.")
                    .unwrap()
                    .with_criterion("All inputs listed"),
            )
            .step("finish", "Finish", "Wrap up.")
            .compile()
            .unwrap()
    }

    fn pending(step: &str) -> PendingStep {
        PendingStep {
            step_id: DelimiterSafeId::parse(step).unwrap(),
            loop_path: Vec::new(),
        }
    }

    #[test]
    fn renders_base_validation_and_notes_sections() {
        let rendered = render_step_prompt(&workflow(), &pending("gather"), 32 * 1024);
        assert_eq!(rendered.step_id, "gather");
        assert!(rendered.prompt.contains("Gather the inputs."));
        assert!(rendered.prompt.contains("Validation requirements:"));
        assert!(rendered.prompt.contains("All inputs listed"));
        assert!(rendered.prompt.contains("markdown notes"));
    }

    #[test]
    fn loop_banner_appears_inside_loops() {
        let mut p = pending("gather");
        p.loop_path.push(LoopPathEntry {
            loop_id: DelimiterSafeId::parse("retry").unwrap(),
            iteration: 2,
        });
        let rendered = render_step_prompt(&workflow(), &p, 32 * 1024);
        assert!(rendered.prompt.contains("iteration 2"));
        assert!(rendered.prompt.contains("intentional"));
    }

    #[test]
    fn truncation_lands_on_char_boundary_with_marker() {
        let text = "é".repeat(1000);
        let truncated = truncate_to_budget(text, 101);
        assert!(truncated.len() <= 101);
        assert!(truncated.ends_with(TRUNCATION_MARKER));
        assert!(truncated.is_char_boundary(truncated.len() - TRUNCATION_MARKER.len()));
    }
}
