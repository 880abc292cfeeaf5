//! Workflow definitions, the validating builder, and pinned snapshots.
//!
//! A workflow is an ordered list of steps with optional validation
//! criteria, output contracts, and loop metadata. Definitions are compiled
//! through [`WorkflowBuilder`], which rejects structurally unsound inputs
//! before anything touches storage.
//!
//! Two snapshot forms exist: a **preview** (metadata plus the first step,
//! read-only) and a **pinned** snapshot (the full definition). The pinned
//! form is content-addressed, `workflow_hash =
//! sha256(canonical_json(pinned_snapshot))`, and immutable for the life of
//! any run referencing it.
//!
//! # Examples
//!
//! ```rust
//! use loomrail::workflow::WorkflowBuilder;
//!
//! let workflow = WorkflowBuilder::new("release", "Cut a release")
//!     .description("Tag, build, and publish")
//!     .step("tag", "Tag the commit", "Create the release tag.")
//!     .step("publish", "Publish", "Push the artifacts.")
//!     .compile()
//!     .unwrap();
//!
//! let hash = workflow.workflow_hash().unwrap();
//! assert!(hash.as_str().starts_with("sha256:"));
//! ```

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::canon::CanonError;
use crate::digest::canonical_digest;
use crate::types::{DelimiterSafeId, IdError, WorkflowHash};

/// Errors from workflow compilation.
#[derive(Debug, Error, Diagnostic)]
pub enum WorkflowError {
    /// A workflow must contain at least one step.
    #[error("workflow {workflow_id} has no steps")]
    #[diagnostic(code(loomrail::workflow::empty))]
    Empty { workflow_id: String },

    /// Step ids must be unique within a workflow.
    #[error("duplicate step id {step_id} in workflow {workflow_id}")]
    #[diagnostic(code(loomrail::workflow::duplicate_step))]
    DuplicateStep {
        workflow_id: String,
        step_id: String,
    },

    /// An id failed the delimiter-safe discipline.
    #[error(transparent)]
    #[diagnostic(code(loomrail::workflow::bad_id))]
    BadId(#[from] IdError),

    /// Steps sharing a loop id must be contiguous.
    #[error("loop {loop_id} body is not contiguous in workflow {workflow_id}")]
    #[diagnostic(
        code(loomrail::workflow::loop_not_contiguous),
        help("All steps of one loop body must be adjacent in the step list.")
    )]
    LoopNotContiguous {
        workflow_id: String,
        loop_id: String,
    },

    /// The last step of a loop body must carry the loop-control contract.
    #[error("loop {loop_id} in workflow {workflow_id} has no loop-control step")]
    #[diagnostic(
        code(loomrail::workflow::loop_missing_control),
        help("The final step of a loop body decides continue vs break via the loop_control contract.")
    )]
    LoopMissingControl {
        workflow_id: String,
        loop_id: String,
    },

    /// The loop-control contract is only valid on the last step of a loop body.
    #[error("step {step_id} carries loop_control outside a loop tail in workflow {workflow_id}")]
    #[diagnostic(code(loomrail::workflow::misplaced_loop_control))]
    MisplacedLoopControl {
        workflow_id: String,
        step_id: String,
    },

    /// Snapshot serialization failed.
    #[error(transparent)]
    #[diagnostic(code(loomrail::workflow::canon))]
    Canon(#[from] CanonError),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Reference to a structured-output contract a step's submission must meet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputContract {
    /// The submission must be `{"action": "continue" | "break"}`, steering
    /// loop re-entry.
    LoopControl,
}

/// Loop membership of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopMeta {
    /// Identifies the loop; contiguous steps sharing it form the body.
    pub loop_id: DelimiterSafeId,
    /// Upper bound on iterations; the engine breaks the loop when reached.
    pub max_iterations: u32,
}

/// One authored step of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: DelimiterSafeId,
    pub title: String,
    pub prompt: String,
    /// Criteria the agent's submission is validated against.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_criteria: Vec<String>,
    /// Structured-output contract, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_contract: Option<OutputContract>,
    /// Step needs explicit user confirmation before the agent proceeds.
    #[serde(default)]
    pub require_confirmation: bool,
    /// Step opts out of the default notes requirement.
    #[serde(default)]
    pub notes_optional: bool,
    /// Context keys that must be present when this step is submitted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_context: Vec<String>,
    /// Capabilities the agent must have declared available.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_capabilities: Vec<String>,
    /// Loop membership, if the step is part of a loop body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_meta: Option<LoopMeta>,
}

impl WorkflowStep {
    /// Creates a bare step; refine with the `with_*` methods.
    pub fn new(id: &str, title: &str, prompt: &str) -> Result<Self> {
        Ok(Self {
            id: DelimiterSafeId::parse(id)?,
            title: title.to_string(),
            prompt: prompt.to_string(),
            validation_criteria: Vec::new(),
            output_contract: None,
            require_confirmation: false,
            notes_optional: false,
            required_context: Vec::new(),
            required_capabilities: Vec::new(),
            loop_meta: None,
        })
    }

    /// Adds a validation criterion.
    #[must_use]
    pub fn with_criterion(mut self, criterion: &str) -> Self {
        self.validation_criteria.push(criterion.to_string());
        self
    }

    /// Attaches an output contract.
    #[must_use]
    pub fn with_output_contract(mut self, contract: OutputContract) -> Self {
        self.output_contract = Some(contract);
        self
    }

    /// Marks notes as optional for this step.
    #[must_use]
    pub fn with_optional_notes(mut self) -> Self {
        self.notes_optional = true;
        self
    }

    /// Requires a context key at submission time.
    #[must_use]
    pub fn with_required_context(mut self, key: &str) -> Self {
        self.required_context.push(key.to_string());
        self
    }

    /// Requires a declared-available capability at submission time.
    #[must_use]
    pub fn with_required_capability(mut self, capability: &str) -> Self {
        self.required_capabilities.push(capability.to_string());
        self
    }

    /// Requires explicit user confirmation before the step is accepted.
    #[must_use]
    pub fn with_confirmation(mut self) -> Self {
        self.require_confirmation = true;
        self
    }

    /// Places the step inside a loop body.
    pub fn with_loop(mut self, loop_id: &str, max_iterations: u32) -> Result<Self> {
        self.loop_meta = Some(LoopMeta {
            loop_id: DelimiterSafeId::parse(loop_id)?,
            max_iterations,
        });
        Ok(self)
    }

    /// Whether the agent must submit markdown notes for this step.
    #[must_use]
    pub fn notes_required(&self) -> bool {
        !self.notes_optional && self.output_contract.is_none()
    }
}

/// A compiled, validated workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: DelimiterSafeId,
    pub name: String,
    pub description: String,
    pub version: String,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    /// Looks up a step by id.
    #[must_use]
    pub fn step(&self, id: &DelimiterSafeId) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| &s.id == id)
    }

    /// Index of a step in authoring order.
    #[must_use]
    pub fn step_index(&self, id: &DelimiterSafeId) -> Option<usize> {
        self.steps.iter().position(|s| &s.id == id)
    }

    /// Steps belonging to the given loop body, in order.
    #[must_use]
    pub fn loop_body(&self, loop_id: &DelimiterSafeId) -> Vec<&WorkflowStep> {
        self.steps
            .iter()
            .filter(|s| s.loop_meta.as_ref().is_some_and(|m| &m.loop_id == loop_id))
            .collect()
    }

    /// The full, executable snapshot form.
    #[must_use]
    pub fn pinned_snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot::V1Pinned {
            definition: self.clone(),
        }
    }

    /// The read-only preview form: metadata plus the first step.
    #[must_use]
    pub fn preview_snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot::V1Preview {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            version: self.version.clone(),
            first_step: self.steps.first().cloned(),
        }
    }

    /// Content address of the pinned snapshot.
    pub fn workflow_hash(&self) -> Result<WorkflowHash> {
        let (_, digest) = canonical_digest(&self.pinned_snapshot())?;
        Ok(WorkflowHash::from_digest(&digest))
    }
}

/// The two persistable snapshot forms of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowSnapshot {
    /// Metadata plus first step; cannot be executed.
    #[serde(rename_all = "camelCase")]
    V1Preview {
        id: DelimiterSafeId,
        name: String,
        description: String,
        version: String,
        first_step: Option<WorkflowStep>,
    },
    /// The full definition; the executable, content-addressed form.
    #[serde(rename_all = "camelCase")]
    V1Pinned { definition: WorkflowDefinition },
}

impl WorkflowSnapshot {
    /// The definition, if this snapshot is executable.
    #[must_use]
    pub fn definition(&self) -> Option<&WorkflowDefinition> {
        match self {
            WorkflowSnapshot::V1Pinned { definition } => Some(definition),
            WorkflowSnapshot::V1Preview { .. } => None,
        }
    }
}

/// Fluent builder for workflow definitions.
///
/// Mirrors the compile-time validation split: construction is infallible,
/// [`compile`](Self::compile) performs every structural check.
#[derive(Debug)]
pub struct WorkflowBuilder {
    id: String,
    name: String,
    description: String,
    version: String,
    steps: Vec<WorkflowStep>,
    deferred: Option<WorkflowError>,
}

impl WorkflowBuilder {
    /// Starts a builder for the given workflow id and display name.
    #[must_use]
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            version: "1.0.0".to_string(),
            steps: Vec::new(),
            deferred: None,
        }
    }

    /// Sets the workflow description.
    #[must_use]
    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Sets the workflow version string.
    #[must_use]
    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    /// Appends a plain step.
    #[must_use]
    pub fn step(mut self, id: &str, title: &str, prompt: &str) -> Self {
        match WorkflowStep::new(id, title, prompt) {
            Ok(step) => self.steps.push(step),
            Err(e) => self.deferred = self.deferred.or(Some(e)),
        }
        self
    }

    /// Appends a fully configured step.
    #[must_use]
    pub fn push_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Validates and produces the compiled definition.
    pub fn compile(self) -> Result<WorkflowDefinition> {
        if let Some(e) = self.deferred {
            return Err(e);
        }
        let workflow_id = DelimiterSafeId::parse(&self.id)?;
        if self.steps.is_empty() {
            return Err(WorkflowError::Empty {
                workflow_id: self.id,
            });
        }

        let mut seen = rustc_hash::FxHashSet::default();
        for step in &self.steps {
            if !seen.insert(step.id.clone()) {
                return Err(WorkflowError::DuplicateStep {
                    workflow_id: self.id.clone(),
                    step_id: step.id.to_string(),
                });
            }
        }

        // Loop bodies must be contiguous, and the body tail must carry the
        // loop-control contract that steers re-entry.
        let mut closed_loops = rustc_hash::FxHashSet::default();
        let mut idx = 0;
        while idx < self.steps.len() {
            let Some(meta) = &self.steps[idx].loop_meta else {
                idx += 1;
                continue;
            };
            let loop_id = meta.loop_id.clone();
            if closed_loops.contains(&loop_id) {
                return Err(WorkflowError::LoopNotContiguous {
                    workflow_id: self.id.clone(),
                    loop_id: loop_id.to_string(),
                });
            }
            let mut end = idx;
            while end < self.steps.len()
                && self.steps[end]
                    .loop_meta
                    .as_ref()
                    .is_some_and(|m| m.loop_id == loop_id)
            {
                end += 1;
            }
            let tail = &self.steps[end - 1];
            if tail.output_contract != Some(OutputContract::LoopControl) {
                return Err(WorkflowError::LoopMissingControl {
                    workflow_id: self.id.clone(),
                    loop_id: loop_id.to_string(),
                });
            }
            closed_loops.insert(loop_id);
            idx = end;
        }

        for (i, step) in self.steps.iter().enumerate() {
            if step.output_contract == Some(OutputContract::LoopControl) {
                let is_loop_tail = step.loop_meta.as_ref().is_some_and(|m| {
                    self.steps
                        .get(i + 1)
                        .and_then(|next| next.loop_meta.as_ref())
                        .is_none_or(|next_meta| next_meta.loop_id != m.loop_id)
                });
                if !is_loop_tail {
                    return Err(WorkflowError::MisplacedLoopControl {
                        workflow_id: self.id.clone(),
                        step_id: step.id.to_string(),
                    });
                }
            }
        }

        Ok(WorkflowDefinition {
            id: workflow_id,
            name: self.name,
            description: self.description,
            version: self.version,
            steps: self.steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_rejects_empty_workflow() {
        assert!(matches!(
            WorkflowBuilder::new("w", "W").compile(),
            Err(WorkflowError::Empty { .. })
        ));
    }

    #[test]
    fn compile_rejects_duplicate_steps() {
        let err = WorkflowBuilder::new("w", "W")
            .step("a", "A", "p")
            .step("a", "A again", "p")
            .compile()
            .unwrap_err();
        assert!(matches!(err, WorkflowError::DuplicateStep { .. }));
    }

    #[test]
    fn pinned_hash_is_stable_and_preview_differs() {
        let wf = WorkflowBuilder::new("w", "W")
            .step("a", "A", "p")
            .step("b", "B", "p")
            .compile()
            .unwrap();
        assert_eq!(wf.workflow_hash().unwrap(), wf.workflow_hash().unwrap());

        let pinned = crate::canon::canonical_json_string(&wf.pinned_snapshot()).unwrap();
        let preview = crate::canon::canonical_json_string(&wf.preview_snapshot()).unwrap();
        assert!(pinned.contains("v1_pinned"));
        assert!(preview.contains("v1_preview"));
        assert_ne!(pinned, preview);
    }

    #[test]
    fn loop_body_must_be_contiguous() {
        let err = WorkflowBuilder::new("w", "W")
            .push_step(
                WorkflowStep::new("a", "A", "p")
                    .unwrap()
                    .with_loop("l", 3)
                    .unwrap()
                    .with_output_contract(OutputContract::LoopControl),
            )
            .step("mid", "Mid", "p")
            .push_step(
                WorkflowStep::new("b", "B", "p")
                    .unwrap()
                    .with_loop("l", 3)
                    .unwrap()
                    .with_output_contract(OutputContract::LoopControl),
            )
            .compile()
            .unwrap_err();
        assert!(matches!(err, WorkflowError::LoopNotContiguous { .. }));
    }

    #[test]
    fn loop_tail_needs_loop_control() {
        let err = WorkflowBuilder::new("w", "W")
            .push_step(
                WorkflowStep::new("a", "A", "p")
                    .unwrap()
                    .with_loop("l", 3)
                    .unwrap(),
            )
            .compile()
            .unwrap_err();
        assert!(matches!(err, WorkflowError::LoopMissingControl { .. }));
    }

    #[test]
    fn loop_control_outside_loop_tail_is_rejected() {
        let err = WorkflowBuilder::new("w", "W")
            .push_step(
                WorkflowStep::new("a", "A", "p")
                    .unwrap()
                    .with_output_contract(OutputContract::LoopControl),
            )
            .compile()
            .unwrap_err();
        assert!(matches!(err, WorkflowError::MisplacedLoopControl { .. }));
    }
}
