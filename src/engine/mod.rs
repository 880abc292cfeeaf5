//! The execution engine: state advancement, blockers, prompts, operations.
//!
//! Everything here runs *inside* the gate's critical section except token
//! parsing and context validation, which fail fast before any lock is
//! taken. The engine never touches storage directly; it builds event
//! batches and snapshots, and the gate-held witness carries them to disk.

pub mod advance;
pub mod blockers;
pub mod checkpoint;
pub mod context;
pub mod guardrails;
pub mod prompt;
pub mod service;
pub mod snapshot;
pub mod start;

pub use advance::{AgentOutput, ArtifactOutput, ContinueArgs, ContinueIntent, ContinueResponse};
pub use blockers::{BlockKind, Blocker, BlockerCode, BlockerPointer, CapabilityStatus};
pub use service::{
    CheckpointResponse, NextCall, PendingStepView, StartArgs, StartResponse, ValidationReport,
    WorkflowService,
};
pub use snapshot::{EngineState, ExecutionSnapshot, LoopFrame, PendingStep};
