//! # Loomrail: Durable Execution Authority for Agent Workflows
//!
//! Loomrail executes multi-step agent workflows against a durable,
//! replayable, tamper-evident execution state. The agent never owns its
//! state: at each step it surrenders an opaque signed token, and the engine
//! hands back the next step, fresh tokens, and the invariants to preserve.
//!
//! ## Core Concepts
//!
//! - **Session event log**: the append-only authority for everything that
//!   happened in one workflow execution
//! - **Execution snapshots**: content-addressed, immutable captures of the
//!   engine state between steps
//! - **Tokens**: HMAC-signed claims (`state`, `ack`, `checkpoint`) binding
//!   the agent to a session, run, node, and attempt
//! - **Gate**: the single choke point that holds the per-session lock and
//!   mints the witness every write requires
//! - **Projections**: pure functions over an event prefix (run DAG, node
//!   outputs, session health, resume candidates)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use loomrail::config::EngineConfig;
//! use loomrail::engine::{StartArgs, WorkflowService};
//! use loomrail::workflow::WorkflowBuilder;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let workflow = WorkflowBuilder::new("triage", "Bug triage")
//!     .step("reproduce", "Reproduce the bug", "Reproduce the reported bug.")
//!     .step("fix", "Fix the bug", "Apply the smallest correct fix.")
//!     .compile()?;
//!
//! let service = WorkflowService::open(EngineConfig::default())?;
//! let started = service
//!     .start_workflow(StartArgs::new(workflow))
//!     .await?;
//!
//! // Hand `started.state_token` / `started.ack_token` to the agent; every
//! // later call re-verifies them against the keyring.
//! println!("first step: {:?}", started.pending);
//! # Ok(())
//! # }
//! ```
//!
//! ## Write Path
//!
//! One advance call flows: parse tokens → gate acquires the session lock →
//! load session truth → project health and the run DAG → replay
//! short-circuit if this attempt was already recorded → validate context
//! and output → detect blockers → append the event batch (with snapshot
//! pins) as one unit → mint next tokens → render the next prompt.
//!
//! The gate is the *only* caller of the event log's `append`; a write
//! requires a [`gate::Witness`], which only the gate can construct.
//!
//! ## Module Guide
//!
//! - [`types`] - Tagged identifiers and content references
//! - [`canon`] - RFC 8785 canonical JSON serialization
//! - [`digest`] - SHA-256 content addressing
//! - [`keyring`] - HMAC key persistence and rotation
//! - [`tokens`] - Token codec: binary framing, bech32m text, sign/verify
//! - [`workflow`] - Workflow definitions, builder, pinned snapshots
//! - [`events`] - Session event model and dedupe keys
//! - [`stores`] - Event log, snapshot/pinned stores, session lock
//! - [`gate`] - Single-writer execution gate and witness
//! - [`projections`] - Pure views over the event log
//! - [`engine`] - Advance/start/checkpoint logic, blockers, prompts
//! - [`errors`] - The closed service error taxonomy
//! - [`config`] - Engine configuration
//! - [`telemetry`] - Tracing subscriber setup

pub mod canon;
pub mod config;
pub mod digest;
pub mod engine;
pub mod errors;
pub mod events;
pub mod gate;
pub mod keyring;
pub mod projections;
pub mod stores;
pub mod telemetry;
pub mod tokens;
pub mod types;
pub mod workflow;
pub mod workspace;
