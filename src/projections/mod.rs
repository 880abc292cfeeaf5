//! Projections: pure, deterministic views over a session's event prefix.
//!
//! Projections never write and never consult wall-clock state; given the
//! same event prefix they produce byte-identical outputs. The run DAG, node
//! outputs, and snapshot state drive advancement; session health drives the
//! gate; resume ranking drives "pick up where I left off".

pub mod health;
pub mod outputs;
pub mod resume;
pub mod run_dag;
pub mod snapshot_state;

pub use health::{SessionHealth, project_session_health};
pub use outputs::{NodeOutputs, project_node_outputs};
pub use resume::{ResumeCandidate, rank_resume_candidates};
pub use run_dag::{RunDag, RunDagNode, project_run_dag};
pub use snapshot_state::{SnapshotState, project_snapshot_state};
