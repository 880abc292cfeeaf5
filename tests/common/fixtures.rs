use loomrail::config::EngineConfig;
use loomrail::engine::WorkflowService;
use loomrail::stores::{DataLayout, SessionEventLogStore};
use loomrail::types::SessionId;
use loomrail::workflow::{WorkflowBuilder, WorkflowDefinition};

/// One engine over a throwaway data directory.
pub struct TestEngine {
    pub dir: tempfile::TempDir,
    pub service: WorkflowService,
}

impl TestEngine {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let service =
            WorkflowService::open(EngineConfig::at(dir.path())).expect("engine opens on fresh dir");
        Self { dir, service }
    }

    /// A raw store over the same data directory, for asserting on the log.
    pub fn raw_store(&self) -> SessionEventLogStore {
        SessionEventLogStore::new(DataLayout::new(self.dir.path()))
    }

    /// The single session the test created.
    pub async fn only_session(&self) -> SessionId {
        let mut sessions = self.raw_store().list_sessions().await.expect("list");
        assert_eq!(sessions.len(), 1, "expected exactly one session");
        sessions.pop().expect("one session")
    }
}

pub fn two_step_workflow() -> WorkflowDefinition {
    WorkflowBuilder::new("demo", "Demo")
        .description("Two plain steps")
        .step("step1", "First step", "Do the first thing.")
        .step("step2", "Second step", "Do the second thing.")
        .compile()
        .expect("demo workflow compiles")
}

pub fn three_step_workflow() -> WorkflowDefinition {
    WorkflowBuilder::new("triage", "Triage")
        .step("reproduce", "Reproduce", "Reproduce the bug.")
        .step("fix", "Fix", "Apply the fix.")
        .step("verify", "Verify", "Verify the fix.")
        .compile()
        .expect("triage workflow compiles")
}
