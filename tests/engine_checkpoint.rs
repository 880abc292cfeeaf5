mod common;

use common::fixtures::{TestEngine, two_step_workflow};
use loomrail::engine::{AgentOutput, ContinueArgs, ContinueResponse, StartArgs};
use loomrail::events::{EventBody, NodeKind};

/// Scenario: checkpoint, resume from the minted state token, and verify
/// the second checkpoint with the same token is a pure replay.
#[tokio::test]
async fn checkpoint_then_resume_then_idempotent_replay() {
    let engine = TestEngine::new();
    let started = engine
        .service
        .start_workflow(StartArgs::new(two_step_workflow()))
        .await
        .unwrap();
    let checkpoint_token = started.checkpoint_token.clone().unwrap();

    let first = engine
        .service
        .checkpoint_workflow(&checkpoint_token)
        .await
        .unwrap();

    // The fresh state token still points at the original pending step.
    let rehydrated = engine
        .service
        .continue_workflow(ContinueArgs::rehydrate(&first.state_token))
        .await
        .unwrap();
    let ContinueResponse::Ok { pending, .. } = rehydrated else {
        panic!("rehydrate after checkpoint should succeed");
    };
    assert_eq!(pending.unwrap().step_id, "step1");

    let session = engine.only_session().await;
    let len_after_first = engine.raw_store().load(&session).await.unwrap().events.len();

    let second = engine
        .service
        .checkpoint_workflow(&checkpoint_token)
        .await
        .unwrap();
    assert_eq!(second.checkpoint_node_id, first.checkpoint_node_id);
    assert_eq!(second.state_token, first.state_token);

    let truth = engine.raw_store().load(&session).await.unwrap();
    assert_eq!(truth.events.len(), len_after_first, "replay must not write");

    let checkpoints = truth
        .events
        .iter()
        .filter(|e| {
            matches!(&e.body, EventBody::NodeCreated(n) if n.node_kind == NodeKind::Checkpoint)
        })
        .count();
    assert_eq!(checkpoints, 1);
}

/// A checkpoint never moves the preferred tip, so advancing afterwards
/// still consumes the original pending step.
#[tokio::test]
async fn checkpoint_does_not_steal_the_pending_step() {
    let engine = TestEngine::new();
    let started = engine
        .service
        .start_workflow(StartArgs::new(two_step_workflow()))
        .await
        .unwrap();

    engine
        .service
        .checkpoint_workflow(started.checkpoint_token.as_deref().unwrap())
        .await
        .unwrap();

    let advanced = engine
        .service
        .continue_workflow(ContinueArgs::advance(
            &started.state_token,
            started.ack_token.as_deref().unwrap(),
            AgentOutput::notes("progressed"),
        ))
        .await
        .unwrap();
    let ContinueResponse::Ok { pending, .. } = advanced else {
        panic!("advance after checkpoint should succeed");
    };
    assert_eq!(pending.unwrap().step_id, "step2");
}
