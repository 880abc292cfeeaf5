mod common;

use common::fixtures::{TestEngine, two_step_workflow};
use loomrail::engine::{AgentOutput, ContinueArgs, ContinueResponse, StartArgs};
use loomrail::errors::{ErrorCode, RetryClass};
use loomrail::events::{EventBody, NodeKind};
use loomrail::stores::{DataLayout, SessionLockManager};

/// A held session lock turns an advance into a fail-fast retryable error.
#[tokio::test]
async fn advance_against_a_held_lock_fails_fast() {
    let engine = TestEngine::new();
    let started = engine
        .service
        .start_workflow(StartArgs::new(two_step_workflow()))
        .await
        .unwrap();
    let session = engine.only_session().await;

    let manager = SessionLockManager::new(DataLayout::new(engine.dir.path()), 1_000);
    let held = manager.acquire(&session).unwrap();

    let err = engine
        .service
        .continue_workflow(ContinueArgs::advance(
            &started.state_token,
            started.ack_token.as_deref().unwrap(),
            AgentOutput::notes("contended"),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::TokenSessionLocked);
    assert!(matches!(err.retry, RetryClass::RetryableAfterMs { .. }));

    held.release().unwrap();

    let ok = engine
        .service
        .continue_workflow(ContinueArgs::advance(
            &started.state_token,
            started.ack_token.as_deref().unwrap(),
            AgentOutput::notes("after release"),
        ))
        .await
        .unwrap();
    assert!(ok.is_ok());
}

/// Two racing advances with the same tokens: each either succeeds (the
/// loser via fact-returning replay) or observes the lock; the log gains
/// exactly one new step node either way.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_identical_advances_write_one_step() {
    let engine = TestEngine::new();
    let started = engine
        .service
        .start_workflow(StartArgs::new(two_step_workflow()))
        .await
        .unwrap();
    let state = started.state_token.clone();
    let ack = started.ack_token.clone().unwrap();

    let spawn_advance = |service: loomrail::engine::WorkflowService,
                         state: String,
                         ack: String| {
        tokio::spawn(async move {
            service
                .continue_workflow(ContinueArgs::advance(&state, &ack, AgentOutput::notes("race")))
                .await
        })
    };
    let left = spawn_advance(engine.service.clone(), state.clone(), ack.clone());
    let right = spawn_advance(engine.service.clone(), state, ack);
    let (left, right) = tokio::join!(left, right);
    let (left, right) = (left.unwrap(), right.unwrap());

    let mut ok_count = 0;
    for outcome in [left, right] {
        match outcome {
            Ok(ContinueResponse::Ok { .. }) => ok_count += 1,
            Ok(other) => panic!("unexpected block: {other:?}"),
            Err(e) => assert_eq!(e.code, ErrorCode::TokenSessionLocked, "{e:?}"),
        }
    }
    assert!(ok_count >= 1, "at least one racer must win");

    let session = engine.only_session().await;
    let truth = engine.raw_store().load(&session).await.unwrap();
    let step_nodes = truth
        .events
        .iter()
        .filter(|e| matches!(&e.body, EventBody::NodeCreated(n) if n.node_kind == NodeKind::Step))
        .count();
    assert_eq!(step_nodes, 2, "root plus exactly one advanced node");
}
