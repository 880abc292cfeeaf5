mod common;

use common::fixtures::{TestEngine, three_step_workflow};
use loomrail::engine::{AgentOutput, ContinueArgs, ContinueResponse, StartArgs};

fn ok_pending(resp: ContinueResponse) -> (String, Option<String>, String, String) {
    let ContinueResponse::Ok {
        state_token,
        ack_token,
        pending,
        ..
    } = resp
    else {
        panic!("expected ok, got {resp:?}");
    };
    let pending = pending.expect("pending step");
    (state_token, ack_token, pending.step_id, pending.prompt)
}

/// Rehydrating a superseded position surfaces the ancestry recap and the
/// downstream recap so a recovered agent does not silently fork the run.
#[tokio::test]
async fn rehydrating_a_stale_token_explains_what_already_happened() {
    let engine = TestEngine::new();
    let started = engine
        .service
        .start_workflow(StartArgs::new(three_step_workflow()))
        .await
        .unwrap();

    let (state2, ack2, step2, _) = ok_pending(
        engine
            .service
            .continue_workflow(ContinueArgs::advance(
                &started.state_token,
                started.ack_token.as_deref().unwrap(),
                AgentOutput::notes("Reproduced with `cargo test flaky -- --ignored`."),
            ))
            .await
            .unwrap(),
    );
    assert_eq!(step2, "fix");

    let (_, _, step3, _) = ok_pending(
        engine
            .service
            .continue_workflow(ContinueArgs::advance(
                &state2,
                ack2.as_deref().unwrap(),
                AgentOutput::notes("Pinned the race with a mutex around the cache."),
            ))
            .await
            .unwrap(),
    );
    assert_eq!(step3, "verify");

    // The original start token now points two steps behind the tip.
    let stale = engine
        .service
        .continue_workflow(ContinueArgs::rehydrate(&started.state_token))
        .await
        .unwrap();
    let ContinueResponse::Ok { pending, .. } = stale else {
        panic!("stale rehydrate still succeeds");
    };
    let pending = pending.expect("root still pends its original step");
    assert_eq!(pending.step_id, "reproduce");
    assert!(
        pending.prompt.contains("already continued past this step"),
        "downstream recap missing: {}",
        pending.prompt
    );
    assert!(
        pending.prompt.contains("Pinned the race"),
        "downstream recap should quote the recorded notes: {}",
        pending.prompt
    );
}

/// Rehydrating the current tip includes the ancestry recap of everything
/// before it.
#[tokio::test]
async fn rehydrating_the_tip_recaps_ancestors() {
    let engine = TestEngine::new();
    let started = engine
        .service
        .start_workflow(StartArgs::new(three_step_workflow()))
        .await
        .unwrap();

    let (state2, _, _, _) = ok_pending(
        engine
            .service
            .continue_workflow(ContinueArgs::advance(
                &started.state_token,
                started.ack_token.as_deref().unwrap(),
                AgentOutput::notes("Reproduced on CI run 4812."),
            ))
            .await
            .unwrap(),
    );

    let rehydrated = engine
        .service
        .continue_workflow(ContinueArgs::rehydrate(&state2))
        .await
        .unwrap();
    let ContinueResponse::Ok { pending, .. } = rehydrated else {
        panic!("rehydrate succeeds");
    };
    let prompt = pending.unwrap().prompt;
    assert!(
        prompt.contains("What happened before this step"),
        "ancestry recap missing: {prompt}"
    );
    assert!(
        prompt.contains("Reproduced on CI run 4812."),
        "ancestor notes missing: {prompt}"
    );
}

/// The rendered prompt never exceeds the recovery budget; truncation is
/// marked.
#[tokio::test]
async fn recovery_prompt_respects_the_byte_budget() {
    use loomrail::config::EngineConfig;
    use loomrail::engine::WorkflowService;

    let dir = tempfile::tempdir().unwrap();
    let service = WorkflowService::open(
        EngineConfig::at(dir.path()).with_recovery_budget_bytes(512),
    )
    .unwrap();

    let started = service
        .start_workflow(StartArgs::new(three_step_workflow()))
        .await
        .unwrap();
    let huge_notes = "a very long recap line. ".repeat(200);
    service
        .continue_workflow(ContinueArgs::advance(
            &started.state_token,
            started.ack_token.as_deref().unwrap(),
            AgentOutput::notes(&huge_notes),
        ))
        .await
        .unwrap();

    let rehydrated = service
        .continue_workflow(ContinueArgs::rehydrate(&started.state_token))
        .await
        .unwrap();
    let ContinueResponse::Ok { pending, .. } = rehydrated else {
        panic!("rehydrate succeeds");
    };
    let prompt = pending.unwrap().prompt;
    assert!(prompt.len() <= 512, "prompt is {} bytes", prompt.len());
    assert!(prompt.ends_with("[TRUNCATED]"));
}
