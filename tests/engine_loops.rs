mod common;

use common::fixtures::TestEngine;
use loomrail::engine::{AgentOutput, ContinueArgs, ContinueResponse, StartArgs};
use loomrail::workflow::{OutputContract, WorkflowBuilder, WorkflowDefinition, WorkflowStep};
use serde_json::json;

fn looped_workflow() -> WorkflowDefinition {
    WorkflowBuilder::new("scan", "Scan loop")
        .push_step(
            WorkflowStep::new("probe", "Probe", "Probe the target.")
                .unwrap()
                .with_loop("sweep", 2)
                .unwrap(),
        )
        .push_step(
            WorkflowStep::new("decide", "Decide", "Decide whether to sweep again.")
                .unwrap()
                .with_loop("sweep", 2)
                .unwrap()
                .with_output_contract(OutputContract::LoopControl),
        )
        .step("report", "Report", "Write up the findings.")
        .compile()
        .unwrap()
}

struct Position {
    state: String,
    ack: String,
    step: String,
    prompt: String,
}

fn position(resp: ContinueResponse) -> Position {
    let ContinueResponse::Ok {
        state_token,
        ack_token,
        pending,
        ..
    } = resp
    else {
        panic!("expected an ok response, got {resp:?}");
    };
    let pending = pending.expect("run still has a pending step");
    Position {
        state: state_token,
        ack: ack_token.expect("pending implies ack"),
        step: pending.step_id,
        prompt: pending.prompt,
    }
}

#[tokio::test]
async fn loop_continue_re_enters_with_banner_then_break_leaves() {
    let engine = TestEngine::new();
    let started = engine
        .service
        .start_workflow(StartArgs::new(looped_workflow()))
        .await
        .unwrap();
    let pending = started.pending.as_ref().unwrap();
    assert_eq!(pending.step_id, "probe");
    assert!(
        pending.prompt.contains("iteration 1"),
        "loop steps announce their iteration: {}",
        pending.prompt
    );

    let decide = position(
        engine
            .service
            .continue_workflow(ContinueArgs::advance(
                &started.state_token,
                started.ack_token.as_deref().unwrap(),
                AgentOutput::notes("probed the first corner"),
            ))
            .await
            .unwrap(),
    );
    assert_eq!(decide.step, "decide");

    // The loop-control contract steers re-entry.
    let probe_again = position(
        engine
            .service
            .continue_workflow(ContinueArgs::advance(
                &decide.state,
                &decide.ack,
                AgentOutput::default().with_structured(json!({"action": "continue"})),
            ))
            .await
            .unwrap(),
    );
    assert_eq!(probe_again.step, "probe");
    assert!(
        probe_again.prompt.contains("iteration 2"),
        "re-entry bumps the iteration: {}",
        probe_again.prompt
    );

    let decide_again = position(
        engine
            .service
            .continue_workflow(ContinueArgs::advance(
                &probe_again.state,
                &probe_again.ack,
                AgentOutput::notes("probed the second corner"),
            ))
            .await
            .unwrap(),
    );

    let report = position(
        engine
            .service
            .continue_workflow(ContinueArgs::advance(
                &decide_again.state,
                &decide_again.ack,
                AgentOutput::default().with_structured(json!({"action": "break"})),
            ))
            .await
            .unwrap(),
    );
    assert_eq!(report.step, "report");
    assert!(
        !report.prompt.contains("iteration"),
        "steps outside the loop carry no banner"
    );
}

#[tokio::test]
async fn iteration_cap_overrides_continue() {
    let engine = TestEngine::new();
    let started = engine
        .service
        .start_workflow(StartArgs::new(looped_workflow()))
        .await
        .unwrap();

    let mut pos = Position {
        state: started.state_token.clone(),
        ack: started.ack_token.clone().unwrap(),
        step: "probe".to_string(),
        prompt: String::new(),
    };

    // Always ask to continue; the cap of 2 iterations must still end it.
    for _ in 0..2 {
        assert_eq!(pos.step, "probe");
        pos = position(
            engine
                .service
                .continue_workflow(ContinueArgs::advance(
                    &pos.state,
                    &pos.ack,
                    AgentOutput::notes("probing"),
                ))
                .await
                .unwrap(),
        );
        assert_eq!(pos.step, "decide");
        pos = position(
            engine
                .service
                .continue_workflow(ContinueArgs::advance(
                    &pos.state,
                    &pos.ack,
                    AgentOutput::default().with_structured(json!({"action": "continue"})),
                ))
                .await
                .unwrap(),
        );
    }
    assert_eq!(pos.step, "report", "the cap forces the loop exit");
}

#[tokio::test]
async fn malformed_loop_control_blocks_with_contract_pointer() {
    let engine = TestEngine::new();
    let started = engine
        .service
        .start_workflow(StartArgs::new(looped_workflow()))
        .await
        .unwrap();

    let decide = position(
        engine
            .service
            .continue_workflow(ContinueArgs::advance(
                &started.state_token,
                started.ack_token.as_deref().unwrap(),
                AgentOutput::notes("probed"),
            ))
            .await
            .unwrap(),
    );

    let blocked = engine
        .service
        .continue_workflow(ContinueArgs::advance(
            &decide.state,
            &decide.ack,
            AgentOutput::default().with_structured(json!({"action": "perhaps"})),
        ))
        .await
        .unwrap();
    let ContinueResponse::Blocked { blockers, retryable, .. } = blocked else {
        panic!("invalid loop control must block");
    };
    assert!(retryable);
    assert_eq!(
        blockers[0].code,
        loomrail::engine::BlockerCode::InvalidRequiredOutput
    );
}
