//! Dynamic decision routing and loop prevention across repeated jumps.

use ashep::agent::mock::SessionScript;
use ashep::app::ShutdownHandle;
use ashep::config::AshepConfig;
use ashep::registry::AgentConfig;
use ashep::runlog::DecisionType;
use ashep::testutil::{build_agent, harness_with, open_issue, TestHarness};
use ashep::worker::engine::process_issue;

const PINGPONG_POLICIES: &str = r#"
default_policy: pingpong
policies:
  pingpong:
    retry:
      max_attempts: 2
      strategy: fixed
      initial_delay_ms: 5
    timeout_base_ms: 5000
    loop_prevention:
      max_transitions_default: 50
    phases:
      - name: implement
        capabilities: [code]
        dynamic_decision: triage
      - name: test
        capabilities: [test]
        dynamic_decision: triage
"#;

fn decider() -> AgentConfig {
    AgentConfig {
        id: "decider".to_string(),
        name: "Decider".to_string(),
        capabilities: vec!["triage".to_string()],
        priority: 5,
        constraints: None,
        active: true,
    }
}

fn decision_reply(decision: &str) -> SessionScript {
    SessionScript::completed_with_message(
        &format!(
            r#"{{"decision": "{decision}", "reasoning": "routing", "confidence": 0.95}}"#
        ),
        50,
    )
}

async fn drive_once(h: &TestHarness, issue_id: &str) {
    process_issue(&h.ctx, ShutdownHandle::new().subscribe(), issue_id)
        .await
        .unwrap();
}

#[tokio::test]
async fn oscillating_jumps_are_cut_off() {
    let h = harness_with(
        PINGPONG_POLICIES,
        AshepConfig::default(),
        vec![build_agent(), decider()],
    )
    .await;
    h.tracker.insert(open_issue("I1"));

    // Six ping-pong hops: each call runs the phase, then the decider jumps
    // to the other phase.
    for hop in 0..6 {
        h.gateway.script(SessionScript::success(100));
        let target = if hop % 2 == 0 { "test" } else { "implement" };
        h.gateway.script(decision_reply(&format!("jump_to_{target}")));
        drive_once(&h, "I1").await;
    }

    // Seventh attempt: the cycle detector fires before any decision agent
    // is consulted, so only the phase run itself is scripted.
    h.gateway.script(SessionScript::success(100));
    drive_once(&h, "I1").await;

    let issue = h.tracker.snapshot("I1").unwrap();
    assert_eq!(issue.hitl_reason().as_deref(), Some("loop-detected"));

    let decisions = h.ctx.runlog.decisions_for_issue("I1", 100).await.unwrap();
    let jumps: Vec<_> = decisions
        .iter()
        .filter(|d| d.decision_type == DecisionType::PhaseTransition && d.decision.starts_with("jump"))
        .collect();
    assert_eq!(jumps.len(), 6);

    let blocked = decisions
        .iter()
        .find(|d| d.decision_type == DecisionType::PhaseTransition && d.decision == "block")
        .expect("terminal block transition");
    assert!(blocked.reasoning.contains("Oscillating"));
}

#[tokio::test]
async fn dynamic_advance_routes_forward() {
    let h = harness_with(
        PINGPONG_POLICIES,
        AshepConfig::default(),
        vec![build_agent(), decider()],
    )
    .await;
    h.tracker.insert(open_issue("I1"));

    h.gateway.script(SessionScript::success(100));
    h.gateway.script(decision_reply("advance_to_test"));
    drive_once(&h, "I1").await;

    let issue = h.tracker.snapshot("I1").unwrap();
    assert_eq!(issue.current_phase().as_deref(), Some("test"));

    let dynamic: Vec<_> = h
        .ctx
        .runlog
        .decisions_for_issue("I1", 100)
        .await
        .unwrap()
        .into_iter()
        .filter(|d| d.decision_type == DecisionType::DynamicDecision)
        .collect();
    assert_eq!(dynamic.len(), 1);
    assert_eq!(dynamic[0].decision, "advance_to_test");
}

#[tokio::test]
async fn low_confidence_decision_demotes_to_approval() {
    let h = harness_with(
        PINGPONG_POLICIES,
        AshepConfig::default(),
        vec![build_agent(), decider()],
    )
    .await;
    h.tracker.insert(open_issue("I1"));

    h.gateway.script(SessionScript::success(100));
    h.gateway.script(SessionScript::completed_with_message(
        r#"{"decision": "advance_to_test", "reasoning": "not sure", "confidence": 0.4}"#,
        50,
    ));
    drive_once(&h, "I1").await;

    let issue = h.tracker.snapshot("I1").unwrap();
    assert_eq!(issue.hitl_reason().as_deref(), Some("approval"));
    // No phase change happened.
    assert_eq!(issue.current_phase().as_deref(), Some("implement"));
}

#[tokio::test]
async fn invalid_decision_reply_blocks() {
    let h = harness_with(
        PINGPONG_POLICIES,
        AshepConfig::default(),
        vec![build_agent(), decider()],
    )
    .await;
    h.tracker.insert(open_issue("I1"));

    h.gateway.script(SessionScript::success(100));
    h.gateway
        .script(SessionScript::completed_with_message("not json", 50));
    drive_once(&h, "I1").await;

    let issue = h.tracker.snapshot("I1").unwrap();
    assert!(issue.hitl_reason().is_some());
}

#[tokio::test]
async fn jump_to_unknown_phase_blocks() {
    let h = harness_with(
        PINGPONG_POLICIES,
        AshepConfig::default(),
        vec![build_agent(), decider()],
    )
    .await;
    h.tracker.insert(open_issue("I1"));

    h.gateway.script(SessionScript::success(100));
    h.gateway.script(decision_reply("jump_to_deploy"));
    drive_once(&h, "I1").await;

    // "deploy" is not an allowed destination, so the decision is rejected
    // and the issue blocks instead of moving.
    let issue = h.tracker.snapshot("I1").unwrap();
    assert!(issue.hitl_reason().is_some());
    assert_eq!(issue.current_phase().as_deref(), Some("implement"));
}
