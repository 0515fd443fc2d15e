//! End-to-end issue processing over mock gateways: the worker pipeline,
//! retries, HITL blocks, session continuation, and loop prevention.

use ashep::agent::mock::SessionScript;
use ashep::app::ShutdownHandle;
use ashep::config::AshepConfig;
use ashep::runlog::{DecisionType, RunFilter, RunStatus};
use ashep::testutil::{build_agent, harness, harness_with, open_issue, TestHarness, SIMPLE_POLICIES};
use ashep::tracker::IssueStatus;
use ashep::worker::engine::process_issue;

async fn drive_once(h: &TestHarness, issue_id: &str) {
    process_issue(&h.ctx, ShutdownHandle::new().subscribe(), issue_id)
        .await
        .unwrap();
}

async fn transition_decisions(h: &TestHarness, issue_id: &str) -> Vec<String> {
    let mut decisions = h
        .ctx
        .runlog
        .decisions_for_issue(issue_id, 100)
        .await
        .unwrap();
    decisions.retain(|d| d.decision_type == DecisionType::PhaseTransition);
    decisions.reverse(); // oldest first
    decisions.into_iter().map(|d| d.decision).collect()
}

#[tokio::test]
async fn happy_path_three_phases_closes_issue() {
    let h = harness().await;
    h.tracker.insert(open_issue("I1"));
    for _ in 0..3 {
        h.gateway.script(SessionScript::success(500));
    }

    // implement -> test
    drive_once(&h, "I1").await;
    let issue = h.tracker.snapshot("I1").unwrap();
    assert_eq!(issue.current_phase().as_deref(), Some("test"));

    // test -> validate
    drive_once(&h, "I1").await;
    assert_eq!(
        h.tracker.snapshot("I1").unwrap().current_phase().as_deref(),
        Some("validate")
    );

    // validate -> close
    drive_once(&h, "I1").await;
    let issue = h.tracker.snapshot("I1").unwrap();
    assert_eq!(issue.status, IssueStatus::Closed);
    assert_eq!(issue.current_phase(), None);
    assert_eq!(issue.hitl_reason(), None);

    let runs = h
        .ctx
        .runlog
        .query_runs(&RunFilter {
            issue_id: Some("I1".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(runs.len(), 3);
    assert!(runs.iter().all(|r| r.status == RunStatus::Completed));

    assert_eq!(
        transition_decisions(&h, "I1").await,
        vec!["advance_to_test", "advance_to_validate", "close"]
    );
}

#[tokio::test]
async fn retry_then_success_keeps_both_runs() {
    let h = harness().await;
    h.tracker.insert(open_issue("I1"));
    h.gateway.script(SessionScript::failure("compile error"));
    h.gateway.script(SessionScript::success(400));

    // One call: failure, in-place retry, success, advance.
    drive_once(&h, "I1").await;
    assert_eq!(
        h.tracker.snapshot("I1").unwrap().current_phase().as_deref(),
        Some("test")
    );

    let runs = h
        .ctx
        .runlog
        .query_runs(&RunFilter {
            issue_id: Some("I1".to_string()),
            phase: Some("implement".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(runs.len(), 2);
    let statuses: Vec<_> = runs.iter().map(|r| r.status).collect();
    assert!(statuses.contains(&RunStatus::Failed));
    assert!(statuses.contains(&RunStatus::Completed));

    let transitions = transition_decisions(&h, "I1").await;
    assert_eq!(transitions, vec!["retry_1", "advance_to_test"]);
}

#[tokio::test]
async fn max_retries_exceeded_blocks_with_hitl_label() {
    let h = harness().await;
    h.tracker.insert(open_issue("I1"));
    for _ in 0..3 {
        h.gateway.script(SessionScript::failure("still broken"));
    }

    drive_once(&h, "I1").await;

    let issue = h.tracker.snapshot("I1").unwrap();
    assert_eq!(issue.hitl_reason().as_deref(), Some("max-retries-exceeded"));
    // Phase label stays so a human can resume where it stopped.
    assert_eq!(issue.current_phase().as_deref(), Some("implement"));

    let runs = h
        .ctx
        .runlog
        .query_runs(&RunFilter {
            issue_id: Some("I1".to_string()),
            status: Some(RunStatus::Failed),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(runs.len(), 3);

    let transitions = transition_decisions(&h, "I1").await;
    assert_eq!(transitions, vec!["retry_1", "retry_2", "block"]);

    let hitl: Vec<_> = h
        .ctx
        .runlog
        .decisions_for_issue("I1", 100)
        .await
        .unwrap()
        .into_iter()
        .filter(|d| d.decision_type == DecisionType::Hitl)
        .collect();
    assert_eq!(hitl.len(), 1);
    assert!(hitl[0].reasoning.contains("Max retries exceeded (2)"));
}

#[tokio::test]
async fn blocked_issue_is_not_redispatched() {
    let h = harness().await;
    h.tracker.insert(open_issue("I1"));
    for _ in 0..3 {
        h.gateway.script(SessionScript::failure("nope"));
    }
    drive_once(&h, "I1").await;
    assert!(h.tracker.snapshot("I1").unwrap().hitl_reason().is_some());

    // The dispatch filter skips HITL-labelled issues entirely, so a later
    // poll must not consume any scripts (none are queued; a dispatch would
    // error loudly inside the worker task).
    let ready = h.ctx.tracker.list_ready().await.unwrap();
    assert!(ready.iter().any(|i| i.id == "I1"));
    assert!(ready[0].hitl_reason().is_some());
}

const CONTINUATION_POLICIES: &str = r#"
default_policy: simple
policies:
  simple:
    shared_session: true
    retry:
      max_attempts: 2
      strategy: fixed
      initial_delay_ms: 5
    timeout_base_ms: 5000
    phases:
      - name: implement
        capabilities: [code]
      - name: test
        capabilities: [test]
        reuse_session_from_phase: "@shared"
        max_context_tokens: 130000
        context_window_threshold: 0.9
"#;

#[tokio::test]
async fn session_continues_under_token_budget() {
    let h = harness_with(
        CONTINUATION_POLICIES,
        AshepConfig::default(),
        vec![build_agent()],
    )
    .await;
    h.tracker.insert(open_issue("I1"));
    // 110_000 tokens < 130_000 * 0.9: the test phase reuses the session.
    h.gateway.script(SessionScript::success(110_000));
    h.gateway.script(SessionScript::success(1_000));

    drive_once(&h, "I1").await; // implement
    drive_once(&h, "I1").await; // test, continuing the same session

    let launches = h.gateway.launches();
    assert_eq!(launches.len(), 2);
    assert!(!launches[0].continued);
    assert!(launches[1].continued);
    assert_eq!(launches[1].session_id, launches[0].session_id);
}

#[tokio::test]
async fn session_over_token_budget_starts_fresh() {
    let h = harness_with(
        CONTINUATION_POLICIES,
        AshepConfig::default(),
        vec![build_agent()],
    )
    .await;
    h.tracker.insert(open_issue("I1"));
    // 118_000 >= 117_000: reuse forbidden.
    h.gateway.script(SessionScript::success(118_000));
    h.gateway.script(SessionScript::success(1_000));

    drive_once(&h, "I1").await;
    drive_once(&h, "I1").await;

    let launches = h.gateway.launches();
    assert_eq!(launches.len(), 2);
    assert!(!launches[1].continued);
    assert_ne!(launches[1].session_id, launches[0].session_id);

    // The run log shows two distinct sessions.
    let runs = h
        .ctx
        .runlog
        .query_runs(&RunFilter {
            issue_id: Some("I1".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    let sessions: std::collections::HashSet<_> =
        runs.iter().filter_map(|r| r.session_id.clone()).collect();
    assert_eq!(sessions.len(), 2);
}

#[tokio::test]
async fn no_capable_agent_blocks_issue() {
    let mut lonely = build_agent();
    lonely.capabilities = vec!["code".to_string()]; // nothing covers test/review
    let h = harness_with(SIMPLE_POLICIES, AshepConfig::default(), vec![lonely]).await;

    let mut issue = open_issue("I1");
    issue.labels = vec!["ashep-phase:test".to_string()];
    h.tracker.insert(issue);

    drive_once(&h, "I1").await;

    let issue = h.tracker.snapshot("I1").unwrap();
    assert_eq!(issue.hitl_reason().as_deref(), Some("no-capable-agent"));

    let decisions = h.ctx.runlog.decisions_for_issue("I1", 100).await.unwrap();
    assert!(decisions
        .iter()
        .any(|d| d.decision_type == DecisionType::AgentSelection
            && d.decision == "no_capable_agent"));
}

#[tokio::test]
async fn excluded_issue_never_dispatches() {
    let h = harness().await;
    let mut issue = open_issue("I1");
    issue.labels = vec!["ashep-excluded".to_string()];
    h.tracker.insert(issue);

    // No scripts queued: a dispatch would fail the launch and mark a run.
    let ready = h.ctx.tracker.list_ready().await.unwrap();
    assert!(ready[0].is_excluded());
    assert!(!h.ctx.runlog.has_live_run("I1").await.unwrap());
}

#[tokio::test]
async fn phase_result_message_reaches_next_phase_prompt() {
    let h = harness().await;
    h.tracker.insert(open_issue("I1"));
    h.gateway
        .script(SessionScript::completed_with_message("implemented the fix", 100));
    h.gateway.script(SessionScript::success(100));

    drive_once(&h, "I1").await; // implement -> test, sends a result message
    drive_once(&h, "I1").await; // test run consumes it

    let launches = h.gateway.launches();
    assert!(launches[1].user_prompt.contains("implemented the fix"));
}
