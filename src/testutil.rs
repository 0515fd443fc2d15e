//! Test fixtures shared by unit and integration tests.

use std::collections::HashMap;
use std::sync::Arc;

use crate::agent::MockAgentGateway;
use crate::app::EngineContext;
use crate::config::{AshepConfig, FallbackConfig};
use crate::messenger::PhaseMessenger;
use crate::policy::{PolicyEngine, PolicyFile};
use crate::prompt::{DecisionAnalytics, TemplateSet};
use crate::registry::{AgentConfig, AgentRegistry};
use crate::retention::ArchiveStore;
use crate::runlog::RunLog;
use crate::tracker::{Issue, IssueStatus, MockIssueTracker};

/// Three-phase policy used across the test suite.
pub const SIMPLE_POLICIES: &str = r#"
default_policy: simple
policies:
  simple:
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
      - name: validate
        capabilities: [review]
"#;

pub fn build_agent() -> AgentConfig {
    AgentConfig {
        id: "build".to_string(),
        name: "Build Agent".to_string(),
        capabilities: vec![
            "code".to_string(),
            "test".to_string(),
            "review".to_string(),
        ],
        priority: 10,
        constraints: None,
        active: true,
    }
}

pub fn open_issue(id: &str) -> Issue {
    Issue {
        id: id.to_string(),
        title: format!("issue {id}"),
        description: "something is broken".to_string(),
        issue_type: Some("bug".to_string()),
        priority: 1,
        status: IssueStatus::Open,
        labels: Vec::new(),
        created_at: Some(chrono::Utc::now()),
        metadata: HashMap::new(),
    }
}

/// Mock-backed engine context plus handles to the mocks.
pub struct TestHarness {
    pub dir: tempfile::TempDir,
    pub ctx: Arc<EngineContext>,
    pub tracker: MockIssueTracker,
    pub gateway: MockAgentGateway,
}

pub async fn harness() -> TestHarness {
    harness_with(SIMPLE_POLICIES, AshepConfig::default(), vec![build_agent()]).await
}

pub async fn harness_with(
    policies_yaml: &str,
    config: AshepConfig,
    agents: Vec<AgentConfig>,
) -> TestHarness {
    let dir = tempfile::tempdir().unwrap();
    let runlog = Arc::new(RunLog::open(dir.path()).await.unwrap());
    let archive = Arc::new(ArchiveStore::open(dir.path()).await.unwrap());
    let messenger = PhaseMessenger::new(Arc::clone(&runlog), dir.path());

    let policy_file: PolicyFile = serde_yaml::from_str(policies_yaml).unwrap();
    let policies = PolicyEngine::new(
        policy_file,
        config.loop_prevention.clone(),
        config.hitl.allowed_reasons.clone(),
    );
    let fallback: FallbackConfig = config.fallback.clone();
    let registry = AgentRegistry::new(agents, fallback);

    let tracker = MockIssueTracker::new();
    let gateway = MockAgentGateway::new();

    let ctx = Arc::new(EngineContext {
        config,
        policies,
        registry,
        runlog,
        archive,
        messenger,
        tracker: Arc::new(tracker.clone()),
        agents: Arc::new(gateway.clone()),
        templates: TemplateSet::builtin(),
        analytics: DecisionAnalytics::new(),
    });

    TestHarness {
        dir,
        ctx,
        tracker,
        gateway,
    }
}

/// Bare context for tests that only need stores and policies.
pub async fn test_context() -> (tempfile::TempDir, EngineContext) {
    let TestHarness { dir, ctx, .. } = harness().await;
    let ctx = Arc::try_unwrap(ctx).unwrap_or_else(|_| panic!("context still shared"));
    (dir, ctx)
}
