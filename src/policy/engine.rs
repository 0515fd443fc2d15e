//! The phase transition state machine.
//!
//! `determine_transition` is consulted after every run reaches a terminal
//! status. Verdict order: policy/phase existence, approval gates, retry
//! budget, loop prevention (visits, per-pair transition caps, oscillation),
//! then advance or close. Retry counts come from the run log, never from
//! outcome fields.

use std::collections::HashMap;

use crate::config::LoopPreventionConfig;
use crate::registry::AgentRegistry;
use crate::runlog::{RunLog, RunOutcome, StoreError};

use super::hitl::HitlReasonRules;
use super::types::{PhaseConfig, PolicyConfig, PolicyFile, RetryStrategy, Transition};

pub struct PolicyEngine {
    policies: HashMap<String, PolicyConfig>,
    default_policy: String,
    loop_prevention: LoopPreventionConfig,
    hitl_rules: HitlReasonRules,
}

impl PolicyEngine {
    pub fn new(
        file: PolicyFile,
        loop_prevention: LoopPreventionConfig,
        hitl_rules: HitlReasonRules,
    ) -> Self {
        Self {
            policies: file.policies,
            default_policy: file.default_policy,
            loop_prevention,
            hitl_rules,
        }
    }

    pub fn policy_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.policies.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get_policy(&self, name: &str) -> Option<&PolicyConfig> {
        self.policies.get(name)
    }

    pub fn default_policy_name(&self) -> &str {
        &self.default_policy
    }

    /// Policy for an issue: its requested policy when known, else the
    /// default.
    pub fn resolve_policy_name(&self, requested: Option<&str>) -> String {
        match requested {
            Some(name) if self.policies.contains_key(name) => name.to_string(),
            Some(name) => {
                tracing::warn!("Unknown policy '{name}' requested; using default");
                self.default_policy.clone()
            }
            None => self.default_policy.clone(),
        }
    }

    pub fn hitl_rules(&self) -> &HitlReasonRules {
        &self.hitl_rules
    }

    pub fn loop_prevention(&self) -> &LoopPreventionConfig {
        &self.loop_prevention
    }

    pub fn phase_sequence(&self, policy_name: &str) -> Vec<String> {
        self.get_policy(policy_name)
            .map(|p| p.phase_names())
            .unwrap_or_default()
    }

    pub fn phase_config(&self, policy_name: &str, phase: &str) -> Option<&PhaseConfig> {
        self.get_policy(policy_name).and_then(|p| p.phase(phase))
    }

    pub fn next_phase(&self, policy_name: &str, phase: &str) -> Option<&PhaseConfig> {
        self.get_policy(policy_name).and_then(|p| p.next_phase(phase))
    }

    /// Delay before retry attempt `attempt_number` (0-based), capped by the
    /// policy's `max_delay_ms`.
    pub fn calculate_retry_delay(policy: &PolicyConfig, attempt_number: u32) -> u64 {
        let retry = &policy.retry;
        let raw = match retry.strategy {
            RetryStrategy::Fixed => retry.initial_delay_ms,
            RetryStrategy::Linear => retry
                .initial_delay_ms
                .saturating_mul(attempt_number as u64 + 1),
            RetryStrategy::Exponential => retry
                .initial_delay_ms
                .saturating_mul(1u64 << attempt_number.min(32)),
        };
        raw.min(retry.max_delay_ms)
    }

    fn effective_max_visits(&self, policy: &PolicyConfig, phase: &PhaseConfig) -> u32 {
        phase
            .max_visits
            .or_else(|| {
                policy
                    .loop_prevention
                    .as_ref()
                    .and_then(|lp| lp.max_visits_default)
            })
            .unwrap_or(self.loop_prevention.max_visits_default)
    }

    fn effective_max_transitions(&self, policy: &PolicyConfig, from: &str, to: &str) -> u32 {
        policy
            .transition_limit(from, to)
            .or_else(|| {
                policy
                    .loop_prevention
                    .as_ref()
                    .and_then(|lp| lp.max_transitions_default)
            })
            .unwrap_or(self.loop_prevention.max_transitions_default)
    }

    fn effective_cycle_length(&self, policy: &PolicyConfig) -> u32 {
        policy
            .loop_prevention
            .as_ref()
            .and_then(|lp| lp.cycle_detection_length)
            .unwrap_or(self.loop_prevention.cycle_detection_length)
    }

    /// Pre-dispatch gate: refuse to start another run of a phase whose
    /// visit budget is already spent.
    pub async fn check_visit_budget(
        &self,
        policy_name: &str,
        phase_name: &str,
        issue_id: &str,
        runlog: &RunLog,
    ) -> Result<Option<String>, StoreError> {
        if !self.loop_prevention.enabled {
            return Ok(None);
        }
        let Some(policy) = self.get_policy(policy_name) else {
            return Ok(None);
        };
        let Some(phase) = policy.phase(phase_name) else {
            return Ok(None);
        };

        let max_visits = self.effective_max_visits(policy, phase);
        let visits = runlog.phase_visit_count(issue_id, phase_name).await?;
        if visits >= max_visits {
            return Ok(Some(format!(
                "Phase '{phase_name}' exceeded max_visits ({max_visits})"
            )));
        }
        Ok(None)
    }

    /// Decide what happens after a terminal run of `current_phase`.
    pub async fn determine_transition(
        &self,
        policy_name: &str,
        current_phase: &str,
        outcome: &RunOutcome,
        issue_id: Option<&str>,
        runlog: &RunLog,
    ) -> Result<Transition, StoreError> {
        let Some(policy) = self.get_policy(policy_name) else {
            return Ok(Transition::Block {
                reason: format!("Policy not found: {policy_name}"),
            });
        };
        let Some(phase) = policy.phase(current_phase) else {
            return Ok(Transition::Block {
                reason: format!("Phase not found: {current_phase}"),
            });
        };

        if outcome.requires_approval || phase.require_approval || policy.hitl_required {
            return Ok(Transition::Block {
                reason: "Human approval required".to_string(),
            });
        }

        if !outcome.success {
            let max_attempts = policy.retry.max_attempts;
            // The failed run is already recorded, so prior retries are one
            // less than the stored failure count.
            let retry_count = match issue_id {
                Some(issue_id) => runlog
                    .phase_retry_count(issue_id, current_phase)
                    .await?
                    .saturating_sub(1),
                None => 0,
            };

            if retry_count < max_attempts {
                let attempt = retry_count + 1;
                return Ok(Transition::Retry {
                    attempt,
                    delay_ms: Self::calculate_retry_delay(policy, retry_count),
                    reason: format!("Retry {attempt}/{max_attempts}"),
                });
            }
            return Ok(Transition::Block {
                reason: format!("Max retries exceeded ({max_attempts})"),
            });
        }

        let next = policy.next_phase(current_phase);

        if self.loop_prevention.enabled {
            if let Some(issue_id) = issue_id {
                let max_visits = self.effective_max_visits(policy, phase);
                // The run just recorded counts as one visit; the budget
                // applies to visits before it.
                let visits = runlog
                    .phase_visit_count(issue_id, current_phase)
                    .await?
                    .saturating_sub(1);
                if visits >= max_visits {
                    return Ok(Transition::Block {
                        reason: format!(
                            "Phase '{current_phase}' exceeded max_visits ({max_visits})"
                        ),
                    });
                }

                if let Some(next) = next {
                    let max_transitions =
                        self.effective_max_transitions(policy, current_phase, &next.name);
                    let taken = runlog
                        .transition_count(issue_id, current_phase, &next.name)
                        .await?;
                    if taken >= max_transitions {
                        return Ok(Transition::Block {
                            reason: format!(
                                "Transition {current_phase} -> {} exceeded max_transitions ({max_transitions})",
                                next.name
                            ),
                        });
                    }
                }

                let cycle_length = self.effective_cycle_length(policy);
                let recent = runlog
                    .recent_transitions(issue_id, cycle_length as usize)
                    .await?;
                if is_oscillating(&recent, cycle_length as usize) {
                    return Ok(Transition::Block {
                        reason: "Oscillating cycle detected".to_string(),
                    });
                }
            }
        }

        if let Some(capability) = &phase.dynamic_decision {
            return Ok(Transition::DynamicDecision {
                capability: capability.clone(),
                config: Default::default(),
            });
        }

        match next {
            Some(next) => Ok(Transition::Advance {
                next_phase: next.name.clone(),
            }),
            None => Ok(Transition::Close),
        }
    }

    /// Vet a transition proposed by a dynamic decision agent.
    pub fn validate_dynamic_transition(
        &self,
        policy_name: &str,
        current_phase: &str,
        transition: &Transition,
        registry: &AgentRegistry,
    ) -> Result<(), String> {
        let Some(policy) = self.get_policy(policy_name) else {
            return Err(format!("Policy not found: {policy_name}"));
        };

        match transition {
            Transition::JumpBack { target_phase, .. } => {
                if target_phase == current_phase {
                    return Err(format!(
                        "jump_back target '{target_phase}' is the current phase"
                    ));
                }
                if policy.phase(target_phase).is_none() {
                    return Err(format!(
                        "jump_back target '{target_phase}' is not a phase of '{policy_name}'"
                    ));
                }
                Ok(())
            }
            Transition::DynamicDecision { capability, .. } => {
                if registry.capability_covered(capability) {
                    Ok(())
                } else {
                    Err(format!(
                        "dynamic_decision capability '{capability}' has no active provider"
                    ))
                }
            }
            Transition::Advance { next_phase } => {
                if policy.phase(next_phase).is_none() {
                    return Err(format!(
                        "advance target '{next_phase}' is not a phase of '{policy_name}'"
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// A window of newest-first transitions oscillates when it is full, touches
/// exactly two phases, and every hop flips direction (A->B->A->B...).
fn is_oscillating(recent: &[(String, String)], window: usize) -> bool {
    if window < 2 || recent.len() < window {
        return false;
    }
    let window_slice = &recent[..window];

    let mut phases: Vec<&str> = Vec::new();
    for (from, to) in window_slice {
        for phase in [from.as_str(), to.as_str()] {
            if !phases.contains(&phase) {
                phases.push(phase);
            }
        }
    }
    if phases.len() != 2 {
        return false;
    }

    window_slice.windows(2).all(|pair| {
        let (newer, older) = (&pair[0], &pair[1]);
        // Consecutive hops chain and reverse direction.
        older.1 == newer.0 && newer.0 != newer.1 && older.0 != older.1
    }) && window_slice.iter().all(|(from, to)| from != to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FallbackConfig;
    use crate::registry::AgentConfig;
    use crate::runlog::{
        DecisionType, NewDecision, RunDraft, RunMetrics, RunPatch, RunStatus,
    };

    fn policy_file() -> PolicyFile {
        serde_yaml::from_str(
            r#"
            default_policy: simple
            policies:
              simple:
                retry:
                  max_attempts: 2
                  strategy: fixed
                  initial_delay_ms: 10
                phases:
                  - name: implement
                    capabilities: [code]
                  - name: test
                    capabilities: [test]
                  - name: validate
                    capabilities: [review]
            "#,
        )
        .unwrap()
    }

    fn engine() -> PolicyEngine {
        PolicyEngine::new(
            policy_file(),
            LoopPreventionConfig::default(),
            HitlReasonRules::default(),
        )
    }

    async fn store() -> (tempfile::TempDir, RunLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::open(dir.path()).await.unwrap();
        (dir, log)
    }

    fn ok_outcome() -> RunOutcome {
        RunOutcome {
            success: true,
            metrics: RunMetrics::default(),
            ..Default::default()
        }
    }

    fn failed_outcome() -> RunOutcome {
        RunOutcome {
            success: false,
            ..Default::default()
        }
    }

    async fn record_failure(runlog: &RunLog, issue: &str, phase: &str) {
        let run = runlog
            .create_run(RunDraft {
                issue_id: issue.to_string(),
                agent_id: "build".to_string(),
                policy_name: "simple".to_string(),
                phase: phase.to_string(),
                status: Some(RunStatus::Running),
                ..Default::default()
            })
            .await
            .unwrap();
        runlog
            .update_run(
                &run.id,
                RunPatch {
                    status: Some(RunStatus::Failed),
                    outcome: Some(failed_outcome()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    async fn record_transition(runlog: &RunLog, issue: &str, from: &str, to: &str) {
        runlog
            .log_decision(NewDecision {
                run_id: "run-x".to_string(),
                issue_id: issue.to_string(),
                decision_type: DecisionType::PhaseTransition,
                decision: format!("advance_to_{to}"),
                reasoning: String::new(),
                metadata: serde_json::json!({"from_phase": from, "to_phase": to}),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_policy_blocks() {
        let (_dir, runlog) = store().await;
        let transition = engine()
            .determine_transition("nope", "implement", &ok_outcome(), None, &runlog)
            .await
            .unwrap();
        assert!(
            matches!(transition, Transition::Block { reason } if reason.contains("Policy not found"))
        );
    }

    #[tokio::test]
    async fn unknown_phase_blocks() {
        let (_dir, runlog) = store().await;
        let transition = engine()
            .determine_transition("simple", "deploy", &ok_outcome(), None, &runlog)
            .await
            .unwrap();
        assert!(
            matches!(transition, Transition::Block { reason } if reason.contains("Phase not found"))
        );
    }

    #[tokio::test]
    async fn success_advances_then_closes() {
        let (_dir, runlog) = store().await;
        let engine = engine();

        let transition = engine
            .determine_transition("simple", "implement", &ok_outcome(), None, &runlog)
            .await
            .unwrap();
        assert_eq!(
            transition,
            Transition::Advance {
                next_phase: "test".to_string()
            }
        );

        let transition = engine
            .determine_transition("simple", "validate", &ok_outcome(), None, &runlog)
            .await
            .unwrap();
        assert_eq!(transition, Transition::Close);
    }

    #[tokio::test]
    async fn approval_gate_blocks() {
        let (_dir, runlog) = store().await;
        let outcome = RunOutcome {
            success: true,
            requires_approval: true,
            ..Default::default()
        };
        let transition = engine()
            .determine_transition("simple", "implement", &outcome, None, &runlog)
            .await
            .unwrap();
        assert!(
            matches!(transition, Transition::Block { reason } if reason == "Human approval required")
        );
    }

    #[tokio::test]
    async fn first_failure_retries_with_initial_delay() {
        let (_dir, runlog) = store().await;
        record_failure(&runlog, "I1", "implement").await;

        let transition = engine()
            .determine_transition("simple", "implement", &failed_outcome(), Some("I1"), &runlog)
            .await
            .unwrap();
        assert_eq!(
            transition,
            Transition::Retry {
                attempt: 1,
                delay_ms: 10,
                reason: "Retry 1/2".to_string()
            }
        );
    }

    #[tokio::test]
    async fn last_retry_allowed_then_blocked() {
        let (_dir, runlog) = store().await;
        record_failure(&runlog, "I1", "implement").await;
        record_failure(&runlog, "I1", "implement").await;

        // retry_count = max_attempts - 1: last retry allowed.
        let transition = engine()
            .determine_transition("simple", "implement", &failed_outcome(), Some("I1"), &runlog)
            .await
            .unwrap();
        assert_eq!(
            transition,
            Transition::Retry {
                attempt: 2,
                delay_ms: 10,
                reason: "Retry 2/2".to_string()
            }
        );

        record_failure(&runlog, "I1", "implement").await;

        // retry_count = max_attempts: blocked.
        let transition = engine()
            .determine_transition("simple", "implement", &failed_outcome(), Some("I1"), &runlog)
            .await
            .unwrap();
        assert!(
            matches!(transition, Transition::Block { reason } if reason == "Max retries exceeded (2)")
        );
    }

    #[tokio::test]
    async fn retry_delay_strategies() {
        let mut policy = policy_file().policies.remove("simple").unwrap();

        policy.retry.strategy = RetryStrategy::Fixed;
        policy.retry.initial_delay_ms = 100;
        policy.retry.max_delay_ms = 10_000;
        assert_eq!(PolicyEngine::calculate_retry_delay(&policy, 0), 100);
        assert_eq!(PolicyEngine::calculate_retry_delay(&policy, 3), 100);

        policy.retry.strategy = RetryStrategy::Linear;
        assert_eq!(PolicyEngine::calculate_retry_delay(&policy, 0), 100);
        assert_eq!(PolicyEngine::calculate_retry_delay(&policy, 2), 300);

        policy.retry.strategy = RetryStrategy::Exponential;
        assert_eq!(PolicyEngine::calculate_retry_delay(&policy, 0), 100);
        assert_eq!(PolicyEngine::calculate_retry_delay(&policy, 3), 800);
        // Capped.
        assert_eq!(PolicyEngine::calculate_retry_delay(&policy, 10), 10_000);
    }

    #[tokio::test]
    async fn max_visits_blocks() {
        let (_dir, runlog) = store().await;
        let engine = engine();
        // Default max_visits is 5; the sixth recorded run has five prior
        // visits behind it.
        for _ in 0..6 {
            let run = runlog
                .create_run(RunDraft {
                    issue_id: "I1".to_string(),
                    agent_id: "build".to_string(),
                    policy_name: "simple".to_string(),
                    phase: "implement".to_string(),
                    status: Some(RunStatus::Completed),
                    ..Default::default()
                })
                .await
                .unwrap();
            drop(run);
        }

        let transition = engine
            .determine_transition("simple", "implement", &ok_outcome(), Some("I1"), &runlog)
            .await
            .unwrap();
        assert!(
            matches!(&transition, Transition::Block { reason } if reason.contains("max_visits"))
        );

        let precheck = engine
            .check_visit_budget("simple", "implement", "I1", &runlog)
            .await
            .unwrap();
        assert!(precheck.is_some());
    }

    #[tokio::test]
    async fn max_transitions_blocks() {
        let (_dir, runlog) = store().await;
        for _ in 0..3 {
            record_transition(&runlog, "I1", "implement", "test").await;
        }

        let transition = engine()
            .determine_transition("simple", "implement", &ok_outcome(), Some("I1"), &runlog)
            .await
            .unwrap();
        assert!(
            matches!(&transition, Transition::Block { reason } if reason.contains("max_transitions"))
        );
    }

    #[tokio::test]
    async fn oscillation_blocks() {
        let (_dir, runlog) = store().await;
        // Raise the per-pair cap so the oscillation check is what fires.
        let mut file = policy_file();
        file.policies.get_mut("simple").unwrap().loop_prevention =
            Some(crate::policy::LoopPreventionOverride {
                max_transitions_default: Some(50),
                ..Default::default()
            });
        let engine = PolicyEngine::new(
            file,
            LoopPreventionConfig::default(),
            HitlReasonRules::default(),
        );

        // A->B->A->B->A->B as seen newest-first after six hops.
        for _ in 0..3 {
            record_transition(&runlog, "I1", "implement", "test").await;
            record_transition(&runlog, "I1", "test", "implement").await;
        }

        let transition = engine
            .determine_transition("simple", "implement", &ok_outcome(), Some("I1"), &runlog)
            .await
            .unwrap();
        assert!(
            matches!(&transition, Transition::Block { reason } if reason.contains("Oscillating"))
        );
    }

    #[tokio::test]
    async fn forward_progress_is_not_oscillation() {
        let (_dir, runlog) = store().await;
        record_transition(&runlog, "I1", "implement", "test").await;
        record_transition(&runlog, "I1", "test", "validate").await;

        let transition = engine()
            .determine_transition("simple", "implement", &ok_outcome(), Some("I1"), &runlog)
            .await
            .unwrap();
        assert!(matches!(transition, Transition::Advance { .. }));
    }

    #[test]
    fn oscillation_window_must_be_full() {
        let hops = vec![
            ("a".to_string(), "b".to_string()),
            ("b".to_string(), "a".to_string()),
        ];
        assert!(!is_oscillating(&hops, 6));
        assert!(is_oscillating(&hops, 2));
    }

    #[test]
    fn dynamic_transition_validation() {
        let engine = engine();
        let registry = AgentRegistry::new(
            vec![AgentConfig {
                id: "decider".to_string(),
                name: "decider".to_string(),
                capabilities: vec!["triage".to_string()],
                priority: 0,
                constraints: None,
                active: true,
            }],
            FallbackConfig::default(),
        );

        assert!(engine
            .validate_dynamic_transition(
                "simple",
                "test",
                &Transition::JumpBack {
                    target_phase: "implement".to_string(),
                    reason: String::new()
                },
                &registry
            )
            .is_ok());

        assert!(engine
            .validate_dynamic_transition(
                "simple",
                "test",
                &Transition::JumpBack {
                    target_phase: "test".to_string(),
                    reason: String::new()
                },
                &registry
            )
            .is_err());

        assert!(engine
            .validate_dynamic_transition(
                "simple",
                "test",
                &Transition::JumpBack {
                    target_phase: "deploy".to_string(),
                    reason: String::new()
                },
                &registry
            )
            .is_err());

        assert!(engine
            .validate_dynamic_transition(
                "simple",
                "test",
                &Transition::DynamicDecision {
                    capability: "triage".to_string(),
                    config: Default::default()
                },
                &registry
            )
            .is_ok());

        assert!(engine
            .validate_dynamic_transition(
                "simple",
                "test",
                &Transition::DynamicDecision {
                    capability: "security-review".to_string(),
                    config: Default::default()
                },
                &registry
            )
            .is_err());
    }
}
