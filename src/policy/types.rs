use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Contents of `policies.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyFile {
    /// Policy assigned to issues that do not name one.
    pub default_policy: String,

    #[serde(default)]
    pub policies: HashMap<String, PolicyConfig>,
}

/// A named workflow: ordered phases plus the knobs that govern how an issue
/// moves through them. Immutable at runtime; reloaded from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub description: Option<String>,

    pub phases: Vec<PhaseConfig>,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Base wall-clock budget per phase, scaled by the phase multiplier.
    #[serde(default = "default_timeout_base_ms")]
    pub timeout_base_ms: u64,

    /// Stall threshold for live runs; falls back to the monitor default.
    #[serde(default)]
    pub stall_threshold_ms: Option<u64>,

    /// One agent session shared across phases of the same issue.
    #[serde(default)]
    pub shared_session: bool,

    /// Every phase of this policy requires human approval before advancing.
    #[serde(default)]
    pub hitl_required: bool,

    #[serde(default)]
    pub worker_assistant: Option<WorkerAssistantOverride>,

    #[serde(default)]
    pub loop_prevention: Option<LoopPreventionOverride>,

    /// Explicit caps on named (from -> to) transitions.
    #[serde(default)]
    pub max_transitions: Vec<TransitionLimit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Capability tags an agent must advertise to run this phase.
    #[serde(default)]
    pub capabilities: Vec<String>,

    #[serde(default = "default_timeout_multiplier")]
    pub timeout_multiplier: f64,

    /// Block for human approval after a successful run of this phase.
    #[serde(default)]
    pub require_approval: bool,

    /// Template name overriding the generic phase prompt.
    #[serde(default)]
    pub custom_prompt: Option<String>,

    /// Explicit phase name or one of `@self`, `@previous`, `@first`,
    /// `@shared`.
    #[serde(default)]
    pub reuse_session_from_phase: Option<String>,

    /// Fraction of the context window that may be consumed before a reused
    /// session is abandoned (0..=1).
    #[serde(default)]
    pub context_window_threshold: Option<f64>,

    #[serde(default)]
    pub max_context_tokens: Option<u64>,

    #[serde(default)]
    pub max_visits: Option<u32>,

    /// Capability consulted to route the issue after this phase succeeds,
    /// instead of the implicit next phase.
    #[serde(default)]
    pub dynamic_decision: Option<String>,

    #[serde(default)]
    pub worker_assistant: Option<WorkerAssistantOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionLimit {
    pub from: String,
    pub to: String,
    pub max: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    Fixed,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_strategy")]
    pub strategy: RetryStrategy,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            strategy: default_retry_strategy(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Policy- or phase-level worker assistant override. Phase beats policy,
/// policy beats global config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerAssistantOverride {
    #[serde(default)]
    pub enabled: Option<bool>,

    #[serde(default, rename = "agentCapability")]
    pub agent_capability: Option<String>,

    #[serde(default, rename = "timeoutMs")]
    pub timeout_ms: Option<u64>,

    #[serde(default, rename = "fallbackAction")]
    pub fallback_action: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopPreventionOverride {
    #[serde(default)]
    pub max_visits_default: Option<u32>,

    #[serde(default)]
    pub max_transitions_default: Option<u32>,

    #[serde(default)]
    pub cycle_detection_length: Option<u32>,
}

fn default_timeout_base_ms() -> u64 {
    600_000
}

fn default_timeout_multiplier() -> f64 {
    1.0
}

fn default_max_attempts() -> u32 {
    2
}

fn default_retry_strategy() -> RetryStrategy {
    RetryStrategy::Exponential
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

/// Extra instructions carried into a dynamic decision prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionConfig {
    #[serde(default)]
    pub prompt_template: Option<String>,

    /// Destinations the deciding agent may advance or jump to. Empty means
    /// every phase of the policy is allowed.
    #[serde(default)]
    pub allowed_destinations: Vec<String>,
}

/// The policy engine's verdict on what happens to an issue next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transition {
    Advance {
        next_phase: String,
    },
    Retry {
        /// 1-based attempt number about to run.
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    JumpBack {
        target_phase: String,
        reason: String,
    },
    DynamicDecision {
        capability: String,
        #[serde(default)]
        config: DecisionConfig,
    },
    Block {
        reason: String,
    },
    Close,
}

impl Transition {
    /// Short decision string recorded in the run log.
    pub fn decision_label(&self) -> String {
        match self {
            Transition::Advance { next_phase } => format!("advance_to_{next_phase}"),
            Transition::Retry { attempt, .. } => format!("retry_{attempt}"),
            Transition::JumpBack { target_phase, .. } => format!("jump_to_{target_phase}"),
            Transition::DynamicDecision { capability, .. } => {
                format!("dynamic_decision_{capability}")
            }
            Transition::Block { .. } => "block".to_string(),
            Transition::Close => "close".to_string(),
        }
    }
}

impl PolicyConfig {
    pub fn phase(&self, name: &str) -> Option<&PhaseConfig> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn phase_names(&self) -> Vec<String> {
        self.phases.iter().map(|p| p.name.clone()).collect()
    }

    pub fn first_phase(&self) -> Option<&PhaseConfig> {
        self.phases.first()
    }

    /// Phase that follows `name` in declaration order.
    pub fn next_phase(&self, name: &str) -> Option<&PhaseConfig> {
        let idx = self.phases.iter().position(|p| p.name == name)?;
        self.phases.get(idx + 1)
    }

    /// Phase that precedes `name` in declaration order.
    pub fn previous_phase(&self, name: &str) -> Option<&PhaseConfig> {
        let idx = self.phases.iter().position(|p| p.name == name)?;
        idx.checked_sub(1).and_then(|i| self.phases.get(i))
    }

    pub fn transition_limit(&self, from: &str, to: &str) -> Option<u32> {
        self.max_transitions
            .iter()
            .find(|t| t.from == from && t.to == to)
            .map(|t| t.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PolicyConfig {
        serde_yaml::from_str(
            r#"
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

    #[test]
    fn phase_ordering() {
        let policy = sample();
        assert_eq!(policy.first_phase().unwrap().name, "implement");
        assert_eq!(policy.next_phase("implement").unwrap().name, "test");
        assert_eq!(policy.next_phase("test").unwrap().name, "validate");
        assert!(policy.next_phase("validate").is_none());
        assert_eq!(policy.previous_phase("test").unwrap().name, "implement");
        assert!(policy.previous_phase("implement").is_none());
    }

    #[test]
    fn retry_defaults() {
        let policy = sample();
        assert_eq!(policy.retry.max_attempts, 2);
        assert_eq!(policy.retry.strategy, RetryStrategy::Exponential);
        assert_eq!(policy.retry.initial_delay_ms, 1_000);
    }

    #[test]
    fn transition_labels() {
        assert_eq!(
            Transition::Advance {
                next_phase: "test".into()
            }
            .decision_label(),
            "advance_to_test"
        );
        assert_eq!(Transition::Close.decision_label(), "close");
        assert_eq!(
            Transition::Block {
                reason: "x".into()
            }
            .decision_label(),
            "block"
        );
    }

    #[test]
    fn explicit_transition_limits() {
        let policy: PolicyConfig = serde_yaml::from_str(
            r#"
            phases:
              - name: implement
              - name: test
            max_transitions:
              - from: test
                to: implement
                max: 3
            "#,
        )
        .unwrap();
        assert_eq!(policy.transition_limit("test", "implement"), Some(3));
        assert_eq!(policy.transition_limit("implement", "test"), None);
    }

    #[test]
    fn worker_assistant_override_wire_names() {
        let ov: WorkerAssistantOverride = serde_yaml::from_str(
            r#"
            enabled: true
            agentCapability: triage
            timeoutMs: 30000
            fallbackAction: block
            "#,
        )
        .unwrap();
        assert_eq!(ov.enabled, Some(true));
        assert_eq!(ov.agent_capability.as_deref(), Some("triage"));
        assert_eq!(ov.timeout_ms, Some(30_000));
        assert_eq!(ov.fallback_action.as_deref(), Some("block"));
    }
}
