use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::policy::HitlReasonRules;
use crate::retention::RetentionPolicy;

/// Engine configuration (`config.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AshepConfig {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub ui: UiConfig,

    #[serde(default)]
    pub fallback: FallbackConfig,

    #[serde(default)]
    pub workflow: WorkflowConfig,

    #[serde(default)]
    pub hitl: HitlConfig,

    #[serde(default)]
    pub worker_assistant: WorkerAssistantConfig,

    #[serde(default)]
    pub loop_prevention: LoopPreventionConfig,

    #[serde(default)]
    pub session_continuation: SessionContinuationConfig,

    #[serde(default)]
    pub cleanup: CleanupConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub tracker: TrackerConfig,

    #[serde(default)]
    pub agent: AgentCliConfig,
}

impl Default for AshepConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            worker: WorkerConfig::default(),
            monitor: MonitorConfig::default(),
            ui: UiConfig::default(),
            fallback: FallbackConfig::default(),
            workflow: WorkflowConfig::default(),
            hitl: HitlConfig::default(),
            worker_assistant: WorkerAssistantConfig::default(),
            loop_prevention: LoopPreventionConfig::default(),
            session_continuation: SessionContinuationConfig::default(),
            cleanup: CleanupConfig::default(),
            retention: RetentionConfig::default(),
            tracker: TrackerConfig::default(),
            agent: AgentCliConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_poll_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_worker_poll_ms(),
            max_concurrent_runs: default_max_concurrent_runs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_poll_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_stall_threshold_ms")]
    pub stall_threshold_ms: u64,

    #[serde(default = "default_timeout_multiplier")]
    pub timeout_multiplier: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_monitor_poll_ms(),
            stall_threshold_ms: default_stall_threshold_ms(),
            timeout_multiplier: default_timeout_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiConfig {
    #[serde(default = "default_ui_port")]
    pub port: u16,

    #[serde(default = "default_ui_host")]
    pub host: String,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            port: default_ui_port(),
            host: default_ui_host(),
        }
    }
}

/// Fallback agent used when no registered agent covers a capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub default_agent: Option<String>,

    /// Capability -> agent id overrides consulted before the default agent.
    #[serde(default)]
    pub mappings: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InvalidLabelStrategy {
    #[default]
    Error,
    Warning,
    Ignore,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub invalid_label_strategy: InvalidLabelStrategy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HitlConfig {
    #[serde(default)]
    pub allowed_reasons: HitlReasonRules,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FallbackAction {
    Advance,
    Retry,
    #[default]
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerAssistantConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_assistant_capability", rename = "agentCapability")]
    pub agent_capability: String,

    #[serde(default = "default_assistant_timeout_ms", rename = "timeoutMs")]
    pub timeout_ms: u64,

    #[serde(default, rename = "fallbackAction")]
    pub fallback_action: FallbackAction,
}

impl Default for WorkerAssistantConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            agent_capability: default_assistant_capability(),
            timeout_ms: default_assistant_timeout_ms(),
            fallback_action: FallbackAction::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopPreventionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_max_visits")]
    pub max_visits_default: u32,

    #[serde(default = "default_max_transitions")]
    pub max_transitions_default: u32,

    #[serde(default = "default_cycle_length")]
    pub cycle_detection_length: u32,
}

impl Default for LoopPreventionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_visits_default: default_max_visits(),
            max_transitions_default: default_max_transitions(),
            cycle_detection_length: default_cycle_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContinuationConfig {
    #[serde(default = "default_max_context_tokens")]
    pub default_max_context_tokens: u64,

    #[serde(default = "default_context_threshold")]
    pub default_threshold: f64,
}

impl Default for SessionContinuationConfig {
    fn default() -> Self {
        Self {
            default_max_context_tokens: default_max_context_tokens(),
            default_threshold: default_context_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub run_on_startup: bool,

    #[serde(default = "default_cleanup_interval_hours")]
    pub schedule_interval_hours: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            run_on_startup: false,
            schedule_interval_hours: default_cleanup_interval_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub policies: Vec<RetentionPolicy>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            policies: Vec::new(),
        }
    }
}

/// External issue tracker binary invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_tracker_bin")]
    pub bin: String,

    /// Extra arguments prepended to every tracker invocation.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            bin: default_tracker_bin(),
            args: Vec::new(),
        }
    }
}

/// Agent provider CLI invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCliConfig {
    #[serde(default = "default_agent_bin")]
    pub bin: String,
}

impl Default for AgentCliConfig {
    fn default() -> Self {
        Self {
            bin: default_agent_bin(),
        }
    }
}

fn default_version() -> u32 {
    1
}

fn default_worker_poll_ms() -> u64 {
    5_000
}

fn default_max_concurrent_runs() -> usize {
    2
}

fn default_monitor_poll_ms() -> u64 {
    10_000
}

fn default_stall_threshold_ms() -> u64 {
    120_000
}

fn default_timeout_multiplier() -> f64 {
    1.5
}

fn default_ui_port() -> u16 {
    8787
}

fn default_ui_host() -> String {
    "127.0.0.1".to_string()
}

fn default_assistant_capability() -> String {
    "worker-assistant".to_string()
}

fn default_assistant_timeout_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

fn default_max_visits() -> u32 {
    5
}

fn default_max_transitions() -> u32 {
    3
}

fn default_cycle_length() -> u32 {
    6
}

fn default_max_context_tokens() -> u64 {
    130_000
}

fn default_context_threshold() -> f64 {
    0.8
}

fn default_cleanup_interval_hours() -> u64 {
    24
}

fn default_tracker_bin() -> String {
    "bd".to_string()
}

fn default_agent_bin() -> String {
    "opencode".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_gets_defaults() {
        let config: AshepConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.version, 1);
        assert_eq!(config.worker.max_concurrent_runs, 2);
        assert_eq!(config.monitor.stall_threshold_ms, 120_000);
        assert!(config.loop_prevention.enabled);
        assert_eq!(config.loop_prevention.cycle_detection_length, 6);
        assert_eq!(config.session_continuation.default_max_context_tokens, 130_000);
        assert!((config.session_continuation.default_threshold - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.worker_assistant.fallback_action, FallbackAction::Block);
    }

    #[test]
    fn worker_assistant_wire_names() {
        let config: AshepConfig = serde_yaml::from_str(
            r#"
            worker_assistant:
              enabled: true
              agentCapability: shepherd-assist
              timeoutMs: 45000
              fallbackAction: retry
            "#,
        )
        .unwrap();
        assert!(config.worker_assistant.enabled);
        assert_eq!(config.worker_assistant.agent_capability, "shepherd-assist");
        assert_eq!(config.worker_assistant.timeout_ms, 45_000);
        assert_eq!(config.worker_assistant.fallback_action, FallbackAction::Retry);
    }

    #[test]
    fn invalid_label_strategy_values() {
        for (raw, expected) in [
            ("error", InvalidLabelStrategy::Error),
            ("warning", InvalidLabelStrategy::Warning),
            ("ignore", InvalidLabelStrategy::Ignore),
        ] {
            let config: AshepConfig = serde_yaml::from_str(&format!(
                "workflow:\n  invalid_label_strategy: {raw}\n"
            ))
            .unwrap();
            assert_eq!(config.workflow.invalid_label_strategy, expected);
        }
    }
}
