//! Configuration management.
//!
//! Three files live under `<config_dir>/config/`: `config.yaml` (engine
//! tuning), `policies.yaml` (workflow policies), `agents.yaml` (agent
//! catalogue). Loading is strict by default; soft mode downgrades validation
//! failures to warnings.

pub mod loader;
pub mod types;

pub use loader::{load_agents, load_config, load_policies, ConfigPaths, LoadMode};
pub use types::{
    AgentCliConfig, AshepConfig, CleanupConfig, FallbackAction, FallbackConfig, HitlConfig,
    InvalidLabelStrategy, LoopPreventionConfig, MonitorConfig, RetentionConfig,
    SessionContinuationConfig, TrackerConfig, UiConfig, WorkerAssistantConfig, WorkerConfig,
    WorkflowConfig,
};
