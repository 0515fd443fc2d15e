//! File loading for the three configuration documents.

use std::path::{Path, PathBuf};

use crate::error::{AshepError, Result};
use crate::policy::PolicyFile;
use crate::registry::AgentsFile;

use super::types::AshepConfig;

/// Resolved filesystem layout for configuration and durable state.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    /// Root holding `config/` with the three YAML documents.
    pub config_dir: PathBuf,
    /// Root for `runs.db`, append logs, and archives.
    pub data_dir: PathBuf,
}

impl ConfigPaths {
    pub fn new(config_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            data_dir: data_dir.into(),
        }
    }

    /// Default layout under `~/.ashep`.
    pub fn resolve_default() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| AshepError::Config("cannot determine home directory".into()))?;
        let root = home.join(".ashep");
        Ok(Self {
            config_dir: root.clone(),
            data_dir: root.join("data"),
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config").join("config.yaml")
    }

    pub fn policies_file(&self) -> PathBuf {
        self.config_dir.join("config").join("policies.yaml")
    }

    pub fn agents_file(&self) -> PathBuf {
        self.config_dir.join("config").join("agents.yaml")
    }
}

/// Strict fails startup on any validation problem; soft logs warnings and
/// keeps going with whatever parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Strict,
    Soft,
}

/// Load `config.yaml`, falling back to built-in defaults when absent.
pub fn load_config(paths: &ConfigPaths, mode: LoadMode) -> Result<AshepConfig> {
    let path = paths.config_file();
    if !path.exists() {
        tracing::info!("No config.yaml at {}, using defaults", path.display());
        return Ok(AshepConfig::default());
    }

    let config: AshepConfig = read_yaml(&path)?;
    let problems = validate_config(&config);
    report(problems, mode, &path)?;
    Ok(config)
}

/// Load `policies.yaml`. Required: the engine cannot dispatch without at
/// least one policy.
pub fn load_policies(paths: &ConfigPaths, mode: LoadMode) -> Result<PolicyFile> {
    let path = paths.policies_file();
    if !path.exists() {
        return Err(AshepError::Config(format!(
            "policies.yaml not found at {}",
            path.display()
        )));
    }

    let file: PolicyFile = read_yaml(&path)?;
    let problems = validate_policies(&file);
    report(problems, mode, &path)?;
    Ok(file)
}

/// Load `agents.yaml`. Required.
pub fn load_agents(paths: &ConfigPaths, mode: LoadMode) -> Result<AgentsFile> {
    let path = paths.agents_file();
    if !path.exists() {
        return Err(AshepError::Config(format!(
            "agents.yaml not found at {}",
            path.display()
        )));
    }

    let file: AgentsFile = read_yaml(&path)?;
    let problems = validate_agents(&file);
    report(problems, mode, &path)?;
    Ok(file)
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&content)
        .map_err(|e| AshepError::Config(format!("{}: {}", path.display(), e)))
}

fn report(problems: Vec<String>, mode: LoadMode, path: &Path) -> Result<()> {
    if problems.is_empty() {
        return Ok(());
    }
    match mode {
        LoadMode::Strict => Err(AshepError::Config(format!(
            "{}: {}",
            path.display(),
            problems.join("; ")
        ))),
        LoadMode::Soft => {
            for problem in problems {
                tracing::warn!("{}: {}", path.display(), problem);
            }
            Ok(())
        }
    }
}

fn validate_config(config: &AshepConfig) -> Vec<String> {
    let mut problems = Vec::new();

    if config.worker.max_concurrent_runs == 0 {
        problems.push("worker.max_concurrent_runs must be at least 1".to_string());
    }
    if config.worker.poll_interval_ms == 0 {
        problems.push("worker.poll_interval_ms must be positive".to_string());
    }
    if config.monitor.timeout_multiplier <= 0.0 {
        problems.push("monitor.timeout_multiplier must be positive".to_string());
    }
    let threshold = config.session_continuation.default_threshold;
    if !(0.0..=1.0).contains(&threshold) {
        problems.push(format!(
            "session_continuation.default_threshold must be in 0..=1, got {threshold}"
        ));
    }
    if config.fallback.enabled && config.fallback.default_agent.is_none() {
        problems.push("fallback.enabled requires fallback.default_agent".to_string());
    }
    if config.loop_prevention.cycle_detection_length < 2 {
        problems.push("loop_prevention.cycle_detection_length must be at least 2".to_string());
    }

    problems
}

fn validate_policies(file: &PolicyFile) -> Vec<String> {
    let mut problems = Vec::new();

    if !file.policies.contains_key(&file.default_policy) {
        problems.push(format!(
            "default_policy '{}' is not defined",
            file.default_policy
        ));
    }

    for (name, policy) in &file.policies {
        if policy.phases.is_empty() {
            problems.push(format!("policy '{name}' has no phases"));
        }
        let mut seen = std::collections::HashSet::new();
        for phase in &policy.phases {
            if !seen.insert(phase.name.as_str()) {
                problems.push(format!(
                    "policy '{name}' declares phase '{}' more than once",
                    phase.name
                ));
            }
            if let Some(threshold) = phase.context_window_threshold {
                if !(0.0..=1.0).contains(&threshold) {
                    problems.push(format!(
                        "policy '{name}' phase '{}': context_window_threshold out of range",
                        phase.name
                    ));
                }
            }
            if phase.timeout_multiplier <= 0.0 {
                problems.push(format!(
                    "policy '{name}' phase '{}': timeout_multiplier must be positive",
                    phase.name
                ));
            }
            if let Some(reuse) = &phase.reuse_session_from_phase {
                let keyword = matches!(reuse.as_str(), "@self" | "@previous" | "@first" | "@shared");
                if !keyword && policy.phase(reuse).is_none() {
                    problems.push(format!(
                        "policy '{name}' phase '{}': reuse_session_from_phase '{reuse}' names no phase",
                        phase.name
                    ));
                }
            }
        }
        if policy.retry.max_attempts == 0 {
            problems.push(format!("policy '{name}': retry.max_attempts must be at least 1"));
        }
        for limit in &policy.max_transitions {
            if policy.phase(&limit.from).is_none() || policy.phase(&limit.to).is_none() {
                problems.push(format!(
                    "policy '{name}': max_transitions names unknown phase ({} -> {})",
                    limit.from, limit.to
                ));
            }
        }
    }

    problems
}

fn validate_agents(file: &AgentsFile) -> Vec<String> {
    let mut problems = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for agent in &file.agents {
        if !seen.insert(agent.id.as_str()) {
            problems.push(format!("duplicate agent id '{}'", agent.id));
        }
        if agent.capabilities.is_empty() {
            problems.push(format!("agent '{}' advertises no capabilities", agent.id));
        }
    }
    problems
}
