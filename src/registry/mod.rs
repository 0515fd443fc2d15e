//! Agent registry and capability-based selection.
//!
//! Capabilities are the sole binding between policy phases and agents: a
//! phase names the tags it needs, and the registry returns the
//! highest-priority active agent advertising all of them. The registry is
//! read-mostly after load; reloads replace the whole catalogue atomically.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::agent::KnownAgent;
use crate::config::FallbackConfig;

/// Contents of `agents.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentsFile {
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConstraints {
    #[serde(default)]
    pub performance_tier: Option<String>,

    #[serde(default)]
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Higher wins during selection.
    #[serde(default)]
    pub priority: i64,

    #[serde(default)]
    pub constraints: Option<AgentConstraints>,

    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl AgentConfig {
    pub fn covers(&self, required: &[String]) -> bool {
        required
            .iter()
            .all(|cap| self.capabilities.iter().any(|c| c == cap))
    }

    fn satisfies(&self, constraints: &AgentConstraints) -> bool {
        if let Some(tier) = &constraints.performance_tier {
            let agent_tier = self
                .constraints
                .as_ref()
                .and_then(|c| c.performance_tier.as_ref());
            if agent_tier != Some(tier) {
                return false;
            }
        }
        constraints.domains.iter().all(|domain| {
            self.constraints
                .as_ref()
                .map(|c| c.domains.iter().any(|d| d == domain))
                .unwrap_or(false)
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct SelectionRequest {
    pub required_capabilities: Vec<String>,
    pub constraints: Option<AgentConstraints>,
}

/// Counts from a gateway sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: usize,
    pub updated: usize,
    pub deactivated: usize,
}

pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentConfig>>,
    fallback: FallbackConfig,
}

impl AgentRegistry {
    pub fn new(agents: Vec<AgentConfig>, fallback: FallbackConfig) -> Self {
        let map = agents.into_iter().map(|a| (a.id.clone(), a)).collect();
        Self {
            agents: RwLock::new(map),
            fallback,
        }
    }

    pub fn load_agents(&self, agents: Vec<AgentConfig>) {
        let map = agents.into_iter().map(|a| (a.id.clone(), a)).collect();
        *self.agents.write().unwrap() = map;
    }

    pub fn get_agent(&self, id: &str) -> Option<AgentConfig> {
        self.agents.read().unwrap().get(id).cloned()
    }

    pub fn all_agents(&self) -> Vec<AgentConfig> {
        let mut agents: Vec<_> = self.agents.read().unwrap().values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub fn active_agents(&self) -> Vec<AgentConfig> {
        self.all_agents().into_iter().filter(|a| a.active).collect()
    }

    /// Every active agent whose capability set covers `required`.
    pub fn find_by_capabilities(&self, required: &[String]) -> Vec<AgentConfig> {
        self.active_agents()
            .into_iter()
            .filter(|a| a.covers(required))
            .collect()
    }

    /// Highest-priority active match; ties break on lexicographic id. Falls
    /// back to the configured mapping or default agent when enabled.
    pub fn select_agent(&self, request: &SelectionRequest) -> Option<AgentConfig> {
        let mut candidates = self.find_by_capabilities(&request.required_capabilities);
        if let Some(constraints) = &request.constraints {
            candidates.retain(|a| a.satisfies(constraints));
        }

        // all_agents sorts by id, so max_by_key on priority keeps the
        // lexicographically smallest id among equals.
        let best = candidates
            .into_iter()
            .rev()
            .max_by_key(|a| a.priority);
        if best.is_some() {
            return best;
        }

        self.fallback_for(&request.required_capabilities)
    }

    fn fallback_for(&self, required: &[String]) -> Option<AgentConfig> {
        if !self.fallback.enabled {
            return None;
        }
        for capability in required {
            if let Some(id) = self.fallback.mappings.get(capability) {
                if let Some(agent) = self.get_agent(id).filter(|a| a.active) {
                    return Some(agent);
                }
            }
        }
        self.fallback
            .default_agent
            .as_ref()
            .and_then(|id| self.get_agent(id))
            .filter(|a| a.active)
    }

    /// Whether `capability` resolves to at least one active provider,
    /// counting the fallback path.
    pub fn capability_covered(&self, capability: &str) -> bool {
        let required = [capability.to_string()];
        !self.find_by_capabilities(&required).is_empty()
            || self.fallback_for(&required).is_some()
    }

    /// Reconcile the catalogue against what the provider CLI reports.
    ///
    /// Unknown agents are added (advertising their own id as capability),
    /// known ones are reactivated if needed, and registry agents the
    /// gateway no longer lists are marked inactive. History is never erased.
    pub fn sync_with_gateway(&self, known: &[KnownAgent]) -> SyncReport {
        let mut agents = self.agents.write().unwrap();
        let mut report = SyncReport::default();

        for known_agent in known {
            match agents.get_mut(&known_agent.id) {
                Some(existing) => {
                    if !existing.active {
                        existing.active = true;
                        report.updated += 1;
                    }
                }
                None => {
                    agents.insert(
                        known_agent.id.clone(),
                        AgentConfig {
                            id: known_agent.id.clone(),
                            name: known_agent.id.clone(),
                            capabilities: vec![known_agent.id.clone()],
                            priority: 0,
                            constraints: None,
                            active: true,
                        },
                    );
                    report.added += 1;
                }
            }
        }

        let known_ids: std::collections::HashSet<&str> =
            known.iter().map(|a| a.id.as_str()).collect();
        for agent in agents.values_mut() {
            if agent.active && !known_ids.contains(agent.id.as_str()) {
                agent.active = false;
                report.deactivated += 1;
            }
        }

        tracing::info!(
            "Agent sync: {} added, {} updated, {} deactivated",
            report.added,
            report.updated,
            report.deactivated
        );
        report
    }
}
