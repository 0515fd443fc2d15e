//! Offline policy-capability-agent integrity validation.
//!
//! Runs at startup and on demand: every capability a policy phase names
//! must resolve to an active agent (or the fallback), the phase graph must
//! be acyclic in the advance direction, and inactive agents are surfaced.
//! Errors are fatal at startup unless the caller opted into soft mode.

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use std::collections::BTreeSet;

use crate::policy::PolicyEngine;
use crate::registry::AgentRegistry;

#[derive(Debug, Default, Clone)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub policies_checked: usize,
    pub capabilities_checked: usize,
    pub dead_end_capabilities: Vec<String>,
    pub inactive_agents: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} policies, {} capabilities checked: {} error(s), {} warning(s)",
            self.policies_checked,
            self.capabilities_checked,
            self.errors.len(),
            self.warnings.len()
        )
    }
}

/// Validate every enabled policy against the agent catalogue.
pub fn validate(policies: &PolicyEngine, registry: &AgentRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut capabilities_seen: BTreeSet<String> = BTreeSet::new();
    let mut dead_ends: BTreeSet<String> = BTreeSet::new();

    for policy_name in policies.policy_names() {
        let Some(policy) = policies.get_policy(&policy_name) else {
            continue;
        };
        report.policies_checked += 1;

        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut nodes = Vec::new();
        for phase in &policy.phases {
            nodes.push(graph.add_node(phase.name.as_str()));
        }
        for window in nodes.windows(2) {
            graph.add_edge(window[0], window[1], ());
        }
        if is_cyclic_directed(&graph) {
            report.errors.push(format!(
                "policy '{policy_name}': phase graph has a cycle in the advance direction"
            ));
        }

        for phase in &policy.phases {
            let mut required: Vec<&String> = phase.capabilities.iter().collect();
            if let Some(capability) = &phase.dynamic_decision {
                required.push(capability);
            }

            for capability in required {
                capabilities_seen.insert(capability.clone());
                if !registry.capability_covered(capability) {
                    dead_ends.insert(capability.clone());
                    report.errors.push(format!(
                        "capability '{capability}' (policy '{policy_name}', phase '{}') has no \
                         active provider; add an agent advertising it or enable a fallback",
                        phase.name
                    ));
                }
            }
        }
    }

    for agent in registry.all_agents() {
        if !agent.active {
            report.warnings.push(format!("agent '{}' is inactive", agent.id));
            report.inactive_agents.push(agent.id);
        }
    }

    report.capabilities_checked = capabilities_seen.len();
    report.dead_end_capabilities = dead_ends.into_iter().collect();
    report
}
