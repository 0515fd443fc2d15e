//! Worker assistant: a second opinion after every phase outcome.
//!
//! When enabled, a capability-selected agent reviews the run outcome and
//! answers advance, retry, or block. Opt-out has three levels: phase
//! overrides policy overrides global config. Parse failures and timeouts
//! fall back to the configured action.

use serde_json::json;
use std::time::Duration;

use crate::app::EngineContext;
use crate::config::{FallbackAction, WorkerAssistantConfig};
use crate::error::Result;
use crate::policy::{PhaseConfig, PolicyConfig, WorkerAssistantOverride};
use crate::prompt::{validate_response, DecisionResponse};
use crate::registry::SelectionRequest;
use crate::runlog::{DecisionType, NewDecision, RunOutcome};
use crate::tracker::Issue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssistantAction {
    Advance,
    Retry,
    Block,
}

impl AssistantAction {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "advance" => Some(AssistantAction::Advance),
            "retry" => Some(AssistantAction::Retry),
            "block" => Some(AssistantAction::Block),
            _ => None,
        }
    }

    fn from_fallback(action: FallbackAction) -> Self {
        match action {
            FallbackAction::Advance => AssistantAction::Advance,
            FallbackAction::Retry => AssistantAction::Retry,
            FallbackAction::Block => AssistantAction::Block,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AssistantAction::Advance => "advance",
            AssistantAction::Retry => "retry",
            AssistantAction::Block => "block",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EffectiveAssistant {
    pub enabled: bool,
    pub capability: String,
    pub timeout: Duration,
    pub fallback: AssistantAction,
}

fn apply_override(config: &mut EffectiveAssistant, layer: &WorkerAssistantOverride) {
    if let Some(enabled) = layer.enabled {
        config.enabled = enabled;
    }
    if let Some(capability) = &layer.agent_capability {
        config.capability = capability.clone();
    }
    if let Some(timeout_ms) = layer.timeout_ms {
        config.timeout = Duration::from_millis(timeout_ms);
    }
    if let Some(action) = &layer.fallback_action {
        if let Some(parsed) = AssistantAction::parse(action) {
            config.fallback = parsed;
        }
    }
}

/// Merge the three configuration levels: global, then policy, then phase.
pub fn effective_assistant(
    global: &WorkerAssistantConfig,
    policy: &PolicyConfig,
    phase: &PhaseConfig,
) -> EffectiveAssistant {
    let mut config = EffectiveAssistant {
        enabled: global.enabled,
        capability: global.agent_capability.clone(),
        timeout: Duration::from_millis(global.timeout_ms),
        fallback: AssistantAction::from_fallback(global.fallback_action),
    };
    if let Some(layer) = &policy.worker_assistant {
        apply_override(&mut config, layer);
    }
    if let Some(layer) = &phase.worker_assistant {
        apply_override(&mut config, layer);
    }
    config
}

/// Ask the assistant about a finished run. Returns the action to apply, or
/// `None` when the assistant is disabled. Every path that consulted an
/// agent logs a `worker_assistant` decision row.
pub async fn consult_assistant(
    ctx: &EngineContext,
    effective: &EffectiveAssistant,
    issue: &Issue,
    phase_name: &str,
    outcome: &RunOutcome,
    run_id: &str,
) -> Result<Option<AssistantAction>> {
    if !effective.enabled {
        return Ok(None);
    }

    let (action, reasoning, response) = run_consultation(ctx, effective, issue, phase_name, outcome)
        .await
        .unwrap_or_else(|reason| {
            tracing::warn!("Worker assistant fell back to {}: {reason}", effective.fallback.as_str());
            (effective.fallback, format!("fallback: {reason}"), None)
        });

    ctx.runlog
        .log_decision(NewDecision {
            run_id: run_id.to_string(),
            issue_id: issue.id.clone(),
            decision_type: DecisionType::WorkerAssistant,
            decision: action.as_str().to_string(),
            reasoning,
            metadata: json!({
                "phase": phase_name,
                "capability": effective.capability,
                "confidence": response.as_ref().map(|r| r.confidence),
            }),
        })
        .await?;

    Ok(Some(action))
}

/// One consultation attempt. Err carries the reason the fallback applies.
async fn run_consultation(
    ctx: &EngineContext,
    effective: &EffectiveAssistant,
    issue: &Issue,
    phase_name: &str,
    outcome: &RunOutcome,
) -> std::result::Result<(AssistantAction, String, Option<DecisionResponse>), String> {
    let agent = ctx
        .registry
        .select_agent(&SelectionRequest {
            required_capabilities: vec![effective.capability.clone()],
            constraints: None,
        })
        .ok_or_else(|| format!("no agent provides '{}'", effective.capability))?;

    let prompt = ctx.templates.build_prompt(
        "worker-assistant",
        &json!({
            "issue": {"id": issue.id, "title": issue.title},
            "phase": {"name": phase_name},
            "outcome": outcome,
        }),
    );

    let mut session = ctx
        .agents
        .launch(crate::agent::LaunchSpec {
            agent_id: agent.id,
            session_id: None,
            system_prompt: prompt.system_prompt,
            user_prompt: prompt.user_prompt,
            timeout: effective.timeout,
        })
        .await
        .map_err(|e| format!("assistant launch failed: {e}"))?;

    let mut reply = String::new();
    while let Some(event) = session.events.recv().await {
        match event {
            crate::agent::AgentEvent::Message { content } => reply = content,
            crate::agent::AgentEvent::Completed { outcome } => {
                if let Some(message) = outcome.message {
                    reply = message;
                }
                break;
            }
            crate::agent::AgentEvent::Failed { error, .. } => {
                return Err(format!("assistant session failed: {error}"));
            }
            crate::agent::AgentEvent::TimedOut { .. } => {
                return Err("assistant session timed out".to_string());
            }
            crate::agent::AgentEvent::Killed => {
                return Err("assistant session was killed".to_string());
            }
            _ => {}
        }
    }

    let validated = validate_response(&reply, &[], None);
    let response = validated
        .response
        .ok_or_else(|| format!("unparseable assistant reply: {:?}", validated.errors))?;
    let action = AssistantAction::parse(&response.action)
        .ok_or_else(|| format!("assistant answered '{}', expected advance/retry/block", response.action))?;

    ctx.analytics.record(&response);
    Ok((action, response.reasoning.clone(), Some(response)))
}
