//! Cross-phase session continuation.
//!
//! A phase may reuse an earlier phase's agent session so the agent keeps
//! its context. Reuse is refused once the session's cumulative token usage
//! reaches the phase's context-window budget.

use crate::app::EngineContext;
use crate::error::Result;
use crate::policy::{PhaseConfig, PolicyConfig};

/// Where the next run's session comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPlan {
    /// Continue this session; `None` starts fresh.
    pub session_id: Option<String>,
}

impl SessionPlan {
    pub fn fresh() -> Self {
        Self { session_id: None }
    }

    pub fn is_continuation(&self) -> bool {
        self.session_id.is_some()
    }
}

/// Resolve the `reuse_session_from_phase` directive for one dispatch.
pub async fn resolve_session(
    ctx: &EngineContext,
    policy: &PolicyConfig,
    phase: &PhaseConfig,
    issue_id: &str,
) -> Result<SessionPlan> {
    let Some(directive) = &phase.reuse_session_from_phase else {
        return Ok(SessionPlan::fresh());
    };

    let candidate = match directive.as_str() {
        "@self" => {
            ctx.runlog
                .last_successful_session(issue_id, &phase.name)
                .await?
        }
        "@previous" => match policy.previous_phase(&phase.name) {
            Some(previous) => {
                ctx.runlog
                    .last_successful_session(issue_id, &previous.name)
                    .await?
            }
            None => None,
        },
        "@first" => match policy.first_phase() {
            Some(first) => {
                ctx.runlog
                    .last_successful_session(issue_id, &first.name)
                    .await?
            }
            None => None,
        },
        "@shared" => {
            if policy.shared_session {
                ctx.runlog.last_session_for_issue(issue_id).await?
            } else {
                tracing::warn!(
                    "Phase '{}' asks for @shared but the policy has no shared session",
                    phase.name
                );
                None
            }
        }
        explicit => ctx.runlog.last_successful_session(issue_id, explicit).await?,
    };

    let Some(session_id) = candidate else {
        return Ok(SessionPlan::fresh());
    };

    let max_tokens = phase
        .max_context_tokens
        .unwrap_or(ctx.config.session_continuation.default_max_context_tokens);
    let threshold = phase
        .context_window_threshold
        .unwrap_or(ctx.config.session_continuation.default_threshold);
    let budget = (max_tokens as f64 * threshold) as u64;

    let used = ctx.runlog.session_tokens(issue_id, &session_id).await?;
    if used < budget {
        tracing::debug!(
            "Reusing session {session_id} for {issue_id}/{} ({used}/{budget} tokens)",
            phase.name
        );
        Ok(SessionPlan {
            session_id: Some(session_id),
        })
    } else {
        tracing::info!(
            "Session {session_id} for {issue_id} spent {used} of {budget} token budget; starting fresh"
        );
        Ok(SessionPlan::fresh())
    }
}
