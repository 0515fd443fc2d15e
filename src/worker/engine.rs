//! The dispatch loop and the per-issue pipeline.
//!
//! One `process_issue` call drives one phase attempt end to end: resolve
//! policy and phase, pre-check loop budgets, select an agent, resolve
//! session continuation, build the prompt, run the session, record the
//! outcome, consult the assistant, and apply the policy verdict. Retries
//! loop in place; every other verdict ends the call.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::agent::{AgentEvent, AgentSession, LaunchSpec};
use crate::app::EngineContext;
use crate::error::{AshepError, Result};
use crate::policy::{PhaseConfig, PolicyConfig, PolicyEngine, Transition};
use crate::prompt::validate_response;
use crate::registry::SelectionRequest;
use crate::runlog::{
    DecisionType, MessageType, NewDecision, NewPhaseMessage, RunDraft, RunErrorInfo, RunMetrics,
    RunOutcome, RunPatch, RunStatus,
};
use crate::tracker::Issue;

use super::assistant::{consult_assistant, effective_assistant, AssistantAction};
use super::session::resolve_session;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Placeholder run id for decisions taken before any run exists.
const NO_RUN: &str = "unassigned";

pub struct WorkerEngine {
    ctx: Arc<EngineContext>,
    shutdown: watch::Receiver<bool>,
}

impl WorkerEngine {
    pub fn new(ctx: Arc<EngineContext>, shutdown: watch::Receiver<bool>) -> Self {
        Self { ctx, shutdown }
    }

    /// Main loop: dispatch ready issues up to the slot cap, sleep, repeat.
    pub async fn run(mut self) -> Result<()> {
        let slots = Arc::new(Semaphore::new(self.ctx.config.worker.max_concurrent_runs));
        let poll = Duration::from_millis(self.ctx.config.worker.poll_interval_ms);
        let mut tasks: JoinSet<()> = JoinSet::new();

        tracing::info!(
            "Worker engine started (poll {}ms, {} slots)",
            self.ctx.config.worker.poll_interval_ms,
            self.ctx.config.worker.max_concurrent_runs
        );

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            while let Some(finished) = tasks.try_join_next() {
                if let Err(e) = finished {
                    tracing::error!("Worker task aborted: {e}");
                }
            }

            if let Err(e) = self.dispatch_ready(&slots, &mut tasks).await {
                // Transient tracker trouble must not stop the loop.
                tracing::warn!("Dispatch pass failed: {e}");
            }

            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = self.shutdown.changed() => {}
            }
        }

        self.drain(tasks).await;
        tracing::info!("Worker engine stopped");
        Ok(())
    }

    async fn dispatch_ready(
        &self,
        slots: &Arc<Semaphore>,
        tasks: &mut JoinSet<()>,
    ) -> Result<()> {
        let issues = self.ctx.tracker.list_ready().await?;
        for issue in issues {
            if issue.is_excluded() {
                continue;
            }
            if issue.hitl_reason().is_some() {
                continue;
            }
            if self.ctx.runlog.has_live_run(&issue.id).await? {
                continue;
            }

            let Ok(permit) = Arc::clone(slots).try_acquire_owned() else {
                break;
            };
            let ctx = Arc::clone(&self.ctx);
            let shutdown = self.shutdown.clone();
            let issue_id = issue.id.clone();
            tasks.spawn(async move {
                let _permit = permit;
                if let Err(e) = process_issue(&ctx, shutdown, &issue_id).await {
                    tracing::error!("Processing {issue_id} failed: {e}");
                }
            });
        }
        Ok(())
    }

    /// Give in-flight dispatches a grace window, then kill what remains.
    async fn drain(&self, mut tasks: JoinSet<()>) {
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !tasks.is_empty() {
            tokio::select! {
                finished = tasks.join_next() => {
                    if finished.is_none() {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!("Shutdown grace expired; cancelling {} dispatch(es)", tasks.len());
                    tasks.shutdown().await;
                    break;
                }
            }
        }
        if let Err(e) = cancel_live_runs(&self.ctx).await {
            tracing::error!("Cancelling live runs failed: {e}");
        }
    }
}

/// Kill sessions of live runs and mark those runs cancelled.
pub async fn cancel_live_runs(ctx: &EngineContext) -> Result<()> {
    for run in ctx.runlog.live_runs().await? {
        if let Some(session_id) = &run.session_id {
            let _ = ctx.agents.kill(session_id).await;
        }
        let outcome = RunOutcome {
            success: false,
            error: Some(RunErrorInfo {
                error_type: "cancelled".to_string(),
                message: "shutdown cancelled this run".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        if let Err(e) = ctx
            .runlog
            .update_run(
                &run.id,
                RunPatch {
                    status: Some(RunStatus::Cancelled),
                    outcome: Some(outcome),
                    ..Default::default()
                },
            )
            .await
        {
            tracing::warn!("Could not cancel run {}: {e}", run.id);
        }
    }
    Ok(())
}

/// Drive one issue until its current phase attempt reaches a non-retry
/// verdict.
pub async fn process_issue(
    ctx: &Arc<EngineContext>,
    shutdown: watch::Receiver<bool>,
    issue_id: &str,
) -> Result<()> {
    let issue = ctx.tracker.get(issue_id).await?;
    let policy_name = ctx.policies.resolve_policy_name(issue.policy_name());
    let Some(policy) = ctx.policies.get_policy(&policy_name).cloned() else {
        apply_block(ctx, issue_id, NO_RUN, &format!("Policy not found: {policy_name}")).await?;
        return Ok(());
    };

    let mut phase_name = match resolve_phase(ctx, &policy, issue_id).await? {
        Some(name) => name,
        None => return Ok(()),
    };

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        if let Some(reason) = ctx
            .policies
            .check_visit_budget(&policy_name, &phase_name, issue_id, &ctx.runlog)
            .await?
        {
            apply_block(ctx, issue_id, NO_RUN, &reason).await?;
            return Ok(());
        }

        let Some(phase) = policy.phase(&phase_name).cloned() else {
            apply_block(ctx, issue_id, NO_RUN, &format!("Phase not found: {phase_name}")).await?;
            return Ok(());
        };

        let Some(agent) = ctx.registry.select_agent(&SelectionRequest {
            required_capabilities: phase.capabilities.clone(),
            constraints: None,
        }) else {
            ctx.runlog
                .log_decision(NewDecision {
                    run_id: NO_RUN.to_string(),
                    issue_id: issue_id.to_string(),
                    decision_type: DecisionType::AgentSelection,
                    decision: "no_capable_agent".to_string(),
                    reasoning: format!(
                        "no active agent covers {:?} and fallback did not resolve",
                        phase.capabilities
                    ),
                    metadata: json!({"phase": phase_name}),
                })
                .await?;
            apply_block(ctx, issue_id, NO_RUN, "No capable agent").await?;
            return Ok(());
        };

        let plan = resolve_session(ctx, &policy, &phase, issue_id).await?;
        let prompt = build_phase_prompt(ctx, &issue, &phase).await?;

        let retry_count = ctx.runlog.phase_retry_count(issue_id, &phase_name).await?;
        let run = ctx
            .runlog
            .create_run(RunDraft {
                issue_id: issue_id.to_string(),
                session_id: plan.session_id.clone(),
                agent_id: agent.id.clone(),
                policy_name: policy_name.clone(),
                phase: phase_name.clone(),
                status: Some(RunStatus::Running),
                metadata: [
                    ("attempt_number".to_string(), json!(retry_count + 1)),
                    ("retry_count".to_string(), json!(retry_count)),
                ]
                .into_iter()
                .collect(),
                ..Default::default()
            })
            .await?;

        ctx.runlog
            .log_decision(NewDecision {
                run_id: run.id.clone(),
                issue_id: issue_id.to_string(),
                decision_type: DecisionType::AgentSelection,
                decision: format!("selected_{}", agent.id),
                reasoning: format!("covers {:?} with priority {}", phase.capabilities, agent.priority),
                metadata: json!({"phase": phase_name, "agent_id": agent.id}),
            })
            .await?;

        let timeout =
            Duration::from_millis((policy.timeout_base_ms as f64 * phase.timeout_multiplier) as u64);
        let started = Instant::now();
        let start_epoch_ms = Utc::now().timestamp_millis() as u64;

        tracing::info!(
            "Dispatching {issue_id} phase {phase_name} to agent {} (attempt {})",
            agent.id,
            retry_count + 1
        );

        let launch = if let Some(session_id) = &plan.session_id {
            ctx.agents
                .continue_session(session_id, prompt.user_prompt.clone(), timeout)
                .await
        } else {
            ctx.agents
                .launch(LaunchSpec {
                    agent_id: agent.id.clone(),
                    session_id: None,
                    system_prompt: prompt.system_prompt.clone(),
                    user_prompt: prompt.user_prompt.clone(),
                    timeout,
                })
                .await
        };

        let (status, outcome) = match launch {
            Ok(session) => {
                ctx.runlog
                    .update_run(
                        &run.id,
                        RunPatch {
                            session_id: Some(session.session_id.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                await_outcome(ctx, &run.id, session, start_epoch_ms, started).await
            }
            Err(e) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                (
                    RunStatus::Failed,
                    RunOutcome {
                        success: false,
                        error: Some(RunErrorInfo {
                            error_type: "agent_start_failed".to_string(),
                            message: e.to_string(),
                            ..Default::default()
                        }),
                        metrics: RunMetrics {
                            duration_ms,
                            start_time_ms: start_epoch_ms,
                            end_time_ms: start_epoch_ms + duration_ms,
                            ..Default::default()
                        },
                        ..Default::default()
                    },
                )
            }
        };

        ctx.runlog
            .update_run(
                &run.id,
                RunPatch {
                    status: Some(status),
                    outcome: Some(outcome.clone()),
                    ..Default::default()
                },
            )
            .await?;

        let effective = effective_assistant(&ctx.config.worker_assistant, &policy, &phase);
        let assistant = consult_assistant(ctx, &effective, &issue, &phase_name, &outcome, &run.id)
            .await?;

        let mut transition = ctx
            .policies
            .determine_transition(&policy_name, &phase_name, &outcome, Some(issue_id), &ctx.runlog)
            .await?;

        if let Some(action) = assistant {
            transition = apply_assistant_verdict(&policy, action, transition, retry_count);
        }

        let transition =
            resolve_dynamic(ctx, &policy_name, &policy, &phase_name, &issue, &run.id, transition, 0)
                .await?;

        log_transition(ctx, &run.id, issue_id, &phase_name, &transition).await?;

        match transition {
            Transition::Advance { next_phase } => {
                ctx.tracker.set_phase_label(issue_id, &next_phase).await?;
                ctx.messenger
                    .send_message(NewPhaseMessage {
                        issue_id: issue_id.to_string(),
                        from_phase: phase_name.clone(),
                        to_phase: next_phase.clone(),
                        message_type: MessageType::Result,
                        content: outcome
                            .message
                            .clone()
                            .unwrap_or_else(|| format!("{phase_name} completed")),
                        metadata: Some(json!({"run_id": run.id})),
                        run_counter: None,
                    })
                    .await?;
                tracing::info!("{issue_id}: {phase_name} -> {next_phase}");
                return Ok(());
            }
            Transition::Retry {
                attempt,
                delay_ms,
                reason,
            } => {
                tracing::warn!(
                    "{issue_id}: retry attempt {attempt} for {phase_name} ({reason}) after {delay_ms}ms"
                );
                let mut shutdown = shutdown.clone();
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                    _ = shutdown.changed() => {
                        // Shutdown drops the pending retry.
                        return Ok(());
                    }
                }
                continue;
            }
            Transition::JumpBack {
                target_phase,
                reason,
            } => {
                ctx.tracker.set_phase_label(issue_id, &target_phase).await?;
                ctx.messenger
                    .send_message(NewPhaseMessage {
                        issue_id: issue_id.to_string(),
                        from_phase: phase_name.clone(),
                        to_phase: target_phase.clone(),
                        message_type: MessageType::Context,
                        content: if reason.is_empty() {
                            format!("jumped back from {phase_name}")
                        } else {
                            reason
                        },
                        metadata: Some(json!({"run_id": run.id})),
                        run_counter: None,
                    })
                    .await?;
                tracing::warn!("{issue_id}: {phase_name} jumped back to {target_phase}");
                return Ok(());
            }
            Transition::Block { reason } => {
                apply_block(ctx, issue_id, &run.id, &reason).await?;
                return Ok(());
            }
            Transition::Close => {
                ctx.tracker.clear_phase_labels(issue_id).await?;
                ctx.tracker.clear_hitl_labels(issue_id).await?;
                ctx.tracker.close_issue(issue_id).await?;
                ctx.messenger
                    .cleanup_phase_messages(issue_id, "issue completed")
                    .await?;
                tracing::info!("{issue_id}: closed after {phase_name}");
                return Ok(());
            }
            Transition::DynamicDecision { .. } => {
                // resolve_dynamic never returns this.
                apply_block(ctx, issue_id, &run.id, "Unresolved dynamic decision").await?;
                return Ok(());
            }
        }
    }
}

/// Current phase from the tracker, bootstrapping the first phase when the
/// issue has none. Returns `None` when the issue should be skipped.
async fn resolve_phase(
    ctx: &EngineContext,
    policy: &PolicyConfig,
    issue_id: &str,
) -> Result<Option<String>> {
    use crate::config::InvalidLabelStrategy;

    match ctx.tracker.current_phase(issue_id).await? {
        Some(name) if policy.phase(&name).is_some() => Ok(Some(name)),
        Some(name) => match ctx.config.workflow.invalid_label_strategy {
            InvalidLabelStrategy::Error => Err(AshepError::Validation(format!(
                "issue {issue_id} carries unknown phase label '{name}'"
            ))),
            InvalidLabelStrategy::Warning => {
                tracing::warn!(
                    "Issue {issue_id} carries unknown phase label '{name}'; resetting to first phase"
                );
                bootstrap_first_phase(ctx, policy, issue_id).await
            }
            InvalidLabelStrategy::Ignore => {
                tracing::debug!("Ignoring issue {issue_id} with unknown phase label '{name}'");
                Ok(None)
            }
        },
        None => bootstrap_first_phase(ctx, policy, issue_id).await,
    }
}

async fn bootstrap_first_phase(
    ctx: &EngineContext,
    policy: &PolicyConfig,
    issue_id: &str,
) -> Result<Option<String>> {
    let Some(first) = policy.first_phase() else {
        return Ok(None);
    };
    ctx.tracker.set_phase_label(issue_id, &first.name).await?;
    Ok(Some(first.name.clone()))
}

async fn build_phase_prompt(
    ctx: &EngineContext,
    issue: &Issue,
    phase: &PhaseConfig,
) -> Result<crate::prompt::BuiltPrompt> {
    let messages = ctx
        .messenger
        .receive_messages(&issue.id, &phase.name, true)
        .await?;
    let message_context: Vec<_> = messages
        .iter()
        .map(|m| {
            json!({
                "from_phase": m.from_phase,
                "message_type": m.message_type.as_str(),
                "content": m.content,
            })
        })
        .collect();

    let template = phase.custom_prompt.as_deref().unwrap_or("phase");
    Ok(ctx.templates.build_prompt(
        template,
        &json!({
            "issue": {
                "id": issue.id,
                "title": issue.title,
                "description": issue.description,
                "type": issue.issue_type,
                "priority": issue.priority,
            },
            "phase": {
                "name": phase.name,
                "description": phase.description,
                "capabilities": phase.capabilities,
            },
            "messages": message_context,
        }),
    ))
}

/// Pump session events into the run log until the terminal event, then
/// shape the outcome.
async fn await_outcome(
    ctx: &EngineContext,
    run_id: &str,
    mut session: AgentSession,
    start_epoch_ms: u64,
    started: Instant,
) -> (RunStatus, RunOutcome) {
    let mut terminal = None;
    while let Some(event) = session.events.recv().await {
        if event.is_terminal() {
            terminal = Some(event);
            break;
        }
        // Progress heartbeat for the monitor's stall detection.
        if let Err(e) = ctx.runlog.touch_run(run_id).await {
            tracing::debug!("Heartbeat for {run_id} failed: {e}");
        }
    }

    let duration_ms = started.elapsed().as_millis() as u64;
    let metrics_for = |session_outcome: &crate::agent::SessionOutcome| RunMetrics {
        duration_ms,
        start_time_ms: start_epoch_ms,
        end_time_ms: start_epoch_ms + duration_ms,
        tokens_used: session_outcome.tokens_used,
        cost: session_outcome.cost,
        api_calls_count: session_outcome.api_calls_count,
    };

    match terminal {
        Some(AgentEvent::Completed { outcome }) => (
            RunStatus::Completed,
            RunOutcome {
                success: true,
                message: outcome.message.clone(),
                metrics: metrics_for(&outcome),
                ..Default::default()
            },
        ),
        Some(AgentEvent::Failed { error, outcome }) => (
            RunStatus::Failed,
            RunOutcome {
                success: false,
                message: outcome.message.clone(),
                error: Some(RunErrorInfo {
                    error_type: "agent_failure".to_string(),
                    message: error,
                    ..Default::default()
                }),
                metrics: metrics_for(&outcome),
                ..Default::default()
            },
        ),
        Some(AgentEvent::TimedOut { outcome }) => (
            RunStatus::Timeout,
            RunOutcome {
                success: false,
                message: outcome.message.clone(),
                error: Some(RunErrorInfo {
                    error_type: "timeout".to_string(),
                    message: "wall-clock timeout exceeded".to_string(),
                    ..Default::default()
                }),
                metrics: metrics_for(&outcome),
                ..Default::default()
            },
        ),
        _ => (
            RunStatus::Cancelled,
            RunOutcome {
                success: false,
                error: Some(RunErrorInfo {
                    error_type: "killed".to_string(),
                    message: "session ended without a terminal event".to_string(),
                    ..Default::default()
                }),
                metrics: metrics_for(&Default::default()),
                ..Default::default()
            },
        ),
    }
}

/// The assistant can veto the policy verdict: block always wins, retry
/// forces another attempt within the retry budget, advance defers to the
/// policy.
fn apply_assistant_verdict(
    policy: &PolicyConfig,
    action: AssistantAction,
    transition: Transition,
    retry_count: u32,
) -> Transition {
    match action {
        AssistantAction::Advance => transition,
        AssistantAction::Block => Transition::Block {
            reason: "Worker assistant blocked".to_string(),
        },
        AssistantAction::Retry => {
            let max_attempts = policy.retry.max_attempts;
            if retry_count >= max_attempts {
                Transition::Block {
                    reason: format!("Max retries exceeded ({max_attempts})"),
                }
            } else {
                Transition::Retry {
                    attempt: retry_count + 1,
                    delay_ms: PolicyEngine::calculate_retry_delay(policy, retry_count),
                    reason: "Worker assistant requested retry".to_string(),
                }
            }
        }
    }
}

/// Run the dynamic decision capability and map its answer to a concrete
/// transition. Depth is capped at one so decisions cannot chain.
#[allow(clippy::too_many_arguments)]
async fn resolve_dynamic(
    ctx: &EngineContext,
    policy_name: &str,
    policy: &PolicyConfig,
    current_phase: &str,
    issue: &Issue,
    run_id: &str,
    transition: Transition,
    depth: u8,
) -> Result<Transition> {
    let Transition::DynamicDecision { capability, config } = transition else {
        return Ok(transition);
    };

    if depth >= 1 {
        return Ok(Transition::Block {
            reason: "Nested dynamic decision refused".to_string(),
        });
    }

    if let Err(reason) = ctx.policies.validate_dynamic_transition(
        policy_name,
        current_phase,
        &Transition::DynamicDecision {
            capability: capability.clone(),
            config: config.clone(),
        },
        &ctx.registry,
    ) {
        return Ok(Transition::Block { reason });
    }

    let Some(agent) = ctx.registry.select_agent(&SelectionRequest {
        required_capabilities: vec![capability.clone()],
        constraints: None,
    }) else {
        return Ok(Transition::Block {
            reason: format!("No agent provides decision capability '{capability}'"),
        });
    };

    let destinations = if config.allowed_destinations.is_empty() {
        policy.phase_names()
    } else {
        config.allowed_destinations.clone()
    };

    let template = config
        .prompt_template
        .as_deref()
        .unwrap_or("dynamic-decision");
    let prompt = ctx.templates.build_prompt(
        template,
        &json!({
            "issue": {"id": issue.id, "title": issue.title},
            "phase": {"name": current_phase},
            "destinations": destinations,
        }),
    );

    let reply = match run_decision_session(ctx, &agent.id, prompt).await {
        Ok(reply) => reply,
        Err(reason) => {
            return Ok(Transition::Block {
                reason: format!("Dynamic decision failed: {reason}"),
            })
        }
    };

    let validated = validate_response(&reply, &destinations, None);
    let Some(response) = validated.response else {
        return Ok(Transition::Block {
            reason: format!("Dynamic decision invalid: {}", validated.errors.join("; ")),
        });
    };

    ctx.analytics.record(&response);
    ctx.runlog
        .log_decision(NewDecision {
            run_id: run_id.to_string(),
            issue_id: issue.id.clone(),
            decision_type: DecisionType::DynamicDecision,
            decision: response.decision.clone(),
            reasoning: response.reasoning.clone(),
            metadata: json!({
                "capability": capability,
                "confidence": response.confidence,
                "target": response.target,
                "warnings": validated.warnings,
            }),
        })
        .await?;

    if response.requires_approval {
        return Ok(Transition::Block {
            reason: "Human approval required (low decision confidence)".to_string(),
        });
    }

    let retry_count = ctx
        .runlog
        .phase_retry_count(&issue.id, current_phase)
        .await?;

    let mapped = match (response.action.as_str(), response.target.as_deref()) {
        ("advance", None) => match policy.next_phase(current_phase) {
            Some(next) => Transition::Advance {
                next_phase: next.name.clone(),
            },
            None => Transition::Close,
        },
        ("advance", Some(target)) => Transition::Advance {
            next_phase: target.to_string(),
        },
        ("jump", Some(target)) => Transition::JumpBack {
            target_phase: target.to_string(),
            reason: response.reasoning.clone(),
        },
        ("retry", _) => {
            if retry_count >= policy.retry.max_attempts {
                Transition::Block {
                    reason: format!("Max retries exceeded ({})", policy.retry.max_attempts),
                }
            } else {
                Transition::Retry {
                    attempt: retry_count + 1,
                    delay_ms: PolicyEngine::calculate_retry_delay(policy, retry_count),
                    reason: response.reasoning.clone(),
                }
            }
        }
        ("block", _) => Transition::Block {
            reason: response.reasoning.clone(),
        },
        (other, _) => Transition::Block {
            reason: format!("Unsupported decision action '{other}'"),
        },
    };

    if let Err(reason) =
        ctx.policies
            .validate_dynamic_transition(policy_name, current_phase, &mapped, &ctx.registry)
    {
        return Ok(Transition::Block { reason });
    }

    // Depth 1: a mapped transition is always concrete, but keep the guard
    // honest.
    Box::pin(resolve_dynamic(
        ctx,
        policy_name,
        policy,
        current_phase,
        issue,
        run_id,
        mapped,
        depth + 1,
    ))
    .await
}

/// Collect the final message of a short decision session.
async fn run_decision_session(
    ctx: &EngineContext,
    agent_id: &str,
    prompt: crate::prompt::BuiltPrompt,
) -> std::result::Result<String, String> {
    let timeout = Duration::from_millis(ctx.config.worker_assistant.timeout_ms);
    let mut session = ctx
        .agents
        .launch(LaunchSpec {
            agent_id: agent_id.to_string(),
            session_id: None,
            system_prompt: prompt.system_prompt,
            user_prompt: prompt.user_prompt,
            timeout,
        })
        .await
        .map_err(|e| e.to_string())?;

    let mut reply = String::new();
    while let Some(event) = session.events.recv().await {
        match event {
            AgentEvent::Message { content } => reply = content,
            AgentEvent::Completed { outcome } => {
                if let Some(message) = outcome.message {
                    reply = message;
                }
                break;
            }
            AgentEvent::Failed { error, .. } => return Err(error),
            AgentEvent::TimedOut { .. } => return Err("decision session timed out".to_string()),
            AgentEvent::Killed => return Err("decision session was killed".to_string()),
            _ => {}
        }
    }
    Ok(reply)
}

async fn log_transition(
    ctx: &EngineContext,
    run_id: &str,
    issue_id: &str,
    from_phase: &str,
    transition: &Transition,
) -> Result<()> {
    let (to_phase, reason) = match transition {
        Transition::Advance { next_phase } => (Some(next_phase.clone()), String::new()),
        Transition::JumpBack {
            target_phase,
            reason,
        } => (Some(target_phase.clone()), reason.clone()),
        Transition::Retry { reason, .. } => (None, reason.clone()),
        Transition::Block { reason } => (None, reason.clone()),
        Transition::Close => (None, "all phases complete".to_string()),
        Transition::DynamicDecision { capability, .. } => (None, capability.clone()),
    };

    ctx.runlog
        .log_decision(NewDecision {
            run_id: run_id.to_string(),
            issue_id: issue_id.to_string(),
            decision_type: DecisionType::PhaseTransition,
            decision: transition.decision_label(),
            reasoning: reason,
            metadata: json!({
                "from_phase": from_phase,
                "to_phase": to_phase,
            }),
        })
        .await?;
    Ok(())
}

/// Soft block: put the HITL label on the issue and record the decision.
pub async fn apply_block(
    ctx: &EngineContext,
    issue_id: &str,
    run_id: &str,
    reason: &str,
) -> Result<()> {
    let label_reason = choose_hitl_reason(ctx, reason);
    ctx.tracker.set_hitl_label(issue_id, &label_reason).await?;
    ctx.runlog
        .log_decision(NewDecision {
            run_id: run_id.to_string(),
            issue_id: issue_id.to_string(),
            decision_type: DecisionType::Hitl,
            decision: label_reason.clone(),
            reasoning: reason.to_string(),
            metadata: json!({}),
        })
        .await?;
    tracing::warn!("{issue_id}: blocked for human attention ({reason})");
    Ok(())
}

/// Map a block reason onto a valid HITL label reason.
fn choose_hitl_reason(ctx: &EngineContext, reason: &str) -> String {
    let lower = reason.to_lowercase();
    let candidate = if lower.contains("approval") {
        "approval"
    } else if lower.contains("max retries") {
        "max-retries-exceeded"
    } else if lower.contains("max_visits")
        || lower.contains("max_transitions")
        || lower.contains("oscillating")
    {
        "loop-detected"
    } else if lower.contains("capable agent") || lower.contains("capability") {
        "no-capable-agent"
    } else if lower.contains("assistant") {
        "assistant-block"
    } else {
        "approval"
    };

    let rules = ctx.policies.hitl_rules();
    if crate::policy::validate_hitl_reason(candidate, rules).is_ok() {
        candidate.to_string()
    } else {
        rules
            .predefined
            .first()
            .cloned()
            .unwrap_or_else(|| "approval".to_string())
    }
}
