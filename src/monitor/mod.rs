//! Monitor engine: supervision of live runs.
//!
//! Runs in parallel with the worker. On startup it sweeps runs left in a
//! live status by an earlier process (interrupted runs); in steady state it
//! watches heartbeats for stalls and enforces the wall-clock ceiling even
//! when a session keeps emitting events. One bad run never stops the loop.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::app::EngineContext;
use crate::error::Result;
use crate::policy::Transition;
use crate::runlog::{
    DecisionType, NewDecision, Run, RunErrorInfo, RunOutcome, RunPatch, RunStatus,
};
use crate::worker::engine::apply_block;

pub struct MonitorEngine {
    ctx: Arc<EngineContext>,
    shutdown: watch::Receiver<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeoutKind {
    Interrupted,
    Stalled,
    WallClock,
}

impl TimeoutKind {
    fn describe(&self) -> &'static str {
        match self {
            TimeoutKind::Interrupted => "interrupted (no progress since before restart)",
            TimeoutKind::Stalled => "stalled (no stream progress)",
            TimeoutKind::WallClock => "wall-clock timeout exceeded",
        }
    }
}

impl MonitorEngine {
    pub fn new(ctx: Arc<EngineContext>, shutdown: watch::Receiver<bool>) -> Self {
        Self { ctx, shutdown }
    }

    pub async fn run(mut self) -> Result<()> {
        let poll = Duration::from_millis(self.ctx.config.monitor.poll_interval_ms);
        tracing::info!(
            "Monitor engine started (poll {}ms)",
            self.ctx.config.monitor.poll_interval_ms
        );

        match self.resume_interrupted_runs().await {
            Ok(0) => {}
            Ok(count) => tracing::warn!("Recovered {count} interrupted run(s)"),
            Err(e) => tracing::error!("Interrupted-run sweep failed: {e}"),
        }

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            if let Err(e) = self.check_live_runs().await {
                tracing::error!("Supervision pass failed: {e}");
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = self.shutdown.changed() => {}
            }
        }

        tracing::info!("Monitor engine stopped");
        Ok(())
    }

    /// Stall budget for a run's policy, scaled by the monitor multiplier.
    fn stall_budget(&self, run: &Run) -> Duration {
        let base = self
            .ctx
            .policies
            .get_policy(&run.policy_name)
            .and_then(|p| p.stall_threshold_ms)
            .unwrap_or(self.ctx.config.monitor.stall_threshold_ms);
        Duration::from_millis(
            (base as f64 * self.ctx.config.monitor.timeout_multiplier) as u64,
        )
    }

    /// Hard ceiling for a run's phase, beyond the gateway's own timeout.
    fn wall_clock_budget(&self, run: &Run) -> Duration {
        let policy = self.ctx.policies.get_policy(&run.policy_name);
        let base = policy.map(|p| p.timeout_base_ms).unwrap_or(600_000);
        let multiplier = policy
            .and_then(|p| p.phase(&run.phase))
            .map(|phase| phase.timeout_multiplier)
            .unwrap_or(1.0);
        Duration::from_millis(
            (base as f64 * multiplier * self.ctx.config.monitor.timeout_multiplier) as u64,
        )
    }

    /// Sweep runs that were live when a previous process died: stale
    /// heartbeat or a session the gateway no longer knows about.
    pub async fn resume_interrupted_runs(&self) -> Result<usize> {
        let live_runs = self.ctx.runlog.live_runs().await?;
        if live_runs.is_empty() {
            return Ok(0);
        }
        let live_sessions = self.ctx.agents.live_sessions().await;

        let mut recovered = 0;
        for run in live_runs {
            let stale = Utc::now() - run.updated_at
                > chrono::Duration::from_std(self.stall_budget(&run)).unwrap_or_default();
            let session_gone = match &run.session_id {
                Some(session_id) => !live_sessions.contains(session_id),
                None => true,
            };

            if stale || session_gone {
                if let Err(e) = self.time_out_run(&run, TimeoutKind::Interrupted).await {
                    tracing::error!("Recovering run {} failed: {e}", run.id);
                } else {
                    recovered += 1;
                }
            }
        }
        Ok(recovered)
    }

    /// Steady-state pass: stall and wall-clock detection over live runs.
    pub async fn check_live_runs(&self) -> Result<()> {
        for run in self.ctx.runlog.live_runs().await? {
            let now = Utc::now();
            let since_progress = (now - run.updated_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let since_start = (now - run.created_at).to_std().unwrap_or(Duration::ZERO);

            let verdict = if since_start > self.wall_clock_budget(&run) {
                Some(TimeoutKind::WallClock)
            } else if since_progress > self.stall_budget(&run) {
                Some(TimeoutKind::Stalled)
            } else {
                None
            };

            if let Some(kind) = verdict {
                // Defensive: one bad run must not stop the sweep.
                if let Err(e) = self.time_out_run(&run, kind).await {
                    tracing::error!("Timing out run {} failed: {e}", run.id);
                }
            }
        }
        Ok(())
    }

    /// Kill the session, mark the run timed out, log the decision, and let
    /// the policy engine pick retry or block.
    async fn time_out_run(&self, run: &Run, kind: TimeoutKind) -> Result<()> {
        tracing::warn!("Run {} ({}/{}): {}", run.id, run.issue_id, run.phase, kind.describe());

        if let Some(session_id) = &run.session_id {
            let _ = self.ctx.agents.kill(session_id).await;
        }

        let duration_ms = (Utc::now() - run.created_at).num_milliseconds().max(0) as u64;
        let start_time_ms = run.created_at.timestamp_millis() as u64;
        let outcome = RunOutcome {
            success: false,
            error: Some(RunErrorInfo {
                error_type: "timeout".to_string(),
                message: kind.describe().to_string(),
                ..Default::default()
            }),
            metrics: crate::runlog::RunMetrics {
                duration_ms,
                start_time_ms,
                end_time_ms: start_time_ms + duration_ms,
                ..Default::default()
            },
            ..Default::default()
        };

        self.ctx
            .runlog
            .update_run(
                &run.id,
                RunPatch {
                    status: Some(RunStatus::Timeout),
                    outcome: Some(outcome.clone()),
                    ..Default::default()
                },
            )
            .await?;

        self.ctx
            .runlog
            .log_decision(NewDecision {
                run_id: run.id.clone(),
                issue_id: run.issue_id.clone(),
                decision_type: DecisionType::Timeout,
                decision: "timeout".to_string(),
                reasoning: kind.describe().to_string(),
                metadata: json!({"phase": run.phase, "session_id": run.session_id}),
            })
            .await?;

        let transition = self
            .ctx
            .policies
            .determine_transition(
                &run.policy_name,
                &run.phase,
                &outcome,
                Some(&run.issue_id),
                &self.ctx.runlog,
            )
            .await?;

        match transition {
            Transition::Block { reason } => {
                apply_block(&self.ctx, &run.issue_id, &run.id, &reason).await?;
            }
            Transition::Retry { attempt, .. } => {
                // Leaving the issue unblocked lets the worker's next poll
                // dispatch the retry.
                tracing::info!(
                    "Run {} timed out; retry attempt {attempt} will be dispatched",
                    run.id
                );
            }
            other => {
                tracing::debug!("Timeout transition for {}: {other:?}", run.id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ShutdownHandle;
    use crate::runlog::RunDraft;
    use crate::testutil::{harness, open_issue};

    async fn running_run(ctx: &EngineContext, issue: &str, session: Option<&str>) -> Run {
        ctx.runlog
            .create_run(RunDraft {
                issue_id: issue.to_string(),
                session_id: session.map(String::from),
                agent_id: "build".to_string(),
                policy_name: "simple".to_string(),
                phase: "implement".to_string(),
                status: Some(RunStatus::Running),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    async fn backdate(ctx: &EngineContext, run_id: &str, seconds: i64) {
        let past = Utc::now() - chrono::Duration::seconds(seconds);
        sqlx::query("UPDATE runs SET updated_at = ?, created_at = ? WHERE id = ?")
            .bind(crate::runlog::store::fmt_ts(&past))
            .bind(crate::runlog::store::fmt_ts(&past))
            .bind(run_id)
            .execute(ctx.runlog.pool())
            .await
            .unwrap();
    }

    fn monitor(ctx: &Arc<EngineContext>) -> MonitorEngine {
        MonitorEngine::new(Arc::clone(ctx), ShutdownHandle::new().subscribe())
    }

    #[tokio::test]
    async fn interrupted_run_with_dead_session_is_timed_out() {
        let h = harness().await;
        h.tracker.insert(open_issue("I1"));
        let run = running_run(&h.ctx, "I1", Some("S-dead")).await;

        let recovered = monitor(&h.ctx).resume_interrupted_runs().await.unwrap();
        assert_eq!(recovered, 1);

        let stored = h.ctx.runlog.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Timeout);

        let decisions = h.ctx.runlog.decisions_for_run(&run.id).await.unwrap();
        assert!(decisions
            .iter()
            .any(|d| d.decision_type == DecisionType::Timeout));
        // First timeout: policy grants a retry, so no HITL label.
        assert_eq!(h.tracker.snapshot("I1").unwrap().hitl_reason(), None);
    }

    #[tokio::test]
    async fn live_session_with_fresh_heartbeat_is_left_alone() {
        let h = harness().await;
        h.tracker.insert(open_issue("I1"));
        h.gateway.register_live_session("S-alive");
        let run = running_run(&h.ctx, "I1", Some("S-alive")).await;

        let recovered = monitor(&h.ctx).resume_interrupted_runs().await.unwrap();
        assert_eq!(recovered, 0);

        let stored = h.ctx.runlog.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn stalled_run_is_killed_and_timed_out() {
        let h = harness().await;
        h.tracker.insert(open_issue("I1"));
        h.gateway.register_live_session("S-stalled");
        let run = running_run(&h.ctx, "I1", Some("S-stalled")).await;
        // Stale heartbeat past the stall budget (120s * 1.5), recent
        // created_at so the wall-clock ceiling is not what fires.
        let past = Utc::now() - chrono::Duration::seconds(200);
        sqlx::query("UPDATE runs SET updated_at = ? WHERE id = ?")
            .bind(crate::runlog::store::fmt_ts(&past))
            .bind(&run.id)
            .execute(h.ctx.runlog.pool())
            .await
            .unwrap();

        monitor(&h.ctx).check_live_runs().await.unwrap();

        let stored = h.ctx.runlog.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Timeout);
        assert_eq!(h.gateway.killed_sessions(), vec!["S-stalled".to_string()]);
    }

    #[tokio::test]
    async fn repeated_timeouts_escalate_to_block() {
        let h = harness().await;
        h.tracker.insert(open_issue("I1"));

        // Exhaust the retry budget (max_attempts = 2 in the test policy):
        // three timed-out attempts in a row.
        for attempt in 0..3 {
            let run = running_run(&h.ctx, "I1", Some(&format!("S{attempt}"))).await;
            backdate(&h.ctx, &run.id, 400).await;
            monitor(&h.ctx).resume_interrupted_runs().await.unwrap();
        }

        let issue = h.tracker.snapshot("I1").unwrap();
        assert_eq!(issue.hitl_reason().as_deref(), Some("max-retries-exceeded"));
    }
}
