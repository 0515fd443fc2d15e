//! Read-only inspection snapshots.
//!
//! The UI server is a separate process; it calls into this adapter for its
//! `/api/runs`, `/api/policies`, `/api/phases`, and `/api/health` payloads.
//! Nothing here mutates state.

use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::EngineContext;
use crate::error::Result;
use crate::retention::{query_all_runs, HealthChecker};
use crate::runlog::RunFilter;

pub struct InspectionApi {
    ctx: Arc<EngineContext>,
}

impl InspectionApi {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Recent runs across the active and archive stores, newest first.
    pub async fn recent_runs(&self, limit: usize) -> Result<Value> {
        let runs = query_all_runs(
            &self.ctx.runlog,
            &self.ctx.archive,
            &RunFilter {
                limit: Some(limit),
                ..Default::default()
            },
        )
        .await?;
        Ok(serde_json::to_value(runs)?)
    }

    pub fn policies(&self) -> Value {
        json!({
            "default_policy": self.ctx.policies.default_policy_name(),
            "policies": self.ctx.policies.policy_names(),
        })
    }

    pub fn phases(&self, policy_name: &str) -> Value {
        let Some(policy) = self.ctx.policies.get_policy(policy_name) else {
            return json!({"error": format!("unknown policy '{policy_name}'")});
        };
        let phases: Vec<Value> = policy
            .phases
            .iter()
            .map(|phase| {
                json!({
                    "name": phase.name,
                    "description": phase.description,
                    "capabilities": phase.capabilities,
                    "timeout_multiplier": phase.timeout_multiplier,
                    "require_approval": phase.require_approval,
                    "reuse_session_from_phase": phase.reuse_session_from_phase,
                    "max_visits": phase.max_visits,
                })
            })
            .collect();
        json!({"policy": policy_name, "phases": phases})
    }

    pub async fn health(&self) -> Result<Value> {
        let checker = HealthChecker::new(
            Arc::clone(&self.ctx.runlog),
            Arc::clone(&self.ctx.archive),
            false,
        );
        let report = checker.check_all().await;
        Ok(json!({
            "health": report,
            "storage_bytes": self.ctx.runlog.storage_bytes(),
            "run_count": self.ctx.runlog.run_count().await?,
            "analytics": self.ctx.analytics.snapshot(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runlog::{RunDraft, RunStatus};
    use crate::testutil::harness;

    #[tokio::test]
    async fn snapshots_render() {
        let h = harness().await;
        h.ctx
            .runlog
            .create_run(RunDraft {
                issue_id: "I1".to_string(),
                agent_id: "build".to_string(),
                policy_name: "simple".to_string(),
                phase: "implement".to_string(),
                status: Some(RunStatus::Completed),
                ..Default::default()
            })
            .await
            .unwrap();

        let api = InspectionApi::new(Arc::clone(&h.ctx));

        let runs = api.recent_runs(10).await.unwrap();
        assert_eq!(runs.as_array().unwrap().len(), 1);

        let policies = api.policies();
        assert_eq!(policies["default_policy"], "simple");

        let phases = api.phases("simple");
        assert_eq!(phases["phases"].as_array().unwrap().len(), 3);
        assert!(api.phases("nope")["error"].is_string());

        let health = api.health().await.unwrap();
        assert_eq!(health["health"]["overall"], "healthy");
        assert_eq!(health["run_count"], 1);
    }
}
