//! Cleanup engine: age/count-driven sweeps plus emergency and critical
//! passes triggered by size pressure.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::{CleanupConfig, RetentionConfig};
use crate::runlog::{
    CleanupOperation, NewCleanupMetric, Run, RunFilter, RunLog, RunStatus, StoreError,
};

use super::archive::ArchiveStore;
use super::policy::RetentionPolicy;
use super::size::{SizeMonitor, SizePressure};

const TERMINAL_STATUSES: [RunStatus; 4] = [
    RunStatus::Completed,
    RunStatus::Failed,
    RunStatus::Timeout,
    RunStatus::Cancelled,
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub runs_processed: u64,
    pub runs_archived: u64,
    pub runs_deleted: u64,
    pub bytes_archived: u64,
    pub bytes_deleted: u64,
    pub duration_ms: u64,
}

impl CleanupReport {
    fn merge(&mut self, other: CleanupReport) {
        self.runs_processed += other.runs_processed;
        self.runs_archived += other.runs_archived;
        self.runs_deleted += other.runs_deleted;
        self.bytes_archived += other.bytes_archived;
        self.bytes_deleted += other.bytes_deleted;
        self.duration_ms += other.duration_ms;
    }
}

pub struct CleanupEngine {
    runlog: Arc<RunLog>,
    archive: Arc<ArchiveStore>,
    config: CleanupConfig,
    policies: Vec<RetentionPolicy>,
    monitor: SizeMonitor,
}

impl CleanupEngine {
    pub fn new(
        runlog: Arc<RunLog>,
        archive: Arc<ArchiveStore>,
        config: CleanupConfig,
        retention: &RetentionConfig,
    ) -> Self {
        let policies = if retention.enabled && !retention.policies.is_empty() {
            retention.policies.clone()
        } else if retention.enabled {
            vec![RetentionPolicy::default()]
        } else {
            Vec::new()
        };

        let max_bytes = policies
            .iter()
            .map(|p| p.max_size_bytes())
            .max()
            .unwrap_or(RetentionPolicy::default().max_size_bytes());

        Self {
            runlog,
            archive,
            config,
            policies,
            monitor: SizeMonitor::new(max_bytes),
        }
    }

    pub fn size_monitor(&self) -> &SizeMonitor {
        &self.monitor
    }

    async fn terminal_runs_oldest_first(&self) -> Result<Vec<Run>, StoreError> {
        let mut runs = Vec::new();
        for status in TERMINAL_STATUSES {
            runs.extend(
                self.runlog
                    .query_runs(&RunFilter {
                        status: Some(status),
                        ..Default::default()
                    })
                    .await?,
            );
        }
        runs.sort_by(|a, b| {
            let a_done = a.completed_at.unwrap_or(a.created_at);
            let b_done = b.completed_at.unwrap_or(b.created_at);
            a_done.cmp(&b_done).then_with(|| a.id.cmp(&b.id))
        });
        Ok(runs)
    }

    fn record_size(run: &Run) -> u64 {
        serde_json::to_string(run).map(|s| s.len() as u64).unwrap_or(0)
    }

    /// Copy a run (and its decisions) into the archive, then drop it from
    /// the active index. The archive insert commits first, so a crash in
    /// between leaves a duplicate id for the consistency check, never a
    /// lost run.
    async fn move_to_archive(&self, run: &Run, reason: &str) -> Result<u64, StoreError> {
        self.archive.archive_run(run, reason).await?;
        for decision in self.runlog.decisions_for_run(&run.id).await? {
            self.archive.archive_decision(&decision, reason).await?;
        }
        self.runlog.delete_run_rows(&run.id).await?;
        Ok(Self::record_size(run))
    }

    async fn delete_run(&self, run: &Run) -> Result<u64, StoreError> {
        self.runlog.delete_run_rows(&run.id).await?;
        Ok(Self::record_size(run))
    }

    /// Age- and count-driven sweep for one retention policy.
    async fn sweep_policy(&self, policy: &RetentionPolicy) -> Result<CleanupReport, StoreError> {
        let started = std::time::Instant::now();
        let now = chrono::Utc::now();
        let runs = self.terminal_runs_oldest_first().await?;
        let mut report = CleanupReport {
            runs_processed: runs.len() as u64,
            ..Default::default()
        };

        let overage = (runs.len() as u64).saturating_sub(policy.max_runs);
        for (index, run) in runs.iter().enumerate() {
            let over_count = (index as u64) < overage;
            if policy.should_delete(run, now) {
                report.bytes_deleted += self.delete_run(run).await?;
                report.runs_deleted += 1;
            } else if policy.should_archive(run, now) {
                report.bytes_archived += self.move_to_archive(run, "age").await?;
                report.runs_archived += 1;
            } else if over_count && policy.archive_enabled {
                report.bytes_archived += self.move_to_archive(run, "count").await?;
                report.runs_archived += 1;
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;

        if report.runs_archived > 0 {
            self.record_metric(policy, CleanupOperation::Archive, &report)
                .await?;
        }
        if report.runs_deleted > 0 {
            self.record_metric(policy, CleanupOperation::Delete, &report)
                .await?;
        }
        Ok(report)
    }

    async fn record_metric(
        &self,
        policy: &RetentionPolicy,
        operation: CleanupOperation,
        report: &CleanupReport,
    ) -> Result<(), StoreError> {
        self.runlog
            .record_cleanup_metric(NewCleanupMetric {
                policy_name: policy.name.clone(),
                operation,
                issue_id: None,
                runs_processed: report.runs_processed,
                runs_archived: report.runs_archived,
                runs_deleted: report.runs_deleted,
                bytes_archived: report.bytes_archived,
                bytes_deleted: report.bytes_deleted,
                duration_ms: report.duration_ms,
            })
            .await?;
        Ok(())
    }

    /// Run every retention policy's sweep now.
    pub async fn run_immediate_cleanup(&self) -> Result<CleanupReport, StoreError> {
        let mut total = CleanupReport::default();
        for policy in &self.policies {
            let report = self.sweep_policy(policy).await?;
            tracing::info!(
                "Cleanup ({}) archived {} deleted {} of {} runs",
                policy.name,
                report.runs_archived,
                report.runs_deleted,
                report.runs_processed
            );
            total.merge(report);
        }
        Ok(total)
    }

    /// Size above the warning threshold: move the oldest quarter of
    /// terminal runs to the archive.
    pub async fn run_emergency_cleanup(&self) -> Result<CleanupReport, StoreError> {
        self.pressure_sweep(4, CleanupOperation::Emergency).await
    }

    /// Size above the critical threshold: move the oldest half.
    pub async fn run_critical_cleanup(&self) -> Result<CleanupReport, StoreError> {
        self.pressure_sweep(2, CleanupOperation::Critical).await
    }

    async fn pressure_sweep(
        &self,
        divisor: usize,
        operation: CleanupOperation,
    ) -> Result<CleanupReport, StoreError> {
        let started = std::time::Instant::now();
        let runs = self.terminal_runs_oldest_first().await?;
        let take = runs.len().div_ceil(divisor);
        let mut report = CleanupReport {
            runs_processed: runs.len() as u64,
            ..Default::default()
        };

        let reason = operation.as_str();
        for run in runs.iter().take(take) {
            report.bytes_archived += self.move_to_archive(run, reason).await?;
            report.runs_archived += 1;
        }
        report.duration_ms = started.elapsed().as_millis() as u64;

        let policy_name = self
            .policies
            .first()
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "default".to_string());
        self.runlog
            .record_cleanup_metric(NewCleanupMetric {
                policy_name,
                operation,
                issue_id: None,
                runs_processed: report.runs_processed,
                runs_archived: report.runs_archived,
                runs_deleted: report.runs_deleted,
                bytes_archived: report.bytes_archived,
                bytes_deleted: report.bytes_deleted,
                duration_ms: report.duration_ms,
            })
            .await?;

        tracing::warn!(
            "{} cleanup archived {} of {} runs",
            reason,
            report.runs_archived,
            report.runs_processed
        );
        Ok(report)
    }

    /// Sample the store size and react to threshold crossings.
    pub async fn check_size_pressure(&self) -> Result<Option<CleanupReport>, StoreError> {
        let sample = self.monitor.sample(&self.runlog).await?;
        match self.monitor.pressure(&sample) {
            SizePressure::Nominal => Ok(None),
            SizePressure::Warning => Ok(Some(self.run_emergency_cleanup().await?)),
            SizePressure::Critical | SizePressure::Emergency => {
                Ok(Some(self.run_critical_cleanup().await?))
            }
        }
    }

    /// Periodic cleanup loop; exits when shutdown flips.
    pub async fn run_scheduled(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            return;
        }
        if self.config.run_on_startup {
            if let Err(e) = self.run_immediate_cleanup().await {
                tracing::error!("Startup cleanup failed: {e}");
            }
        }

        let interval = Duration::from_secs(self.config.schedule_interval_hours * 3_600);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run_immediate_cleanup().await {
                        tracing::error!("Scheduled cleanup failed: {e}");
                    }
                    if let Err(e) = self.check_size_pressure().await {
                        tracing::error!("Size pressure check failed: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runlog::{RunDraft, RunOutcome, RunPatch};
    use chrono::Utc;

    async fn engine_with(
        retention: RetentionConfig,
    ) -> (tempfile::TempDir, Arc<RunLog>, Arc<ArchiveStore>, CleanupEngine) {
        let dir = tempfile::tempdir().unwrap();
        let runlog = Arc::new(RunLog::open(dir.path()).await.unwrap());
        let archive = Arc::new(ArchiveStore::open(dir.path()).await.unwrap());
        let engine = CleanupEngine::new(
            Arc::clone(&runlog),
            Arc::clone(&archive),
            CleanupConfig::default(),
            &retention,
        );
        (dir, runlog, archive, engine)
    }

    async fn terminal_run(runlog: &RunLog, issue: &str, success: bool, age_days: i64) -> Run {
        let run = runlog
            .create_run(RunDraft {
                issue_id: issue.to_string(),
                agent_id: "build".to_string(),
                policy_name: "simple".to_string(),
                phase: "implement".to_string(),
                status: Some(RunStatus::Running),
                ..Default::default()
            })
            .await
            .unwrap();
        let mut updated = runlog
            .update_run(
                &run.id,
                RunPatch {
                    status: Some(if success {
                        RunStatus::Completed
                    } else {
                        RunStatus::Failed
                    }),
                    outcome: Some(RunOutcome {
                        success,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Backdate for age-based tests; completed_at drives retention age.
        if age_days > 0 {
            let backdated = Utc::now() - chrono::Duration::days(age_days);
            sqlx::query("UPDATE runs SET completed_at = ?, created_at = ? WHERE id = ?")
                .bind(crate::runlog::store::fmt_ts(&backdated))
                .bind(crate::runlog::store::fmt_ts(&backdated))
                .bind(&run.id)
                .execute(runlog.pool())
                .await
                .unwrap();
            updated.completed_at = Some(backdated);
            updated.created_at = backdated;
        }
        updated
    }

    fn retention(policy: RetentionPolicy) -> RetentionConfig {
        RetentionConfig {
            enabled: true,
            policies: vec![policy],
        }
    }

    #[tokio::test]
    async fn old_successful_runs_are_archived_then_gone_from_active() {
        let (_dir, runlog, archive, engine) = engine_with(retention(RetentionPolicy {
            archive_after_days: 7,
            delete_after_days: 3_650,
            ..Default::default()
        }))
        .await;

        let old = terminal_run(&runlog, "I1", true, 30).await;
        let fresh = terminal_run(&runlog, "I2", true, 0).await;

        let report = engine.run_immediate_cleanup().await.unwrap();
        assert_eq!(report.runs_archived, 1);
        assert_eq!(report.runs_deleted, 0);

        assert!(runlog.get_run(&old.id).await.unwrap().is_none());
        assert!(archive.get_run(&old.id).await.unwrap().is_some());
        assert!(runlog.get_run(&fresh.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_respects_keep_flags() {
        let (_dir, runlog, _archive, engine) = engine_with(retention(RetentionPolicy {
            archive_enabled: false,
            delete_after_days: 10,
            keep_successful_runs: false,
            keep_failed_runs: true,
            ..Default::default()
        }))
        .await;

        let success = terminal_run(&runlog, "I1", true, 30).await;
        let failure = terminal_run(&runlog, "I2", false, 30).await;

        let report = engine.run_immediate_cleanup().await.unwrap();
        assert_eq!(report.runs_deleted, 1);
        assert!(runlog.get_run(&success.id).await.unwrap().is_none());
        assert!(runlog.get_run(&failure.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn emergency_cleanup_moves_oldest_quarter() {
        let (_dir, runlog, archive, engine) =
            engine_with(retention(RetentionPolicy::default())).await;
        for i in 0..8 {
            terminal_run(&runlog, &format!("I{i}"), true, 0).await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let report = engine.run_emergency_cleanup().await.unwrap();
        assert_eq!(report.runs_archived, 2);
        assert_eq!(archive.run_count().await.unwrap(), 2);
        assert_eq!(runlog.run_count().await.unwrap(), 6);

        let metrics = runlog.cleanup_metrics(None).await.unwrap();
        assert!(metrics
            .iter()
            .any(|m| m.operation == CleanupOperation::Emergency));
    }

    #[tokio::test]
    async fn count_overage_is_archived() {
        let (_dir, runlog, archive, engine) = engine_with(retention(RetentionPolicy {
            max_runs: 2,
            archive_after_days: 3_650,
            delete_after_days: 3_650,
            ..Default::default()
        }))
        .await;
        for i in 0..5 {
            terminal_run(&runlog, &format!("I{i}"), true, 0).await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let report = engine.run_immediate_cleanup().await.unwrap();
        assert_eq!(report.runs_archived, 3);
        assert_eq!(runlog.run_count().await.unwrap(), 2);
        assert_eq!(archive.run_count().await.unwrap(), 3);
    }
}
