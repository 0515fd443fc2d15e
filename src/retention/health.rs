//! Storage health checks.

use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::collections::HashSet;
use std::sync::Arc;

use crate::runlog::{RunLog, StoreError};

use super::archive::ArchiveStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub passed: bool,
    /// Severity if the check fails.
    pub severity: HealthStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall: HealthStatus,
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    fn from_checks(checks: Vec<HealthCheck>) -> Self {
        let overall = checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.severity)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self { overall, checks }
    }
}

pub struct HealthChecker {
    runlog: Arc<RunLog>,
    archive: Arc<ArchiveStore>,
    run_vacuum: bool,
}

impl HealthChecker {
    pub fn new(runlog: Arc<RunLog>, archive: Arc<ArchiveStore>, run_vacuum: bool) -> Self {
        Self {
            runlog,
            archive,
            run_vacuum,
        }
    }

    pub async fn check_all(&self) -> HealthReport {
        let mut checks = vec![
            self.database_integrity().await,
            self.query_functionality().await,
            self.archive_accessibility().await,
            self.archive_consistency().await,
            self.index_health().await,
        ];
        if self.run_vacuum {
            checks.push(self.vacuum_optimization().await);
        }
        HealthReport::from_checks(checks)
    }

    async fn database_integrity(&self) -> HealthCheck {
        let result: Result<String, StoreError> = async {
            let row = sqlx::query("PRAGMA integrity_check")
                .fetch_one(self.runlog.pool())
                .await?;
            Ok(row.get::<String, _>(0))
        }
        .await;

        match result {
            Ok(verdict) if verdict == "ok" => check_ok("database_integrity", "integrity_check ok"),
            Ok(verdict) => check_failed(
                "database_integrity",
                HealthStatus::Critical,
                format!("integrity_check reported: {verdict}"),
            ),
            Err(e) => check_failed(
                "database_integrity",
                HealthStatus::Critical,
                format!("integrity_check failed: {e}"),
            ),
        }
    }

    async fn query_functionality(&self) -> HealthCheck {
        match self.runlog.run_count().await {
            Ok(count) => check_ok(
                "query_functionality",
                format!("index answers queries ({count} runs)"),
            ),
            Err(e) => check_failed(
                "query_functionality",
                HealthStatus::Critical,
                format!("query failed: {e}"),
            ),
        }
    }

    async fn archive_accessibility(&self) -> HealthCheck {
        match self.archive.run_count().await {
            Ok(count) => check_ok(
                "archive_accessibility",
                format!("archive reachable ({count} runs)"),
            ),
            Err(e) => check_failed(
                "archive_accessibility",
                HealthStatus::Warning,
                format!("archive unreachable: {e}"),
            ),
        }
    }

    /// A run id present in both stores points at a partial cleanup.
    async fn archive_consistency(&self) -> HealthCheck {
        let result: Result<Vec<String>, StoreError> = async {
            let active: HashSet<String> = self.runlog.all_run_ids().await?.into_iter().collect();
            Ok(self
                .archive
                .all_run_ids()
                .await?
                .into_iter()
                .filter(|id| active.contains(id))
                .collect())
        }
        .await;

        match result {
            Ok(duplicates) if duplicates.is_empty() => {
                check_ok("archive_consistency", "no run appears in both stores")
            }
            Ok(duplicates) => check_failed(
                "archive_consistency",
                HealthStatus::Warning,
                format!(
                    "{} run(s) present in both stores (e.g. {})",
                    duplicates.len(),
                    duplicates[0]
                ),
            ),
            Err(e) => check_failed(
                "archive_consistency",
                HealthStatus::Warning,
                format!("consistency scan failed: {e}"),
            ),
        }
    }

    async fn index_health(&self) -> HealthCheck {
        let expected = [
            "idx_runs_issue",
            "idx_runs_issue_phase",
            "idx_runs_status",
            "idx_runs_created",
            "idx_decisions_run",
            "idx_decisions_issue",
        ];

        let result: Result<HashSet<String>, StoreError> = async {
            let rows = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'index'")
                .fetch_all(self.runlog.pool())
                .await?;
            Ok(rows.iter().map(|r| r.get::<String, _>(0)).collect())
        }
        .await;

        match result {
            Ok(present) => {
                let missing: Vec<_> = expected
                    .iter()
                    .filter(|name| !present.contains(**name))
                    .collect();
                if missing.is_empty() {
                    check_ok("index_health", "all expected indexes present")
                } else {
                    check_failed(
                        "index_health",
                        HealthStatus::Warning,
                        format!("missing indexes: {missing:?}"),
                    )
                }
            }
            Err(e) => check_failed(
                "index_health",
                HealthStatus::Warning,
                format!("index scan failed: {e}"),
            ),
        }
    }

    async fn vacuum_optimization(&self) -> HealthCheck {
        match sqlx::query("VACUUM").execute(self.runlog.pool()).await {
            Ok(_) => check_ok("vacuum_optimization", "vacuum completed"),
            Err(e) => check_failed(
                "vacuum_optimization",
                HealthStatus::Warning,
                format!("vacuum failed: {e}"),
            ),
        }
    }
}

fn check_ok(name: &str, message: impl Into<String>) -> HealthCheck {
    HealthCheck {
        name: name.to_string(),
        passed: true,
        severity: HealthStatus::Healthy,
        message: message.into(),
    }
}

fn check_failed(name: &str, severity: HealthStatus, message: impl Into<String>) -> HealthCheck {
    HealthCheck {
        name: name.to_string(),
        passed: false,
        severity,
        message: message.into(),
    }
}
