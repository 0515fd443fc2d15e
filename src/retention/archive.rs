//! Secondary store for retired runs and decisions.
//!
//! Archived rows keep the full record plus `archive_reason` and
//! `archived_at`. Combined queries merge active and archive results and
//! deduplicate by run id, active copy first.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::runlog::store::{decision_from_row, fmt_ts, now_ts, parse_ts, run_from_row};
use crate::runlog::{Decision, Run, RunFilter, RunLog, StoreError};

const ARCHIVE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS archived_runs (
    id TEXT PRIMARY KEY,
    issue_id TEXT NOT NULL,
    session_id TEXT,
    agent_id TEXT NOT NULL,
    policy_name TEXT NOT NULL,
    phase TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT,
    outcome TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    archive_reason TEXT NOT NULL,
    archived_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_archived_runs_issue ON archived_runs(issue_id);
CREATE INDEX IF NOT EXISTS idx_archived_runs_created ON archived_runs(created_at);
CREATE TABLE IF NOT EXISTS archived_decisions (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL,
    issue_id TEXT NOT NULL,
    decision_type TEXT NOT NULL,
    decision TEXT NOT NULL,
    reasoning TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    archive_reason TEXT NOT NULL,
    archived_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_archived_decisions_run ON archived_decisions(run_id);
"#;

/// A run with its archive bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedRun {
    pub run: Run,
    pub archive_reason: String,
    pub archived_at: DateTime<Utc>,
}

pub struct ArchiveStore {
    pool: SqlitePool,
    db_path: PathBuf,
}

impl ArchiveStore {
    pub async fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let archive_dir = data_dir.join("archive");
        std::fs::create_dir_all(&archive_dir)?;
        let db_path = archive_dir.join("archive.db");

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(3)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(ARCHIVE_DDL).execute(&pool).await?;

        Ok(Self { pool, db_path })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn storage_bytes(&self) -> u64 {
        std::fs::metadata(&self.db_path).map(|m| m.len()).unwrap_or(0)
    }

    pub async fn archive_run(&self, run: &Run, reason: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO archived_runs \
             (id, issue_id, session_id, agent_id, policy_name, phase, status, \
              created_at, updated_at, completed_at, outcome, metadata, \
              archive_reason, archived_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&run.id)
        .bind(&run.issue_id)
        .bind(&run.session_id)
        .bind(&run.agent_id)
        .bind(&run.policy_name)
        .bind(&run.phase)
        .bind(run.status.as_str())
        .bind(fmt_ts(&run.created_at))
        .bind(fmt_ts(&run.updated_at))
        .bind(run.completed_at.as_ref().map(fmt_ts))
        .bind(
            run.outcome
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(serde_json::to_string(&run.metadata)?)
        .bind(reason)
        .bind(fmt_ts(&now_ts()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn archive_decision(
        &self,
        decision: &Decision,
        reason: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO archived_decisions \
             (id, run_id, issue_id, decision_type, decision, reasoning, metadata, \
              created_at, archive_reason, archived_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&decision.id)
        .bind(&decision.run_id)
        .bind(&decision.issue_id)
        .bind(decision.decision_type.as_str())
        .bind(&decision.decision)
        .bind(&decision.reasoning)
        .bind(serde_json::to_string(&decision.metadata)?)
        .bind(fmt_ts(&decision.created_at))
        .bind(reason)
        .bind(fmt_ts(&now_ts()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_run(&self, id: &str) -> Result<Option<ArchivedRun>, StoreError> {
        let row = sqlx::query("SELECT * FROM archived_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref()
            .map(|row| {
                Ok(ArchivedRun {
                    run: run_from_row(row)?,
                    archive_reason: row.get("archive_reason"),
                    archived_at: parse_ts(&row.get::<String, _>("archived_at"))?,
                })
            })
            .transpose()
    }

    /// Filtered query over archived runs, newest first.
    pub async fn query_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, StoreError> {
        let mut sql = String::from("SELECT * FROM archived_runs WHERE 1=1");
        if filter.issue_id.is_some() {
            sql.push_str(" AND issue_id = ?");
        }
        if filter.agent_id.is_some() {
            sql.push_str(" AND agent_id = ?");
        }
        if filter.phase.is_some() {
            sql.push_str(" AND phase = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.created_after.is_some() {
            sql.push_str(" AND created_at > ?");
        }
        if filter.created_before.is_some() {
            sql.push_str(" AND created_at < ?");
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(issue_id) = &filter.issue_id {
            query = query.bind(issue_id);
        }
        if let Some(agent_id) = &filter.agent_id {
            query = query.bind(agent_id);
        }
        if let Some(phase) = &filter.phase {
            query = query.bind(phase);
        }
        if let Some(status) = &filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(after) = &filter.created_after {
            query = query.bind(fmt_ts(after));
        }
        if let Some(before) = &filter.created_before {
            query = query.bind(fmt_ts(before));
        }
        query = query.bind(filter.limit.map(|l| l as i64).unwrap_or(i64::MAX));

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(run_from_row).collect()
    }

    pub async fn decisions_for_run(&self, run_id: &str) -> Result<Vec<Decision>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM archived_decisions WHERE run_id = ? \
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decision_from_row).collect()
    }

    pub async fn run_count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) FROM archived_runs")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>(0) as u64)
    }

    pub(crate) async fn all_run_ids(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT id FROM archived_runs")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }
}

/// Merge active and archived runs. Each run id appears exactly once (the
/// active copy wins), the union is sorted newest first, and the filter's
/// limit applies across the whole union.
pub async fn query_all_runs(
    active: &RunLog,
    archive: &ArchiveStore,
    filter: &RunFilter,
) -> Result<Vec<Run>, StoreError> {
    let unbounded = RunFilter {
        limit: None,
        offset: None,
        ..filter.clone()
    };

    let active_runs = active.query_runs(&unbounded).await?;
    let archived_runs = archive.query_runs(&unbounded).await?;

    let mut seen: HashSet<String> = HashSet::new();
    let mut merged = Vec::with_capacity(active_runs.len() + archived_runs.len());
    for run in active_runs.into_iter().chain(archived_runs) {
        if seen.insert(run.id.clone()) {
            merged.push(run);
        }
    }

    merged.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });

    let offset = filter.offset.unwrap_or(0);
    let limit = filter.limit.unwrap_or(usize::MAX);
    Ok(merged.into_iter().skip(offset).take(limit).collect())
}
