//! Sqlite-indexed store with crash-safe append logs.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use super::error::StoreError;
use super::types::{
    Decision, DecisionType, NewDecision, Run, RunDraft, RunFilter, RunPatch, RunStatus,
};

pub(crate) const RUNS_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
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
    metadata TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_runs_issue ON runs(issue_id);
CREATE INDEX IF NOT EXISTS idx_runs_issue_phase ON runs(issue_id, phase);
CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at);
"#;

pub(crate) const DECISIONS_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS decisions (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL,
    issue_id TEXT NOT NULL,
    decision_type TEXT NOT NULL,
    decision TEXT NOT NULL,
    reasoning TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_decisions_run ON decisions(run_id);
CREATE INDEX IF NOT EXISTS idx_decisions_issue ON decisions(issue_id, created_at);
"#;

const MESSAGES_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS phase_messages (
    id TEXT PRIMARY KEY,
    issue_id TEXT NOT NULL,
    from_phase TEXT NOT NULL,
    to_phase TEXT NOT NULL,
    message_type TEXT NOT NULL,
    content TEXT NOT NULL,
    metadata TEXT,
    is_read INTEGER NOT NULL DEFAULT 0,
    run_counter INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_issue ON phase_messages(issue_id, to_phase);
"#;

const CLEANUP_METRICS_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS cleanup_metrics (
    id TEXT PRIMARY KEY,
    recorded_at TEXT NOT NULL,
    policy_name TEXT NOT NULL,
    operation TEXT NOT NULL,
    issue_id TEXT,
    runs_processed INTEGER NOT NULL DEFAULT 0,
    runs_archived INTEGER NOT NULL DEFAULT 0,
    runs_deleted INTEGER NOT NULL DEFAULT 0,
    bytes_archived INTEGER NOT NULL DEFAULT 0,
    bytes_deleted INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER NOT NULL DEFAULT 0
);
"#;

/// Current time truncated to microseconds, the precision the column format
/// preserves. Keeps in-memory records byte-equivalent with reloaded ones.
pub(crate) fn now_ts() -> DateTime<Utc> {
    use chrono::Timelike;
    let now = Utc::now();
    now.with_nanosecond(now.nanosecond() / 1_000 * 1_000)
        .unwrap_or(now)
}

pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{raw}': {e}")))
}

pub(crate) fn run_from_row(row: &SqliteRow) -> Result<Run, StoreError> {
    let status_raw: String = row.get("status");
    let status = RunStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown run status '{status_raw}'")))?;

    let outcome = row
        .get::<Option<String>, _>("outcome")
        .map(|raw| serde_json::from_str(&raw))
        .transpose()?;

    let metadata_raw: String = row.get("metadata");
    let metadata: HashMap<String, serde_json::Value> = serde_json::from_str(&metadata_raw)?;

    Ok(Run {
        id: row.get("id"),
        issue_id: row.get("issue_id"),
        session_id: row.get("session_id"),
        agent_id: row.get("agent_id"),
        policy_name: row.get("policy_name"),
        phase: row.get("phase"),
        status,
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
        completed_at: row
            .get::<Option<String>, _>("completed_at")
            .map(|raw| parse_ts(&raw))
            .transpose()?,
        outcome,
        metadata,
    })
}

pub(crate) fn decision_from_row(row: &SqliteRow) -> Result<Decision, StoreError> {
    let type_raw: String = row.get("decision_type");
    let decision_type = DecisionType::parse(&type_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown decision type '{type_raw}'")))?;

    Ok(Decision {
        id: row.get("id"),
        run_id: row.get("run_id"),
        issue_id: row.get("issue_id"),
        decision_type,
        decision: row.get("decision"),
        reasoning: row.get("reasoning"),
        metadata: serde_json::from_str(&row.get::<String, _>("metadata"))?,
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
    })
}

pub struct RunLog {
    pool: SqlitePool,
    db_path: PathBuf,
    runs_log: PathBuf,
    decisions_log: PathBuf,
    append_guard: Mutex<()>,
}

impl RunLog {
    /// Open (or create) the store under `data_dir`. A missing index next to
    /// existing append logs triggers a rebuild from the logs.
    pub async fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("runs.db");
        let runs_log = data_dir.join("runs.jsonl");
        let decisions_log = data_dir.join("decisions.jsonl");
        let rebuild = !db_path.exists() && (runs_log.exists() || decisions_log.exists());

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        for ddl in [RUNS_DDL, DECISIONS_DDL, MESSAGES_DDL, CLEANUP_METRICS_DDL] {
            sqlx::raw_sql(ddl).execute(&pool).await?;
        }

        let store = Self {
            pool,
            db_path,
            runs_log,
            decisions_log,
            append_guard: Mutex::new(()),
        };

        if rebuild {
            store.rebuild_from_logs().await?;
        }

        Ok(store)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Bytes on disk across the index and append logs.
    pub fn storage_bytes(&self) -> u64 {
        [&self.db_path, &self.runs_log, &self.decisions_log]
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum()
    }

    async fn rebuild_from_logs(&self) -> Result<(), StoreError> {
        tracing::warn!("Run index missing; rebuilding from append logs");

        if self.runs_log.exists() {
            let content = std::fs::read_to_string(&self.runs_log)?;
            // Later snapshots of the same run replace earlier ones.
            let mut latest: HashMap<String, Run> = HashMap::new();
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                let run: Run = serde_json::from_str(line)
                    .map_err(|e| StoreError::Corrupt(format!("runs.jsonl: {e}")))?;
                latest.insert(run.id.clone(), run);
            }
            let count = latest.len();
            for run in latest.into_values() {
                self.upsert_run(&run).await?;
            }
            tracing::info!("Rebuilt {count} runs from runs.jsonl");
        }

        if self.decisions_log.exists() {
            let content = std::fs::read_to_string(&self.decisions_log)?;
            let mut count = 0usize;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                let decision: Decision = serde_json::from_str(line)
                    .map_err(|e| StoreError::Corrupt(format!("decisions.jsonl: {e}")))?;
                self.insert_decision_row(&decision).await?;
                count += 1;
            }
            tracing::info!("Rebuilt {count} decisions from decisions.jsonl");
        }

        Ok(())
    }

    fn append_line<T: serde::Serialize>(&self, path: &Path, record: &T) -> Result<(), StoreError> {
        let line = serde_json::to_string(record)?;
        let _guard = self.append_guard.lock().unwrap();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    async fn upsert_run(&self, run: &Run) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO runs \
             (id, issue_id, session_id, agent_id, policy_name, phase, status, \
              created_at, updated_at, completed_at, outcome, metadata) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
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
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_decision_row(&self, decision: &Decision) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR IGNORE INTO decisions \
             (id, run_id, issue_id, decision_type, decision, reasoning, metadata, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&decision.id)
        .bind(&decision.run_id)
        .bind(&decision.issue_id)
        .bind(decision.decision_type.as_str())
        .bind(&decision.decision)
        .bind(&decision.reasoning)
        .bind(serde_json::to_string(&decision.metadata)?)
        .bind(fmt_ts(&decision.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Create a run. Assigns id and timestamps unless the draft carries them.
    pub async fn create_run(&self, draft: RunDraft) -> Result<Run, StoreError> {
        let now = now_ts();
        let run = Run {
            id: draft
                .id
                .unwrap_or_else(|| format!("run-{}", Uuid::new_v4())),
            issue_id: draft.issue_id,
            session_id: draft.session_id,
            agent_id: draft.agent_id,
            policy_name: draft.policy_name,
            phase: draft.phase,
            status: draft.status.unwrap_or(RunStatus::Pending),
            created_at: now,
            updated_at: now,
            completed_at: None,
            outcome: None,
            metadata: draft.metadata,
        };

        // Append log commits before the index.
        self.append_line(&self.runs_log, &run)?;
        self.upsert_run(&run).await?;
        Ok(run)
    }

    /// Merge a patch into a non-terminal run.
    pub async fn update_run(&self, id: &str, patch: RunPatch) -> Result<Run, StoreError> {
        let mut run = self
            .get_run(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("run {id}")))?;

        if run.status.is_terminal() {
            return Err(StoreError::TerminalRunImmutable(id.to_string()));
        }

        let now = now_ts();
        if let Some(status) = patch.status {
            run.status = status;
            if status.is_terminal() {
                run.completed_at = Some(now);
            }
        }
        if let Some(session_id) = patch.session_id {
            run.session_id = Some(session_id);
        }
        if let Some(outcome) = patch.outcome {
            run.outcome = Some(outcome);
        }
        run.metadata.extend(patch.metadata);
        run.updated_at = now;

        self.append_line(&self.runs_log, &run)?;
        self.upsert_run(&run).await?;
        Ok(run)
    }

    /// Refresh `updated_at` on a live run (progress heartbeat). Terminal
    /// runs are left untouched; heartbeats are not mirrored to the append
    /// log.
    pub async fn touch_run(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE runs SET updated_at = ? WHERE id = ? AND status IN ('pending', 'running')",
        )
        .bind(fmt_ts(&now_ts()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_run(&self, id: &str) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    /// Filtered query, newest first.
    pub async fn query_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, StoreError> {
        let mut sql = String::from("SELECT * FROM runs WHERE 1=1");
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
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?");

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
        query = query
            .bind(filter.limit.map(|l| l as i64).unwrap_or(i64::MAX))
            .bind(filter.offset.map(|o| o as i64).unwrap_or(0));

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(run_from_row).collect()
    }

    /// Runs currently pending or running.
    pub async fn live_runs(&self) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM runs WHERE status IN ('pending', 'running') ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    /// Whether the issue has a run that has not reached a terminal status.
    pub async fn has_live_run(&self, issue_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) FROM runs WHERE issue_id = ? AND status IN ('pending', 'running')",
        )
        .bind(issue_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>(0) > 0)
    }

    /// Remove a run and its decisions from the index. Retention only; the
    /// append log keeps the historical record.
    pub(crate) async fn delete_run_rows(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM decisions WHERE run_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM runs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Total rows in the runs table.
    pub async fn run_count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) FROM runs")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>(0) as u64)
    }

    pub(crate) async fn all_run_ids(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT id FROM runs")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    /// Append-only decision record.
    pub async fn log_decision(&self, new: NewDecision) -> Result<Decision, StoreError> {
        let decision = Decision {
            id: format!("dec-{}", Uuid::new_v4()),
            run_id: new.run_id,
            issue_id: new.issue_id,
            decision_type: new.decision_type,
            decision: new.decision,
            reasoning: new.reasoning,
            metadata: new.metadata,
            created_at: now_ts(),
        };

        self.append_line(&self.decisions_log, &decision)?;
        self.insert_decision_row(&decision).await?;
        Ok(decision)
    }

    /// Decisions for one run in insertion order.
    pub async fn decisions_for_run(&self, run_id: &str) -> Result<Vec<Decision>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM decisions WHERE run_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decision_from_row).collect()
    }

    /// Most recent decisions for an issue, newest first.
    pub async fn decisions_for_issue(
        &self,
        issue_id: &str,
        limit: usize,
    ) -> Result<Vec<Decision>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM decisions WHERE issue_id = ? \
             ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(issue_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decision_from_row).collect()
    }
}
