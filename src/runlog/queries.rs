//! Indexed queries: counters for loop prevention, session token budgets,
//! duration statistics, phase messages, and cleanup metrics.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use super::error::StoreError;
use super::store::{fmt_ts, now_ts, parse_ts, RunLog};
use super::types::{
    CleanupMetric, CleanupOperation, DurationStats, MessageFilter, MessageStats, MessageType,
    NewCleanupMetric, NewPhaseMessage, PhaseDuration, PhaseMessage, RunFilter,
};

fn message_from_row(row: &SqliteRow) -> Result<PhaseMessage, StoreError> {
    let type_raw: String = row.get("message_type");
    let message_type = MessageType::parse(&type_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown message type '{type_raw}'")))?;

    Ok(PhaseMessage {
        id: row.get("id"),
        issue_id: row.get("issue_id"),
        from_phase: row.get("from_phase"),
        to_phase: row.get("to_phase"),
        message_type,
        content: row.get("content"),
        metadata: row
            .get::<Option<String>, _>("metadata")
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?,
        read: row.get::<i64, _>("is_read") != 0,
        run_counter: row.get("run_counter"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
    })
}

impl RunLog {
    /// Total attempts of `phase` for `issue_id`, any status.
    pub async fn phase_visit_count(&self, issue_id: &str, phase: &str) -> Result<u32, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) FROM runs WHERE issue_id = ? AND phase = ?")
            .bind(issue_id)
            .bind(phase)
            .fetch_one(self.pool())
            .await?;
        Ok(row.get::<i64, _>(0) as u32)
    }

    /// Prior failed attempts of `phase` (failed or timed out).
    pub async fn phase_retry_count(&self, issue_id: &str, phase: &str) -> Result<u32, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) FROM runs \
             WHERE issue_id = ? AND phase = ? AND status IN ('failed', 'timeout')",
        )
        .bind(issue_id)
        .bind(phase)
        .fetch_one(self.pool())
        .await?;
        Ok(row.get::<i64, _>(0) as u32)
    }

    /// How often the issue has taken the (from -> to) transition.
    pub async fn transition_count(
        &self,
        issue_id: &str,
        from_phase: &str,
        to_phase: &str,
    ) -> Result<u32, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) FROM decisions \
             WHERE issue_id = ? AND decision_type = 'phase_transition' \
               AND json_extract(metadata, '$.from_phase') = ? \
               AND json_extract(metadata, '$.to_phase') = ?",
        )
        .bind(issue_id)
        .bind(from_phase)
        .bind(to_phase)
        .fetch_one(self.pool())
        .await?;
        Ok(row.get::<i64, _>(0) as u32)
    }

    /// Last `limit` (from, to) transitions for an issue, newest first.
    pub async fn recent_transitions(
        &self,
        issue_id: &str,
        limit: usize,
    ) -> Result<Vec<(String, String)>, StoreError> {
        let rows = sqlx::query(
            "SELECT metadata FROM decisions \
             WHERE issue_id = ? AND decision_type = 'phase_transition' \
               AND json_extract(metadata, '$.to_phase') IS NOT NULL \
             ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(issue_id)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;

        let mut transitions = Vec::with_capacity(rows.len());
        for row in rows {
            let metadata: serde_json::Value = serde_json::from_str(&row.get::<String, _>(0))?;
            let from = metadata
                .get("from_phase")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let to = metadata
                .get("to_phase")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            transitions.push((from, to));
        }
        Ok(transitions)
    }

    /// Session of the most recent completed run of `phase` for the issue.
    pub async fn last_successful_session(
        &self,
        issue_id: &str,
        phase: &str,
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            "SELECT session_id FROM runs \
             WHERE issue_id = ? AND phase = ? AND status = 'completed' \
               AND session_id IS NOT NULL \
             ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(issue_id)
        .bind(phase)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|r| r.get(0)))
    }

    /// Most recent session used anywhere on this issue (shared sessions).
    pub async fn last_session_for_issue(
        &self,
        issue_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            "SELECT session_id FROM runs \
             WHERE issue_id = ? AND session_id IS NOT NULL \
             ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(issue_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|r| r.get(0)))
    }

    /// Cumulative tokens consumed by `session_id` on this issue.
    pub async fn session_tokens(
        &self,
        issue_id: &str,
        session_id: &str,
    ) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT SUM(json_extract(outcome, '$.metrics.tokens_used')) FROM runs \
             WHERE issue_id = ? AND session_id = ?",
        )
        .bind(issue_id)
        .bind(session_id)
        .fetch_one(self.pool())
        .await?;
        Ok(row.get::<Option<i64>, _>(0).unwrap_or(0).max(0) as u64)
    }

    pub async fn phase_total_duration(
        &self,
        issue_id: &str,
        phase: &str,
    ) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT SUM(json_extract(outcome, '$.metrics.duration_ms')) FROM runs \
             WHERE issue_id = ? AND phase = ? AND outcome IS NOT NULL",
        )
        .bind(issue_id)
        .bind(phase)
        .fetch_one(self.pool())
        .await?;
        Ok(row.get::<Option<i64>, _>(0).unwrap_or(0).max(0) as u64)
    }

    pub async fn phase_average_duration(
        &self,
        issue_id: &str,
        phase: &str,
    ) -> Result<f64, StoreError> {
        let row = sqlx::query(
            "SELECT AVG(json_extract(outcome, '$.metrics.duration_ms')) FROM runs \
             WHERE issue_id = ? AND phase = ? AND outcome IS NOT NULL",
        )
        .bind(issue_id)
        .bind(phase)
        .fetch_one(self.pool())
        .await?;
        Ok(row.get::<Option<f64>, _>(0).unwrap_or(0.0))
    }

    /// Duration statistics over runs matching the filter.
    pub async fn duration_stats(&self, filter: &RunFilter) -> Result<DurationStats, StoreError> {
        let mut sql = String::from(
            "SELECT COUNT(*), \
                    COALESCE(SUM(json_extract(outcome, '$.metrics.duration_ms')), 0), \
                    COALESCE(AVG(json_extract(outcome, '$.metrics.duration_ms')), 0), \
                    COALESCE(MIN(json_extract(outcome, '$.metrics.duration_ms')), 0), \
                    COALESCE(MAX(json_extract(outcome, '$.metrics.duration_ms')), 0) \
             FROM runs WHERE outcome IS NOT NULL",
        );
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

        let row = query.fetch_one(self.pool()).await?;
        Ok(DurationStats {
            count: row.get::<i64, _>(0) as u64,
            total_ms: row.get::<i64, _>(1).max(0) as u64,
            average_ms: row.get::<f64, _>(2),
            min_ms: row.get::<i64, _>(3).max(0) as u64,
            max_ms: row.get::<i64, _>(4).max(0) as u64,
        })
    }

    /// Phases of an issue ranked by average duration, slowest first.
    pub async fn slowest_phases(
        &self,
        issue_id: &str,
        limit: usize,
    ) -> Result<Vec<PhaseDuration>, StoreError> {
        let rows = sqlx::query(
            "SELECT phase, COUNT(*), \
                    COALESCE(SUM(json_extract(outcome, '$.metrics.duration_ms')), 0), \
                    COALESCE(AVG(json_extract(outcome, '$.metrics.duration_ms')), 0) \
             FROM runs WHERE issue_id = ? AND outcome IS NOT NULL \
             GROUP BY phase ORDER BY 4 DESC LIMIT ?",
        )
        .bind(issue_id)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| PhaseDuration {
                phase: row.get(0),
                count: row.get::<i64, _>(1) as u64,
                total_ms: row.get::<i64, _>(2).max(0) as u64,
                average_ms: row.get::<f64, _>(3),
            })
            .collect())
    }

    /// Insert a phase message; `run_counter` defaults to one past the
    /// issue's current maximum so delivery order is preserved.
    pub async fn insert_message(
        &self,
        new: NewPhaseMessage,
    ) -> Result<PhaseMessage, StoreError> {
        let run_counter = match new.run_counter {
            Some(counter) => counter,
            None => {
                let row = sqlx::query(
                    "SELECT COALESCE(MAX(run_counter), 0) FROM phase_messages WHERE issue_id = ?",
                )
                .bind(&new.issue_id)
                .fetch_one(self.pool())
                .await?;
                row.get::<i64, _>(0) + 1
            }
        };

        let message = PhaseMessage {
            id: format!("msg-{}", Uuid::new_v4()),
            issue_id: new.issue_id,
            from_phase: new.from_phase,
            to_phase: new.to_phase,
            message_type: new.message_type,
            content: new.content,
            metadata: new.metadata,
            read: false,
            run_counter,
            created_at: now_ts(),
        };

        sqlx::query(
            "INSERT INTO phase_messages \
             (id, issue_id, from_phase, to_phase, message_type, content, metadata, \
              is_read, run_counter, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(&message.id)
        .bind(&message.issue_id)
        .bind(&message.from_phase)
        .bind(&message.to_phase)
        .bind(message.message_type.as_str())
        .bind(&message.content)
        .bind(
            message
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(message.run_counter)
        .bind(fmt_ts(&message.created_at))
        .execute(self.pool())
        .await?;

        Ok(message)
    }

    pub async fn list_messages(
        &self,
        filter: &MessageFilter,
    ) -> Result<Vec<PhaseMessage>, StoreError> {
        let mut sql = String::from("SELECT * FROM phase_messages WHERE 1=1");
        if filter.issue_id.is_some() {
            sql.push_str(" AND issue_id = ?");
        }
        if filter.from_phase.is_some() {
            sql.push_str(" AND from_phase = ?");
        }
        if filter.to_phase.is_some() {
            sql.push_str(" AND to_phase = ?");
        }
        if filter.message_type.is_some() {
            sql.push_str(" AND message_type = ?");
        }
        if filter.unread_only {
            sql.push_str(" AND is_read = 0");
        }
        sql.push_str(" ORDER BY run_counter ASC, created_at ASC, rowid ASC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(issue_id) = &filter.issue_id {
            query = query.bind(issue_id);
        }
        if let Some(from_phase) = &filter.from_phase {
            query = query.bind(from_phase);
        }
        if let Some(to_phase) = &filter.to_phase {
            query = query.bind(to_phase);
        }
        if let Some(message_type) = &filter.message_type {
            query = query.bind(message_type.as_str());
        }
        query = query.bind(filter.limit.map(|l| l as i64).unwrap_or(i64::MAX));

        let rows = query.fetch_all(self.pool()).await?;
        rows.iter().map(message_from_row).collect()
    }

    pub async fn mark_messages_read(&self, ids: &[String]) -> Result<(), StoreError> {
        for id in ids {
            sqlx::query("UPDATE phase_messages SET is_read = 1 WHERE id = ?")
                .bind(id)
                .execute(self.pool())
                .await?;
        }
        Ok(())
    }

    pub async fn delete_messages_for_issue(&self, issue_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM phase_messages WHERE issue_id = ?")
            .bind(issue_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn message_stats(
        &self,
        issue_id: Option<&str>,
    ) -> Result<MessageStats, StoreError> {
        let sql = match issue_id {
            Some(_) => {
                "SELECT message_type, COUNT(*), SUM(CASE WHEN is_read = 0 THEN 1 ELSE 0 END) \
                 FROM phase_messages WHERE issue_id = ? GROUP BY message_type"
            }
            None => {
                "SELECT message_type, COUNT(*), SUM(CASE WHEN is_read = 0 THEN 1 ELSE 0 END) \
                 FROM phase_messages GROUP BY message_type"
            }
        };

        let mut query = sqlx::query(sql);
        if let Some(issue_id) = issue_id {
            query = query.bind(issue_id);
        }

        let mut stats = MessageStats::default();
        for row in query.fetch_all(self.pool()).await? {
            let message_type: String = row.get(0);
            let count = row.get::<i64, _>(1) as u64;
            let unread = row.get::<Option<i64>, _>(2).unwrap_or(0) as u64;
            stats.total += count;
            stats.unread += unread;
            stats.by_type.insert(message_type, count);
        }
        Ok(stats)
    }

    pub async fn record_cleanup_metric(
        &self,
        new: NewCleanupMetric,
    ) -> Result<CleanupMetric, StoreError> {
        let metric = CleanupMetric {
            id: format!("clm-{}", Uuid::new_v4()),
            recorded_at: now_ts(),
            policy_name: new.policy_name,
            operation: new.operation,
            issue_id: new.issue_id,
            runs_processed: new.runs_processed,
            runs_archived: new.runs_archived,
            runs_deleted: new.runs_deleted,
            bytes_archived: new.bytes_archived,
            bytes_deleted: new.bytes_deleted,
            duration_ms: new.duration_ms,
        };

        sqlx::query(
            "INSERT INTO cleanup_metrics \
             (id, recorded_at, policy_name, operation, issue_id, runs_processed, \
              runs_archived, runs_deleted, bytes_archived, bytes_deleted, duration_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&metric.id)
        .bind(fmt_ts(&metric.recorded_at))
        .bind(&metric.policy_name)
        .bind(metric.operation.as_str())
        .bind(&metric.issue_id)
        .bind(metric.runs_processed as i64)
        .bind(metric.runs_archived as i64)
        .bind(metric.runs_deleted as i64)
        .bind(metric.bytes_archived as i64)
        .bind(metric.bytes_deleted as i64)
        .bind(metric.duration_ms as i64)
        .execute(self.pool())
        .await?;

        Ok(metric)
    }

    pub async fn cleanup_metrics(
        &self,
        issue_id: Option<&str>,
    ) -> Result<Vec<CleanupMetric>, StoreError> {
        let mut sql = String::from("SELECT * FROM cleanup_metrics WHERE 1=1");
        if issue_id.is_some() {
            sql.push_str(" AND issue_id = ?");
        }
        sql.push_str(" ORDER BY recorded_at DESC");

        let mut query = sqlx::query(&sql);
        if let Some(issue_id) = issue_id {
            query = query.bind(issue_id);
        }

        let rows = query.fetch_all(self.pool()).await?;
        rows.iter()
            .map(|row| {
                let operation_raw: String = row.get("operation");
                let operation = CleanupOperation::parse(&operation_raw).ok_or_else(|| {
                    StoreError::Corrupt(format!("unknown cleanup operation '{operation_raw}'"))
                })?;
                Ok(CleanupMetric {
                    id: row.get("id"),
                    recorded_at: parse_ts(&row.get::<String, _>("recorded_at"))?,
                    policy_name: row.get("policy_name"),
                    operation,
                    issue_id: row.get("issue_id"),
                    runs_processed: row.get::<i64, _>("runs_processed") as u64,
                    runs_archived: row.get::<i64, _>("runs_archived") as u64,
                    runs_deleted: row.get::<i64, _>("runs_deleted") as u64,
                    bytes_archived: row.get::<i64, _>("bytes_archived") as u64,
                    bytes_deleted: row.get::<i64, _>("bytes_deleted") as u64,
                    duration_ms: row.get::<i64, _>("duration_ms") as u64,
                })
            })
            .collect()
    }
}
