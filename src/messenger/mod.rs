//! Typed inter-phase messages.
//!
//! Phases talk to each other through durable messages: a `result` summary
//! for the next phase, `context` explaining a jump back, `decision` records,
//! or free-form `data`. Delivery order follows the per-issue run counter;
//! consumers mark messages read. On issue completion the whole conversation
//! is archived to one jsonl file per issue and removed from the active
//! store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{AshepError, Result};
use crate::runlog::{
    CleanupMetric, CleanupOperation, MessageFilter, MessageStats, NewCleanupMetric,
    NewPhaseMessage, PhaseMessage, RunLog,
};

pub struct PhaseMessenger {
    runlog: Arc<RunLog>,
    archive_dir: PathBuf,
}

impl PhaseMessenger {
    pub fn new(runlog: Arc<RunLog>, data_dir: &Path) -> Self {
        Self {
            runlog,
            archive_dir: data_dir.join("messages_archive"),
        }
    }

    fn archive_file(&self, issue_id: &str) -> PathBuf {
        self.archive_dir.join(format!("{issue_id}.jsonl"))
    }

    pub async fn send_message(&self, new: NewPhaseMessage) -> Result<PhaseMessage> {
        let message = self.runlog.insert_message(new).await?;
        tracing::debug!(
            "Phase message {} -> {} for {} ({})",
            message.from_phase,
            message.to_phase,
            message.issue_id,
            message.message_type.as_str()
        );
        Ok(message)
    }

    /// Unread messages addressed to `to_phase`, in send order. With
    /// `mark_read` the delivery is recorded atomically with the read.
    pub async fn receive_messages(
        &self,
        issue_id: &str,
        to_phase: &str,
        mark_read: bool,
    ) -> Result<Vec<PhaseMessage>> {
        let messages = self
            .runlog
            .list_messages(&MessageFilter {
                issue_id: Some(issue_id.to_string()),
                to_phase: Some(to_phase.to_string()),
                unread_only: true,
                ..Default::default()
            })
            .await?;

        if mark_read && !messages.is_empty() {
            let ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();
            self.runlog.mark_messages_read(&ids).await?;
        }
        Ok(messages)
    }

    pub async fn list_messages(&self, filter: &MessageFilter) -> Result<Vec<PhaseMessage>> {
        Ok(self.runlog.list_messages(filter).await?)
    }

    /// Write every message of the issue to its archive file, with the
    /// archive bookkeeping appended. Returns the number archived.
    pub async fn archive_messages_for_issue(
        &self,
        issue_id: &str,
        reason: &str,
    ) -> Result<usize> {
        let messages = self
            .runlog
            .list_messages(&MessageFilter {
                issue_id: Some(issue_id.to_string()),
                ..Default::default()
            })
            .await?;
        if messages.is_empty() {
            return Ok(0);
        }

        std::fs::create_dir_all(&self.archive_dir)?;
        let archived_at = chrono::Utc::now();
        let mut lines = String::new();
        for message in &messages {
            let mut value = serde_json::to_value(message)?;
            let object = value
                .as_object_mut()
                .ok_or_else(|| AshepError::Internal("message did not serialize to an object".into()))?;
            object.insert(
                "archived_at".to_string(),
                serde_json::Value::String(archived_at.to_rfc3339()),
            );
            object.insert(
                "archive_reason".to_string(),
                serde_json::Value::String(reason.to_string()),
            );
            lines.push_str(&serde_json::to_string(&value)?);
            lines.push('\n');
        }

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.archive_file(issue_id))?;
        file.write_all(lines.as_bytes())?;

        Ok(messages.len())
    }

    /// Archive then delete the issue's messages, recording a cleanup metric
    /// with the sizes before and after.
    pub async fn cleanup_phase_messages(
        &self,
        issue_id: &str,
        reason: &str,
    ) -> Result<CleanupMetric> {
        let started = std::time::Instant::now();

        let messages = self
            .runlog
            .list_messages(&MessageFilter {
                issue_id: Some(issue_id.to_string()),
                ..Default::default()
            })
            .await?;
        let size_before: u64 = messages
            .iter()
            .filter_map(|m| serde_json::to_string(m).ok())
            .map(|s| s.len() as u64)
            .sum();

        let archived = self.archive_messages_for_issue(issue_id, reason).await?;
        let deleted = self.runlog.delete_messages_for_issue(issue_id).await?;

        let metric = self
            .runlog
            .record_cleanup_metric(NewCleanupMetric {
                policy_name: "phase-messages".to_string(),
                operation: CleanupOperation::Archive,
                issue_id: Some(issue_id.to_string()),
                runs_processed: archived as u64,
                runs_archived: archived as u64,
                runs_deleted: deleted,
                bytes_archived: size_before,
                bytes_deleted: size_before,
                duration_ms: started.elapsed().as_millis() as u64,
            })
            .await?;

        tracing::info!(
            "Archived {archived} and deleted {deleted} phase messages for {issue_id} ({reason})"
        );
        Ok(metric)
    }

    pub async fn message_stats(&self, issue_id: Option<&str>) -> Result<MessageStats> {
        Ok(self.runlog.message_stats(issue_id).await?)
    }

    pub async fn cleanup_metrics(&self, issue_id: Option<&str>) -> Result<Vec<CleanupMetric>> {
        Ok(self.runlog.cleanup_metrics(issue_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runlog::MessageType;

    async fn messenger() -> (tempfile::TempDir, Arc<RunLog>, PhaseMessenger) {
        let dir = tempfile::tempdir().unwrap();
        let runlog = Arc::new(RunLog::open(dir.path()).await.unwrap());
        let messenger = PhaseMessenger::new(Arc::clone(&runlog), dir.path());
        (dir, runlog, messenger)
    }

    fn message(issue: &str, to: &str, content: &str) -> NewPhaseMessage {
        NewPhaseMessage {
            issue_id: issue.to_string(),
            from_phase: "implement".to_string(),
            to_phase: to.to_string(),
            message_type: MessageType::Result,
            content: content.to_string(),
            metadata: None,
            run_counter: None,
        }
    }

    #[tokio::test]
    async fn receive_marks_read_once() {
        let (_dir, _runlog, messenger) = messenger().await;
        messenger.send_message(message("I1", "test", "first")).await.unwrap();
        messenger.send_message(message("I1", "test", "second")).await.unwrap();

        let received = messenger.receive_messages("I1", "test", true).await.unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].content, "first");

        // Already consumed.
        let again = messenger.receive_messages("I1", "test", true).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn receive_without_marking_leaves_unread() {
        let (_dir, _runlog, messenger) = messenger().await;
        messenger.send_message(message("I1", "test", "peek")).await.unwrap();

        let peeked = messenger.receive_messages("I1", "test", false).await.unwrap();
        assert_eq!(peeked.len(), 1);
        let again = messenger.receive_messages("I1", "test", true).await.unwrap();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn cleanup_archives_then_deletes() {
        let (dir, _runlog, messenger) = messenger().await;
        messenger.send_message(message("I1", "test", "a")).await.unwrap();
        messenger.send_message(message("I1", "validate", "b")).await.unwrap();
        messenger.send_message(message("I2", "test", "other")).await.unwrap();

        let metric = messenger
            .cleanup_phase_messages("I1", "issue completed")
            .await
            .unwrap();
        assert_eq!(metric.runs_archived, 2);
        assert_eq!(metric.runs_deleted, 2);
        assert!(metric.bytes_archived > 0);

        // Archive file holds both messages with their reason.
        let content =
            std::fs::read_to_string(dir.path().join("messages_archive").join("I1.jsonl")).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["archive_reason"], "issue completed");
        assert!(first["archived_at"].is_string());

        // Other issues untouched.
        let stats = messenger.message_stats(Some("I2")).await.unwrap();
        assert_eq!(stats.total, 1);
        let stats = messenger.message_stats(Some("I1")).await.unwrap();
        assert_eq!(stats.total, 0);

        let metrics = messenger.cleanup_metrics(Some("I1")).await.unwrap();
        assert_eq!(metrics.len(), 1);
    }
}
