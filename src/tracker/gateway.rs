use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// Tracker unreachable or busy; safe to retry.
    #[error("Tracker unavailable: {0}")]
    Unavailable(String),

    /// The tracker answered but not in the shape we expect.
    #[error("Tracker protocol error: {0}")]
    Protocol(String),
}

impl From<TrackerError> for crate::error::AshepError {
    fn from(err: TrackerError) -> Self {
        match err {
            TrackerError::Unavailable(msg) => crate::error::AshepError::TransientIo(msg),
            TrackerError::Protocol(msg) => crate::error::AshepError::FatalIo(msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    InProgress,
    Blocked,
    Closed,
}

/// A work item as the external tracker reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub title: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub issue_type: Option<String>,

    /// Lower value means more urgent (tracker convention: 0 is critical).
    #[serde(default)]
    pub priority: i64,

    pub status: IssueStatus,

    #[serde(default)]
    pub labels: Vec<String>,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Issue {
    /// Policy name the issue asks for, if any.
    pub fn policy_name(&self) -> Option<&str> {
        self.metadata.get("policy").map(String::as_str)
    }

    pub fn current_phase(&self) -> Option<String> {
        super::labels::extract_phase(&self.labels)
    }

    pub fn hitl_reason(&self) -> Option<String> {
        super::labels::extract_hitl_reason(&self.labels)
    }

    pub fn is_excluded(&self) -> bool {
        self.labels.iter().any(|l| l == super::labels::EXCLUDED_LABEL)
    }
}

/// Read/write access to the external tracker.
///
/// Label writes are best-effort idempotent: set-then-remove sequences are
/// safe to retry after an `Unavailable` error.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Candidate issues ordered by priority (most urgent first) then age.
    async fn list_ready(&self) -> Result<Vec<Issue>, TrackerError>;

    async fn get(&self, id: &str) -> Result<Issue, TrackerError>;

    /// Atomically replace any existing `ashep-phase:*` label.
    async fn set_phase_label(&self, id: &str, phase: &str) -> Result<(), TrackerError>;

    async fn clear_phase_labels(&self, id: &str) -> Result<(), TrackerError>;

    async fn set_hitl_label(&self, id: &str, reason: &str) -> Result<(), TrackerError>;

    async fn clear_hitl_labels(&self, id: &str) -> Result<(), TrackerError>;

    async fn has_excluded_label(&self, id: &str) -> Result<bool, TrackerError>;

    async fn current_phase(&self, id: &str) -> Result<Option<String>, TrackerError>;

    async fn hitl_reason(&self, id: &str) -> Result<Option<String>, TrackerError>;

    /// Mark the issue closed in the tracker.
    async fn close_issue(&self, id: &str) -> Result<(), TrackerError>;
}

/// Sort candidates the way the dispatcher consumes them.
pub fn order_for_dispatch(issues: &mut [Issue]) {
    issues.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(id: &str, priority: i64, age_secs: i64) -> Issue {
        Issue {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            issue_type: None,
            priority,
            status: IssueStatus::Open,
            labels: Vec::new(),
            created_at: Some(Utc::now() - chrono::Duration::seconds(age_secs)),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn dispatch_order_priority_then_age() {
        let mut issues = vec![issue("c", 2, 100), issue("a", 0, 10), issue("b", 0, 50)];
        order_for_dispatch(&mut issues);
        let ids: Vec<_> = issues.iter().map(|i| i.id.as_str()).collect();
        // Same priority: older first.
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn issue_label_helpers() {
        let mut i = issue("x", 1, 0);
        i.labels = vec![
            "ashep-phase:implement".to_string(),
            "ashep-excluded".to_string(),
        ];
        assert_eq!(i.current_phase().as_deref(), Some("implement"));
        assert!(i.is_excluded());
        assert_eq!(i.hitl_reason(), None);
    }
}
