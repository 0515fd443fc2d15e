use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::gateway::{order_for_dispatch, Issue, IssueStatus, IssueTracker, TrackerError};
use super::labels;

/// In-memory tracker for tests.
#[derive(Clone, Default)]
pub struct MockIssueTracker {
    issues: Arc<Mutex<HashMap<String, Issue>>>,
}

impl MockIssueTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, issue: Issue) {
        self.issues.lock().unwrap().insert(issue.id.clone(), issue);
    }

    pub fn snapshot(&self, id: &str) -> Option<Issue> {
        self.issues.lock().unwrap().get(id).cloned()
    }

    fn with_issue<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Issue) -> T,
    ) -> Result<T, TrackerError> {
        let mut issues = self.issues.lock().unwrap();
        let issue = issues
            .get_mut(id)
            .ok_or_else(|| TrackerError::Protocol(format!("unknown issue {id}")))?;
        Ok(f(issue))
    }
}

#[async_trait]
impl IssueTracker for MockIssueTracker {
    async fn list_ready(&self) -> Result<Vec<Issue>, TrackerError> {
        let mut ready: Vec<Issue> = self
            .issues
            .lock()
            .unwrap()
            .values()
            .filter(|i| !matches!(i.status, IssueStatus::Closed | IssueStatus::Blocked))
            .cloned()
            .collect();
        order_for_dispatch(&mut ready);
        Ok(ready)
    }

    async fn get(&self, id: &str) -> Result<Issue, TrackerError> {
        self.with_issue(id, |i| i.clone())
    }

    async fn set_phase_label(&self, id: &str, phase: &str) -> Result<(), TrackerError> {
        let label = labels::phase_label(phase);
        self.with_issue(id, |issue| {
            issue.labels.retain(|l| !l.starts_with(labels::PHASE_PREFIX));
            issue.labels.push(label);
        })
    }

    async fn clear_phase_labels(&self, id: &str) -> Result<(), TrackerError> {
        self.with_issue(id, |issue| {
            issue.labels.retain(|l| !l.starts_with(labels::PHASE_PREFIX));
        })
    }

    async fn set_hitl_label(&self, id: &str, reason: &str) -> Result<(), TrackerError> {
        let label = labels::hitl_label(reason);
        self.with_issue(id, |issue| {
            issue.labels.retain(|l| !l.starts_with(labels::HITL_PREFIX));
            issue.labels.push(label);
        })
    }

    async fn clear_hitl_labels(&self, id: &str) -> Result<(), TrackerError> {
        self.with_issue(id, |issue| {
            issue.labels.retain(|l| !l.starts_with(labels::HITL_PREFIX));
        })
    }

    async fn has_excluded_label(&self, id: &str) -> Result<bool, TrackerError> {
        self.with_issue(id, |issue| issue.is_excluded())
    }

    async fn current_phase(&self, id: &str) -> Result<Option<String>, TrackerError> {
        self.with_issue(id, |issue| issue.current_phase())
    }

    async fn hitl_reason(&self, id: &str) -> Result<Option<String>, TrackerError> {
        self.with_issue(id, |issue| issue.hitl_reason())
    }

    async fn close_issue(&self, id: &str) -> Result<(), TrackerError> {
        self.with_issue(id, |issue| {
            issue.status = IssueStatus::Closed;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_issue(id: &str) -> Issue {
        Issue {
            id: id.to_string(),
            title: format!("issue {id}"),
            description: String::new(),
            issue_type: None,
            priority: 1,
            status: IssueStatus::Open,
            labels: Vec::new(),
            created_at: Some(chrono::Utc::now()),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn phase_label_is_exclusive() {
        let tracker = MockIssueTracker::new();
        tracker.insert(open_issue("I1"));

        tracker.set_phase_label("I1", "implement").await.unwrap();
        tracker.set_phase_label("I1", "test").await.unwrap();

        let issue = tracker.get("I1").await.unwrap();
        let phase_labels: Vec<_> = issue
            .labels
            .iter()
            .filter(|l| l.starts_with(labels::PHASE_PREFIX))
            .collect();
        assert_eq!(phase_labels.len(), 1);
        assert_eq!(issue.current_phase().as_deref(), Some("test"));
    }

    #[tokio::test]
    async fn close_marks_closed_and_leaves_ready() {
        let tracker = MockIssueTracker::new();
        tracker.insert(open_issue("I1"));
        tracker.insert(open_issue("I2"));

        tracker.close_issue("I1").await.unwrap();

        let ready = tracker.list_ready().await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "I2");
    }
}
