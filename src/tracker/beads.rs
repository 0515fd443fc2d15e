//! Tracker gateway backed by the beads (`bd`) CLI.
//!
//! Every operation is one or two short-lived subprocess invocations with
//! `--json` output. Exit-status failures are protocol errors; spawn and I/O
//! failures are transient.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::TrackerConfig;
use crate::subprocess::{ProcessCommand, ProcessError, ProcessOutput, ProcessRunner};

use super::gateway::{order_for_dispatch, Issue, IssueStatus, IssueTracker, TrackerError};
use super::labels;

pub struct BeadsTracker {
    runner: Arc<dyn ProcessRunner>,
    config: TrackerConfig,
}

impl BeadsTracker {
    pub fn new(runner: Arc<dyn ProcessRunner>, config: TrackerConfig) -> Self {
        Self { runner, config }
    }

    fn command<I, S>(&self, args: I) -> ProcessCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ProcessCommand::new(self.config.bin.as_str())
            .args(self.config.args.clone())
            .args(args)
    }

    async fn invoke(&self, command: ProcessCommand) -> Result<ProcessOutput, TrackerError> {
        let output = self.runner.run(command).await.map_err(|e| match e {
            ProcessError::Io(_) | ProcessError::Timeout(_) => {
                TrackerError::Unavailable(e.to_string())
            }
            other => TrackerError::Protocol(other.to_string()),
        })?;

        if !output.status.success() {
            return Err(TrackerError::Protocol(format!(
                "tracker exited with {:?}: {}",
                output.status,
                output.stderr.trim()
            )));
        }
        Ok(output)
    }

    async fn add_label(&self, id: &str, label: &str) -> Result<(), TrackerError> {
        self.invoke(self.command(["label", "add", id, label]))
            .await?;
        Ok(())
    }

    async fn remove_label(&self, id: &str, label: &str) -> Result<(), TrackerError> {
        self.invoke(self.command(["label", "remove", id, label]))
            .await?;
        Ok(())
    }

    /// Remove every label of `prefix` except `keep`.
    async fn remove_prefixed(
        &self,
        id: &str,
        prefix: &str,
        keep: Option<&str>,
    ) -> Result<(), TrackerError> {
        let issue = self.get(id).await?;
        for label in issue.labels.iter().filter(|l| l.starts_with(prefix)) {
            if keep == Some(label.as_str()) {
                continue;
            }
            self.remove_label(id, label).await?;
        }
        Ok(())
    }
}

fn parse_status(raw: &str) -> IssueStatus {
    match raw {
        "in_progress" => IssueStatus::InProgress,
        "blocked" => IssueStatus::Blocked,
        "closed" | "done" => IssueStatus::Closed,
        _ => IssueStatus::Open,
    }
}

fn parse_issue(json: &Value) -> Result<Issue, TrackerError> {
    let id = json
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| TrackerError::Protocol("issue without id".to_string()))?
        .to_string();

    let labels = json
        .get("labels")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    let metadata = json
        .get("metadata")
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect::<HashMap<_, _>>()
        })
        .unwrap_or_default();

    Ok(Issue {
        id,
        title: json
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        description: json
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        issue_type: json
            .get("issue_type")
            .and_then(Value::as_str)
            .map(String::from),
        priority: json.get("priority").and_then(Value::as_i64).unwrap_or(2),
        status: parse_status(json.get("status").and_then(Value::as_str).unwrap_or("open")),
        created_at: json
            .get("created")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<DateTime<Utc>>().ok()),
        labels,
        metadata,
    })
}

#[async_trait]
impl IssueTracker for BeadsTracker {
    async fn list_ready(&self) -> Result<Vec<Issue>, TrackerError> {
        let output = self.invoke(self.command(["ready", "--json"])).await?;
        let json: Value = serde_json::from_str(output.stdout.trim())
            .map_err(|e| TrackerError::Protocol(format!("ready list is not JSON: {e}")))?;
        let items = json
            .as_array()
            .ok_or_else(|| TrackerError::Protocol("ready list is not an array".to_string()))?;

        let mut issues = items.iter().map(parse_issue).collect::<Result<Vec<_>, _>>()?;
        order_for_dispatch(&mut issues);
        Ok(issues)
    }

    async fn get(&self, id: &str) -> Result<Issue, TrackerError> {
        let output = self.invoke(self.command(["show", id, "--json"])).await?;
        let json: Value = serde_json::from_str(output.stdout.trim())
            .map_err(|e| TrackerError::Protocol(format!("issue {id} is not JSON: {e}")))?;
        parse_issue(&json)
    }

    async fn set_phase_label(&self, id: &str, phase: &str) -> Result<(), TrackerError> {
        let label = labels::phase_label(phase);
        // Add first so a retry after a partial failure converges on one label.
        self.add_label(id, &label).await?;
        self.remove_prefixed(id, labels::PHASE_PREFIX, Some(label.as_str()))
            .await
    }

    async fn clear_phase_labels(&self, id: &str) -> Result<(), TrackerError> {
        self.remove_prefixed(id, labels::PHASE_PREFIX, None).await
    }

    async fn set_hitl_label(&self, id: &str, reason: &str) -> Result<(), TrackerError> {
        let label = labels::hitl_label(reason);
        self.add_label(id, &label).await?;
        self.remove_prefixed(id, labels::HITL_PREFIX, Some(label.as_str()))
            .await
    }

    async fn clear_hitl_labels(&self, id: &str) -> Result<(), TrackerError> {
        self.remove_prefixed(id, labels::HITL_PREFIX, None).await
    }

    async fn has_excluded_label(&self, id: &str) -> Result<bool, TrackerError> {
        Ok(self.get(id).await?.is_excluded())
    }

    async fn current_phase(&self, id: &str) -> Result<Option<String>, TrackerError> {
        Ok(self.get(id).await?.current_phase())
    }

    async fn hitl_reason(&self, id: &str) -> Result<Option<String>, TrackerError> {
        Ok(self.get(id).await?.hitl_reason())
    }

    async fn close_issue(&self, id: &str) -> Result<(), TrackerError> {
        self.invoke(self.command(["close", id])).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::MockProcessRunner;

    fn tracker(mock: &MockProcessRunner) -> BeadsTracker {
        BeadsTracker::new(Arc::new(mock.clone()), TrackerConfig::default())
    }

    #[tokio::test]
    async fn list_ready_parses_and_orders() {
        let mock = MockProcessRunner::new();
        mock.push_success(
            "bd",
            r#"[
                {"id":"I2","title":"two","status":"open","priority":1},
                {"id":"I1","title":"one","status":"open","priority":0}
            ]"#,
        );
        let issues = tracker(&mock).list_ready().await.unwrap();
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].id, "I1");
    }

    #[tokio::test]
    async fn get_parses_labels_and_metadata() {
        let mock = MockProcessRunner::new();
        mock.push_success(
            "bd",
            r#"{"id":"I1","title":"one","status":"in_progress",
                "labels":["ashep-phase:test"],
                "metadata":{"policy":"simple"}}"#,
        );
        let issue = tracker(&mock).get("I1").await.unwrap();
        assert_eq!(issue.status, IssueStatus::InProgress);
        assert_eq!(issue.current_phase().as_deref(), Some("test"));
        assert_eq!(issue.policy_name(), Some("simple"));
    }

    #[tokio::test]
    async fn set_phase_label_replaces_existing() {
        let mock = MockProcessRunner::new();
        // add new label
        mock.push_success("bd", "{}");
        // show for removal pass
        mock.push_success(
            "bd",
            r#"{"id":"I1","title":"one","status":"open",
                "labels":["ashep-phase:implement","ashep-phase:test"]}"#,
        );
        // remove stale label
        mock.push_success("bd", "{}");

        tracker(&mock).set_phase_label("I1", "test").await.unwrap();

        let history = mock.call_history();
        assert_eq!(history.len(), 3);
        assert_eq!(
            history[0].args[..4],
            ["label", "add", "I1", "ashep-phase:test"].map(String::from)
        );
        assert_eq!(
            history[2].args[..4],
            ["label", "remove", "I1", "ashep-phase:implement"].map(String::from)
        );
    }

    #[tokio::test]
    async fn nonzero_exit_is_protocol_error() {
        let mock = MockProcessRunner::new();
        mock.push_failure("bd", 1, "boom");
        let err = tracker(&mock).list_ready().await.unwrap_err();
        assert!(matches!(err, TrackerError::Protocol(_)));
    }
}
