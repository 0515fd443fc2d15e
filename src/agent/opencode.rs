//! OpenCode CLI gateway implementation.
//!
//! Sessions are `opencode run` subprocesses emitting one JSON event per
//! stdout line. The gateway translates those lines into [`AgentEvent`]s,
//! enforces the wall-clock timeout, and keeps a kill handle per live session
//! so the monitor can terminate stalled runs.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::subprocess::{KillHandle, ProcessCommand, ProcessRunner};

use super::events::{AgentEvent, AgentKind, KnownAgent, SessionOutcome};
use super::gateway::{AgentError, AgentGateway, AgentSession, LaunchSpec};

pub struct OpenCodeGateway {
    runner: Arc<dyn ProcessRunner>,
    bin: String,
    live: Arc<Mutex<HashMap<String, KillHandle>>>,
}

impl OpenCodeGateway {
    pub fn new(runner: Arc<dyn ProcessRunner>, bin: impl Into<String>) -> Self {
        Self {
            runner,
            bin: bin.into(),
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn start(
        &self,
        session_id: String,
        agent_id: Option<&str>,
        prompt: String,
        timeout: Duration,
    ) -> Result<AgentSession, AgentError> {
        let mut command = ProcessCommand::new(self.bin.as_str())
            .args(["run", "--format", "json", "--session", &session_id])
            .stdin(prompt);
        if let Some(agent) = agent_id {
            command = command.args(["--agent", agent]);
        }

        let child = self
            .runner
            .spawn_streaming(command)
            .await
            .map_err(|e| AgentError::StartFailed(e.to_string()))?;

        self.live
            .lock()
            .await
            .insert(session_id.clone(), child.kill_handle());

        let (tx, rx) = mpsc::channel(256);
        let live = Arc::clone(&self.live);
        let sid = session_id.clone();
        tokio::spawn(async move {
            supervise(child, tx, timeout).await;
            live.lock().await.remove(&sid);
        });

        Ok(AgentSession {
            session_id,
            events: rx,
        })
    }
}

/// Pump child stdout into agent events until a terminal condition.
async fn supervise(
    mut child: crate::subprocess::StreamingChild,
    tx: mpsc::Sender<AgentEvent>,
    timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    let kill = child.kill_handle();
    let mut outcome = SessionOutcome::default();
    let mut timed_out = false;
    let mut reported_error: Option<String> = None;

    loop {
        tokio::select! {
            line = child.lines.recv() => {
                match line {
                    Some(line) => {
                        for event in parse_line(&line, &mut outcome) {
                            if let AgentEvent::Failed { error, .. } = &event {
                                reported_error = Some(error.clone());
                                continue;
                            }
                            let _ = tx.send(event).await;
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::time::sleep_until(deadline), if !timed_out => {
                timed_out = true;
                kill.kill().await;
            }
        }
    }

    let status = child.wait().await;
    let terminal = if timed_out {
        AgentEvent::TimedOut { outcome }
    } else {
        match status {
            Ok(status) if status.success() && reported_error.is_none() => {
                AgentEvent::Completed { outcome }
            }
            Ok(status) => AgentEvent::Failed {
                error: reported_error
                    .unwrap_or_else(|| format!("agent exited with status {status:?}")),
                outcome,
            },
            Err(e) => AgentEvent::Failed {
                error: e.to_string(),
                outcome,
            },
        }
    };
    let _ = tx.send(terminal).await;
}

/// Translate one stdout line into zero or more events, folding usage totals
/// into `outcome` as they stream past.
fn parse_line(line: &str, outcome: &mut SessionOutcome) -> Vec<AgentEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let Ok(json) = serde_json::from_str::<Value>(trimmed) else {
        // Providers occasionally emit plain text around the JSON stream.
        return vec![AgentEvent::Message {
            content: trimmed.to_string(),
        }];
    };

    let event_type = json
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown");

    match event_type {
        "session.started" => extract_str(&json, "sessionId")
            .map(|session_id| vec![AgentEvent::SessionStarted { session_id }])
            .unwrap_or_default(),
        "token.usage" => {
            let input = extract_u64(&json, "input_tokens");
            let output = extract_u64(&json, "output_tokens");
            outcome.tokens_used += input + output;
            outcome.api_calls_count += 1;
            vec![AgentEvent::TokenUsage {
                input_tokens: input,
                output_tokens: output,
            }]
        }
        "tool.use" => vec![AgentEvent::ToolCall {
            name: extract_str(&json, "name").unwrap_or_else(|| "unknown".to_string()),
        }],
        "message" => {
            let content = extract_str(&json, "content").unwrap_or_default();
            outcome.message = Some(content.clone());
            vec![AgentEvent::Message { content }]
        }
        "result" => {
            if let Some(cost) = json.get("cost").and_then(Value::as_f64) {
                outcome.cost = cost;
            }
            if let Some(tokens) = json.get("tokens_used").and_then(Value::as_u64) {
                outcome.tokens_used = tokens;
            }
            if let Some(message) = extract_str(&json, "message") {
                outcome.message = Some(message);
            }
            let success = json
                .get("success")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            if success {
                Vec::new()
            } else {
                vec![AgentEvent::Failed {
                    error: extract_str(&json, "error")
                        .unwrap_or_else(|| "agent reported failure".to_string()),
                    outcome: outcome.clone(),
                }]
            }
        }
        "error" => vec![AgentEvent::Failed {
            error: extract_str(&json, "message").unwrap_or_else(|| "unknown error".to_string()),
            outcome: outcome.clone(),
        }],
        _ => Vec::new(),
    }
}

fn extract_str(json: &Value, field: &str) -> Option<String> {
    json.get(field).and_then(Value::as_str).map(String::from)
}

fn extract_u64(json: &Value, field: &str) -> u64 {
    json.get(field).and_then(Value::as_u64).unwrap_or(0)
}

#[async_trait]
impl AgentGateway for OpenCodeGateway {
    async fn launch(&self, spec: LaunchSpec) -> Result<AgentSession, AgentError> {
        let session_id = spec
            .session_id
            .unwrap_or_else(|| format!("sess-{}", Uuid::new_v4()));
        let prompt = if spec.system_prompt.is_empty() {
            spec.user_prompt
        } else {
            format!("{}\n\n{}", spec.system_prompt, spec.user_prompt)
        };
        self.start(session_id, Some(&spec.agent_id), prompt, spec.timeout)
            .await
    }

    async fn continue_session(
        &self,
        session_id: &str,
        user_prompt: String,
        timeout: Duration,
    ) -> Result<AgentSession, AgentError> {
        self.start(session_id.to_string(), None, user_prompt, timeout)
            .await
    }

    async fn kill(&self, session_id: &str) -> Result<(), AgentError> {
        let handle = self.live.lock().await.get(session_id).cloned();
        match handle {
            Some(handle) => {
                handle.kill().await;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn list_known_agents(&self) -> Result<Vec<KnownAgent>, AgentError> {
        let output = self
            .runner
            .run(ProcessCommand::new(self.bin.as_str()).args(["agent", "list", "--format", "json"]))
            .await
            .map_err(|e| AgentError::Protocol(e.to_string()))?;

        if !output.status.success() {
            return Err(AgentError::Protocol(format!(
                "agent list failed: {}",
                output.stderr.trim()
            )));
        }

        parse_agent_list(&output.stdout)
    }

    async fn live_sessions(&self) -> Vec<String> {
        self.live.lock().await.keys().cloned().collect()
    }
}

fn parse_agent_list(stdout: &str) -> Result<Vec<KnownAgent>, AgentError> {
    let json: Value = serde_json::from_str(stdout.trim())
        .map_err(|e| AgentError::Protocol(format!("agent list is not JSON: {e}")))?;
    let items = json
        .as_array()
        .ok_or_else(|| AgentError::Protocol("agent list is not an array".to_string()))?;

    let mut agents = Vec::with_capacity(items.len());
    for item in items {
        let id = extract_str(item, "id")
            .or_else(|| extract_str(item, "name"))
            .ok_or_else(|| AgentError::Protocol("agent entry without id".to_string()))?;
        let kind = match item
            .get("mode")
            .or_else(|| item.get("type"))
            .and_then(Value::as_str)
        {
            Some("subagent") => AgentKind::Subagent,
            _ => AgentKind::Primary,
        };
        agents.push(KnownAgent { id, kind });
    }
    Ok(agents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_token_usage_and_accumulates() {
        let mut outcome = SessionOutcome::default();
        let events = parse_line(
            r#"{"type":"token.usage","input_tokens":100,"output_tokens":50}"#,
            &mut outcome,
        );
        assert_eq!(
            events,
            vec![AgentEvent::TokenUsage {
                input_tokens: 100,
                output_tokens: 50
            }]
        );
        assert_eq!(outcome.tokens_used, 150);
        assert_eq!(outcome.api_calls_count, 1);
    }

    #[test]
    fn parses_tool_use() {
        let mut outcome = SessionOutcome::default();
        let events = parse_line(r#"{"type":"tool.use","name":"edit"}"#, &mut outcome);
        assert_eq!(events, vec![AgentEvent::ToolCall { name: "edit".into() }]);
    }

    #[test]
    fn failed_result_becomes_failed_event() {
        let mut outcome = SessionOutcome::default();
        let events = parse_line(
            r#"{"type":"result","success":false,"error":"tests failed"}"#,
            &mut outcome,
        );
        assert!(matches!(&events[0], AgentEvent::Failed { error, .. } if error == "tests failed"));
    }

    #[test]
    fn successful_result_folds_usage() {
        let mut outcome = SessionOutcome::default();
        let events = parse_line(
            r#"{"type":"result","success":true,"tokens_used":1234,"cost":0.05,"message":"done"}"#,
            &mut outcome,
        );
        assert!(events.is_empty());
        assert_eq!(outcome.tokens_used, 1234);
        assert_eq!(outcome.message.as_deref(), Some("done"));
    }

    #[test]
    fn non_json_line_is_a_message() {
        let mut outcome = SessionOutcome::default();
        let events = parse_line("plain progress text", &mut outcome);
        assert_eq!(
            events,
            vec![AgentEvent::Message {
                content: "plain progress text".into()
            }]
        );
    }

    #[test]
    fn agent_list_parsing() {
        let agents = parse_agent_list(
            r#"[{"name":"build","mode":"primary"},{"name":"review","mode":"subagent"}]"#,
        )
        .unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0].id, "build");
        assert_eq!(agents[0].kind, AgentKind::Primary);
        assert_eq!(agents[1].kind, AgentKind::Subagent);
    }

    #[test]
    fn agent_list_rejects_garbage() {
        assert!(parse_agent_list("not json").is_err());
        assert!(parse_agent_list(r#"{"a":1}"#).is_err());
    }
}
