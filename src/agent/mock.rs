use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::events::{AgentEvent, KnownAgent, SessionOutcome};
use super::gateway::{AgentError, AgentGateway, AgentSession, LaunchSpec};

/// Scripted agent gateway for tests.
///
/// Each launch consumes the next [`SessionScript`] in FIFO order and replays
/// its events on the session channel. Launches are recorded for assertions.
#[derive(Clone, Default)]
pub struct MockAgentGateway {
    scripts: Arc<Mutex<VecDeque<SessionScript>>>,
    launches: Arc<Mutex<Vec<RecordedLaunch>>>,
    known_agents: Arc<Mutex<Vec<KnownAgent>>>,
    live: Arc<Mutex<Vec<String>>>,
    kills: Arc<Mutex<Vec<String>>>,
}

#[derive(Debug, Clone)]
pub struct SessionScript {
    /// Non-terminal events replayed before the terminal one.
    pub events: Vec<AgentEvent>,
    pub terminal: AgentEvent,
    /// Delay before the terminal event, for stall/timeout tests.
    pub terminal_delay: Duration,
}

impl SessionScript {
    pub fn success(tokens_used: u64) -> Self {
        Self {
            events: vec![AgentEvent::TokenUsage {
                input_tokens: tokens_used / 2,
                output_tokens: tokens_used - tokens_used / 2,
            }],
            terminal: AgentEvent::Completed {
                outcome: SessionOutcome {
                    message: Some("done".to_string()),
                    tokens_used,
                    cost: 0.01,
                    api_calls_count: 1,
                },
            },
            terminal_delay: Duration::ZERO,
        }
    }

    pub fn failure(error: &str) -> Self {
        Self {
            events: Vec::new(),
            terminal: AgentEvent::Failed {
                error: error.to_string(),
                outcome: SessionOutcome::default(),
            },
            terminal_delay: Duration::ZERO,
        }
    }

    pub fn completed_with_message(message: &str, tokens_used: u64) -> Self {
        Self {
            events: Vec::new(),
            terminal: AgentEvent::Completed {
                outcome: SessionOutcome {
                    message: Some(message.to_string()),
                    tokens_used,
                    cost: 0.0,
                    api_calls_count: 1,
                },
            },
            terminal_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedLaunch {
    pub agent_id: String,
    pub session_id: String,
    pub continued: bool,
    pub system_prompt: String,
    pub user_prompt: String,
}

impl MockAgentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, script: SessionScript) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn set_known_agents(&self, agents: Vec<KnownAgent>) {
        *self.known_agents.lock().unwrap() = agents;
    }

    pub fn launches(&self) -> Vec<RecordedLaunch> {
        self.launches.lock().unwrap().clone()
    }

    pub fn killed_sessions(&self) -> Vec<String> {
        self.kills.lock().unwrap().clone()
    }

    /// Pretend a session is alive without a script (for monitor tests).
    pub fn register_live_session(&self, session_id: &str) {
        self.live.lock().unwrap().push(session_id.to_string());
    }

    fn play(&self, session_id: String, script: SessionScript) -> AgentSession {
        let (tx, rx) = mpsc::channel(64);
        let live = Arc::clone(&self.live);
        let sid = session_id.clone();
        live.lock().unwrap().push(sid.clone());
        tokio::spawn(async move {
            for event in script.events {
                let _ = tx.send(event).await;
            }
            if !script.terminal_delay.is_zero() {
                tokio::time::sleep(script.terminal_delay).await;
            }
            let _ = tx.send(script.terminal).await;
            live.lock().unwrap().retain(|s| s != &sid);
        });
        AgentSession {
            session_id,
            events: rx,
        }
    }
}

#[async_trait]
impl AgentGateway for MockAgentGateway {
    async fn launch(&self, spec: LaunchSpec) -> Result<AgentSession, AgentError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AgentError::StartFailed("no scripted session".to_string()))?;

        let continued = spec.session_id.is_some();
        let session_id = spec
            .session_id
            .unwrap_or_else(|| format!("sess-{}", Uuid::new_v4()));

        self.launches.lock().unwrap().push(RecordedLaunch {
            agent_id: spec.agent_id,
            session_id: session_id.clone(),
            continued,
            system_prompt: spec.system_prompt,
            user_prompt: spec.user_prompt,
        });

        Ok(self.play(session_id, script))
    }

    async fn continue_session(
        &self,
        session_id: &str,
        user_prompt: String,
        _timeout: Duration,
    ) -> Result<AgentSession, AgentError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AgentError::StartFailed("no scripted session".to_string()))?;

        self.launches.lock().unwrap().push(RecordedLaunch {
            agent_id: String::new(),
            session_id: session_id.to_string(),
            continued: true,
            system_prompt: String::new(),
            user_prompt,
        });

        Ok(self.play(session_id.to_string(), script))
    }

    async fn kill(&self, session_id: &str) -> Result<(), AgentError> {
        self.kills.lock().unwrap().push(session_id.to_string());
        self.live.lock().unwrap().retain(|s| s != session_id);
        Ok(())
    }

    async fn list_known_agents(&self) -> Result<Vec<KnownAgent>, AgentError> {
        Ok(self.known_agents.lock().unwrap().clone())
    }

    async fn live_sessions(&self) -> Vec<String> {
        self.live.lock().unwrap().to_vec()
    }
}
