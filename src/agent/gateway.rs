use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use super::events::{AgentEvent, KnownAgent};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent session failed to start: {0}")]
    StartFailed(String),

    #[error("Agent session timed out after {0:?}")]
    Timeout(Duration),

    #[error("Agent session crashed: {0}")]
    Crashed(String),

    #[error("Agent session was killed")]
    Killed,

    #[error("Unknown session: {0}")]
    SessionNotFound(String),

    #[error("Agent provider protocol error: {0}")]
    Protocol(String),
}

impl From<AgentError> for crate::error::AshepError {
    fn from(err: AgentError) -> Self {
        crate::error::AshepError::AgentFailure(err.to_string())
    }
}

/// Everything needed to start one phase attempt.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub agent_id: String,
    /// Continue this session instead of starting fresh.
    pub session_id: Option<String>,
    pub system_prompt: String,
    pub user_prompt: String,
    pub timeout: Duration,
}

/// A live session handle: its id plus the event stream.
pub struct AgentSession {
    pub session_id: String,
    pub events: mpsc::Receiver<AgentEvent>,
}

#[async_trait]
pub trait AgentGateway: Send + Sync {
    /// Start a session (or continue `spec.session_id`) and stream its events.
    async fn launch(&self, spec: LaunchSpec) -> Result<AgentSession, AgentError>;

    /// Continue an existing session with a fresh user prompt.
    async fn continue_session(
        &self,
        session_id: &str,
        user_prompt: String,
        timeout: Duration,
    ) -> Result<AgentSession, AgentError>;

    /// Kill a live session. No-op if it already ended.
    async fn kill(&self, session_id: &str) -> Result<(), AgentError>;

    /// Agents the provider CLI knows about.
    async fn list_known_agents(&self) -> Result<Vec<KnownAgent>, AgentError>;

    /// Sessions currently alive under this gateway.
    async fn live_sessions(&self) -> Vec<String>;
}
