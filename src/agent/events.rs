use serde::{Deserialize, Serialize};

/// Agent type reported by the provider CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Primary,
    Subagent,
}

/// One agent as the provider CLI knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownAgent {
    pub id: String,
    pub kind: AgentKind,
}

/// Events streamed from a live agent session.
///
/// Exactly one terminal event (`Completed`, `Failed`, `TimedOut`, `Killed`)
/// ends every stream; the channel closes after it.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    SessionStarted {
        session_id: String,
    },
    TokenUsage {
        input_tokens: u64,
        output_tokens: u64,
    },
    ToolCall {
        name: String,
    },
    Message {
        content: String,
    },
    Completed {
        outcome: SessionOutcome,
    },
    Failed {
        error: String,
        outcome: SessionOutcome,
    },
    TimedOut {
        outcome: SessionOutcome,
    },
    Killed,
}

impl AgentEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentEvent::Completed { .. }
                | AgentEvent::Failed { .. }
                | AgentEvent::TimedOut { .. }
                | AgentEvent::Killed
        )
    }

    /// Whether this event represents forward progress for stall tracking.
    pub fn is_progress(&self) -> bool {
        !self.is_terminal()
    }
}

/// Usage totals accumulated over one session attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub message: Option<String>,
    pub tokens_used: u64,
    pub cost: f64,
    pub api_calls_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_events() {
        assert!(AgentEvent::Completed {
            outcome: SessionOutcome::default()
        }
        .is_terminal());
        assert!(AgentEvent::Killed.is_terminal());
        assert!(!AgentEvent::ToolCall {
            name: "edit".into()
        }
        .is_terminal());
    }

    #[test]
    fn progress_events() {
        assert!(AgentEvent::TokenUsage {
            input_tokens: 1,
            output_tokens: 2
        }
        .is_progress());
        assert!(!AgentEvent::Killed.is_progress());
    }
}
