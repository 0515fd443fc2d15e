//! Crate-wide error taxonomy.
//!
//! Components translate their low-level errors into one of these classes at
//! their boundary. Transient I/O is retried with bounded backoff before it
//! escalates; agent failures are recorded in run outcomes and handed to the
//! policy engine; logic violations abort.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AshepError {
    /// Invalid or missing configuration. Fatal at startup unless soft mode.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Policy, phase, agent, or capability failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Tracker or storage temporarily unreachable. Retryable.
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Transient I/O that exhausted its retry budget.
    #[error("I/O error: {0}")]
    FatalIo(String),

    /// An agent session failed, timed out, or crashed. Handled by policy.
    #[error("Agent failure: {0}")]
    AgentFailure(String),

    /// Programming error: terminal-run mutation, double dispatch, corrupt
    /// internal record. Operators must investigate.
    #[error("Logic violation: {0}")]
    LogicViolation(String),

    /// Soft block requiring human attention; carries the HITL reason.
    #[error("Human intervention required: {0}")]
    HitlRequired(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AshepError {
    /// Whether the caller may retry the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, AshepError::TransientIo(_))
    }

    /// Whether this class must unwind to the root scope and abort.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AshepError::Config(_)
                | AshepError::Validation(_)
                | AshepError::LogicViolation(_)
                | AshepError::FatalIo(_)
        )
    }

    /// Process exit code for the CLI boundary.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

impl From<String> for AshepError {
    fn from(s: String) -> Self {
        AshepError::Internal(s)
    }
}

pub type Result<T> = std::result::Result<T, AshepError>;
