use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle of one phase attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Timeout => "timeout",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "timeout" => Some(RunStatus::Timeout),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub duration_ms: u64,
    pub start_time_ms: u64,
    pub end_time_ms: u64,
    pub tokens_used: u64,
    pub cost: f64,
    pub api_calls_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunErrorInfo {
    pub error_type: String,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub success: bool,

    /// The agent (or an assistant) asked for a human to sign off.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub requires_approval: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunErrorInfo>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,

    #[serde(default)]
    pub metrics: RunMetrics,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// One atomic attempt of one phase of one issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub issue_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    pub agent_id: String,
    pub policy_name: String,
    pub phase: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Fields for a new run; id and timestamps are assigned by the store.
#[derive(Debug, Clone, Default)]
pub struct RunDraft {
    pub id: Option<String>,
    pub issue_id: String,
    pub session_id: Option<String>,
    pub agent_id: String,
    pub policy_name: String,
    pub phase: String,
    pub status: Option<RunStatus>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Partial update applied to a non-terminal run.
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub session_id: Option<String>,
    pub outcome: Option<RunOutcome>,
    /// Merged key-by-key into the existing metadata.
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    PhaseTransition,
    WorkerAssistant,
    DynamicDecision,
    Hitl,
    Timeout,
    AgentSelection,
}

impl DecisionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionType::PhaseTransition => "phase_transition",
            DecisionType::WorkerAssistant => "worker_assistant",
            DecisionType::DynamicDecision => "dynamic_decision",
            DecisionType::Hitl => "hitl",
            DecisionType::Timeout => "timeout",
            DecisionType::AgentSelection => "agent_selection",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "phase_transition" => Some(DecisionType::PhaseTransition),
            "worker_assistant" => Some(DecisionType::WorkerAssistant),
            "dynamic_decision" => Some(DecisionType::DynamicDecision),
            "hitl" => Some(DecisionType::Hitl),
            "timeout" => Some(DecisionType::Timeout),
            "agent_selection" => Some(DecisionType::AgentSelection),
            _ => None,
        }
    }
}

/// Append-only record of a verdict the engine reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub run_id: String,
    pub issue_id: String,
    pub decision_type: DecisionType,
    pub decision: String,
    pub reasoning: String,

    #[serde(default)]
    pub metadata: serde_json::Value,

    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDecision {
    pub run_id: String,
    pub issue_id: String,
    pub decision_type: DecisionType,
    pub decision: String,
    pub reasoning: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Context,
    Result,
    Decision,
    Data,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Context => "context",
            MessageType::Result => "result",
            MessageType::Decision => "decision",
            MessageType::Data => "data",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "context" => Some(MessageType::Context),
            "result" => Some(MessageType::Result),
            "decision" => Some(MessageType::Decision),
            "data" => Some(MessageType::Data),
            _ => None,
        }
    }
}

/// Typed message handed from one phase to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseMessage {
    pub id: String,
    pub issue_id: String,
    pub from_phase: String,
    pub to_phase: String,
    pub message_type: MessageType,
    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    pub read: bool,

    /// Orders messages within one issue across runs.
    pub run_counter: i64,

    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPhaseMessage {
    pub issue_id: String,
    pub from_phase: String,
    pub to_phase: String,
    pub message_type: MessageType,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub run_counter: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub issue_id: Option<String>,
    pub from_phase: Option<String>,
    pub to_phase: Option<String>,
    pub message_type: Option<MessageType>,
    pub unread_only: bool,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageStats {
    pub total: u64,
    pub unread: u64,
    pub by_type: HashMap<String, u64>,
}

/// Fields for a cleanup metric; id and timestamp come from the store.
#[derive(Debug, Clone)]
pub struct NewCleanupMetric {
    pub policy_name: String,
    pub operation: CleanupOperation,
    pub issue_id: Option<String>,
    pub runs_processed: u64,
    pub runs_archived: u64,
    pub runs_deleted: u64,
    pub bytes_archived: u64,
    pub bytes_deleted: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub issue_id: Option<String>,
    pub agent_id: Option<String>,
    pub phase: Option<String>,
    pub status: Option<RunStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DurationStats {
    pub count: u64,
    pub total_ms: u64,
    pub average_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDuration {
    pub phase: String,
    pub count: u64,
    pub total_ms: u64,
    pub average_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupOperation {
    Archive,
    Delete,
    Emergency,
    Critical,
}

impl CleanupOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupOperation::Archive => "archive",
            CleanupOperation::Delete => "delete",
            CleanupOperation::Emergency => "emergency",
            CleanupOperation::Critical => "critical",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "archive" => Some(CleanupOperation::Archive),
            "delete" => Some(CleanupOperation::Delete),
            "emergency" => Some(CleanupOperation::Emergency),
            "critical" => Some(CleanupOperation::Critical),
            _ => None,
        }
    }
}

/// One cleanup pass, for capacity accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupMetric {
    pub id: String,
    pub recorded_at: DateTime<Utc>,
    pub policy_name: String,
    pub operation: CleanupOperation,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<String>,

    pub runs_processed: u64,
    pub runs_archived: u64,
    pub runs_deleted: u64,
    pub bytes_archived: u64,
    pub bytes_deleted: u64,
    pub duration_ms: u64,
}
