//! Durable run log.
//!
//! Owns the Run, Decision, and PhaseMessage rows. Every insert commits to a
//! line-per-record append log before the sqlite index, so a lost index is
//! rebuilt from the logs on startup. Terminal runs are immutable.

pub mod error;
pub mod queries;
pub mod store;
pub mod types;

pub use error::StoreError;
pub use store::RunLog;
pub use types::{
    CleanupMetric, CleanupOperation, Decision, DecisionType, DurationStats, MessageFilter,
    MessageStats, MessageType, NewCleanupMetric, NewDecision, NewPhaseMessage, PhaseDuration,
    PhaseMessage, Run, RunDraft, RunErrorInfo, RunFilter, RunMetrics, RunOutcome, RunPatch,
    RunStatus,
};
