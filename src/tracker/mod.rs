//! Issue tracker gateway.
//!
//! The external tracker owns issues; this gateway only reads them and
//! mutates orchestration labels (`ashep-phase:*`, `ashep-hitl:*`,
//! `ashep-excluded`) on the engine's behalf. Issues are never deleted here.

pub mod beads;
pub mod gateway;
pub mod labels;
pub mod mock;

pub use beads::BeadsTracker;
pub use gateway::{Issue, IssueStatus, IssueTracker, TrackerError};
pub use labels::{
    excluded_label, extract_hitl_reason, extract_phase, hitl_label, phase_label, EXCLUDED_LABEL,
    HITL_PREFIX, PHASE_PREFIX,
};
pub use mock::MockIssueTracker;
