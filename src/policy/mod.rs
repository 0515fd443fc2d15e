//! Policy definitions and the phase transition state machine.
//!
//! A policy is an ordered list of phases plus retry, timeout, HITL,
//! loop-prevention, and session-continuation configuration. The engine's
//! verdicts are the closed [`Transition`] sum type, so every consumer is
//! exhaustively checked.

pub mod engine;
pub mod hitl;
pub mod types;

pub use engine::PolicyEngine;
pub use hitl::{validate_hitl_reason, CustomValidation, HitlReasonRules};
pub use types::{
    DecisionConfig, LoopPreventionOverride, PhaseConfig, PolicyConfig, PolicyFile, RetryConfig,
    RetryStrategy, Transition, TransitionLimit, WorkerAssistantOverride,
};
