//! Unified subprocess abstraction layer.
//!
//! Both external collaborators (the issue tracker binary and the agent CLI)
//! are driven through [`ProcessRunner`], so gateways stay mockable in tests.

pub mod error;
pub mod mock;
pub mod runner;

pub use error::ProcessError;
pub use mock::MockProcessRunner;
pub use runner::{
    ExitStatus, KillHandle, ProcessCommand, ProcessOutput, ProcessRunner, StreamingChild,
    TokioProcessRunner,
};
