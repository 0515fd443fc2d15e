//! Agent subprocess gateway.
//!
//! Agents run as external CLI sessions. The gateway launches or continues a
//! session, streams its events back over a channel, and can kill it. Sessions
//! are opaque handles; nothing here assumes in-process state on the agent
//! side.

pub mod events;
pub mod gateway;
pub mod mock;
pub mod opencode;

pub use events::{AgentEvent, AgentKind, KnownAgent, SessionOutcome};
pub use gateway::{AgentError, AgentGateway, AgentSession, LaunchSpec};
pub use mock::MockAgentGateway;
pub use opencode::OpenCodeGateway;
