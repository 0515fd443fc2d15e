//! Thin command-line layer: parse arguments, assemble the engine context,
//! route to the engines.

pub mod args;
pub mod router;
pub mod starter;

pub use args::{Cli, Commands};
pub use router::execute_command;
