//! CLI argument structures.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Shepherd issues through AI coding agent sessions
#[derive(Parser)]
#[command(name = "ashep")]
#[command(about = "ashep - autonomous orchestrator for AI coding agents", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Configuration directory (defaults to ~/.ashep)
    #[arg(long, global = true, value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Data directory (defaults to <config-dir>/data)
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Downgrade configuration validation failures to warnings
    #[arg(long, global = true)]
    pub soft: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the worker dispatch loop
    Worker,

    /// Run the run supervisor
    Monitor,

    /// Process a single issue once and exit
    Work {
        /// Issue identifier in the external tracker
        issue_id: String,
    },

    /// Seed starter configuration files
    Init,

    /// Seed configuration and check external binaries
    Install,

    /// Reconcile the agent catalogue against the provider CLI
    SyncAgents,

    /// Print the inspection snapshot consumed by the UI server
    Ui {
        /// Port the companion UI server should bind
        #[arg(long)]
        port: Option<u16>,

        /// Host the companion UI server should bind
        #[arg(long)]
        host: Option<String>,
    },

    /// Validate that every policy capability resolves to an active agent
    ValidatePolicyChain,

    /// Render each policy's phase chain
    ShowPolicyTree {
        /// Output format: text or json
        #[arg(long, default_value = "text")]
        format: String,
    },
}
