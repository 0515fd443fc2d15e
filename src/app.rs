//! Application assembly.
//!
//! One root function builds the engine context that every component hangs
//! off; there is no global mutable state. The CLI owns the context and
//! passes it (via `Arc`) into the worker, monitor, and cleanup tasks.

use std::sync::Arc;
use tokio::sync::watch;

use crate::agent::{AgentGateway, OpenCodeGateway};
use crate::config::{load_agents, load_config, load_policies, AshepConfig, ConfigPaths, LoadMode};
use crate::error::Result;
use crate::messenger::PhaseMessenger;
use crate::policy::PolicyEngine;
use crate::prompt::{DecisionAnalytics, TemplateSet};
use crate::registry::AgentRegistry;
use crate::retention::ArchiveStore;
use crate::runlog::RunLog;
use crate::subprocess::TokioProcessRunner;
use crate::tracker::{BeadsTracker, IssueTracker};

/// Everything the engines need, assembled once at startup.
pub struct EngineContext {
    pub config: AshepConfig,
    pub policies: PolicyEngine,
    pub registry: AgentRegistry,
    pub runlog: Arc<RunLog>,
    pub archive: Arc<ArchiveStore>,
    pub messenger: PhaseMessenger,
    pub tracker: Arc<dyn IssueTracker>,
    pub agents: Arc<dyn AgentGateway>,
    pub templates: TemplateSet,
    pub analytics: DecisionAnalytics,
}

/// Load configuration and wire up the full engine context.
pub async fn assemble(paths: &ConfigPaths, mode: LoadMode) -> Result<EngineContext> {
    let config = load_config(paths, mode)?;
    let policy_file = load_policies(paths, mode)?;
    let agents_file = load_agents(paths, mode)?;

    let runlog = Arc::new(RunLog::open(&paths.data_dir).await?);
    let archive = Arc::new(ArchiveStore::open(&paths.data_dir).await?);
    let messenger = PhaseMessenger::new(Arc::clone(&runlog), &paths.data_dir);

    let registry = AgentRegistry::new(agents_file.agents, config.fallback.clone());
    let policies = PolicyEngine::new(
        policy_file,
        config.loop_prevention.clone(),
        config.hitl.allowed_reasons.clone(),
    );

    let runner: Arc<dyn crate::subprocess::ProcessRunner> = Arc::new(TokioProcessRunner);
    let tracker: Arc<dyn IssueTracker> = Arc::new(BeadsTracker::new(
        Arc::clone(&runner),
        config.tracker.clone(),
    ));
    let agents: Arc<dyn AgentGateway> = Arc::new(OpenCodeGateway::new(
        runner,
        config.agent.bin.clone(),
    ));

    Ok(EngineContext {
        config,
        policies,
        registry,
        runlog,
        archive,
        messenger,
        tracker,
        agents,
        templates: TemplateSet::builtin(),
        analytics: DecisionAnalytics::new(),
    })
}

/// Verbosity-driven tracing setup: `-v` debug, `-vv` trace.
pub fn init_logging(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ashep={default_level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Cooperative shutdown flag shared by all engine loops.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.subscribe().borrow()
    }

    /// Flip the flag on the first interrupt signal.
    pub fn install_signal_handler(&self) {
        let handle = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received, shutting down");
                handle.trigger();
            }
        });
    }
}
