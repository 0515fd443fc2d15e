//! Command routing.

use std::sync::Arc;

use crate::app::{assemble, EngineContext, ShutdownHandle};
use crate::config::{ConfigPaths, LoadMode};
use crate::error::{AshepError, Result};
use crate::inspect::InspectionApi;
use crate::monitor::MonitorEngine;
use crate::retention::CleanupEngine;
use crate::validator;
use crate::worker::WorkerEngine;

use super::args::{Cli, Commands};
use super::starter;

fn resolve_paths(cli: &Cli) -> Result<ConfigPaths> {
    let mut paths = match &cli.config_dir {
        Some(dir) => ConfigPaths::new(dir.clone(), dir.join("data")),
        None => ConfigPaths::resolve_default()?,
    };
    if let Some(data_dir) = &cli.data_dir {
        paths.data_dir = data_dir.clone();
    }
    Ok(paths)
}

fn load_mode(cli: &Cli) -> LoadMode {
    if cli.soft {
        LoadMode::Soft
    } else {
        LoadMode::Strict
    }
}

/// Startup validation; fatal in strict mode.
fn validate_at_startup(ctx: &EngineContext, mode: LoadMode) -> Result<()> {
    let report = validator::validate(&ctx.policies, &ctx.registry);
    for warning in &report.warnings {
        tracing::warn!("{warning}");
    }
    if report.is_valid() {
        tracing::info!("Validation passed: {}", report.summary());
        return Ok(());
    }
    for error in &report.errors {
        tracing::error!("{error}");
    }
    match mode {
        LoadMode::Strict => Err(AshepError::Validation(report.summary())),
        LoadMode::Soft => Ok(()),
    }
}

pub async fn execute_command(cli: Cli) -> Result<()> {
    let paths = resolve_paths(&cli)?;
    let mode = load_mode(&cli);

    match &cli.command {
        Commands::Worker => {
            let ctx = Arc::new(assemble(&paths, mode).await?);
            validate_at_startup(&ctx, mode)?;

            let shutdown = ShutdownHandle::new();
            shutdown.install_signal_handler();

            let cleanup = Arc::new(CleanupEngine::new(
                Arc::clone(&ctx.runlog),
                Arc::clone(&ctx.archive),
                ctx.config.cleanup.clone(),
                &ctx.config.retention,
            ));
            let cleanup_task = tokio::spawn(cleanup.run_scheduled(shutdown.subscribe()));

            WorkerEngine::new(Arc::clone(&ctx), shutdown.subscribe())
                .run()
                .await?;
            cleanup_task.abort();
            Ok(())
        }
        Commands::Monitor => {
            let ctx = Arc::new(assemble(&paths, mode).await?);
            validate_at_startup(&ctx, mode)?;

            let shutdown = ShutdownHandle::new();
            shutdown.install_signal_handler();

            MonitorEngine::new(Arc::clone(&ctx), shutdown.subscribe())
                .run()
                .await
        }
        Commands::Work { issue_id } => {
            let ctx = Arc::new(assemble(&paths, mode).await?);
            validate_at_startup(&ctx, mode)?;

            let shutdown = ShutdownHandle::new();
            shutdown.install_signal_handler();

            crate::worker::engine::process_issue(&ctx, shutdown.subscribe(), issue_id).await
        }
        Commands::Init => init_config(&paths, false),
        Commands::Install => {
            init_config(&paths, false)?;
            check_binaries(&paths, mode).await
        }
        Commands::SyncAgents => {
            let ctx = assemble(&paths, mode).await?;
            let known = ctx
                .agents
                .list_known_agents()
                .await
                .map_err(|e| AshepError::TransientIo(e.to_string()))?;
            let report = ctx.registry.sync_with_gateway(&known);
            println!(
                "Agent sync: {} added, {} updated, {} deactivated",
                report.added, report.updated, report.deactivated
            );
            Ok(())
        }
        Commands::Ui { port, host } => {
            let ctx = Arc::new(assemble(&paths, mode).await?);
            let api = InspectionApi::new(Arc::clone(&ctx));

            let host = host.clone().unwrap_or_else(|| ctx.config.ui.host.clone());
            let port = port.unwrap_or(ctx.config.ui.port);
            let snapshot = serde_json::json!({
                "ui": {"host": host, "port": port},
                "runs": api.recent_runs(50).await?,
                "policies": api.policies(),
                "health": api.health().await?,
            });
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            eprintln!("The HTTP UI ships separately; point it at this engine's data directory.");
            Ok(())
        }
        Commands::ValidatePolicyChain => {
            let ctx = assemble(&paths, LoadMode::Soft).await?;
            let report = validator::validate(&ctx.policies, &ctx.registry);
            for warning in &report.warnings {
                println!("warning: {warning}");
            }
            for error in &report.errors {
                println!("error: {error}");
            }
            println!("{}", report.summary());
            if report.is_valid() {
                Ok(())
            } else {
                Err(AshepError::Validation(report.summary()))
            }
        }
        Commands::ShowPolicyTree { format } => {
            let ctx = assemble(&paths, LoadMode::Soft).await?;
            show_policy_tree(&ctx, format)
        }
    }
}

fn init_config(paths: &ConfigPaths, overwrite: bool) -> Result<()> {
    let config_dir = paths.config_dir.join("config");
    std::fs::create_dir_all(&config_dir)?;

    let files = [
        (paths.config_file(), starter::CONFIG_YAML),
        (paths.policies_file(), starter::POLICIES_YAML),
        (paths.agents_file(), starter::AGENTS_YAML),
    ];
    for (path, content) in files {
        if path.exists() && !overwrite {
            println!("keeping existing {}", path.display());
            continue;
        }
        std::fs::write(&path, content)?;
        println!("wrote {}", path.display());
    }
    Ok(())
}

async fn check_binaries(paths: &ConfigPaths, mode: LoadMode) -> Result<()> {
    use crate::subprocess::{ProcessCommand, ProcessRunner, TokioProcessRunner};

    let config = crate::config::load_config(paths, mode)?;
    let runner = TokioProcessRunner;
    for (label, bin) in [("tracker", &config.tracker.bin), ("agent", &config.agent.bin)] {
        match runner
            .run(ProcessCommand::new(bin.clone()).arg("--version"))
            .await
        {
            Ok(output) if output.status.success() => {
                println!("{label} binary '{bin}' found");
            }
            _ => {
                println!("warning: {label} binary '{bin}' not found on PATH");
            }
        }
    }
    Ok(())
}

fn show_policy_tree(ctx: &EngineContext, format: &str) -> Result<()> {
    if format == "json" {
        let api_view: Vec<_> = ctx
            .policies
            .policy_names()
            .into_iter()
            .map(|name| {
                let policy = ctx.policies.get_policy(&name).expect("listed policy exists");
                serde_json::json!({
                    "name": name,
                    "default": name == ctx.policies.default_policy_name(),
                    "phases": policy.phases.iter().map(|p| serde_json::json!({
                        "name": p.name,
                        "capabilities": p.capabilities,
                        "timeout_multiplier": p.timeout_multiplier,
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&api_view)?);
        return Ok(());
    }

    for name in ctx.policies.policy_names() {
        let policy = ctx.policies.get_policy(&name).expect("listed policy exists");
        let marker = if name == ctx.policies.default_policy_name() {
            " (default)"
        } else {
            ""
        };
        println!("{name}{marker}");
        let last = policy.phases.len().saturating_sub(1);
        for (index, phase) in policy.phases.iter().enumerate() {
            let connector = if index == last { "└─" } else { "├─" };
            println!(
                "  {connector} {} [{}] x{}",
                phase.name,
                phase.capabilities.join(", "),
                phase.timeout_multiplier
            );
        }
    }
    Ok(())
}
