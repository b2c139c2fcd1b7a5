use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use agent_hive::config::AgentConfig;
use agent_hive::executor::file::FileSandbox;
use agent_hive::executor::http::HttpCapability;
use agent_hive::executor::shell::ShellRunner;
use agent_hive::executor::sql::SqlCapability;
use agent_hive::executor::{BuiltinExecutor, Executor, PlannerExecutor};
use agent_hive::worker::{AcceptingValidator, AgentDeps, CapabilityOracle, WorkerLoop};
use agent_hive::workspace::{Workspace, paths};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = AgentConfig::from_env().context("Invalid agent configuration")?;

    // Console always; daily-rolling files when a log directory is configured.
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", config.agent_id));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    eprintln!("🐝 Agent Hive v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Agent: {} ({})", config.agent_id, config.role);
    eprintln!("   Workspace: {}", config.workspace_path.display());

    // ── Workspace ─────────────────────────────────────────────────────────
    let workspace = Workspace::new(&config.workspace_path);
    workspace
        .ensure_dirs()
        .await
        .context("Failed to create workspace directories")?;
    workspace
        .check_same_volume()
        .await
        .context("Workspace layout unusable for atomic claims")?;

    // ── Executor ──────────────────────────────────────────────────────────
    let executor: Arc<dyn Executor> = if config.role.is_planner() {
        Arc::new(PlannerExecutor)
    } else {
        let root = workspace.root();
        let files = FileSandbox::new(root).with_protected([
            root.join(paths::TASKS),
            root.join(paths::AGENTS),
            root.join(paths::CONTEXT),
        ]);
        let shell = ShellRunner::new(root).with_timeout(config.shell_timeout);
        let sql = SqlCapability::new(&config.sql_database_path);
        Arc::new(BuiltinExecutor::new(files, shell, HttpCapability::new(), sql))
    };
    eprintln!("   Executor: {}", executor.name());
    eprintln!(
        "   Capabilities: {} (eagerness {})\n",
        config.capabilities.join(", "),
        config.eagerness
    );

    let deps = AgentDeps::new(
        config,
        executor,
        Arc::new(CapabilityOracle),
        Arc::new(AcceptingValidator),
    );

    // ── Shutdown ──────────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested");
                shutdown.cancel();
            }
        });
    }

    WorkerLoop::new(deps).run(shutdown).await;
    Ok(())
}
