//! Switchyard binary: serve the hub or drive a workflow from the command line.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use switchyard::config::{HubConfig, TransportMode};
use switchyard::credentials::EnvCredentialProvider;
use switchyard::router::server::{serve_http, serve_stdio};
use switchyard::router::Router;
use switchyard::store::{SqliteStateStore, StateStore};
use switchyard::upstream::DefaultConnector;
use switchyard::workflow::{load_definition, RouterExecutor, WorkflowEngine};

#[derive(Parser, Debug)]
#[command(name = "switchyard")]
#[command(version, about = "Aggregate upstream tool servers and run workflows across them")]
struct Cli {
    /// Config file (YAML or JSON by extension).
    #[arg(short, long, env = "SWITCHYARD_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log filter directive, e.g. `switchyard=debug`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Write logs to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// SQLite database for workflow state.
    #[arg(long, global = true)]
    state_db: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the hub over stdin/stdout.
    Stdio,
    /// Serve the hub over HTTP with server-sent events.
    Http {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a workflow definition to completion and print the final snapshot.
    RunWorkflow {
        /// Definition file (YAML or JSON).
        definition: PathBuf,
        /// Recover and finish interrupted runs before starting this one.
        #[arg(long)]
        resume: bool,
    },
    /// List stored workflow runs.
    Runs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    switchyard::init_tracing(&config.log).context("failed to initialize logging")?;

    match cli.command {
        Some(Command::Stdio) => serve(config, TransportMode::Stdio).await,
        Some(Command::Http { host, port }) => {
            let mut config = config;
            if let Some(host) = host {
                config.transport.host = host;
            }
            if let Some(port) = port {
                config.transport.port = port;
            }
            serve(config, TransportMode::HttpSse).await
        }
        Some(Command::RunWorkflow { definition, resume }) => {
            run_workflow(config, definition, resume).await
        }
        Some(Command::Runs) => list_runs(&config),
        None => {
            let mode = config.transport.mode;
            serve(config, mode).await
        }
    }
}

/// File, then `SWITCHYARD_*` env, then command-line flags.
fn load_config(cli: &Cli) -> Result<HubConfig> {
    let mut config = match &cli.config {
        Some(path) => HubConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            let mut config = HubConfig::default();
            config.apply_overrides(|key| std::env::var(key).ok());
            config
        }
    };
    if let Some(level) = &cli.log_level {
        config.log.level = Some(level.clone());
    }
    if let Some(file) = &cli.log_file {
        config.log.file = Some(file.clone());
    }
    if let Some(db) = &cli.state_db {
        config.state_db = Some(db.clone());
    }
    Ok(config)
}

fn build_router(config: &HubConfig) -> Result<Router> {
    let connector = Arc::new(DefaultConnector::new(Arc::new(EnvCredentialProvider)));
    switchyard::build_router(config, connector).context("failed to register endpoints")
}

fn open_store(config: &HubConfig) -> Result<Arc<dyn StateStore>> {
    let path = config.state_db_path();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let store = SqliteStateStore::open(&path.to_string_lossy())
        .with_context(|| format!("failed to open state database {}", path.display()))?;
    Ok(Arc::new(store))
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            trigger.cancel();
        }
    });
    token
}

async fn serve(config: HubConfig, mode: TransportMode) -> Result<()> {
    let router = build_router(&config)?;
    let shutdown = shutdown_on_ctrl_c();

    let served = match mode {
        TransportMode::Stdio => {
            tokio::select! {
                result = serve_stdio(router.clone()) => result.context("stdio server failed"),
                _ = shutdown.cancelled() => Ok(()),
            }
        }
        TransportMode::HttpSse => {
            let transport = &config.transport;
            serve_http(
                router.clone(),
                &transport.host,
                transport.port,
                &transport.sse_path,
                shutdown.clone(),
            )
            .await
            .context("http server failed")
        }
    };

    router.shutdown().await;
    served
}

async fn run_workflow(config: HubConfig, path: PathBuf, resume: bool) -> Result<()> {
    let definition = load_definition(&path)?;
    let router = build_router(&config)?;
    router.handshake(&json!({})).await;

    let engine = WorkflowEngine::new(
        config.workflow.clone(),
        open_store(&config)?,
        Arc::new(RouterExecutor::new(router.clone())),
    );

    if resume {
        for run_id in engine.recover()? {
            let snapshot = engine.execute(&run_id).await?;
            tracing::info!(run_id = %run_id, status = %snapshot.status, "recovered run settled");
        }
    }

    let run_id = engine.start_run(definition)?;
    let shutdown = shutdown_on_ctrl_c();
    let canceller = {
        let engine = engine.clone();
        let run_id = run_id.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            if let Err(e) = engine.cancel(&run_id).await {
                tracing::warn!(run_id = %run_id, error = %e, "cancel failed");
            }
        })
    };

    let outcome = engine.execute(&run_id).await;
    canceller.abort();
    router.shutdown().await;

    let snapshot = outcome?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn list_runs(config: &HubConfig) -> Result<()> {
    let runs = open_store(config)?.list_runs()?;
    println!("{}", serde_json::to_string_pretty(&runs)?);
    Ok(())
}
