//! stepgridd — the StepGrid daemon.
//!
//! Single binary that assembles the engine:
//! - State store (redb)
//! - Provider gateway (quota, timeout and retry around the provider)
//! - Reconciliation loop + serial step runner
//!
//! # Usage
//!
//! ```text
//! stepgridd standalone --data-dir /var/lib/stepgrid --steps steps.json
//! stepgridd status --data-dir /var/lib/stepgrid
//! stepgridd default-config > /var/lib/stepgrid/stepgrid.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use stepgrid_core::StepgridConfig;
use stepgrid_engine::Engine;
use stepgrid_provider::{GuardedProvider, SimulatedBehavior, SimulatedProvider};
use stepgrid_state::{NewStep, StateStore, Store};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,stepgridd=debug,stepgrid=debug";

/// Config file looked up in the data directory when `--config` is absent.
const CONFIG_FILE: &str = "stepgrid.toml";

#[derive(Parser)]
#[command(name = "stepgridd", about = "StepGrid daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine against the simulated provider until Ctrl-C.
    Standalone {
        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/stepgrid")]
        data_dir: PathBuf,

        /// Configuration file (defaults to `<data-dir>/stepgrid.toml` if present).
        #[arg(long)]
        config: Option<PathBuf>,

        /// JSON array of steps to submit on startup.
        #[arg(long)]
        steps: Option<PathBuf>,

        /// Status polls before a simulated cluster reports Ready.
        #[arg(long, default_value = "2")]
        ready_after_polls: u32,

        /// Status polls before a simulated step completes.
        #[arg(long, default_value = "3")]
        step_polls: u32,
    },

    /// Print clusters and steps recorded in the store as JSON.
    Status {
        #[arg(long, default_value = "/var/lib/stepgrid")]
        data_dir: PathBuf,

        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the default configuration as TOML.
    DefaultConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Standalone {
            data_dir,
            config,
            steps,
            ready_after_polls,
            step_polls,
        } => {
            let behavior = SimulatedBehavior::auto(ready_after_polls, step_polls);
            run_standalone(data_dir, config, steps, behavior).await
        }
        Command::Status { data_dir, config } => print_status(&data_dir, config.as_deref()),
        Command::DefaultConfig => {
            print!("{}", StepgridConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(data_dir: &Path, explicit: Option<&Path>) -> anyhow::Result<StepgridConfig> {
    if let Some(path) = explicit {
        return StepgridConfig::from_file(path);
    }
    let default_path = data_dir.join(CONFIG_FILE);
    if default_path.exists() {
        StepgridConfig::from_file(&default_path)
    } else {
        Ok(StepgridConfig::default())
    }
}

fn open_store(data_dir: &Path, config: &StepgridConfig) -> anyhow::Result<StateStore> {
    let db_path = data_dir.join(&config.store.path);
    let store = StateStore::open(&db_path)
        .with_context(|| format!("failed to open state store at {}", db_path.display()))?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

async fn run_standalone(
    data_dir: PathBuf,
    config_path: Option<PathBuf>,
    steps: Option<PathBuf>,
    behavior: SimulatedBehavior,
) -> anyhow::Result<()> {
    info!("StepGrid daemon starting in standalone mode");

    std::fs::create_dir_all(&data_dir)?;
    let config = load_config(&data_dir, config_path.as_deref())?;
    let store: Arc<dyn Store> = Arc::new(open_store(&data_dir, &config)?);

    // ── Provider ───────────────────────────────────────────────

    let simulated = Arc::new(SimulatedProvider::new(behavior));
    let provider = Arc::new(GuardedProvider::new(simulated, &config.provider));
    info!(
        call_timeout = ?config.provider.call_timeout,
        retry = ?provider.retry_policy(),
        "provider gateway initialized"
    );

    let engine = Engine::new(store, provider, config);

    if let Some(path) = steps {
        submit_steps(&engine, &path).await?;
    }

    // ── Background loops ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine_handle = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine.run(shutdown_rx).await;
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    if let Err(e) = engine_handle.await {
        warn!(error = %e, "engine task ended abnormally");
    }

    info!("StepGrid daemon stopped");
    Ok(())
}

async fn submit_steps(engine: &Engine, path: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read steps from {}", path.display()))?;
    let steps: Vec<NewStep> = serde_json::from_str(&content)
        .with_context(|| format!("invalid steps file {}", path.display()))?;
    info!(count = steps.len(), "submitting steps");
    for new in steps {
        let name = new.name.clone();
        match engine.submit_step(new).await {
            Ok(step) => info!(step_id = %step.id, %name, status = %step.status, "step accepted"),
            Err(e) => warn!(%name, error = %e, "step rejected"),
        }
    }
    Ok(())
}

fn print_status(data_dir: &Path, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(data_dir, config_path)?;
    let store = open_store(data_dir, &config)?;
    let report = serde_json::json!({
        "clusters": store.list_clusters()?,
        "steps": store.list_steps()?,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
