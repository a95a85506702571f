use std::path::PathBuf;

use clap::{Parser, Subcommand};
use keel_engine::{Engine, EngineConfig};
use tracing::debug;

mod commands;

#[derive(Parser)]
#[command(
    name = "keel",
    about = "keel: release and deployment bookkeeping for a small PaaS",
    version,
    propagate_version = true
)]
struct Cli {
    /// Configuration file (default: ./keel.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// State database path, overriding [store].path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register, list and deregister apps
    App {
        #[command(subcommand)]
        action: commands::app::AppAction,
    },
    /// Create releases and move them to ready or failed
    Release {
        #[command(subcommand)]
        action: commands::release::ReleaseAction,
    },
    /// Deploy a release to an app
    Deploy {
        #[arg(short, long)]
        app: String,
        #[arg(short, long)]
        release: String,
    },
    /// Roll a failed deployment back to its previous release
    Rollback { deployment: String },
    /// List an app's deployments, newest first
    Deployments {
        #[arg(short, long)]
        app: String,
    },
    /// Manage addons and their bindings
    Addon {
        #[command(subcommand)]
        action: commands::addon::AddonAction,
    },
    /// Print the event log
    Events {
        #[arg(long, default_value_t = 0)]
        since: u64,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Rebuild a deployment's status history from the event log
    Timeline { deployment: String },
    /// Fail deployments left unfinished by crashes or timeouts
    Reconcile {
        /// Keep running, one pass per [reconcile].interval_secs
        #[arg(long)]
        watch: bool,
        /// Override [reconcile].stale_after_secs
        #[arg(long)]
        stale_after_secs: Option<u64>,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => {
            let default = PathBuf::from("keel.toml");
            if default.exists() {
                EngineConfig::from_file(&default)?
            } else {
                EngineConfig::default()
            }
        }
    };
    if let Some(db) = &cli.db {
        config.store.path = db.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,keel=debug"))?,
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli)?;
    debug!(db = ?config.store.path, "configuration loaded");
    let engine = Engine::open(&config)?;

    match cli.command {
        Commands::App { action } => commands::app::run(&engine, action),
        Commands::Release { action } => commands::release::run(&engine, action),
        Commands::Deploy { app, release } => commands::deploy::deploy(&engine, &app, &release),
        Commands::Rollback { deployment } => commands::deploy::rollback(&engine, &deployment),
        Commands::Deployments { app } => commands::deploy::list(&engine, &app),
        Commands::Addon { action } => commands::addon::run(&engine, action),
        Commands::Events { since, limit } => commands::events::list(&engine, since, limit),
        Commands::Timeline { deployment } => commands::events::timeline(&engine, &deployment),
        Commands::Reconcile {
            watch,
            stale_after_secs,
        } => {
            if let Some(secs) = stale_after_secs {
                config.reconcile.stale_after_secs = secs;
            }
            commands::events::reconcile(&engine, &config, watch).await
        }
    }
}
