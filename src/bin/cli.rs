//! ccjk-sync CLI
//!
//! Command-line interface for syncing config artifacts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ccjk_sync::config::AppConfig;
use ccjk_sync::sync::{DirectoryStore, FileCheckpointStore, SyncEngine, SyncWorker, WorkerConfig};
use ccjk_sync::types::*;

#[derive(Parser)]
#[command(name = "ccjk-sync")]
#[command(about = "Sync skills, workflows, settings and MCP configs with a remote store")]
#[command(version)]
struct Cli {
    /// Config file path
    #[arg(long, env = "CCJK_SYNC_CONFIG")]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long, env = "CCJK_SYNC_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync pass
    Sync {
        /// push, pull or bidirectional
        #[arg(short, long)]
        direction: Option<SyncDirection>,
        /// local-wins, remote-wins, newest-wins, smart-merge or manual
        #[arg(short, long)]
        strategy: Option<ConflictStrategy>,
        /// Item types to include (comma-separated)
        #[arg(short = 'T', long, value_delimiter = ',')]
        types: Vec<ItemType>,
        /// Compute the plan without touching either side
        #[arg(long)]
        dry_run: bool,
        /// Never defer conflicts to manual resolution
        #[arg(short, long)]
        force: bool,
    },
    /// Show engine state
    Status,
    /// List queued conflicts
    Conflicts,
    /// Decide a queued conflict; applied on the next sync
    Resolve {
        /// Conflict ID
        id: String,
        /// local, remote or merged
        resolution: Resolution,
        /// File holding hand-merged content (implies merged)
        #[arg(long)]
        content_file: Option<PathBuf>,
    },
    /// Sync on an interval until interrupted
    Watch {
        /// Seconds between passes
        #[arg(short, long, default_value = "300")]
        interval: u64,
    },
    /// Forget the checkpoint and all sync state
    Reset,
}

fn init_tracing(json: bool) {
    let registry =
        tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::from_default_env());
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .init();
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // Logs go to stderr; stdout is reserved for JSON output
    init_tracing(cli.json_logs);

    let config_path = match &cli.config {
        Some(path) => PathBuf::from(shellexpand::tilde(path).to_string()),
        None => AppConfig::default_path()?,
    };
    let config = AppConfig::load_from(&config_path)?;
    let data_dir = config.data_dir()?;
    let items_dir = config.items_dir()?;

    let engine = Arc::new(SyncEngine::with_state_file(
        Arc::new(DirectoryStore::new(items_dir)),
        Arc::new(FileCheckpointStore::new(data_dir.join("checkpoint.json"))),
        data_dir.join("state.json"),
    )?);

    match cli.command {
        Commands::Sync {
            direction,
            strategy,
            types,
            dry_run,
            force,
        } => {
            configure(&engine, &config, &config_path).await?;
            let mut options = config.sync.clone();
            if let Some(direction) = direction {
                options.direction = direction;
            }
            if let Some(strategy) = strategy {
                options.conflict_strategy = strategy;
            }
            if !types.is_empty() {
                options.item_types = types;
            }
            options.dry_run = dry_run;
            options.force = force;

            let result = engine.perform_sync(options).await?;
            print_json(&result)?;
            engine.shutdown().await?;
            if !result.success {
                std::process::exit(1);
            }
        }

        Commands::Status => {
            print_json(&engine.state())?;
        }

        Commands::Conflicts => {
            print_json(&engine.conflicts())?;
        }

        Commands::Resolve {
            id,
            resolution,
            content_file,
        } => {
            let conflict = match content_file {
                Some(path) => {
                    let content = std::fs::read_to_string(&path)
                        .with_context(|| format!("read {}", path.display()))?;
                    engine.resolve_conflict_with(&id, content).await?
                }
                None => engine.resolve_conflict(&id, resolution).await?,
            };
            print_json(&conflict)?;
        }

        Commands::Watch { interval } => {
            configure(&engine, &config, &config_path).await?;
            let worker = SyncWorker::start(
                engine.clone(),
                WorkerConfig {
                    interval: Some(Duration::from_secs(interval.max(1))),
                    options: config.sync.clone(),
                    ..Default::default()
                },
            );
            worker.sync(config.sync.direction, false).await?;

            tokio::signal::ctrl_c().await?;
            tracing::info!("Interrupted, stopping");
            engine.cancel();
            worker.stop().await?;
            engine.shutdown().await?;
        }

        Commands::Reset => {
            engine.reset().await?;
            print_json(&engine.state())?;
        }
    }

    Ok(())
}

async fn configure(
    engine: &SyncEngine,
    config: &AppConfig,
    config_path: &std::path::Path,
) -> anyhow::Result<()> {
    let provider = config
        .provider
        .clone()
        .ok_or_else(|| anyhow!("no [provider] configured in {}", config_path.display()))?;
    engine.configure(provider).await?;
    Ok(())
}
