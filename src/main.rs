//! # Chime: persistent reminder scheduler
//!
//! Usage:
//!   chime init                              # Write a default ~/.chime/config.toml
//!   chime run                               # Start the scheduler loop
//!   chime run --config ./chime.toml -v      # Custom config, debug logging
//!   chime list --owner u123                 # Show a user's pending reminders
//!   chime next "every 2 weeks"              # Preview the next occurrence

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use chime_core::ChimeConfig;
use chime_core::traits::TaskStore;
use chime_scheduler::{Scheduler, SqliteTaskStore, deliverer_from_config, next_from_spec};

#[derive(Parser)]
#[command(name = "chime", version, about = "⏰ Chime — persistent reminder scheduler")]
struct Cli {
    /// Config file (default: ~/.chime/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default config file if none exists
    Init,
    /// Run the scheduler until Ctrl-C
    Run,
    /// List an owner's active reminders
    List {
        #[arg(long)]
        owner: String,
    },
    /// Print the next occurrence of a recurrence ("daily", "every 3 weeks", ...)
    Next {
        spec: String,
        /// Base instant (RFC 3339); defaults to now
        #[arg(long)]
        from: Option<String>,
    },
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn load_config(cli: &Cli) -> Result<ChimeConfig> {
    let config = match &cli.config {
        Some(path) => ChimeConfig::load_from(&expand_path(path))?,
        None => ChimeConfig::load()?,
    };
    config.validate()?;
    Ok(config)
}

fn open_store(config: &ChimeConfig) -> Result<SqliteTaskStore> {
    let path = config.store.resolved_path();
    SqliteTaskStore::open(&path).with_context(|| format!("opening store at {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "chime=debug,chime_scheduler=debug,chime_core=debug"
    } else {
        "chime=info,chime_scheduler=info,chime_core=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    match &cli.command {
        Command::Init => init(&cli),
        Command::Run => run(load_config(&cli)?).await,
        Command::List { owner } => list(load_config(&cli)?, owner).await,
        Command::Next { spec, from } => next(spec, from.as_deref()),
    }
}

fn init(cli: &Cli) -> Result<()> {
    let custom = cli.config.as_deref().map(expand_path);
    let path = custom.clone().unwrap_or_else(ChimeConfig::default_path);
    if path.exists() {
        println!("⚠️  Config already exists at {}", path.display());
        return Ok(());
    }
    let config = ChimeConfig::default();
    match custom {
        Some(path) => config.save_to(&path)?,
        None => config.save()?,
    }
    println!("✅ Wrote default config to {}", path.display());
    Ok(())
}

async fn run(config: ChimeConfig) -> Result<()> {
    let store = Arc::new(open_store(&config)?);
    let deliverer = deliverer_from_config(&config.delivery)?;

    let mut scheduler = Scheduler::new(store, deliverer, &config.scheduler);
    scheduler.reconcile().await.context("reconciling schedule")?;

    let shutdown = CancellationToken::new();
    let join = scheduler.spawn(shutdown.clone());

    println!("⏰ Chime v{} — Ctrl-C to stop", env!("CARGO_PKG_VERSION"));
    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Shutdown requested");
    shutdown.cancel();

    join.await.context("scheduler task panicked")??;
    Ok(())
}

async fn list(config: ChimeConfig, owner: &str) -> Result<()> {
    let store = open_store(&config)?;
    let tasks = store.list_active_for_owner(owner, Utc::now()).await?;
    if tasks.is_empty() {
        println!("No pending reminders for {owner}.");
        return Ok(());
    }
    for task in tasks {
        let repeat = task
            .recurrence
            .map(|r| r.to_string())
            .unwrap_or_else(|| "once".into());
        println!(
            "#{:<5} {}  {:<14} → {:<12} {}",
            task.id,
            task.trigger_time.format("%Y-%m-%d %H:%M UTC"),
            repeat,
            task.destination(),
            task.payload.message
        );
    }
    Ok(())
}

fn next(spec: &str, from: Option<&str>) -> Result<()> {
    let from = match from {
        Some(s) => DateTime::parse_from_rfc3339(s)
            .with_context(|| format!("invalid --from '{s}'"))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };
    let next = next_from_spec(spec, from)
        .inspect_err(|e| tracing::warn!("⚠️ Invalid recurrence '{}': {e}", spec))?;
    match next {
        Some(at) => println!("{}", at.to_rfc3339()),
        None => anyhow::bail!("'{spec}' has no next occurrence after {from}"),
    }
    Ok(())
}
