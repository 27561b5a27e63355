//! Hypnos - circadian rhythm scheduler for memory pipelines
//!
//! Composition root: loads configuration, wires the resilience layer,
//! processor and scheduler once, then runs the requested command. All
//! command output is JSON on stdout; logs go to stderr.

use anyhow::Context;
use clap::{Parser, Subcommand};
use hypnos_core::{
    config::resolve_config_path,
    health::run_health_checks,
    rhythm::{CommandProcessor, SchedulerState},
    HypnosConfig, ResilienceLayer, RhythmScheduler, SystemClock,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, Level};
use tracing_subscriber::{self, EnvFilter};

#[derive(Parser)]
#[command(name = "hypnos")]
#[command(about = "Circadian rhythm scheduler with resilient dependency handling", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Config file (overrides HYPNOS_CONFIG env var and default)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scheduling pass and exit (for cron or systemd timers)
    Tick,

    /// Run the scheduler loop until interrupted
    Run,

    /// Show current phase, rhythm timing and metrics
    Status,

    /// Run health checks
    Health,

    /// List dead-lettered operations
    DeadLetters {
        /// Maximum entries to list
        #[arg(long, default_value = "50")]
        limit: u32,

        /// List pending retry candidates instead of dead entries
        #[arg(long)]
        pending: bool,

        /// Delete succeeded entries older than this many days
        #[arg(long)]
        purge_days: Option<i64>,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // RUST_LOG wins over --log-level when set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = level.as_str().to_lowercase();
        EnvFilter::new(format!("hypnos={},hypnos_core={}", level, level))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr) // Write logs to stderr, not stdout
        .init();

    debug!("Hypnos v{} starting...", env!("CARGO_PKG_VERSION"));

    let config_path = resolve_config_path(cli.config);
    let config = HypnosConfig::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    debug!(path = %config_path.display(), "Configuration loaded");

    let resilience = Arc::new(
        ResilienceLayer::from_config(&config)
            .await
            .context("Failed to initialize resilience layer")?,
    );

    let processor = Arc::new(CommandProcessor::new(config.processor.clone()));
    let scheduler = Arc::new(RhythmScheduler::new(
        config.scheduler.clone(),
        Arc::clone(&resilience),
        processor,
        Arc::new(SystemClock),
    ));

    let state_path = config.scheduler.resolved_state_path();
    SchedulerState::load_or_default(&state_path).restore(&scheduler);

    match cli.command {
        Commands::Tick => {
            let report = scheduler.tick().await;
            SchedulerState::capture(&scheduler)
                .save(&state_path)
                .context("Failed to save scheduler state")?;
            print_json(&report)?;
        }
        Commands::Run => {
            scheduler.start();
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            info!("Shutdown requested");
            scheduler.stop().await;
            SchedulerState::capture(&scheduler)
                .save(&state_path)
                .context("Failed to save scheduler state")?;
            print_json(&scheduler.get_status())?;
        }
        Commands::Status => {
            print_json(&scheduler.get_status())?;
        }
        Commands::Health => {
            let summary = run_health_checks(&scheduler).await;
            print_json(&summary)?;
        }
        Commands::DeadLetters {
            limit,
            pending,
            purge_days,
        } => {
            let queue = resilience
                .dead_letters()
                .context("Dead-letter queue is disabled in configuration")?;
            if let Some(days) = purge_days {
                let purged = queue.purge_older_than(chrono::Utc::now(), days).await?;
                info!(purged, "Purged completed dead letters");
            }
            let entries = if pending {
                queue
                    .get_retry_candidates_at(chrono::Utc::now(), None, limit)
                    .await?
            } else {
                queue.get_dead_entries(limit).await?
            };
            print_json(&entries)?;
        }
    }

    Ok(())
}
