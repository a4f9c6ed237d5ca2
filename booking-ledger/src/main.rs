//! booking-ledger - command-line entry point
//!
//! `serve` runs the ledger with its background tasks until Ctrl+C; the other
//! subcommands run one maintenance operation and print its report as JSON.

use std::path::PathBuf;

use anyhow::{Context, Result};
use booking_common::config::LedgerConfig;
use booking_ledger::BookingContext;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for booking-ledger
#[derive(Parser, Debug)]
#[command(name = "booking-ledger")]
#[command(about = "Durable booking ledger with backup, loss detection and recovery")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "BOOKING_LEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (overrides BOOKING_LEDGER_DATA_DIR and the config file)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Log level (overrides the config file; RUST_LOG takes precedence)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Migrate, then run periodic backups and the health monitor until stopped
    Serve,
    /// Convert old record layouts to the current one
    Migrate {
        /// Report what would change without writing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Rebuild the ledger from the best available source
    Recover,
    /// Run one health check
    Health,
    /// Snapshot every tracked file now
    Backup,
    /// Restore a backup over the file it was taken from
    Restore {
        /// Backup file name as shown by list-backups
        name: String,
    },
    /// List backups, newest first
    ListBackups {
        /// Only backups of this logical file (e.g. "bookings")
        #[arg(long)]
        file: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = LedgerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    let level = args.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("booking_ledger={0},booking_common={0}", level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting booking-ledger v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = config.resolve_data_dir(args.data_dir.as_deref());
    let ctx = BookingContext::open(config, data_dir)
        .await
        .context("Failed to open booking context")?;

    match args.command {
        Command::Serve => serve(ctx).await?,
        Command::Migrate { dry_run } => {
            let engine = ctx.migration();
            let report = if dry_run {
                engine.plan().await?
            } else {
                engine.migrate_all().await?
            };
            print_json(&report)?;
        }
        Command::Recover => {
            let restored = ctx.recovery().recover().await?;
            print_json(&restored.report)?;
        }
        Command::Health => {
            let snapshot = ctx.health().check_once().await;
            print_json(&snapshot)?;
        }
        Command::Backup => {
            let taken = ctx.backups().snapshot_periodic().await;
            print_json(&taken)?;
        }
        Command::Restore { name } => {
            let restored = ctx
                .restore_backup(&name)
                .await
                .with_context(|| format!("Failed to restore {}", name))?;
            info!("✓ Restored {} from {}", restored.display(), name);
        }
        Command::ListBackups { file } => {
            let backups = ctx.backups().list(file.as_deref()).await;
            print_json(&backups)?;
        }
    }

    Ok(())
}

async fn serve(ctx: BookingContext) -> Result<()> {
    match ctx.migration().migrate_all().await {
        Ok(report) => debug!("Startup migration: {} records", report.migrated_count),
        Err(e) => warn!("Startup migration skipped: {}", e),
    }

    // Relay committed changes to the log
    let mut changes = ctx.subscribe("log");
    let relay = tokio::spawn(async move {
        while let Some(event) = changes.recv().await {
            info!(event = event.event_type(), at = %event.timestamp(), "Ledger change");
        }
    });

    ctx.start_background().await;
    info!(
        "✓ Serving {} bookings from {}",
        ctx.ledger().count().await,
        ctx.paths().root.display()
    );

    shutdown_signal().await;

    ctx.shutdown().await;
    relay.abort();
    info!("Shutdown complete");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
