use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scan_station::archive::{ClearConfirmation, TransferEngine, TransferLog};
use scan_station::ingest::naming::{is_hidden, is_image};
use scan_station::{stats, Station, StationConfig, StationEvent};

/// Headless front end for the scanning station
#[derive(Debug, Parser)]
#[command(name = "scan-station", version, about)]
struct Cli {
    /// Config file (defaults to the per-user data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watch the scan folder and log every station event until Ctrl-C
    Run,
    /// Move scans from the scan folder into a new staged batch
    Batch {
        name: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Show what a transfer would do without touching anything
    Plan,
    /// Archive every staged batch
    Transfer,
    /// Print current counters as JSON
    Stats,
    /// Print the transfer log for one day
    Log {
        /// YYYY-MM-DD, defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Wipe the whole transfer log
    ClearLog {
        /// Required: confirms the log should be erased
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(StationConfig::default_path);
    let config = StationConfig::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Batch { name, files } => {
            let station = Station::new(config)?;
            let batch = station.create_batch(&name, files).await?;
            println!("{} -> {} ({} pages)", batch.name, batch.path.display(), batch.page_count());
            Ok(())
        }
        Command::Plan => {
            let plan = TransferEngine::new(&config).plan()?;
            for planned in &plan.moves {
                println!(
                    "{} ({} pages) -> {}",
                    planned.batch_name,
                    planned.pages,
                    planned.final_path.display()
                );
            }
            for warning in &plan.warnings {
                println!("skip: {}", warning);
            }
            Ok(())
        }
        Command::Transfer => {
            let report = TransferEngine::new(&config)
                .transfer_all()
                .context("transfer aborted, nothing was moved")?;
            for record in &report.records {
                println!(
                    "{} ({} pages) -> {}",
                    record.batch_name,
                    record.page_count,
                    record.destination_path.display()
                );
            }
            for failure in &report.failures {
                println!("failed: {}: {}", failure.batch_name, failure.reason);
            }
            if !report.is_clean() {
                bail!("{} batch(es) left in staging", report.failures.len());
            }
            Ok(())
        }
        Command::Stats => {
            let pending = count_scans(&config.scan_root);
            let snapshot = stats::compute(
                pending,
                &config.staging_root,
                &config.log_file,
                Local::now().date_naive(),
            );
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        Command::Log { date } => {
            let date = date.unwrap_or_else(|| Local::now().date_naive());
            let log = TransferLog::load(&config.log_file)?;
            let records = log.records_on(date);
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
        Command::ClearLog { yes } => {
            let confirmation = if yes {
                ClearConfirmation::Confirmed
            } else {
                ClearConfirmation::NotConfirmed
            };
            let mut log = TransferLog::load(&config.log_file)?;
            log.clear(confirmation)
                .context("pass --yes to really erase the transfer log")?;
            println!("transfer log cleared");
            Ok(())
        }
    }
}

async fn run(config: StationConfig) -> anyhow::Result<()> {
    let station = Station::new(config)?;
    let mut events = station.subscribe();
    station.start()?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => log_event(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
        }
    }

    station.shutdown().await;
    Ok(())
}

fn log_event(event: &StationEvent) {
    match event {
        StationEvent::FileReady(path) => info!(path = %path.display(), "ready"),
        StationEvent::FileFailed(path) => warn!(path = %path.display(), "not settled"),
        StationEvent::FileRemoved(path) => info!(path = %path.display(), "removed"),
        StationEvent::FileRenamed { from, to } => {
            info!(from = %from.display(), to = %to.display(), "renamed")
        }
        StationEvent::ThumbnailReady { key, .. } => info!(%key, "thumbnail"),
        StationEvent::ThumbnailFailed { key, reason } => warn!(%key, reason = %reason, "thumbnail failed"),
        StationEvent::BatchCreated(batch) => {
            info!(batch = %batch.name, pages = batch.page_count(), "batch created")
        }
        StationEvent::TransferComplete(records) => info!(batches = records.len(), "transfer complete"),
        StationEvent::TransferFailed { batch_name, reason } => {
            error!(batch = %batch_name, reason = %reason, "transfer failed")
        }
        StationEvent::StatsUpdated(stats) => info!(
            pending = stats.pending,
            staged = stats.staged_books,
            today = stats.total_pages_today,
            "stats"
        ),
    }
}

/// Images sitting in the scan folder, for one-shot stats without a watcher
fn count_scans(scan_root: &Path) -> usize {
    fs::read_dir(scan_root)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_file() && is_image(path) && !is_hidden(path))
                .count()
        })
        .unwrap_or(0)
}
