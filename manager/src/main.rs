// File: manager/src/main.rs
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use snapshot_manager::config::{Config, ConfigManager};
use snapshot_manager::constants::defaults;
use snapshot_manager::retention::format_bytes;
use snapshot_manager::snapshot::{SnapshotManager, SnapshotReport, SquashOutcome, UnitOutcome};
use snapshot_manager::{FileStoreEngine, OperationTracker, SnapshotScheduler};

#[derive(Parser, Debug)]
#[command(name = "snapshot-manager")]
#[command(about = "Chunked, incremental snapshots of node databases")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding main.toml and the network configs
    #[arg(long, default_value = defaults::CONFIG_DIR)]
    config_dir: PathBuf,

    /// Override the base directory; main.toml becomes optional
    #[arg(long)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Snapshot every discovered unit
    Create {
        snapshot_id: String,
        /// Limit to these networks (repeatable)
        #[arg(short, long)]
        network: Vec<String>,
        /// Always write a base, never an incremental
        #[arg(long)]
        full: bool,
    },
    /// Restore a snapshot into the current runs
    Restore {
        snapshot_id: String,
        #[arg(short, long)]
        network: Option<String>,
        /// Restore a single unit directory (requires --network)
        #[arg(short, long, requires = "network")]
        unit: Option<String>,
        /// Restore the unit somewhere else (requires --unit)
        #[arg(long, requires = "unit")]
        target: Option<PathBuf>,
    },
    /// Collapse incremental chains into a fresh base
    Squash {
        snapshot_id: String,
        #[arg(short, long)]
        network: Option<String>,
        /// Squash a single unit directory regardless of chain length (requires --network)
        #[arg(short, long, requires = "network")]
        unit: Option<String>,
        /// Squash only chains with more incrementals than this
        #[arg(long, default_value_t = 0)]
        min_incrementals: usize,
    },
    /// List stored snapshots, newest first
    List,
    /// Re-hash every part of a snapshot
    Verify { snapshot_id: String },
    /// Rotate runner logs and delete old backups and stale runs
    Clean {
        #[arg(long)]
        dry_run: bool,
        #[arg(short, long)]
        verbose: bool,
    },
    /// Remove chunk files and directories no manifest references
    Gc { snapshot_id: Option<String> },
    /// Run the configured schedules until interrupted
    Daemon,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::from_default_env()
        .add_directive("snapshot_manager=info".parse()?)
        .add_directive("tokio_cron_scheduler=warn".parse()?);

    fmt().with_env_filter(env_filter).init();

    let args = Args::parse();
    let config = load_config(&args).await?;

    let manager = Arc::new(SnapshotManager::new(
        config.engine_config(),
        Arc::new(FileStoreEngine),
    ));

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling in-flight work");
            interrupt.cancel();
        }
    });

    match args.command {
        Commands::Create { snapshot_id, network, full } => {
            let networks = (!network.is_empty()).then_some(network);
            let report = manager
                .create_snapshot(&snapshot_id, networks.as_deref(), !full, cancel)
                .await?;
            finish(report)
        }
        Commands::Restore { snapshot_id, network, unit: Some(unit), target } => {
            let network = network.ok_or_else(|| anyhow!("--unit requires --network"))?;
            let stats = manager
                .restore_unit(&snapshot_id, &network, &unit, target, cancel)
                .await?;
            println!(
                "Restored {}/{} to version {} ({} entries, {} parts, {})",
                network,
                unit,
                stats.version,
                stats.entries,
                stats.parts,
                format_bytes(stats.bytes)
            );
            Ok(())
        }
        Commands::Restore { snapshot_id, network, unit: None, .. } => {
            let report = manager
                .restore_snapshot(&snapshot_id, network.as_deref(), cancel)
                .await?;
            finish(report)
        }
        Commands::Squash { snapshot_id, network, unit: Some(unit), .. } => {
            let network = network.ok_or_else(|| anyhow!("--unit requires --network"))?;
            let outcome = manager.squash(&snapshot_id, &network, &unit, cancel).await?;
            println!("{}/{}: {}", network, unit, describe_squash(&outcome));
            Ok(())
        }
        Commands::Squash { snapshot_id, network, unit: None, min_incrementals } => {
            let report = manager
                .squash_snapshot(&snapshot_id, network.as_deref(), min_incrementals, cancel)
                .await?;
            finish(report)
        }
        Commands::List => {
            let snapshots = manager.list_snapshots()?;
            if snapshots.is_empty() {
                println!("No snapshots under {}", config.base_dir.display());
            }
            for info in snapshots {
                println!(
                    "{:<32} {:>10} {:>4} units  {}  {}",
                    info.name,
                    format_bytes(info.size),
                    info.units,
                    if info.incremental { "incremental" } else { "base" },
                    info.created.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }
        Commands::Verify { snapshot_id } => {
            let report = manager.verify_snapshot(&snapshot_id).await?;
            finish(report)
        }
        Commands::Clean { dry_run, verbose } => {
            let mut cleanup = config.cleanup.to_cleanup_config();
            cleanup.dry_run |= dry_run;
            cleanup.verbose |= verbose;
            let dry_run = cleanup.dry_run;

            let sweeper = manager.clone();
            let result = tokio::task::spawn_blocking(move || sweeper.cleanup(&cleanup)).await?;
            println!(
                "{}logs: {}, backups: {}, stale runs: {}, freed {}",
                if dry_run { "[dry run] " } else { "" },
                result.logs_deleted,
                result.backups_deleted,
                result.stale_runs_deleted,
                format_bytes(result.total_bytes_freed())
            );
            for err in &result.errors {
                error!("{}", err);
            }
            Ok(())
        }
        Commands::Gc { snapshot_id } => {
            let report = manager.collect_garbage(snapshot_id.as_deref())?;
            println!(
                "Removed {} files and {} directories, freed {}",
                report.files_removed,
                report.dirs_removed,
                format_bytes(report.bytes_freed)
            );
            for err in &report.errors {
                error!("{}", err);
            }
            Ok(())
        }
        Commands::Daemon => run_daemon(config, manager, cancel).await,
    }
}

async fn load_config(args: &Args) -> Result<Arc<Config>> {
    let main_toml = args.config_dir.join("main.toml");
    let config = match (&args.base_dir, main_toml.exists()) {
        (Some(base_dir), false) => Arc::new(Config::with_base_dir(base_dir)),
        (override_dir, _) => {
            let loaded = ConfigManager::new(&args.config_dir).await?.get_current_config();
            match override_dir {
                Some(base_dir) => {
                    let mut config = (*loaded).clone();
                    config.base_dir = base_dir.clone();
                    Arc::new(config)
                }
                None => loaded,
            }
        }
    };
    info!("Using base directory {}", config.base_dir.display());
    Ok(config)
}

fn finish(report: SnapshotReport) -> Result<()> {
    for unit in &report.units {
        match &unit.error {
            Some(reason) => println!("{:<12} {}  ({})", format!("{:?}", unit.outcome), unit.unit, reason),
            None => println!(
                "{:<12} {}  {} parts, {}, version {}",
                format!("{:?}", unit.outcome),
                unit.unit,
                unit.parts,
                format_bytes(unit.bytes),
                unit.version
            ),
        }
    }

    let failed = report.count(UnitOutcome::Failed);
    println!(
        "{} {}: {} units, {} skipped, {} failed, {} written",
        report.operation,
        report.snapshot_id,
        report.units.len(),
        report.count(UnitOutcome::Skipped),
        failed,
        format_bytes(report.total_bytes())
    );

    if failed > 0 {
        return Err(anyhow!("{} of {} units failed", failed, report.units.len()));
    }
    Ok(())
}

async fn run_daemon(config: Arc<Config>, manager: Arc<SnapshotManager>, cancel: CancellationToken) -> Result<()> {
    info!("Starting snapshot daemon");
    let tracker = OperationTracker::new();

    let mut scheduler = SnapshotScheduler::new(config.clone(), manager.clone(), tracker.clone()).await?;
    let jobs = scheduler.start().await?;
    if jobs == 0 {
        warn!("Nothing scheduled, daemon will idle until interrupted");
    }

    // Stuck operations get cancelled so their network can be snapshotted again
    let sweeper = tracker.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            defaults::OPERATION_SWEEP_INTERVAL_SECONDS,
        ));
        loop {
            interval.tick().await;
            let cleaned = sweeper.cleanup_old_operations(defaults::OPERATION_TIMEOUT_HOURS);
            if cleaned > 0 {
                warn!(
                    "Cleaned up {} stuck operations older than {} hours",
                    cleaned,
                    defaults::OPERATION_TIMEOUT_HOURS
                );
            }
        }
    });

    cancel.cancelled().await;

    let cancelled = tracker.cancel_all();
    if cancelled > 0 {
        info!("Cancelled {} running operations", cancelled);
    }
    scheduler.shutdown().await?;
    info!("Snapshot daemon stopped");
    Ok(())
}

fn describe_squash(outcome: &SquashOutcome) -> String {
    match outcome {
        SquashOutcome::AlreadyBase => "already a base".to_string(),
        SquashOutcome::Squashed { incrementals, parts_removed, base_parts } => format!(
            "{} incrementals folded, {} parts removed, {} base parts",
            incrementals, parts_removed, base_parts
        ),
    }
}
