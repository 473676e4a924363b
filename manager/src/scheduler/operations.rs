// File: manager/src/scheduler/operations.rs
use crate::config::{Config, NetworkConfig};
use crate::operation_tracker::{OperationKind, OperationTracker};
use crate::retention::{format_bytes, CleanupConfig, CleanupResult};
use crate::snapshot::{SnapshotManager, SnapshotReport, UnitOutcome};
use anyhow::{anyhow, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, instrument, warn};

/// Tracker slot used by the retention sweep, which spans every network
pub const CLEANUP_TARGET: &str = "runs";

pub struct SnapshotScheduler {
    config: Arc<Config>,
    snapshot_manager: Arc<SnapshotManager>,
    tracker: OperationTracker,
    scheduler: JobScheduler,
}

impl SnapshotScheduler {
    pub async fn new(
        config: Arc<Config>,
        snapshot_manager: Arc<SnapshotManager>,
        tracker: OperationTracker,
    ) -> Result<Self> {
        let scheduler = JobScheduler::new().await
            .map_err(|e| anyhow!("Failed to create JobScheduler: {}", e))?;

        Ok(Self {
            config,
            snapshot_manager,
            tracker,
            scheduler,
        })
    }

    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<usize> {
        info!("Starting snapshot scheduler with 6-field cron format (sec min hour day month dow)");
        let mut scheduled_count = 0;

        for network in self.config.enabled_networks() {
            match &network.snapshot_schedule {
                Some(schedule) => {
                    info!("Attempting to schedule snapshots for {}: '{}'", network.name, schedule);
                    match self.schedule_snapshot_job(network.clone(), schedule.clone()).await {
                        Ok(_) => {
                            scheduled_count += 1;
                            info!("✓ Scheduled snapshots for {}: {}", network.name, schedule);
                        }
                        Err(e) => {
                            error!("✗ Failed to schedule snapshots for {}: {} (schedule: {})", network.name, e, schedule);
                        }
                    }
                }
                None => info!("No snapshot schedule configured for {}", network.name),
            }
        }

        let cleanup_schedule = self.config.cleanup_schedule().to_string();
        match self.schedule_cleanup_job(cleanup_schedule.clone()).await {
            Ok(_) => {
                scheduled_count += 1;
                info!("✓ Scheduled cleanup: {}", cleanup_schedule);
            }
            Err(e) => error!("✗ Failed to schedule cleanup: {} (schedule: {})", e, cleanup_schedule),
        }

        if scheduled_count > 0 {
            self.scheduler.start().await
                .map_err(|e| anyhow!("Failed to start scheduler: {}", e))?;
            info!("✓ Snapshot scheduler started successfully with {} jobs", scheduled_count);
        } else {
            warn!("No scheduled jobs configured - scheduler not started");
        }

        Ok(scheduled_count)
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.scheduler.shutdown().await
            .map_err(|e| anyhow!("Failed to stop scheduler: {}", e))
    }

    async fn schedule_snapshot_job(&self, network: NetworkConfig, schedule: String) -> Result<()> {
        validate_6_field_cron(&schedule)
            .map_err(|e| anyhow!("Invalid 6-field cron schedule '{}': {}", schedule, e))?;

        let snapshot_manager = self.snapshot_manager.clone();
        let tracker = self.tracker.clone();

        let job = Job::new_async(schedule.as_str(), move |_uuid, _scheduler| {
            let snapshot_manager = snapshot_manager.clone();
            let tracker = tracker.clone();
            let network = network.clone();

            Box::pin(async move {
                info!("📸 Executing scheduled snapshot for {}", network.name);
                match run_scheduled_snapshot(&snapshot_manager, &tracker, &network).await {
                    Ok(report) if report.is_success() => {
                        info!("✓ Scheduled snapshot {} completed", report.snapshot_id);
                    }
                    Ok(report) => {
                        warn!(
                            "Scheduled snapshot {} finished with {} failed units",
                            report.snapshot_id,
                            report.count(UnitOutcome::Failed)
                        );
                    }
                    Err(e) => error!("✗ Scheduled snapshot failed for {}: {}", network.name, e),
                }
            })
        })
        .map_err(|e| anyhow!("Failed to create snapshot job for '{}': {}", schedule, e))?;

        self.scheduler.add(job).await
            .map_err(|e| anyhow!("Failed to add snapshot job to scheduler: {}", e))?;

        Ok(())
    }

    async fn schedule_cleanup_job(&self, schedule: String) -> Result<()> {
        validate_6_field_cron(&schedule)
            .map_err(|e| anyhow!("Invalid 6-field cron schedule '{}': {}", schedule, e))?;

        let snapshot_manager = self.snapshot_manager.clone();
        let tracker = self.tracker.clone();
        let cleanup_config = self.config.cleanup.to_cleanup_config();

        let job = Job::new_async(schedule.as_str(), move |_uuid, _scheduler| {
            let snapshot_manager = snapshot_manager.clone();
            let tracker = tracker.clone();
            let cleanup_config = cleanup_config.clone();

            Box::pin(async move {
                info!("🧹 Executing scheduled cleanup");
                if let Err(e) = run_scheduled_cleanup(&snapshot_manager, &tracker, cleanup_config).await {
                    error!("✗ Scheduled cleanup failed: {}", e);
                }
            })
        })
        .map_err(|e| anyhow!("Failed to create cleanup job for '{}': {}", schedule, e))?;

        self.scheduler.add(job).await
            .map_err(|e| anyhow!("Failed to add cleanup job to scheduler: {}", e))?;

        Ok(())
    }
}

/// Identifier of the snapshot a scheduled run writes into, one per network per day
pub fn scheduled_snapshot_id(network: &str) -> String {
    format!("{}-{}", network, Utc::now().format("%Y-%m-%d"))
}

/// One scheduled snapshot of a network, followed by a squash when its chains grew too long
pub async fn run_scheduled_snapshot(
    manager: &SnapshotManager,
    tracker: &OperationTracker,
    network: &NetworkConfig,
) -> Result<SnapshotReport> {
    let guard = tracker.try_start_operation(&network.name, OperationKind::Snapshot)?;
    let snapshot_id = scheduled_snapshot_id(&network.name);
    let networks = vec![network.name.clone()];

    let report = manager
        .create_snapshot(&snapshot_id, Some(networks.as_slice()), network.incremental, guard.token())
        .await?;

    if let Some(limit) = network.squash_after {
        let produced = report.count(UnitOutcome::Base) + report.count(UnitOutcome::Incremental);
        if produced > 0 {
            match manager
                .squash_snapshot(&snapshot_id, Some(&network.name), limit, guard.token())
                .await
            {
                Ok(squash) => info!(
                    "Squashed {} units of {} (limit {} incrementals)",
                    squash.count(UnitOutcome::Squashed),
                    snapshot_id,
                    limit
                ),
                Err(e) => warn!("Squash after snapshot {} failed: {}", snapshot_id, e),
            }
        }
    }

    Ok(report)
}

/// One retention sweep, run on the blocking pool
pub async fn run_scheduled_cleanup(
    manager: &SnapshotManager,
    tracker: &OperationTracker,
    config: CleanupConfig,
) -> Result<CleanupResult> {
    let _guard = tracker.try_start_operation(CLEANUP_TARGET, OperationKind::Cleanup)?;
    let manager = manager.clone();
    let result = tokio::task::spawn_blocking(move || manager.cleanup(&config))
        .await
        .map_err(|e| anyhow!("Cleanup task failed: {}", e))?;

    for err in &result.errors {
        warn!("Cleanup: {}", err);
    }
    info!("✓ Cleanup freed {}", format_bytes(result.total_bytes_freed()));
    Ok(result)
}

pub fn validate_6_field_cron(schedule: &str) -> Result<()> {
    let parts: Vec<&str> = schedule.split_whitespace().collect();

    if parts.len() != 6 {
        return Err(anyhow!("tokio-cron-scheduler requires exactly 6 fields: second minute hour day month dayofweek. Got {} fields: '{}'", parts.len(), schedule));
    }

    validate_cron_field(parts[0], "second", 0, 59)?;
    validate_cron_field(parts[1], "minute", 0, 59)?;
    validate_cron_field(parts[2], "hour", 0, 23)?;
    validate_cron_field(parts[3], "day", 1, 31)?;
    validate_cron_field(parts[4], "month", 1, 12)?;
    validate_cron_field(parts[5], "dayofweek", 0, 7)?;

    Ok(())
}

fn validate_cron_field(field: &str, name: &str, min: u32, max: u32) -> Result<()> {
    if field == "*" || field == "?" {
        return Ok(());
    }

    if let Some((start, end)) = field.split_once('-') {
        let start = start.parse::<u32>()
            .map_err(|_| anyhow!("Invalid {} range start: {}", name, start))?;
        let end = end.parse::<u32>()
            .map_err(|_| anyhow!("Invalid {} range end: {}", name, end))?;

        if start < min || start > max || end < min || end > max {
            return Err(anyhow!("{} range {}-{} is outside valid range {}-{}", name, start, end, min, max));
        }
        return Ok(());
    }

    if field.contains(',') {
        for part in field.split(',') {
            let value = part.parse::<u32>()
                .map_err(|_| anyhow!("Invalid {} value in list: {}", name, part))?;
            if value < min || value > max {
                return Err(anyhow!("{} value {} is outside valid range {}-{}", name, value, min, max));
            }
        }
        return Ok(());
    }

    if let Some(step_str) = field.strip_prefix("*/") {
        let step = step_str.parse::<u32>()
            .map_err(|_| anyhow!("Invalid {} step value: {}", name, step_str))?;
        if step == 0 {
            return Err(anyhow!("{} step value cannot be 0", name));
        }
        return Ok(());
    }

    let value = field.parse::<u32>()
        .map_err(|_| anyhow!("Invalid {} value: {}", name, field))?;

    if value < min || value > max {
        return Err(anyhow!("{} value {} is outside valid range {}-{}", name, value, min, max));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("0 0 3 * * *" ; "daily")]
    #[test_case("0 */15 * * * *" ; "every fifteen minutes")]
    #[test_case("0 30 2 * * 1-5" ; "weekdays")]
    #[test_case("0 0 0,12 * * *" ; "twice a day")]
    fn test_valid_schedules(schedule: &str) {
        assert!(validate_6_field_cron(schedule).is_ok());
    }

    #[test_case("0 3 * * *" ; "five fields")]
    #[test_case("0 0 24 * * *" ; "hour out of range")]
    #[test_case("0 */0 * * * *" ; "zero step")]
    #[test_case("0 0 1-40 * * *" ; "range out of bounds")]
    #[test_case("x 0 0 * * *" ; "not a number")]
    fn test_invalid_schedules(schedule: &str) {
        assert!(validate_6_field_cron(schedule).is_err());
    }

    #[test]
    fn test_scheduled_snapshot_id_is_per_day() {
        let id = scheduled_snapshot_id("mainnet");
        assert!(id.starts_with("mainnet-"));
        assert_eq!(id.len(), "mainnet-".len() + "YYYY-MM-DD".len());
    }
}
