// File: manager/src/snapshot/manager.rs
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::constants::chunking::{CHUNK_SIZE, COMPRESSION_LEVEL};
use crate::constants::defaults::MAX_PARALLEL_UNITS;
use crate::constants::layout::{CHUNKS_DIR, NODE_DB_DIR, RUNS_DIR, RUN_PREFIX, SCRATCH_PREFIX, SNAPSHOTS_DIR};
use crate::db::DatabaseEngine;
use crate::errors::{IoContext, Result, SnapshotError};
use crate::retention::{self, dir_size, CleanupConfig, CleanupResult};
use crate::snapshot::builder::{create_base_snapshot, create_incremental_snapshot, PipelineOptions};
use crate::snapshot::chunk::verify_part;
use crate::snapshot::discovery::{discover_units, resolve_run_dir, SnapshotUnit};
use crate::snapshot::manifest::{
    chunks_dir, load_manifest, manifest_path, snapshot_dir, unit_dir, SnapshotEntry, SnapshotManifest,
};
use crate::snapshot::restore::{self, RestoreStats, SquashOutcome};

/// Engine settings, passed explicitly to [`SnapshotManager::new`]
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub base_dir: PathBuf,
    pub chunk_size: u64,
    pub compression_level: i32,
    /// 0 runs every unit at once
    pub max_parallel_units: usize,
}

impl EngineConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            chunk_size: CHUNK_SIZE,
            compression_level: COMPRESSION_LEVEL,
            max_parallel_units: MAX_PARALLEL_UNITS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitOutcome {
    Base,
    Incremental,
    Restored,
    Squashed,
    Verified,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub unit: String,
    pub outcome: UnitOutcome,
    pub parts: usize,
    pub bytes: u64,
    pub version: u64,
    pub error: Option<String>,
}

impl UnitReport {
    fn new(unit: &str, outcome: UnitOutcome) -> Self {
        Self {
            unit: unit.to_string(),
            outcome,
            parts: 0,
            bytes: 0,
            version: 0,
            error: None,
        }
    }

    fn from_entry(unit: &str, outcome: UnitOutcome, entry: &SnapshotEntry) -> Self {
        Self {
            parts: entry.parts.len(),
            bytes: entry.total_bytes(),
            version: entry.version,
            ..Self::new(unit, outcome)
        }
    }

    fn skipped(unit: &str, reason: impl ToString) -> Self {
        Self {
            error: Some(reason.to_string()),
            ..Self::new(unit, UnitOutcome::Skipped)
        }
    }

    fn failed(unit: &str, err: impl ToString) -> Self {
        Self {
            error: Some(err.to_string()),
            ..Self::new(unit, UnitOutcome::Failed)
        }
    }
}

/// Per-unit outcomes of one fleet-wide operation
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotReport {
    pub operation: String,
    pub snapshot_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub units: Vec<UnitReport>,
}

impl SnapshotReport {
    pub fn count(&self, outcome: UnitOutcome) -> usize {
        self.units.iter().filter(|u| u.outcome == outcome).count()
    }

    pub fn is_success(&self) -> bool {
        self.count(UnitOutcome::Failed) == 0
    }

    pub fn unit(&self, label: &str) -> Option<&UnitReport> {
        self.units.iter().find(|u| u.unit == label)
    }

    pub fn total_bytes(&self) -> u64 {
        self.units.iter().map(|u| u.bytes).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub size: u64,
    pub incremental: bool,
    pub path: PathBuf,
    pub created: DateTime<Utc>,
    pub units: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GcReport {
    pub files_removed: usize,
    pub dirs_removed: usize,
    pub bytes_freed: u64,
    pub errors: Vec<String>,
}

/// A unit directory inside a stored snapshot
#[derive(Debug, Clone)]
pub struct StoredUnit {
    pub network: String,
    pub name: String,
    pub dir: PathBuf,
}

impl StoredUnit {
    pub fn label(&self) -> String {
        format!("{}/{}", self.network, self.name)
    }

    pub fn has_manifest(&self) -> bool {
        manifest_path(&self.dir).exists()
    }
}

#[derive(Clone)]
pub struct SnapshotManager {
    config: Arc<EngineConfig>,
    engine: Arc<dyn DatabaseEngine>,
}

impl SnapshotManager {
    pub fn new(config: EngineConfig, engine: Arc<dyn DatabaseEngine>) -> Self {
        Self {
            config: Arc::new(config),
            engine,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn pipeline_options(&self, cancel: &CancellationToken) -> PipelineOptions {
        PipelineOptions {
            chunk_size: self.config.chunk_size,
            compression_level: self.config.compression_level,
            cancel: cancel.clone(),
        }
    }

    /// Snapshot every discovered unit into `snapshot_id`
    ///
    /// Unit failures never fail the call; they are reported per unit.
    #[instrument(skip(self, networks, cancel))]
    pub async fn create_snapshot(
        &self,
        snapshot_id: &str,
        networks: Option<&[String]>,
        incremental: bool,
        cancel: CancellationToken,
    ) -> Result<SnapshotReport> {
        validate_snapshot_id(snapshot_id)?;
        let started_at = Utc::now();
        let units = discover_units(&self.config.base_dir, networks)?;

        info!(
            "Creating snapshot {} for {} units (incremental: {})",
            snapshot_id,
            units.len(),
            incremental
        );

        let id = snapshot_id.to_string();
        let jobs = units.into_iter().map(|unit| (unit.label(), unit)).collect();
        let reports = self
            .run_units("snapshot", jobs, move |manager: &SnapshotManager, unit: SnapshotUnit| {
                manager.snapshot_unit(&id, &unit, incremental, &cancel)
            })
            .await;

        let report = self.finish_report("create", snapshot_id, started_at, reports);
        info!(
            "Snapshot {} finished: {} base, {} incremental, {} skipped, {} failed",
            snapshot_id,
            report.count(UnitOutcome::Base),
            report.count(UnitOutcome::Incremental),
            report.count(UnitOutcome::Skipped),
            report.count(UnitOutcome::Failed)
        );
        Ok(report)
    }

    fn snapshot_unit(
        &self,
        snapshot_id: &str,
        unit: &SnapshotUnit,
        incremental: bool,
        cancel: &CancellationToken,
    ) -> UnitReport {
        let label = unit.label();
        let options = self.pipeline_options(cancel);

        let mut db = match self.engine.open(&unit.db_path) {
            Ok(db) => db,
            Err(e) => {
                let err = SnapshotError::from(e);
                if err.is_skippable() {
                    warn!("Skipping {} ({}): {}", label, unit.db_path.display(), err);
                    return UnitReport::skipped(&label, err);
                }
                error!("Failed to open {} ({}): {}", label, unit.db_path.display(), err);
                return UnitReport::failed(&label, err);
            }
        };

        let dir = unit_dir(&self.config.base_dir, snapshot_id, &unit.network, &unit.dir_name());

        if incremental {
            match self.find_parent(snapshot_id, unit) {
                Some((parent_dir, parent)) => {
                    match create_incremental_snapshot(unit, db.as_mut(), &parent, &parent_dir, &dir, &options) {
                        Ok(manifest) => {
                            if let Some(entry) = manifest.incrementals.last() {
                                return UnitReport::from_entry(&label, UnitOutcome::Incremental, entry);
                            }
                        }
                        Err(SnapshotError::Cancelled) => {
                            warn!("Snapshot of {} cancelled", label);
                            return UnitReport::failed(&label, SnapshotError::Cancelled);
                        }
                        Err(e) => {
                            warn!("Incremental snapshot of {} failed, falling back to base: {}", label, e);
                        }
                    }
                }
                None => debug!("No parent snapshot for {}, taking a base", label),
            }
        }

        match create_base_snapshot(unit, db.as_mut(), &dir, &options) {
            Ok(manifest) => UnitReport::from_entry(&label, UnitOutcome::Base, &manifest.base),
            Err(e) => {
                error!("Base snapshot of {} failed: {}", label, e);
                UnitReport::failed(&label, e)
            }
        }
    }

    /// The unit's own manifest in `snapshot_id`, else the newest one in any other snapshot
    fn find_parent(&self, snapshot_id: &str, unit: &SnapshotUnit) -> Option<(PathBuf, SnapshotManifest)> {
        let name = unit.dir_name();
        let own = unit_dir(&self.config.base_dir, snapshot_id, &unit.network, &name);
        match load_manifest(&manifest_path(&own)) {
            Ok(manifest) => return Some((own, manifest)),
            Err(SnapshotError::NotFound(_)) => {}
            Err(e) => warn!("Ignoring unreadable manifest of {}: {}", unit.label(), e),
        }

        let entries = fs::read_dir(self.config.base_dir.join(SNAPSHOTS_DIR)).ok()?;
        entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|id| id != snapshot_id && !id.starts_with('.'))
            .filter_map(|id| {
                let dir = unit_dir(&self.config.base_dir, &id, &unit.network, &name);
                load_manifest(&manifest_path(&dir)).ok().map(|m| (dir, m))
            })
            .max_by_key(|(_, manifest)| manifest.latest_created_at())
    }

    /// Restore every unit of `snapshot_id` into the current run of its network
    #[instrument(skip(self, cancel))]
    pub async fn restore_snapshot(
        &self,
        snapshot_id: &str,
        network: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<SnapshotReport> {
        let started_at = Utc::now();
        let units = self.manifest_units(snapshot_id, network)?;
        info!("Restoring {} units from snapshot {}", units.len(), snapshot_id);

        let jobs = units.into_iter().map(|unit| (unit.label(), unit)).collect();
        let reports = self
            .run_units("restore", jobs, move |manager: &SnapshotManager, unit: StoredUnit| {
                let label = unit.label();
                match manager.restore_stored(&unit, None, &cancel) {
                    Ok(stats) => UnitReport {
                        parts: stats.parts,
                        bytes: stats.bytes,
                        version: stats.version,
                        ..UnitReport::new(&label, UnitOutcome::Restored)
                    },
                    Err(e) => {
                        error!("Restore of {} failed: {}", label, e);
                        UnitReport::failed(&label, e)
                    }
                }
            })
            .await;

        Ok(self.finish_report("restore", snapshot_id, started_at, reports))
    }

    /// Restore one unit; `target` overrides the recorded location
    #[instrument(skip(self, cancel))]
    pub async fn restore_unit(
        &self,
        snapshot_id: &str,
        network: &str,
        unit: &str,
        target: Option<PathBuf>,
        cancel: CancellationToken,
    ) -> Result<RestoreStats> {
        let stored = self.stored_unit(snapshot_id, network, unit)?;
        let manager = self.clone();
        tokio::task::spawn_blocking(move || manager.restore_stored(&stored, target.as_deref(), &cancel))
            .await
            .map_err(|e| SnapshotError::Task(e.to_string()))?
    }

    fn restore_stored(
        &self,
        unit: &StoredUnit,
        target: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<RestoreStats> {
        let manifest = load_manifest(&manifest_path(&unit.dir))?;
        let target = match target {
            Some(path) => path.to_path_buf(),
            None => self.restore_target(&manifest, &unit.label())?,
        };
        restore::restore_unit(
            self.engine.as_ref(),
            &manifest,
            &unit.dir,
            &target,
            &unit.label(),
            cancel,
        )
    }

    /// Where a manifest's database lives in the network's current run
    fn restore_target(&self, manifest: &SnapshotManifest, label: &str) -> Result<PathBuf> {
        let relpath = match (&manifest.db_relpath, &manifest.node_id, &manifest.chain_id) {
            (Some(rel), _, _) => PathBuf::from(rel),
            (None, Some(node), Some(chain)) => Path::new(node).join(NODE_DB_DIR).join(chain).join(NODE_DB_DIR),
            _ => return Err(SnapshotError::NotFound(format!("restore target for {}", label))),
        };
        if relpath
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(SnapshotError::Manifest {
                path: PathBuf::from(label),
                reason: format!("database path '{}' escapes the run directory", relpath.display()),
            });
        }

        let network_dir = self.config.base_dir.join(RUNS_DIR).join(&manifest.network);
        let run_dir = match resolve_run_dir(&network_dir) {
            Some(dir) => dir,
            None => {
                let dir = network_dir.join(format!("{}{}", RUN_PREFIX, Utc::now().format("%Y%m%d_%H%M%S")));
                fs::create_dir_all(&dir).with_path(&dir)?;
                info!("No run for network {}, restoring into {}", manifest.network, dir.display());
                dir
            }
        };
        Ok(run_dir.join(relpath))
    }

    /// Squash one unit's chain into a new base
    #[instrument(skip(self, cancel))]
    pub async fn squash(
        &self,
        snapshot_id: &str,
        network: &str,
        unit: &str,
        cancel: CancellationToken,
    ) -> Result<SquashOutcome> {
        let stored = self.stored_unit(snapshot_id, network, unit)?;
        let manager = self.clone();
        let options = self.pipeline_options(&cancel);
        tokio::task::spawn_blocking(move || restore::squash(manager.engine.as_ref(), &stored.dir, &options))
            .await
            .map_err(|e| SnapshotError::Task(e.to_string()))?
    }

    /// Squash every unit whose chain holds more than `min_incrementals` incrementals
    #[instrument(skip(self, cancel))]
    pub async fn squash_snapshot(
        &self,
        snapshot_id: &str,
        network: Option<&str>,
        min_incrementals: usize,
        cancel: CancellationToken,
    ) -> Result<SnapshotReport> {
        let started_at = Utc::now();
        let units = self.manifest_units(snapshot_id, network)?;

        let jobs = units.into_iter().map(|unit| (unit.label(), unit)).collect();
        let reports = self
            .run_units("squash", jobs, move |manager: &SnapshotManager, unit: StoredUnit| {
                let label = unit.label();
                let chain = match load_manifest(&manifest_path(&unit.dir)) {
                    Ok(manifest) => manifest.incrementals.len(),
                    Err(e) => return UnitReport::failed(&label, e),
                };
                if chain == 0 || chain <= min_incrementals {
                    return UnitReport::skipped(&label, format!("{} incrementals", chain));
                }

                let options = manager.pipeline_options(&cancel);
                match restore::squash(manager.engine.as_ref(), &unit.dir, &options) {
                    Ok(SquashOutcome::Squashed { base_parts, .. }) => UnitReport {
                        parts: base_parts,
                        ..UnitReport::new(&label, UnitOutcome::Squashed)
                    },
                    Ok(SquashOutcome::AlreadyBase) => UnitReport::skipped(&label, "no incrementals"),
                    Err(e) => {
                        error!("Squash of {} failed: {}", label, e);
                        UnitReport::failed(&label, e)
                    }
                }
            })
            .await;

        Ok(self.finish_report("squash", snapshot_id, started_at, reports))
    }

    /// Re-hash every part of every manifest in `snapshot_id`
    #[instrument(skip(self))]
    pub async fn verify_snapshot(&self, snapshot_id: &str) -> Result<SnapshotReport> {
        let started_at = Utc::now();
        let units = self.manifest_units(snapshot_id, None)?;

        let jobs = units.into_iter().map(|unit| (unit.label(), unit)).collect();
        let reports = self
            .run_units("verify", jobs, |_: &SnapshotManager, unit: StoredUnit| {
                let label = unit.label();
                match verify_stored(&unit) {
                    Ok(manifest) => UnitReport {
                        parts: manifest.all_parts().count(),
                        bytes: manifest.total_bytes(),
                        version: manifest.last_version,
                        ..UnitReport::new(&label, UnitOutcome::Verified)
                    },
                    Err(e) => {
                        warn!("Verification of {} failed: {}", label, e);
                        UnitReport::failed(&label, e)
                    }
                }
            })
            .await;

        Ok(self.finish_report("verify", snapshot_id, started_at, reports))
    }

    /// Every stored snapshot, newest first
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        let root = self.config.base_dir.join(SNAPSHOTS_DIR);
        if !root.exists() {
            return Ok(Vec::new());
        }

        let mut infos = Vec::new();
        for entry in fs::read_dir(&root).with_path(&root)?.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            match self.get_snapshot_info(&name) {
                Ok(info) => infos.push(info),
                Err(e) => warn!("Skipping snapshot {}: {}", name, e),
            }
        }
        infos.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.name.cmp(&b.name)));
        Ok(infos)
    }

    pub fn get_snapshot_info(&self, snapshot_id: &str) -> Result<SnapshotInfo> {
        let units = self.stored_units(snapshot_id)?;
        let path = snapshot_dir(&self.config.base_dir, snapshot_id);

        let manifests: Vec<SnapshotManifest> = units
            .iter()
            .filter_map(|unit| load_manifest(&manifest_path(&unit.dir)).ok())
            .collect();

        let created = manifests
            .iter()
            .map(|m| m.base.created_at)
            .min()
            .or_else(|| {
                fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .ok()
                    .map(DateTime::<Utc>::from)
            })
            .unwrap_or_else(Utc::now);

        Ok(SnapshotInfo {
            name: snapshot_id.to_string(),
            size: dir_size(&path),
            incremental: manifests.iter().any(SnapshotManifest::is_incremental),
            units: manifests.len(),
            created,
            path,
        })
    }

    /// Remove chunk files no manifest references, manifest-less unit dirs and squash leftovers
    #[instrument(skip(self))]
    pub fn collect_garbage(&self, snapshot_id: Option<&str>) -> Result<GcReport> {
        let ids = match snapshot_id {
            Some(id) => vec![id.to_string()],
            None => self.list_snapshots()?.into_iter().map(|info| info.name).collect(),
        };

        let mut report = GcReport::default();
        for id in ids {
            for unit in self.stored_units(&id)? {
                collect_unit_garbage(&unit, &mut report);
            }
        }
        info!(
            "Garbage collection removed {} files and {} directories ({})",
            report.files_removed,
            report.dirs_removed,
            retention::format_bytes(report.bytes_freed)
        );
        Ok(report)
    }

    /// Retention sweep over the runs tree
    pub fn cleanup(&self, config: &CleanupConfig) -> CleanupResult {
        retention::cleanup(&self.config.base_dir, config)
    }

    /// Unit directories of `snapshot_id`, with or without a manifest
    pub fn stored_units(&self, snapshot_id: &str) -> Result<Vec<StoredUnit>> {
        validate_snapshot_id(snapshot_id)?;
        let root = snapshot_dir(&self.config.base_dir, snapshot_id);
        if !root.is_dir() {
            return Err(SnapshotError::NotFound(format!("snapshot '{}'", snapshot_id)));
        }

        let mut units = Vec::new();
        for network in visible_subdirs(&root)? {
            let network_dir = root.join(&network);
            for name in visible_subdirs(&network_dir)? {
                units.push(StoredUnit {
                    dir: network_dir.join(&name),
                    network: network.clone(),
                    name,
                });
            }
        }
        units.sort_by(|a, b| a.label().cmp(&b.label()));
        Ok(units)
    }

    fn stored_unit(&self, snapshot_id: &str, network: &str, unit: &str) -> Result<StoredUnit> {
        self.stored_units(snapshot_id)?
            .into_iter()
            .find(|u| u.network == network && u.name == unit && u.has_manifest())
            .ok_or_else(|| SnapshotError::NotFound(format!("unit {}/{} in snapshot '{}'", network, unit, snapshot_id)))
    }

    fn manifest_units(&self, snapshot_id: &str, network: Option<&str>) -> Result<Vec<StoredUnit>> {
        let units: Vec<StoredUnit> = self
            .stored_units(snapshot_id)?
            .into_iter()
            .filter(|u| network.map_or(true, |n| u.network == n))
            .filter(StoredUnit::has_manifest)
            .collect();
        if units.is_empty() {
            return Err(SnapshotError::NotFound(match network {
                Some(n) => format!("units of network {} in snapshot '{}'", n, snapshot_id),
                None => format!("units in snapshot '{}'", snapshot_id),
            }));
        }
        Ok(units)
    }

    /// One task per job, optionally capped, results gathered over a channel after a join barrier
    async fn run_units<J, F>(&self, operation: &str, jobs: Vec<(String, J)>, work: F) -> Vec<UnitReport>
    where
        J: Send + 'static,
        F: Fn(&SnapshotManager, J) -> UnitReport + Send + Sync + 'static,
    {
        let work = Arc::new(work);
        let (tx, mut rx) = mpsc::channel(jobs.len().max(1));
        let limit = (self.config.max_parallel_units > 0)
            .then(|| Arc::new(Semaphore::new(self.config.max_parallel_units)));

        let mut handles = Vec::with_capacity(jobs.len());
        for (label, job) in jobs {
            let tx = tx.clone();
            let work = Arc::clone(&work);
            let manager = self.clone();
            let limit = limit.clone();

            handles.push(tokio::spawn(async move {
                let _permit = match limit {
                    Some(semaphore) => semaphore.acquire_owned().await.ok(),
                    None => None,
                };
                let report = match tokio::task::spawn_blocking(move || (*work)(&manager, job)).await {
                    Ok(report) => report,
                    Err(e) => UnitReport::failed(&label, format!("task panicked: {}", e)),
                };
                if tx.send(report).await.is_err() {
                    warn!("Result of {} dropped, collector is gone", label);
                }
            }));
        }
        drop(tx);

        for joined in join_all(handles).await {
            if let Err(e) = joined {
                error!("{} task failed to join: {}", operation, e);
            }
        }

        let mut reports = Vec::new();
        while let Some(report) = rx.recv().await {
            reports.push(report);
        }
        reports.sort_by(|a, b| a.unit.cmp(&b.unit));
        reports
    }

    fn finish_report(
        &self,
        operation: &str,
        snapshot_id: &str,
        started_at: DateTime<Utc>,
        units: Vec<UnitReport>,
    ) -> SnapshotReport {
        SnapshotReport {
            operation: operation.to_string(),
            snapshot_id: snapshot_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            units,
        }
    }
}

/// Snapshot identifiers become directory names
pub fn validate_snapshot_id(snapshot_id: &str) -> Result<()> {
    let valid = !snapshot_id.is_empty()
        && !snapshot_id.starts_with('.')
        && !snapshot_id.contains(['/', '\\'])
        && snapshot_id != "..";
    if valid {
        Ok(())
    } else {
        Err(SnapshotError::InvalidName(snapshot_id.to_string()))
    }
}

fn visible_subdirs(dir: &Path) -> Result<Vec<String>> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .with_path(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| !name.starts_with('.'))
        .collect();
    names.sort();
    Ok(names)
}

fn verify_stored(unit: &StoredUnit) -> Result<SnapshotManifest> {
    let manifest = load_manifest(&manifest_path(&unit.dir))?;
    manifest.validate_lineage(&unit.label())?;
    let chunks = chunks_dir(&unit.dir);
    for part in manifest.all_parts() {
        verify_part(&chunks, part)?;
    }
    Ok(manifest)
}

fn remove_counted_dir(path: &Path, report: &mut GcReport) {
    let size = dir_size(path);
    match fs::remove_dir_all(path) {
        Ok(()) => {
            report.dirs_removed += 1;
            report.bytes_freed += size;
        }
        Err(e) => report.errors.push(format!("failed to remove {}: {}", path.display(), e)),
    }
}

fn collect_unit_garbage(unit: &StoredUnit, report: &mut GcReport) {
    if let Ok(entries) = fs::read_dir(&unit.dir) {
        for entry in entries.filter_map(|e| e.ok()) {
            if entry.file_name().to_string_lossy().starts_with(SCRATCH_PREFIX) {
                debug!("Removing squash leftover {}", entry.path().display());
                remove_counted_dir(&entry.path(), report);
            }
        }
    }

    let manifest = match load_manifest(&manifest_path(&unit.dir)) {
        Ok(manifest) => manifest,
        Err(SnapshotError::NotFound(_)) => {
            info!("Removing {} which has no manifest", unit.dir.display());
            remove_counted_dir(&unit.dir, report);
            return;
        }
        Err(e) => {
            report.errors.push(format!("{}: {}", unit.label(), e));
            return;
        }
    };

    let referenced: std::collections::HashSet<&str> = manifest.all_parts().map(|p| p.name.as_str()).collect();
    let chunks = unit.dir.join(CHUNKS_DIR);
    let entries = match fs::read_dir(&chunks) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        if referenced.contains(name.as_str()) {
            continue;
        }
        let path = entry.path();
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed orphan chunk {}", path.display());
                report.files_removed += 1;
                report.bytes_freed += size;
            }
            Err(e) => report.errors.push(format!("failed to remove {}: {}", path.display(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("mainnet-2024-01-01", true)]
    #[case("nightly", true)]
    #[case("", false)]
    #[case("..", false)]
    #[case(".hidden", false)]
    #[case("a/b", false)]
    fn test_validate_snapshot_id(#[case] id: &str, #[case] ok: bool) {
        assert_eq!(validate_snapshot_id(id).is_ok(), ok);
    }

    #[test]
    fn test_report_counts() {
        let report = SnapshotReport {
            operation: "create".into(),
            snapshot_id: "s".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            units: vec![
                UnitReport::new("a", UnitOutcome::Base),
                UnitReport::skipped("b", "locked"),
                UnitReport::new("c", UnitOutcome::Incremental),
            ],
        };
        assert_eq!(report.count(UnitOutcome::Base), 1);
        assert_eq!(report.count(UnitOutcome::Skipped), 1);
        assert!(report.is_success());
        assert_eq!(report.unit("b").and_then(|u| u.error.as_deref()), Some("locked"));
    }
}
