// File: manager/src/retention.rs

//! Retention sweeps over the runs tree
//!
//! Three sweeps, each tallying what it removes: oversized or old runner logs,
//! old `.backup.*` run directories, and superseded runner sessions. Stale
//! sessions are picked before anything is deleted, since removing a log bumps
//! its session's mtime; their logs are freed with the session, not by the log
//! sweep. A dry run therefore reports the same numbers a real run produces.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Local;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::constants::layout::RUNS_DIR;
use crate::constants::retention::{
    BACKUP_MARKER, MAX_BACKUP_AGE, MAX_LOG_AGE, MAX_LOG_SIZE, MAX_STALE_RUN_AGE, NETWORK_TYPES,
    SERVER_DIR, SERVER_LOG_NAME, TRUNCATE_LINE_SCAN,
};
use crate::errors::{IoContext, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupConfig {
    pub max_log_size: u64,
    pub max_log_age: Duration,
    pub max_backup_age: Duration,
    pub max_stale_run_age: Duration,
    pub dry_run: bool,
    pub verbose: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            max_log_size: MAX_LOG_SIZE,
            max_log_age: MAX_LOG_AGE,
            max_backup_age: MAX_BACKUP_AGE,
            max_stale_run_age: MAX_STALE_RUN_AGE,
            dry_run: false,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupResult {
    pub logs_deleted: usize,
    pub log_bytes_freed: u64,
    pub backups_deleted: usize,
    pub backup_bytes_freed: u64,
    pub stale_runs_deleted: usize,
    pub stale_run_bytes_freed: u64,
    pub errors: Vec<String>,
}

impl CleanupResult {
    pub fn total_bytes_freed(&self) -> u64 {
        self.log_bytes_freed + self.backup_bytes_freed + self.stale_run_bytes_freed
    }
}

/// Run all three sweeps under `base_dir`
pub fn cleanup(base_dir: &Path, config: &CleanupConfig) -> CleanupResult {
    let mut result = CleanupResult::default();
    let runs = base_dir.join(RUNS_DIR);

    let stale = stale_runs(&runs, config);
    sweep_logs(&runs, &stale, config, &mut result);
    sweep_backups(&runs, config, &mut result);
    sweep_stale_runs(&stale, config, &mut result);

    info!(
        "Cleanup {}: {} logs, {} backups, {} stale runs, {} freed, {} errors",
        if config.dry_run { "(dry run)" } else { "finished" },
        result.logs_deleted,
        result.backups_deleted,
        result.stale_runs_deleted,
        format_bytes(result.total_bytes_freed()),
        result.errors.len()
    );
    result
}

fn age_of(modified: SystemTime) -> Duration {
    SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO)
}

fn report(config: &CleanupConfig, kind: &str, path: &Path, reason: &str) {
    if config.verbose {
        info!("{}: {} ({})", kind, path.display(), reason);
    } else {
        debug!("{}: {} ({})", kind, path.display(), reason);
    }
}

/// Remove `path` unless this is a dry run; returns whether it counts as deleted
fn remove(config: &CleanupConfig, path: &Path, is_dir: bool, result: &mut CleanupResult) -> bool {
    if config.dry_run {
        return true;
    }
    let removed = if is_dir {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match removed {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to remove {}: {}", path.display(), e);
            result
                .errors
                .push(format!("failed to remove {}: {}", path.display(), e));
            false
        }
    }
}

fn sweep_logs(runs: &Path, stale: &[StaleRun], config: &CleanupConfig, result: &mut CleanupResult) {
    let server = runs.join(SERVER_DIR);
    if !server.exists() {
        return;
    }

    let pattern = format!(
        "{}/**/{}",
        glob::Pattern::escape(&server.to_string_lossy()),
        SERVER_LOG_NAME
    );
    let paths = match glob::glob(&pattern) {
        Ok(paths) => paths,
        Err(e) => {
            result.errors.push(format!("invalid log pattern {}: {}", pattern, e));
            return;
        }
    };

    for path in paths.filter_map(|p| p.ok()) {
        if stale.iter().any(|run| path.starts_with(&run.path)) {
            continue;
        }
        let metadata = match fs::metadata(&path) {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        let size = metadata.len();
        let age = metadata.modified().map(age_of).unwrap_or(Duration::ZERO);

        let reason = if age > config.max_log_age {
            format!("age {}h > {}h", age.as_secs() / 3600, config.max_log_age.as_secs() / 3600)
        } else if size > config.max_log_size {
            format!("size {} > {}", size, config.max_log_size)
        } else {
            continue;
        };

        report(config, "Log", &path, &reason);
        if remove(config, &path, false, result) {
            result.logs_deleted += 1;
            result.log_bytes_freed += size;
        }
    }
}

fn sweep_backups(runs: &Path, config: &CleanupConfig, result: &mut CleanupResult) {
    let entries = match fs::read_dir(runs) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            result
                .errors
                .push(format!("failed to read {}: {}", runs.display(), e));
            return;
        }
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.contains(BACKUP_MARKER) {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(m) if m.is_dir() => m,
            _ => continue,
        };
        let age = metadata.modified().map(age_of).unwrap_or(Duration::ZERO);
        if age <= config.max_backup_age {
            continue;
        }

        let path = entry.path();
        let size = dir_size(&path);
        report(config, "Backup", &path, &format!("age {}h", age.as_secs() / 3600));
        if remove(config, &path, true, result) {
            result.backups_deleted += 1;
            result.backup_bytes_freed += size;
        }
    }
}

struct StaleRun {
    path: PathBuf,
    age: Duration,
}

/// Sessions older than `max_stale_run_age`, never the newest of a network type
fn stale_runs(runs: &Path, config: &CleanupConfig) -> Vec<StaleRun> {
    let mut stale = Vec::new();
    for network_type in NETWORK_TYPES {
        let dir = runs.join(SERVER_DIR).join(network_type);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };

        let mut sessions: Vec<(SystemTime, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let metadata = e.metadata().ok()?;
                if !metadata.is_dir() {
                    return None;
                }
                Some((metadata.modified().ok()?, e.path()))
            })
            .collect();
        sessions.sort();

        // The newest session belongs to the running server
        sessions.pop();

        stale.extend(
            sessions
                .into_iter()
                .map(|(modified, path)| StaleRun { path, age: age_of(modified) })
                .filter(|run| run.age > config.max_stale_run_age),
        );
    }
    stale
}

fn sweep_stale_runs(stale: &[StaleRun], config: &CleanupConfig, result: &mut CleanupResult) {
    for run in stale {
        let size = dir_size(&run.path);
        report(config, "Stale run", &run.path, &format!("age {}h", run.age.as_secs() / 3600));
        if remove(config, &run.path, true, result) {
            result.stale_runs_deleted += 1;
            result.stale_run_bytes_freed += size;
        }
    }
}

/// Rename `path` to `<path>.<YYYYmmdd-HHMMSS>` once it grows past `max_size`
pub fn rotate_log(path: &Path, max_size: u64) -> Result<Option<PathBuf>> {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return Ok(None),
    };
    if metadata.len() <= max_size {
        return Ok(None);
    }

    let rotated = PathBuf::from(format!(
        "{}.{}",
        path.display(),
        Local::now().format("%Y%m%d-%H%M%S")
    ));
    fs::rename(path, &rotated).with_path(path)?;
    info!("Rotated {} to {}", path.display(), rotated.display());
    Ok(Some(rotated))
}

/// Keep only the last `keep_bytes` of `path`, starting at a line boundary when one is close
pub fn truncate_log(path: &Path, keep_bytes: u64) -> Result<()> {
    let size = match fs::metadata(path) {
        Ok(m) => m.len(),
        Err(_) => return Ok(()),
    };
    if size <= keep_bytes {
        return Ok(());
    }

    let mut tail = Vec::with_capacity(keep_bytes as usize);
    {
        let mut file = fs::File::open(path).with_path(path)?;
        file.seek(SeekFrom::Start(size - keep_bytes)).with_path(path)?;
        file.read_to_end(&mut tail).with_path(path)?;
    }

    let scan = tail.len().min(TRUNCATE_LINE_SCAN);
    let start = tail[..scan]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(0, |i| i + 1);

    fs::write(path, &tail[start..]).with_path(path)?;
    Ok(())
}

/// Total size of the regular files under `path`; symlinks are not followed
pub fn dir_size(path: &Path) -> u64 {
    let metadata = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(_) => return 0,
    };
    if !metadata.is_dir() {
        return if metadata.is_file() { metadata.len() } else { 0 };
    }
    match fs::read_dir(path) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| dir_size(&e.path()))
            .sum(),
        Err(_) => 0,
    }
}

/// Human-readable size with one decimal: `512 B`, `1.5 KB`, `1.0 MB`
pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let suffix = ['K', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1} {}B", bytes as f64 / div as f64, suffix)
}
