// File: manager/src/snapshot/manifest.rs

//! Per-unit manifest describing a base entry and its incremental chain
//!
//! A manifest is the only place a unit's lineage is recorded. It is written
//! after every part it references is on disk, always through a temp file and
//! a rename, so a reader sees either the old manifest or the new one.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::layout::{CHUNKS_DIR, MANIFEST_FILE, SNAPSHOTS_DIR};
use crate::errors::{IoContext, Result, SnapshotError};

/// One chunk file of a backup stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub name: String,
    pub bytes: u64,
    pub sha256: String,
}

/// One backup stream: the base, or a single incremental on top of it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Upper version bound covered by this entry
    #[serde(default)]
    pub height: u64,
    /// Cursor the entry was taken from; 0 for a base
    #[serde(default)]
    pub since: u64,
    /// Cursor reported by the database once the backup finished
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl SnapshotEntry {
    pub fn new(since: u64, version: u64, parts: Vec<Part>) -> Self {
        Self {
            height: version,
            since,
            version,
            created_at: Utc::now(),
            parts,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.parts.iter().map(|p| p.bytes).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_data_id: Option<String>,
    /// Database path relative to the run directory, used to pick a restore target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_relpath: Option<String>,
    pub base: SnapshotEntry,
    #[serde(default)]
    pub incrementals: Vec<SnapshotEntry>,
    /// Cursor after applying the whole chain
    #[serde(default)]
    pub last_version: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state_root: String,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
}

impl SnapshotManifest {
    pub fn new(network: impl Into<String>, base: SnapshotEntry) -> Self {
        Self {
            network: network.into(),
            node_id: None,
            chain_id: None,
            chain_data_id: None,
            db_relpath: None,
            last_version: base.version,
            base,
            incrementals: Vec::new(),
            state_root: String::new(),
            created_at: Utc::now(),
        }
    }

    /// Base first, then incrementals in the order they must be replayed
    pub fn entries(&self) -> impl Iterator<Item = &SnapshotEntry> {
        std::iter::once(&self.base).chain(self.incrementals.iter())
    }

    pub fn all_parts(&self) -> impl Iterator<Item = &Part> {
        self.entries().flat_map(|entry| entry.parts.iter())
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries().map(SnapshotEntry::total_bytes).sum()
    }

    pub fn is_incremental(&self) -> bool {
        !self.incrementals.is_empty()
    }

    /// Creation time of the newest entry
    pub fn latest_created_at(&self) -> DateTime<Utc> {
        self.entries()
            .map(|entry| entry.created_at)
            .max()
            .unwrap_or(self.created_at)
    }

    /// Append an incremental and advance the cursor
    pub fn push_incremental(&mut self, entry: SnapshotEntry) {
        self.last_version = entry.version;
        self.incrementals.push(entry);
    }

    /// Every incremental must start where the previous entry ended
    ///
    /// Entries written before `version` was recorded carry 0 and are not
    /// checked against their successor.
    pub fn validate_lineage(&self, unit: &str) -> Result<()> {
        if self.base.since != 0 {
            return Err(SnapshotError::CorruptLineage {
                unit: unit.to_string(),
                index: 0,
                expected: 0,
                found: self.base.since,
            });
        }

        let mut previous = self.base.version;
        for (i, entry) in self.incrementals.iter().enumerate() {
            if previous != 0 && entry.since != previous {
                return Err(SnapshotError::CorruptLineage {
                    unit: unit.to_string(),
                    index: i + 1,
                    expected: previous,
                    found: entry.since,
                });
            }
            previous = entry.version;
        }
        Ok(())
    }
}

/// `<base>/snapshots/<id>`
pub fn snapshot_dir(base_dir: &Path, snapshot_id: &str) -> PathBuf {
    base_dir.join(SNAPSHOTS_DIR).join(snapshot_id)
}

/// `<base>/snapshots/<id>/<network>/<unit>`
pub fn unit_dir(base_dir: &Path, snapshot_id: &str, network: &str, unit: &str) -> PathBuf {
    snapshot_dir(base_dir, snapshot_id).join(network).join(unit)
}

pub fn manifest_path(unit_dir: &Path) -> PathBuf {
    unit_dir.join(MANIFEST_FILE)
}

pub fn chunks_dir(unit_dir: &Path) -> PathBuf {
    unit_dir.join(CHUNKS_DIR)
}

pub fn load_manifest(path: &Path) -> Result<SnapshotManifest> {
    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            SnapshotError::NotFound(format!("manifest '{}'", path.display()))
        } else {
            SnapshotError::io(path, e)
        }
    })?;
    serde_json::from_str(&content).map_err(|e| SnapshotError::Manifest {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Write the manifest through a temp file and an atomic rename
pub fn save_manifest(path: &Path, manifest: &SnapshotManifest) -> Result<()> {
    let json = serde_json::to_vec_pretty(manifest).map_err(|e| SnapshotError::Manifest {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_path(parent)?;
    }

    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp).with_path(&tmp)?;
        file.write_all(&json).with_path(&tmp)?;
        file.sync_all().with_path(&tmp)?;
    }
    fs::rename(&tmp, path).with_path(path)?;
    Ok(())
}
