//! Builds a base directory with a runs tree of real databases

use snapshot_manager::db::FileStore;
use snapshot_manager::snapshot::{EngineConfig, SnapshotManager};
use snapshot_manager::FileStoreEngine;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub type Entries = Vec<(Vec<u8>, Vec<u8>)>;

/// Temporary base directory laid out like a node runner host
pub struct TestLayout {
    temp_dir: TempDir,
}

impl TestLayout {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn base(&self) -> &Path {
        self.temp_dir.path()
    }

    /// `runs/<network>/current`
    pub fn run_dir(&self, network: &str) -> PathBuf {
        self.base().join("runs").join(network).join("current")
    }

    /// Path of a node's main database
    pub fn main_db(&self, network: &str, node: &str, chain: &str) -> PathBuf {
        self.run_dir(network).join(node).join("db").join(chain).join("db")
    }

    /// Path of a node's chain data database
    pub fn chain_data_db(&self, network: &str, node: &str, chain_data_id: &str) -> PathBuf {
        self.run_dir(network)
            .join(node)
            .join("chainData")
            .join("network-1")
            .join(chain_data_id)
            .join("db")
            .join("pebble")
    }

    /// Create a main database holding `entries`
    pub fn add_main_db(&self, network: &str, node: &str, chain: &str, entries: &Entries) -> PathBuf {
        let path = self.main_db(network, node, chain);
        write_entries(&path, entries);
        path
    }

    pub fn add_chain_data_db(&self, network: &str, node: &str, chain_data_id: &str, entries: &Entries) -> PathBuf {
        let path = self.chain_data_db(network, node, chain_data_id);
        write_entries(&path, entries);
        path
    }

    pub fn snapshot_dir(&self, snapshot_id: &str) -> PathBuf {
        self.base().join("snapshots").join(snapshot_id)
    }

    /// `snapshots/<id>/<network>/<unit>`
    pub fn unit_dir(&self, snapshot_id: &str, label: &str) -> PathBuf {
        self.snapshot_dir(snapshot_id).join(label)
    }

    pub fn manager(&self) -> SnapshotManager {
        self.manager_with(|config| config)
    }

    pub fn manager_with<F>(&self, f: F) -> SnapshotManager
    where
        F: FnOnce(EngineConfig) -> EngineConfig,
    {
        let config = f(EngineConfig::new(self.base()));
        SnapshotManager::new(config, Arc::new(FileStoreEngine))
    }
}

/// Put every pair into the database at `path`, creating it if needed
pub fn write_entries(path: &Path, entries: &Entries) {
    let mut store = FileStore::open(path).expect("Failed to open store");
    for (key, value) in entries {
        store.put(key, value).expect("Failed to put");
    }
    store.flush().expect("Failed to flush");
}

pub fn delete_keys(path: &Path, keys: &[&[u8]]) {
    let mut store = FileStore::open(path).expect("Failed to open store");
    for key in keys {
        store.delete(key).expect("Failed to delete");
    }
    store.flush().expect("Failed to flush");
}

/// Live contents of the database at `path`, sorted by key
pub fn read_entries(path: &Path) -> Entries {
    let store = FileStore::open(path).expect("Failed to open store");
    store.items()
}

pub fn db_version(path: &Path) -> u64 {
    FileStore::open(path).expect("Failed to open store").version()
}

pub fn chunk_files(unit_dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(unit_dir.join("chunks"))
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
