// File: manager/src/snapshot/discovery.rs

//! Finds the databases of every node under the runs tree
//!
//! Layout walked:
//!
//! ```text
//! runs/<network>/<current|run_*>/node<N>/db/<chain>/db                        main database
//! runs/<network>/<current|run_*>/node<N>/chainData/network-<M>/<id>/db/<kind> chain data database
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::constants::layout::{
    CHAIN_DATA_DIR, CHAIN_DATA_NETWORK_PREFIX, CHAIN_DATA_UNIT_PREFIX, CHAIN_ID_PREFIX_LEN,
    CURRENT_RUN, MAIN_UNIT_PREFIX, NODE_DB_DIR, NODE_PREFIX, RUNS_DIR, RUN_PREFIX,
};
use crate::constants::retention::{BACKUP_MARKER, SERVER_DIR};
use crate::errors::{IoContext, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitKind {
    /// The node's own chain database
    Main { chain: String },
    /// Per-chain data database hosted by the node
    ChainData { chain_data_id: String },
}

/// One independently snapshotted database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotUnit {
    pub network: String,
    pub node_id: String,
    pub kind: UnitKind,
    pub db_path: PathBuf,
    /// `db_path` relative to the run directory
    pub relpath: PathBuf,
}

impl SnapshotUnit {
    /// Directory name of this unit inside a snapshot
    pub fn dir_name(&self) -> String {
        match &self.kind {
            UnitKind::Main { .. } => format!("{}{}", MAIN_UNIT_PREFIX, self.node_id),
            UnitKind::ChainData { chain_data_id } => format!(
                "{}{}_{}",
                CHAIN_DATA_UNIT_PREFIX,
                self.node_id,
                chain_data_id.chars().take(CHAIN_ID_PREFIX_LEN).collect::<String>()
            ),
        }
    }

    /// `network/unit`, used in logs and reports
    pub fn label(&self) -> String {
        format!("{}/{}", self.network, self.dir_name())
    }
}

/// The run directory a network is snapshotted from
///
/// `current` (symlink or directory) wins; otherwise the lexically greatest `run_*`.
pub fn resolve_run_dir(network_dir: &Path) -> Option<PathBuf> {
    let current = network_dir.join(CURRENT_RUN);
    if current.is_dir() {
        return Some(current);
    }

    let entries = fs::read_dir(network_dir).ok()?;
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            name.starts_with(RUN_PREFIX).then_some(name)
        })
        .max()
        .map(|name| network_dir.join(name))
}

/// Network directories under `runs/`, skipping runner sessions and backups
pub fn list_networks(base_dir: &Path) -> Result<Vec<String>> {
    let runs = base_dir.join(RUNS_DIR);
    if !runs.exists() {
        return Ok(Vec::new());
    }

    let mut networks: Vec<String> = fs::read_dir(&runs)
        .with_path(&runs)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| name != SERVER_DIR && !name.contains(BACKUP_MARKER))
        .collect();
    networks.sort();
    Ok(networks)
}

/// Every unit of every selected network; `None` selects all networks
pub fn discover_units(base_dir: &Path, networks: Option<&[String]>) -> Result<Vec<SnapshotUnit>> {
    let mut units = Vec::new();
    for network in list_networks(base_dir)? {
        if let Some(selected) = networks {
            if !selected.iter().any(|n| n == &network) {
                continue;
            }
        }

        let network_dir = base_dir.join(RUNS_DIR).join(&network);
        let run_dir = match resolve_run_dir(&network_dir) {
            Some(dir) => dir,
            None => {
                debug!("No run directory for network {}", network);
                continue;
            }
        };

        for node_id in sorted_subdirs(&run_dir, |name| name.starts_with(NODE_PREFIX)) {
            let node_dir = run_dir.join(&node_id);
            units.extend(discover_node(&network, &node_id, &node_dir, &run_dir));
        }
    }

    debug!("Discovered {} snapshot units", units.len());
    Ok(units)
}

fn discover_node(network: &str, node_id: &str, node_dir: &Path, run_dir: &Path) -> Vec<SnapshotUnit> {
    let mut units = Vec::new();
    let unit = |kind: UnitKind, db_path: PathBuf| SnapshotUnit {
        network: network.to_string(),
        node_id: node_id.to_string(),
        relpath: db_path.strip_prefix(run_dir).unwrap_or(&db_path).to_path_buf(),
        kind,
        db_path,
    };

    let db_root = node_dir.join(NODE_DB_DIR);
    let chains = sorted_subdirs(&db_root, |_| true);
    let main = chains
        .into_iter()
        .map(|chain| (db_root.join(&chain).join(NODE_DB_DIR), chain))
        .filter(|(path, _)| path.is_dir())
        .collect::<Vec<_>>();
    if main.len() > 1 {
        warn!(
            "Node {}/{} has {} chain databases, using {}",
            network,
            node_id,
            main.len(),
            main[0].1
        );
    }
    if let Some((path, chain)) = main.into_iter().next() {
        units.push(unit(UnitKind::Main { chain }, path));
    }

    let chain_data = node_dir.join(CHAIN_DATA_DIR);
    for net in sorted_subdirs(&chain_data, |name| name.starts_with(CHAIN_DATA_NETWORK_PREFIX)) {
        let net_dir = chain_data.join(net);
        for chain_data_id in sorted_subdirs(&net_dir, |_| true) {
            let db_dir = net_dir.join(&chain_data_id).join(NODE_DB_DIR);
            if let Some(kind) = sorted_subdirs(&db_dir, |_| true).into_iter().next() {
                units.push(unit(UnitKind::ChainData { chain_data_id }, db_dir.join(kind)));
            }
        }
    }

    units
}

fn sorted_subdirs(dir: &Path, keep: impl Fn(&str) -> bool) -> Vec<String> {
    let mut names: Vec<String> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| keep(name))
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mkdir(path: PathBuf) {
        fs::create_dir_all(path).unwrap();
    }

    #[test]
    fn test_resolve_prefers_current() {
        let dir = TempDir::new().unwrap();
        mkdir(dir.path().join("run_20240101"));
        mkdir(dir.path().join("current"));
        assert_eq!(resolve_run_dir(dir.path()), Some(dir.path().join("current")));
    }

    #[test]
    fn test_resolve_falls_back_to_latest_run() {
        let dir = TempDir::new().unwrap();
        mkdir(dir.path().join("run_20240101"));
        mkdir(dir.path().join("run_20240301"));
        mkdir(dir.path().join("other"));
        assert_eq!(resolve_run_dir(dir.path()), Some(dir.path().join("run_20240301")));
    }

    #[test]
    fn test_resolve_without_runs() {
        let dir = TempDir::new().unwrap();
        assert_eq!(resolve_run_dir(dir.path()), None);
    }

    #[test]
    fn test_discovers_main_and_chain_data_units() {
        let base = TempDir::new().unwrap();
        let run = base.path().join("runs/mainnet/current");
        mkdir(run.join("node1/db/C/db"));
        mkdir(run.join("node1/chainData/network-1/2Q3xUc8Y7p1KJbDXJLRG4vZ5VrdG9ZrcFVXU6f/db/pebbledb"));
        mkdir(run.join("node2/db/C/db"));
        mkdir(run.join("logs"));
        mkdir(base.path().join("runs/server/mainnet/run_1"));
        mkdir(base.path().join("runs/mainnet.backup.20240101/current/node1/db/C/db"));

        let units = discover_units(base.path(), None).unwrap();
        let names: Vec<String> = units.iter().map(|u| u.dir_name()).collect();
        assert_eq!(
            names,
            vec!["chain_node1", "chaindata_node1_2Q3xUc8Y7p1KJbDX", "chain_node2"]
        );
        assert_eq!(units[0].relpath, PathBuf::from("node1/db/C/db"));
        assert_eq!(units[2].label(), "mainnet/chain_node2");
    }

    #[test]
    fn test_network_filter() {
        let base = TempDir::new().unwrap();
        mkdir(base.path().join("runs/mainnet/current/node1/db/C/db"));
        mkdir(base.path().join("runs/testnet/run_1/node1/db/C/db"));

        let selected = vec!["testnet".to_string()];
        let units = discover_units(base.path(), Some(&selected)).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].network, "testnet");
    }

    #[test]
    fn test_missing_runs_dir_is_empty() {
        let base = TempDir::new().unwrap();
        assert!(discover_units(base.path(), None).unwrap().is_empty());
    }
}
