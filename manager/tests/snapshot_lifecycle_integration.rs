//! Integration tests for the snapshot lifecycle
//!
//! These tests drive `SnapshotManager` against a real runs tree: base and
//! incremental snapshots, restore, squash, listing and garbage collection.

mod common;

use common::fixtures::test_layout::{chunk_files, delete_keys, read_entries, write_entries};
use common::fixtures::*;
use snapshot_manager::snapshot::manifest::{load_manifest, manifest_path};
use snapshot_manager::snapshot::{EngineConfig, SquashOutcome, UnitOutcome};
use snapshot_manager::SnapshotError;
use std::fs;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_base_snapshot_round_trip() {
    let layout = TestLayout::new();
    let entries = sample_entries(0, 50);
    let db = layout.add_main_db(networks::MAINNET, nodes::NODE_1, chains::PRIMARY, &entries);
    let manager = layout.manager();

    let report = manager
        .create_snapshot(snapshots::DAY_1, None, true, CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.count(UnitOutcome::Base), 1);
    let unit = report.unit(labels::MAINNET_NODE_1).expect("unit should be reported");
    assert_eq!(unit.version, 50);
    assert!(unit.parts >= 1);

    let manifest = load_manifest(&manifest_path(&layout.unit_dir(snapshots::DAY_1, labels::MAINNET_NODE_1))).unwrap();
    assert_eq!(manifest.network, networks::MAINNET);
    assert_eq!(manifest.base.since, 0);
    assert_eq!(manifest.last_version, 50);
    assert!(manifest.incrementals.is_empty());
    assert_eq!(manifest.db_relpath.as_deref(), Some("node1/db/C/db"));

    fs::remove_dir_all(&db).unwrap();
    let restored = manager
        .restore_snapshot(snapshots::DAY_1, None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(restored.count(UnitOutcome::Restored), 1);
    assert_eq!(read_entries(&db), entries);
}

#[tokio::test]
async fn test_incremental_in_same_snapshot_extends_chain() {
    let layout = TestLayout::new();
    let db = layout.add_main_db(networks::MAINNET, nodes::NODE_1, chains::PRIMARY, &sample_entries(0, 50));
    let manager = layout.manager();

    manager
        .create_snapshot(snapshots::DAY_1, None, true, CancellationToken::new())
        .await
        .unwrap();

    write_entries(&db, &sample_entries(50, 10));
    delete_keys(&db, &[b"key-00001".as_slice()]);
    let expected = read_entries(&db);

    let report = manager
        .create_snapshot(snapshots::DAY_1, None, true, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.count(UnitOutcome::Incremental), 1);

    let unit_dir = layout.unit_dir(snapshots::DAY_1, labels::MAINNET_NODE_1);
    let manifest = load_manifest(&manifest_path(&unit_dir)).unwrap();
    assert_eq!(manifest.incrementals.len(), 1);
    assert_eq!(manifest.incrementals[0].since, 50);
    assert_eq!(manifest.incrementals[0].version, 61);
    assert_eq!(manifest.last_version, 61);
    assert!(manifest.validate_lineage(labels::MAINNET_NODE_1).is_ok());

    fs::remove_dir_all(&db).unwrap();
    manager
        .restore_snapshot(snapshots::DAY_1, Some(networks::MAINNET), CancellationToken::new())
        .await
        .unwrap();

    let restored = read_entries(&db);
    assert_eq!(restored, expected);
    assert!(!restored.iter().any(|(key, _)| key.as_slice() == b"key-00001"));
}

#[tokio::test]
async fn test_incremental_snapshot_survives_parent_deletion() {
    let layout = TestLayout::new();
    let db = layout.add_main_db(networks::MAINNET, nodes::NODE_1, chains::PRIMARY, &sample_entries(0, 30));
    let manager = layout.manager();

    manager
        .create_snapshot(snapshots::DAY_1, None, true, CancellationToken::new())
        .await
        .unwrap();

    write_entries(&db, &sample_entries(30, 5));
    let expected = read_entries(&db);

    let report = manager
        .create_snapshot(snapshots::DAY_2, None, true, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.count(UnitOutcome::Incremental), 1);

    // Parent parts are linked or copied into the new snapshot
    fs::remove_dir_all(layout.snapshot_dir(snapshots::DAY_1)).unwrap();

    let verify = manager.verify_snapshot(snapshots::DAY_2).await.unwrap();
    assert_eq!(verify.count(UnitOutcome::Verified), 1);

    fs::remove_dir_all(&db).unwrap();
    let restored = manager
        .restore_snapshot(snapshots::DAY_2, None, CancellationToken::new())
        .await
        .unwrap();
    assert!(restored.is_success());
    assert_eq!(read_entries(&db), expected);
}

#[tokio::test]
async fn test_full_snapshot_ignores_parent() {
    let layout = TestLayout::new();
    layout.add_main_db(networks::MAINNET, nodes::NODE_1, chains::PRIMARY, &sample_entries(0, 10));
    let manager = layout.manager();

    manager
        .create_snapshot(snapshots::DAY_1, None, true, CancellationToken::new())
        .await
        .unwrap();
    let report = manager
        .create_snapshot(snapshots::DAY_2, None, false, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.count(UnitOutcome::Base), 1);
    assert_eq!(report.count(UnitOutcome::Incremental), 0);
}

#[tokio::test]
async fn test_small_chunk_size_splits_into_parts() {
    let layout = TestLayout::new();
    let entries = sample_entries(0, 500);
    let db = layout.add_main_db(networks::MAINNET, nodes::NODE_1, chains::PRIMARY, &entries);
    let manager = layout.manager_with(|config| EngineConfig {
        chunk_size: 64,
        ..config
    });

    let report = manager
        .create_snapshot(snapshots::DAY_1, None, true, CancellationToken::new())
        .await
        .unwrap();
    let unit = report.unit(labels::MAINNET_NODE_1).unwrap();
    assert!(unit.parts > 1, "expected several parts, got {}", unit.parts);

    let unit_dir = layout.unit_dir(snapshots::DAY_1, labels::MAINNET_NODE_1);
    let manifest = load_manifest(&manifest_path(&unit_dir)).unwrap();
    for part in &manifest.base.parts {
        assert!(part.bytes <= 64, "part {} holds {} bytes", part.name, part.bytes);
        assert!(part.name.starts_with("base_500.part"));
        assert!(part.name.ends_with(".zst"));
    }
    assert_eq!(chunk_files(&unit_dir).len(), manifest.base.parts.len());

    fs::remove_dir_all(&db).unwrap();
    manager
        .restore_snapshot(snapshots::DAY_1, None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(read_entries(&db), entries);
}

#[tokio::test]
async fn test_squash_matches_chain_and_keeps_cursor() {
    let layout = TestLayout::new();
    let db = layout.add_main_db(networks::MAINNET, nodes::NODE_1, chains::PRIMARY, &sample_entries(0, 20));
    let manager = layout.manager();

    manager
        .create_snapshot(snapshots::DAY_1, None, true, CancellationToken::new())
        .await
        .unwrap();
    write_entries(&db, &sample_entries(20, 5));
    manager
        .create_snapshot(snapshots::DAY_1, None, true, CancellationToken::new())
        .await
        .unwrap();
    delete_keys(&db, &[b"key-00003".as_slice(), b"key-00021".as_slice()]);
    manager
        .create_snapshot(snapshots::DAY_1, None, true, CancellationToken::new())
        .await
        .unwrap();
    let expected = read_entries(&db);

    let unit_dir = layout.unit_dir(snapshots::DAY_1, labels::MAINNET_NODE_1);
    let before = load_manifest(&manifest_path(&unit_dir)).unwrap();
    assert_eq!(before.incrementals.len(), 2);

    let outcome = manager
        .squash(snapshots::DAY_1, networks::MAINNET, "chain_node1", CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(outcome, SquashOutcome::Squashed { incrementals: 2, .. }));

    let after = load_manifest(&manifest_path(&unit_dir)).unwrap();
    assert!(after.incrementals.is_empty());
    assert_eq!(after.last_version, before.last_version);
    assert_eq!(after.base.since, 0);

    // Only the new base's parts remain on disk
    let mut referenced: Vec<String> = after.base.parts.iter().map(|p| p.name.clone()).collect();
    referenced.sort();
    assert_eq!(chunk_files(&unit_dir), referenced);

    fs::remove_dir_all(&db).unwrap();
    manager
        .restore_snapshot(snapshots::DAY_1, None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(read_entries(&db), expected);

    // A squashed chain keeps accepting incrementals from the same cursor
    write_entries(&db, &sample_entries(100, 1));
    let report = manager
        .create_snapshot(snapshots::DAY_1, None, true, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.count(UnitOutcome::Incremental), 1);
    let extended = load_manifest(&manifest_path(&unit_dir)).unwrap();
    assert_eq!(extended.incrementals[0].since, before.last_version);
}

#[tokio::test]
async fn test_cancelled_squash_keeps_chain() {
    let layout = TestLayout::new();
    let db = layout.add_main_db(networks::MAINNET, nodes::NODE_1, chains::PRIMARY, &sample_entries(0, 10));
    let manager = layout.manager();

    manager
        .create_snapshot(snapshots::DAY_1, None, true, CancellationToken::new())
        .await
        .unwrap();
    write_entries(&db, &sample_entries(10, 3));
    manager
        .create_snapshot(snapshots::DAY_1, None, true, CancellationToken::new())
        .await
        .unwrap();

    let unit_dir = layout.unit_dir(snapshots::DAY_1, labels::MAINNET_NODE_1);
    let before = load_manifest(&manifest_path(&unit_dir)).unwrap();
    let files = chunk_files(&unit_dir);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = manager
        .squash(snapshots::DAY_1, networks::MAINNET, "chain_node1", cancel)
        .await;
    assert!(matches!(result, Err(SnapshotError::Cancelled)));

    let after = load_manifest(&manifest_path(&unit_dir)).unwrap();
    assert_eq!(after.incrementals.len(), before.incrementals.len());
    assert_eq!(after.last_version, before.last_version);
    assert_eq!(chunk_files(&unit_dir), files);
}

#[tokio::test]
async fn test_incremental_after_older_restore_takes_base() {
    let layout = TestLayout::new();
    let db = layout.add_main_db(networks::MAINNET, nodes::NODE_1, chains::PRIMARY, &sample_entries(0, 10));
    let manager = layout.manager();

    manager
        .create_snapshot(snapshots::DAY_1, None, false, CancellationToken::new())
        .await
        .unwrap();
    write_entries(&db, &sample_entries(10, 5));
    let report = manager
        .create_snapshot(snapshots::DAY_2, None, true, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.count(UnitOutcome::Incremental), 1);

    // Back to day one, then diverge with fewer writes than day two had
    manager
        .restore_snapshot(snapshots::DAY_1, None, CancellationToken::new())
        .await
        .unwrap();
    write_entries(&db, &sample_entries(100, 3));
    let expected = read_entries(&db);
    assert_eq!(expected.len(), 13);

    let report = manager
        .create_snapshot(snapshots::DAY_3, None, true, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.unit(labels::MAINNET_NODE_1).unwrap().outcome, UnitOutcome::Base);

    let unit_dir = layout.unit_dir(snapshots::DAY_3, labels::MAINNET_NODE_1);
    let manifest = load_manifest(&manifest_path(&unit_dir)).unwrap();
    assert!(manifest.incrementals.is_empty());
    let mut referenced: Vec<String> = manifest.base.parts.iter().map(|p| p.name.clone()).collect();
    referenced.sort();
    assert_eq!(chunk_files(&unit_dir), referenced);

    fs::remove_dir_all(&db).unwrap();
    manager
        .restore_snapshot(snapshots::DAY_3, None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(read_entries(&db), expected);
}

#[tokio::test]
async fn test_squash_snapshot_respects_threshold() {
    let layout = TestLayout::new();
    let db = layout.add_main_db(networks::MAINNET, nodes::NODE_1, chains::PRIMARY, &sample_entries(0, 5));
    let manager = layout.manager();

    manager
        .create_snapshot(snapshots::DAY_1, None, true, CancellationToken::new())
        .await
        .unwrap();
    write_entries(&db, &sample_entries(5, 1));
    manager
        .create_snapshot(snapshots::DAY_1, None, true, CancellationToken::new())
        .await
        .unwrap();

    let skipped = manager
        .squash_snapshot(snapshots::DAY_1, None, 1, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(skipped.count(UnitOutcome::Skipped), 1);

    let squashed = manager
        .squash_snapshot(snapshots::DAY_1, None, 0, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(squashed.count(UnitOutcome::Squashed), 1);
}

#[tokio::test]
async fn test_list_and_inspect_snapshots() {
    let layout = TestLayout::new();
    let db = layout.add_main_db(networks::MAINNET, nodes::NODE_1, chains::PRIMARY, &sample_entries(0, 10));
    layout.add_main_db(networks::TESTNET, nodes::NODE_1, chains::PRIMARY, &sample_entries(0, 3));
    let manager = layout.manager();

    assert!(manager.list_snapshots().unwrap().is_empty());

    manager
        .create_snapshot(snapshots::DAY_1, None, true, CancellationToken::new())
        .await
        .unwrap();
    write_entries(&db, &sample_entries(10, 2));
    manager
        .create_snapshot(snapshots::DAY_2, Some(&[networks::MAINNET.to_string()]), true, CancellationToken::new())
        .await
        .unwrap();

    let mut names: Vec<String> = manager.list_snapshots().unwrap().into_iter().map(|s| s.name).collect();
    names.sort();
    assert_eq!(names, vec![snapshots::DAY_1.to_string(), snapshots::DAY_2.to_string()]);

    let day_1 = manager.get_snapshot_info(snapshots::DAY_1).unwrap();
    assert_eq!(day_1.units, 2);
    assert!(!day_1.incremental);
    assert!(day_1.size > 0);

    let day_2 = manager.get_snapshot_info(snapshots::DAY_2).unwrap();
    assert_eq!(day_2.units, 1);
    assert!(day_2.incremental);

    assert!(manager.get_snapshot_info("missing").is_err());
}

#[tokio::test]
async fn test_garbage_collection_removes_unreferenced_files() {
    let layout = TestLayout::new();
    layout.add_main_db(networks::MAINNET, nodes::NODE_1, chains::PRIMARY, &sample_entries(0, 10));
    let manager = layout.manager();

    manager
        .create_snapshot(snapshots::DAY_1, None, true, CancellationToken::new())
        .await
        .unwrap();

    let unit_dir = layout.unit_dir(snapshots::DAY_1, labels::MAINNET_NODE_1);
    let kept = chunk_files(&unit_dir);
    fs::write(unit_dir.join("chunks").join("tmp_orphan.part00000.zst"), b"orphan").unwrap();
    fs::create_dir_all(unit_dir.join(".squash-leftover")).unwrap();
    let ghost = layout.unit_dir(snapshots::DAY_1, "mainnet/chain_ghost");
    fs::create_dir_all(ghost.join("chunks")).unwrap();
    fs::write(ghost.join("chunks").join("base_1.part00000.zst"), b"ghost").unwrap();

    let report = manager.collect_garbage(None).unwrap();

    assert_eq!(report.files_removed, 1);
    assert_eq!(report.dirs_removed, 2);
    assert!(report.bytes_freed >= 11);
    assert!(report.errors.is_empty());
    assert!(!ghost.exists());
    assert!(!unit_dir.join(".squash-leftover").exists());
    assert_eq!(chunk_files(&unit_dir), kept);

    let verify = manager.verify_snapshot(snapshots::DAY_1).await.unwrap();
    assert!(verify.is_success());
}
