// File: manager/src/snapshot/builder.rs

//! Base and incremental snapshot creation for a single unit
//!
//! Everything here is blocking and runs inside `spawn_blocking`. The backup
//! stream flows database -> zstd encoder -> [`ChunkWriter`], parts are
//! written under a staging prefix and renamed once the stream is complete,
//! and the manifest is written last.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::constants::chunking::{CHUNK_SIZE, COMPRESSION_LEVEL};
use crate::db::Database;
use crate::errors::{IoContext, Result, SnapshotError};
use crate::snapshot::chunk::{part_name, verify_part, ChunkWriter};
use crate::snapshot::discovery::{SnapshotUnit, UnitKind};
use crate::snapshot::manifest::{
    chunks_dir, manifest_path, save_manifest, Part, SnapshotEntry, SnapshotManifest,
};

/// Knobs shared by every backup pipeline
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub chunk_size: u64,
    pub compression_level: i32,
    pub cancel: CancellationToken,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            compression_level: COMPRESSION_LEVEL,
            cancel: CancellationToken::new(),
        }
    }
}

/// How a parent part reached the child's chunk directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    Linked,
    Copied,
    Existing,
}

/// Stream a backup of `db` into `dir` and return its parts and the resulting cursor
///
/// `name_for` maps the cursor to the final part prefix. Nothing is left in
/// `dir` when this fails.
pub fn stream_backup(
    db: &mut dyn Database,
    dir: &Path,
    since: u64,
    options: &PipelineOptions,
    name_for: impl Fn(u64) -> String,
) -> Result<(Vec<Part>, u64)> {
    fs::create_dir_all(dir).with_path(dir)?;

    let staging = format!("tmp_{}", Uuid::new_v4().simple());
    let mut writer = ChunkWriter::new(dir, staging, options.chunk_size)
        .with_cancellation(options.cancel.clone());

    let version = match encode(db, &mut writer, since, options.compression_level) {
        Ok(version) => version,
        Err(e) => {
            writer.abort();
            return Err(e);
        }
    };

    let staged = writer.finish().with_path(dir)?;
    if options.cancel.is_cancelled() {
        remove_parts(dir, &staged);
        return Err(SnapshotError::Cancelled);
    }

    let parts = publish_parts(dir, staged, &name_for(version))?;
    Ok((parts, version))
}

fn encode(db: &mut dyn Database, writer: &mut ChunkWriter, since: u64, level: i32) -> Result<u64> {
    let mut encoder = zstd::Encoder::new(writer, level).map_err(|e| SnapshotError::io("zstd", e))?;
    let version = db.backup(&mut encoder, since)?;
    encoder.finish().map_err(|e| {
        if crate::errors::is_cancellation(&e) {
            SnapshotError::Cancelled
        } else {
            SnapshotError::io("zstd", e)
        }
    })?;
    Ok(version)
}

/// Rename staged parts to their final prefix, picking a free prefix on collision
fn publish_parts(dir: &Path, staged: Vec<Part>, prefix: &str) -> Result<Vec<Part>> {
    let mut chosen = prefix.to_string();
    let mut attempt = 0;
    while (0..staged.len()).any(|i| dir.join(part_name(&chosen, i)).exists()) {
        attempt += 1;
        chosen = format!("{}_{}", prefix, attempt);
    }

    let mut published = Vec::with_capacity(staged.len());
    for (i, part) in staged.iter().enumerate() {
        let name = part_name(&chosen, i);
        if let Err(e) = fs::rename(dir.join(&part.name), dir.join(&name)) {
            remove_parts(dir, &staged[i..]);
            remove_parts(dir, &published);
            return Err(SnapshotError::io(dir.join(&part.name), e));
        }
        published.push(Part {
            name,
            bytes: part.bytes,
            sha256: part.sha256.clone(),
        });
    }
    Ok(published)
}

pub(crate) fn remove_parts(dir: &Path, parts: &[Part]) {
    for part in parts {
        let path = dir.join(&part.name);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove part {}: {}", path.display(), e);
            }
        }
    }
}

/// Fill the identity fields a restore needs to find its target again
pub fn describe_unit(manifest: &mut SnapshotManifest, unit: &SnapshotUnit) {
    manifest.network = unit.network.clone();
    manifest.node_id = Some(unit.node_id.clone());
    manifest.db_relpath = Some(unit.relpath.to_string_lossy().to_string());
    match &unit.kind {
        UnitKind::Main { chain } => manifest.chain_id = Some(chain.clone()),
        UnitKind::ChainData { chain_data_id } => {
            manifest.chain_data_id = Some(chain_data_id.clone())
        }
    }
}

/// Full backup of `db` into `unit_dir`, replacing whatever manifest was there
pub fn create_base_snapshot(
    unit: &SnapshotUnit,
    db: &mut dyn Database,
    unit_dir: &Path,
    options: &PipelineOptions,
) -> Result<SnapshotManifest> {
    let chunks = chunks_dir(unit_dir);
    let (parts, version) = stream_backup(db, &chunks, 0, options, |v| format!("base_{}", v))?;

    let mut manifest = SnapshotManifest::new(unit.network.clone(), SnapshotEntry::new(0, version, parts));
    describe_unit(&mut manifest, unit);

    if let Err(e) = save_manifest(&manifest_path(unit_dir), &manifest) {
        remove_parts(&chunks, &manifest.base.parts);
        return Err(e);
    }

    info!(
        "Base snapshot of {} written: {} parts, {} bytes, version {}",
        unit.label(),
        manifest.base.parts.len(),
        manifest.base.total_bytes(),
        version
    );
    Ok(manifest)
}

/// Differential backup on top of `parent`, written to `unit_dir`
///
/// When `parent_dir` differs from `unit_dir` every parent part is hard-linked
/// (or copied) first so the new snapshot stands alone.
pub fn create_incremental_snapshot(
    unit: &SnapshotUnit,
    db: &mut dyn Database,
    parent: &SnapshotManifest,
    parent_dir: &Path,
    unit_dir: &Path,
    options: &PipelineOptions,
) -> Result<SnapshotManifest> {
    parent.validate_lineage(&unit.label())?;

    let chunks = chunks_dir(unit_dir);
    let since = parent.last_version;
    let stamp = Utc::now().timestamp();
    let (parts, version) =
        stream_backup(db, &chunks, since, options, |_| format!("inc_{}_{}", since, stamp))?;

    // A database restored from an older snapshot sits behind the parent chain
    if version < since {
        remove_parts(&chunks, &parts);
        return Err(SnapshotError::CorruptLineage {
            unit: unit.label(),
            index: parent.incrementals.len() + 1,
            expected: since,
            found: version,
        });
    }

    let parent_chunks = chunks_dir(parent_dir);
    if !same_dir(&parent_chunks, &chunks) {
        if let Err(e) = carry_parent_parts(unit, parent, &parent_chunks, &chunks, options) {
            remove_parts(&chunks, &parts);
            return Err(e);
        }
    }

    let mut manifest = parent.clone();
    describe_unit(&mut manifest, unit);
    manifest.push_incremental(SnapshotEntry::new(since, version, parts));

    if let Err(e) = save_manifest(&manifest_path(unit_dir), &manifest) {
        if let Some(entry) = manifest.incrementals.last() {
            remove_parts(&chunks, &entry.parts);
        }
        return Err(e);
    }

    info!(
        "Incremental snapshot of {} written: {} -> {}, {} incrementals in chain",
        unit.label(),
        since,
        version,
        manifest.incrementals.len()
    );
    Ok(manifest)
}

fn carry_parent_parts(
    unit: &SnapshotUnit,
    parent: &SnapshotManifest,
    parent_chunks: &Path,
    chunks: &Path,
    options: &PipelineOptions,
) -> Result<()> {
    let (mut linked, mut copied) = (0usize, 0usize);
    for part in parent.all_parts() {
        if options.cancel.is_cancelled() {
            return Err(SnapshotError::Cancelled);
        }
        match link_or_copy(parent_chunks, chunks, part)? {
            LinkMode::Linked => linked += 1,
            LinkMode::Copied => copied += 1,
            LinkMode::Existing => {}
        }
    }
    debug!(
        "Carried parent parts of {} from {}: {} linked, {} copied",
        unit.label(),
        parent_chunks.display(),
        linked,
        copied
    );
    Ok(())
}

/// Hard-link `part` from `src_dir` into `dst_dir`, copying when linking fails
pub fn link_or_copy(src_dir: &Path, dst_dir: &Path, part: &Part) -> Result<LinkMode> {
    let src = src_dir.join(&part.name);
    let dst = dst_dir.join(&part.name);

    if dst.exists() {
        if verify_part(dst_dir, part).is_ok() {
            return Ok(LinkMode::Existing);
        }
        fs::remove_file(&dst).with_path(&dst)?;
    }
    if !src.exists() {
        return Err(SnapshotError::MissingPart { path: src });
    }

    match fs::hard_link(&src, &dst) {
        Ok(()) => Ok(LinkMode::Linked),
        Err(e) => {
            debug!("Hard link {} failed ({}), copying", src.display(), e);
            let tmp = dst.with_extension("copy.tmp");
            fs::copy(&src, &tmp).with_path(&src)?;
            fs::rename(&tmp, &dst).with_path(&dst)?;
            Ok(LinkMode::Copied)
        }
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
