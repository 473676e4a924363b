//! Size-bounded, checksummed chunk files
//!
//! [`ChunkWriter`] turns one continuous stream into `<prefix>.partNNNNN.zst`
//! files no larger than the configured chunk size. [`PartReader`] is the
//! inverse: it concatenates an entry's parts in index order and verifies each
//! part's size and SHA-256 as the bytes go by.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::constants::chunking::{PART_EXTENSION, PART_INDEX_WIDTH, READ_BUFFER_SIZE};
use crate::errors::{cancelled_io_error, IoContext, Result, SnapshotError};
use crate::snapshot::manifest::Part;

/// File name of part `index` for `prefix`
pub fn part_name(prefix: &str, index: usize) -> String {
    format!(
        "{}.part{:0width$}.{}",
        prefix,
        index,
        PART_EXTENSION,
        width = PART_INDEX_WIDTH
    )
}

/// Sequence number encoded in a part name, if it has one
pub fn part_index(name: &str) -> Option<usize> {
    let stem = name.strip_suffix(&format!(".{}", PART_EXTENSION))?;
    let (_, index) = stem.rsplit_once(".part")?;
    index.parse().ok()
}

/// Parts ordered by their sequence number, the only order that matters on replay
pub fn sorted_parts(parts: &[Part]) -> Vec<Part> {
    let mut sorted = parts.to_vec();
    sorted.sort_by(|a, b| {
        part_index(&a.name)
            .cmp(&part_index(&b.name))
            .then_with(|| a.name.cmp(&b.name))
    });
    sorted
}

struct OpenPart {
    name: String,
    file: BufWriter<File>,
    hasher: Sha256,
    bytes: u64,
}

impl OpenPart {
    fn finalize(self) -> io::Result<Part> {
        let file = self.file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(Part {
            name: self.name,
            bytes: self.bytes,
            sha256: hex::encode(self.hasher.finalize()),
        })
    }
}

/// Splits a byte stream into sequentially named chunk files
pub struct ChunkWriter {
    dir: PathBuf,
    prefix: String,
    chunk_size: u64,
    current: Option<OpenPart>,
    parts: Vec<Part>,
    created: Vec<PathBuf>,
    cancel: Option<CancellationToken>,
}

impl ChunkWriter {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, chunk_size: u64) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            chunk_size: chunk_size.max(1),
            current: None,
            parts: Vec::new(),
            created: Vec::new(),
            cancel: None,
        }
    }

    /// Fail the next write once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Finalize the last part and return every part in creation order
    ///
    /// An empty stream still produces one empty part so the entry can be replayed.
    /// On failure every file the writer created is removed.
    pub fn finish(mut self) -> io::Result<Vec<Part>> {
        match self.seal() {
            Ok(parts) => Ok(parts),
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    fn seal(&mut self) -> io::Result<Vec<Part>> {
        if self.current.is_none() && self.parts.is_empty() {
            self.open_next()?;
        }
        if let Some(open) = self.current.take() {
            let part = open.finalize()?;
            self.parts.push(part);
        }
        if let Ok(dir) = File::open(&self.dir) {
            // Best effort: not every platform can fsync a directory
            let _ = dir.sync_all();
        }
        debug!(
            "Finished {} in {} ({} parts)",
            self.prefix,
            self.dir.display(),
            self.parts.len()
        );
        Ok(std::mem::take(&mut self.parts))
    }

    /// Remove every file this writer created
    pub fn abort(mut self) {
        self.current = None;
        for path in self.created.drain(..) {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!("Failed to remove partial chunk {}: {}", path.display(), e);
                }
            }
        }
    }

    fn open_next(&mut self) -> io::Result<()> {
        if let Some(open) = self.current.take() {
            let part = open.finalize()?;
            self.parts.push(part);
        }

        let name = part_name(&self.prefix, self.parts.len());
        let path = self.dir.join(&name);
        let file = File::create(&path)?;
        self.created.push(path);
        self.current = Some(OpenPart {
            name,
            file: BufWriter::new(file),
            hasher: Sha256::new(),
            bytes: 0,
        });
        Ok(())
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, mut buf: &[u8]) -> io::Result<usize> {
        if self.cancel.as_ref().map_or(false, |t| t.is_cancelled()) {
            return Err(cancelled_io_error());
        }

        let total = buf.len();
        while !buf.is_empty() {
            let full = self
                .current
                .as_ref()
                .map_or(true, |open| open.bytes >= self.chunk_size);
            if full {
                self.open_next()?;
            }

            let chunk_size = self.chunk_size;
            let open = match self.current.as_mut() {
                Some(open) => open,
                None => return Err(io::Error::new(ErrorKind::Other, "no open chunk")),
            };
            let room = (chunk_size - open.bytes) as usize;
            let take = room.min(buf.len());
            open.file.write_all(&buf[..take])?;
            open.hasher.update(&buf[..take]);
            open.bytes += take as u64;
            buf = &buf[take..];
        }
        Ok(total)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.current.as_mut() {
            Some(open) => open.file.flush(),
            None => Ok(()),
        }
    }
}

struct ReadingPart {
    part: Part,
    file: BufReader<File>,
    hasher: Sha256,
    read: u64,
}

/// Reads an entry's parts back as one stream, verifying each part on the way
///
/// A verification failure surfaces to the consumer as an I/O error; the typed
/// cause is kept and returned by [`PartReader::finish`].
pub struct PartReader {
    dir: PathBuf,
    pending: VecDeque<Part>,
    current: Option<ReadingPart>,
    failure: Option<SnapshotError>,
}

impl PartReader {
    pub fn new(dir: impl Into<PathBuf>, parts: &[Part]) -> Self {
        Self {
            dir: dir.into(),
            pending: sorted_parts(parts).into(),
            current: None,
            failure: None,
        }
    }

    /// Drain whatever the consumer left unread and report the first failure
    pub fn finish(mut self) -> Result<()> {
        if self.failure.is_none() {
            let drained = io::copy(&mut self, &mut io::sink());
            if let Err(e) = drained {
                if self.failure.is_none() {
                    return Err(SnapshotError::io(self.dir.clone(), e));
                }
            }
        }
        match self.failure.take() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    fn fail(&mut self, failure: SnapshotError) -> io::Error {
        let err = io::Error::new(ErrorKind::InvalidData, failure.to_string());
        self.failure = Some(failure);
        err
    }

    fn open(&mut self, part: Part) -> io::Result<()> {
        let path = self.dir.join(&part.name);
        match File::open(&path) {
            Ok(file) => {
                self.current = Some(ReadingPart {
                    part,
                    file: BufReader::with_capacity(READ_BUFFER_SIZE, file),
                    hasher: Sha256::new(),
                    read: 0,
                });
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(self.fail(SnapshotError::MissingPart { path }))
            }
            Err(e) => Err(e),
        }
    }
}

impl Read for PartReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(failure) = &self.failure {
            return Err(io::Error::new(ErrorKind::InvalidData, failure.to_string()));
        }
        loop {
            if self.current.is_none() {
                match self.pending.pop_front() {
                    Some(part) => self.open(part)?,
                    None => return Ok(0),
                }
            }
            let reading = match self.current.as_mut() {
                Some(reading) => reading,
                None => return Ok(0),
            };

            let n = reading.file.read(buf)?;
            if n > 0 {
                reading.hasher.update(&buf[..n]);
                reading.read += n as u64;
                return Ok(n);
            }

            let done = match self.current.take() {
                Some(done) => done,
                None => return Ok(0),
            };
            if done.read != done.part.bytes {
                return Err(self.fail(SnapshotError::SizeMismatch {
                    part: done.part.name,
                    expected: done.part.bytes,
                    actual: done.read,
                }));
            }
            let actual = hex::encode(done.hasher.finalize());
            if !actual.eq_ignore_ascii_case(&done.part.sha256) {
                return Err(self.fail(SnapshotError::ChecksumMismatch {
                    part: done.part.name,
                    expected: done.part.sha256,
                    actual,
                }));
            }
        }
    }
}

/// Size and hex SHA-256 of a file on disk
pub fn hash_file(path: &Path) -> Result<(u64, String)> {
    let file = File::open(path).with_path(path)?;
    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).with_path(path)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((total, hex::encode(hasher.finalize())))
}

/// Check one part on disk against its manifest record
pub fn verify_part(dir: &Path, part: &Part) -> Result<()> {
    let path = dir.join(&part.name);
    if !path.exists() {
        return Err(SnapshotError::MissingPart { path });
    }
    let (bytes, sha256) = hash_file(&path)?;
    if bytes != part.bytes {
        return Err(SnapshotError::SizeMismatch {
            part: part.name.clone(),
            expected: part.bytes,
            actual: bytes,
        });
    }
    if !sha256.eq_ignore_ascii_case(&part.sha256) {
        return Err(SnapshotError::ChecksumMismatch {
            part: part.name.clone(),
            expected: part.sha256.clone(),
            actual: sha256,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_all(dir: &Path, chunk_size: u64, writes: &[&[u8]]) -> Vec<Part> {
        let mut writer = ChunkWriter::new(dir, "base_0", chunk_size);
        for data in writes {
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn test_part_names_sort_in_creation_order() {
        assert_eq!(part_name("base_7", 0), "base_7.part00000.zst");
        assert_eq!(part_name("inc_5_1700000000", 12), "inc_5_1700000000.part00012.zst");
        assert_eq!(part_index("inc_5_1700000000.part00012.zst"), Some(12));
        assert_eq!(part_index("manifest.json"), None);
    }

    #[test]
    fn test_write_straddling_boundary_splits_without_loss() {
        let dir = TempDir::new().unwrap();
        let parts = write_all(dir.path(), 10, &[b"0123456", b"789abcdef", b"XYZ"]);

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].bytes, 10);
        assert_eq!(parts[1].bytes, 9);
        assert_eq!(fs::read(dir.path().join(&parts[0].name)).unwrap(), b"0123456789");
        assert_eq!(fs::read(dir.path().join(&parts[1].name)).unwrap(), b"abcdefXYZ");
    }

    #[test]
    fn test_single_write_fills_parts_in_order() {
        let dir = TempDir::new().unwrap();
        let parts = write_all(dir.path(), 99, &[&[7u8; 250]]);

        let sizes: Vec<u64> = parts.iter().map(|p| p.bytes).collect();
        assert_eq!(sizes, vec![99, 99, 52]);
        for (i, part) in parts.iter().enumerate() {
            assert_eq!(part.name, part_name("base_0", i));
            assert_eq!(fs::metadata(dir.path().join(&part.name)).unwrap().len(), part.bytes);
        }
        assert!(parts[2].name.ends_with(".part00002.zst"));
    }

    #[test]
    fn test_exact_boundary_does_not_create_empty_tail() {
        let dir = TempDir::new().unwrap();
        let parts = write_all(dir.path(), 4, &[b"abcd", b"efgh"]);

        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| p.bytes == 4));
    }

    #[test]
    fn test_empty_stream_yields_one_empty_part() {
        let dir = TempDir::new().unwrap();
        let parts = write_all(dir.path(), 4, &[]);

        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].bytes, 0);
        assert!(dir.path().join(&parts[0].name).exists());
    }

    #[test]
    fn test_recorded_digest_matches_file() {
        let dir = TempDir::new().unwrap();
        let parts = write_all(dir.path(), 3, &[b"hello world"]);

        for part in &parts {
            let (bytes, sha256) = hash_file(&dir.path().join(&part.name)).unwrap();
            assert_eq!(bytes, part.bytes);
            assert_eq!(sha256, part.sha256);
            assert!(bytes <= 3);
        }
    }

    #[test]
    fn test_cancelled_writer_fails_and_abort_removes_files() {
        let dir = TempDir::new().unwrap();
        let token = CancellationToken::new();
        let mut writer = ChunkWriter::new(dir.path(), "base_0", 4).with_cancellation(token.clone());
        writer.write_all(b"abcdef").unwrap();

        token.cancel();
        let err = writer.write_all(b"more").unwrap_err();
        assert!(crate::errors::is_cancellation(&err));

        writer.abort();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_part_reader_concatenates_by_index() {
        let dir = TempDir::new().unwrap();
        let mut parts = write_all(dir.path(), 4, &[b"0123456789"]);
        parts.reverse();

        let mut reader = PartReader::new(dir.path(), &parts);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"0123456789");
        reader.finish().unwrap();
    }

    #[test]
    fn test_part_reader_reports_checksum_mismatch() {
        let dir = TempDir::new().unwrap();
        let parts = write_all(dir.path(), 4, &[b"0123456789"]);
        fs::write(dir.path().join(&parts[1].name), b"XXXX").unwrap();

        let mut reader = PartReader::new(dir.path(), &parts);
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).is_err());
        assert!(matches!(
            reader.finish(),
            Err(SnapshotError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_part_reader_reports_missing_part() {
        let dir = TempDir::new().unwrap();
        let parts = write_all(dir.path(), 4, &[b"0123456789"]);
        fs::remove_file(dir.path().join(&parts[2].name)).unwrap();

        let reader = PartReader::new(dir.path(), &parts);
        assert!(matches!(reader.finish(), Err(SnapshotError::MissingPart { .. })));
    }
}
