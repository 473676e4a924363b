//! Append-only versioned key/value store
//!
//! Every mutation is one record in `data.log`, stamped with a monotonically
//! increasing version. Deletes are tombstones so that differential backups
//! carry them. A `LOCK` file created with `create_new` guards the directory
//! against a second opener; it is removed when the store is dropped. The lock
//! holds the owner's pid and is taken over once that process is gone.
//!
//! Record layout (little endian):
//!
//! ```text
//! tag:u8 | version:u64 | key_len:u32 | key | [value_len:u32 | value]
//! ```
//!
//! `tag` is 1 for a put (value present), 2 for a delete and 3 for a cursor
//! record (empty key) that pins the version counter after compaction.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{Database, DatabaseEngine, DbError};

const DATA_FILE: &str = "data.log";
const LOCK_FILE: &str = "LOCK";

const TAG_PUT: u8 = 1;
const TAG_DELETE: u8 = 2;
const TAG_CURSOR: u8 = 3;

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    version: u64,
    value: Option<Vec<u8>>,
}

#[derive(Debug)]
struct Record {
    tag: u8,
    version: u64,
    key: Vec<u8>,
    value: Option<Vec<u8>>,
}

struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(dir: &Path) -> Result<Self, DbError> {
        let path = dir.join(LOCK_FILE);
        match Self::create(&path) {
            Ok(()) => return Ok(Self { path }),
            Err(e) if e.kind() != ErrorKind::AlreadyExists => return Err(e.into()),
            Err(_) => {}
        }

        // Left behind by a process that never released it
        if let Some(pid) = Self::stale_owner(&path) {
            warn!("Taking over stale lock {} held by dead pid {}", path.display(), pid);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            match Self::create(&path) {
                Ok(()) => return Ok(Self { path }),
                Err(e) if e.kind() != ErrorKind::AlreadyExists => return Err(e.into()),
                Err(_) => {}
            }
        }

        Err(DbError::Locked {
            path: dir.to_path_buf(),
        })
    }

    fn create(path: &Path) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()
    }

    /// The recorded owner when it is no longer running; unreadable or
    /// half-written lock files count as live
    fn stale_owner(path: &Path) -> Option<u32> {
        let pid = fs::read_to_string(path).ok()?.trim().parse::<u32>().ok()?;
        (pid != std::process::id() && !process_alive(pid)).then_some(pid)
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

pub struct FileStore {
    dir: PathBuf,
    log: BufWriter<File>,
    entries: BTreeMap<Vec<u8>, Entry>,
    version: u64,
    // Dropped last so the log is flushed before the directory is unlocked
    _lock: LockFile,
}

impl FileStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, DbError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let lock = LockFile::acquire(&dir)?;

        let data_path = dir.join(DATA_FILE);
        let mut entries = BTreeMap::new();
        let mut version = 0;

        if data_path.exists() {
            let mut reader = BufReader::new(File::open(&data_path)?);
            while let Some(record) = read_record(&mut reader)? {
                version = version.max(record.version);
                apply(&mut entries, record);
            }
        }

        let log = OpenOptions::new().create(true).append(true).open(&data_path)?;
        debug!(
            "Opened store {} ({} keys, version {})",
            dir.display(),
            entries.len(),
            version
        );

        Ok(Self {
            dir,
            log: BufWriter::new(log),
            entries,
            version,
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Current version cursor
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<u64, DbError> {
        self.version += 1;
        let record = Record {
            tag: TAG_PUT,
            version: self.version,
            key: key.to_vec(),
            value: Some(value.to_vec()),
        };
        write_record(&mut self.log, &record)?;
        apply(&mut self.entries, record);
        Ok(self.version)
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<u64, DbError> {
        self.version += 1;
        let record = Record {
            tag: TAG_DELETE,
            version: self.version,
            key: key.to_vec(),
            value: None,
        };
        write_record(&mut self.log, &record)?;
        apply(&mut self.entries, record);
        Ok(self.version)
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries
            .get(key)
            .and_then(|entry| entry.value.as_deref())
    }

    /// Live key/value pairs in key order
    pub fn items(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.entries
            .iter()
            .filter_map(|(key, entry)| entry.value.as_ref().map(|v| (key.clone(), v.clone())))
            .collect()
    }

    pub fn flush(&mut self) -> Result<(), DbError> {
        self.log.flush()?;
        Ok(())
    }
}

impl Database for FileStore {
    fn backup(&mut self, writer: &mut dyn Write, since: u64) -> Result<u64, DbError> {
        self.flush()?;
        for (key, entry) in &self.entries {
            if entry.version <= since {
                continue;
            }
            // Full backups start from an empty database, tombstones add nothing
            if since == 0 && entry.value.is_none() {
                continue;
            }
            let tag = if entry.value.is_some() { TAG_PUT } else { TAG_DELETE };
            write_record(
                writer,
                &Record {
                    tag,
                    version: entry.version,
                    key: key.clone(),
                    value: entry.value.clone(),
                },
            )?;
        }
        // Pins the cursor on the loading side even when the newest changes were deletes
        if self.version > since {
            write_record(
                writer,
                &Record {
                    tag: TAG_CURSOR,
                    version: self.version,
                    key: Vec::new(),
                    value: None,
                },
            )?;
        }
        writer.flush()?;
        Ok(self.version)
    }

    fn load(&mut self, reader: &mut dyn Read) -> Result<(), DbError> {
        let mut reader = BufReader::new(reader);
        let mut loaded = 0usize;
        while let Some(record) = read_record(&mut reader)? {
            if let Some(existing) = self.entries.get(&record.key) {
                if existing.version > record.version {
                    continue;
                }
            }
            write_record(&mut self.log, &record)?;
            self.version = self.version.max(record.version);
            apply(&mut self.entries, record);
            loaded += 1;
        }
        self.flush()?;
        debug!("Loaded {} records into {}", loaded, self.dir.display());
        Ok(())
    }

    fn compact(&mut self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<(), DbError> {
        if let (Some(s), Some(e)) = (start, end) {
            if s > e {
                return Ok(());
            }
        }
        let lower = start.map_or(Bound::Unbounded, |s| Bound::Included(s.to_vec()));
        let upper = end.map_or(Bound::Unbounded, |e| Bound::Excluded(e.to_vec()));
        let dead: Vec<Vec<u8>> = self
            .entries
            .range((lower, upper))
            .filter(|(_, entry)| entry.value.is_none())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &dead {
            self.entries.remove(key);
        }

        self.flush()?;
        let data_path = self.dir.join(DATA_FILE);
        let tmp_path = self.dir.join(format!("{}.compact", DATA_FILE));
        {
            let mut out = BufWriter::new(File::create(&tmp_path)?);
            write_record(
                &mut out,
                &Record {
                    tag: TAG_CURSOR,
                    version: self.version,
                    key: Vec::new(),
                    value: None,
                },
            )?;
            for (key, entry) in &self.entries {
                let tag = if entry.value.is_some() { TAG_PUT } else { TAG_DELETE };
                write_record(
                    &mut out,
                    &Record {
                        tag,
                        version: entry.version,
                        key: key.clone(),
                        value: entry.value.clone(),
                    },
                )?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &data_path)?;
        self.log = BufWriter::new(OpenOptions::new().append(true).open(&data_path)?);

        debug!(
            "Compacted {} ({} tombstones purged)",
            self.dir.display(),
            dead.len()
        );
        Ok(())
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if let Err(e) = self.log.flush() {
            warn!("Failed to flush {}: {}", self.dir.display(), e);
        }
    }
}

/// Engine handle for [`FileStore`] databases
#[derive(Debug, Clone, Copy, Default)]
pub struct FileStoreEngine;

impl DatabaseEngine for FileStoreEngine {
    fn name(&self) -> &str {
        "filestore"
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Database>, DbError> {
        Ok(Box::new(FileStore::open(path)?))
    }
}

fn apply(entries: &mut BTreeMap<Vec<u8>, Entry>, record: Record) {
    if record.tag == TAG_CURSOR {
        return;
    }
    entries.insert(
        record.key,
        Entry {
            version: record.version,
            value: record.value,
        },
    );
}

fn write_record<W: Write + ?Sized>(writer: &mut W, record: &Record) -> io::Result<()> {
    writer.write_all(&[record.tag])?;
    writer.write_all(&record.version.to_le_bytes())?;
    writer.write_all(&(record.key.len() as u32).to_le_bytes())?;
    writer.write_all(&record.key)?;
    if let Some(value) = &record.value {
        writer.write_all(&(value.len() as u32).to_le_bytes())?;
        writer.write_all(value)?;
    }
    Ok(())
}

fn read_record<R: Read + ?Sized>(reader: &mut R) -> Result<Option<Record>, DbError> {
    let mut tag = [0u8; 1];
    loop {
        match reader.read(&mut tag) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    let tag = tag[0];
    if !matches!(tag, TAG_PUT | TAG_DELETE | TAG_CURSOR) {
        return Err(DbError::Corrupt(format!("unknown record tag {}", tag)));
    }

    let version = u64::from_le_bytes(read_array(reader)?);
    let key = read_bytes(reader)?;
    let value = if tag == TAG_PUT {
        Some(read_bytes(reader)?)
    } else {
        None
    };

    Ok(Some(Record {
        tag,
        version,
        key,
        value,
    }))
}

fn read_array<R: Read + ?Sized, const N: usize>(reader: &mut R) -> Result<[u8; N], DbError> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf).map_err(truncated)?;
    Ok(buf)
}

fn read_bytes<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>, DbError> {
    let len = u32::from_le_bytes(read_array(reader)?) as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).map_err(truncated)?;
    Ok(buf)
}

fn truncated(e: io::Error) -> DbError {
    if e.kind() == ErrorKind::UnexpectedEof {
        DbError::Corrupt("truncated record".to_string())
    } else {
        DbError::Io(e)
    }
}
