//! Append-only JSON-lines store.
//!
//! Every change is one line `<checksum> <json>\n`, where the checksum is the
//! first 8 bytes of the SHA-256 of the JSON text, hex encoded. Each append
//! is followed by `fsync`. On open the log is replayed into memory; a
//! damaged final line is a torn write and is cut off, damage anywhere else
//! is reported as corruption. The log is rewritten from the live state once
//! superseded records dominate it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::memory::StoreState;
use super::SyncStore;
use crate::error::{StoreError, StoreResult};
use crate::item::{ConflictRecord, SyncQueueItem};

/// Bytes of the digest kept per record.
const CHECKSUM_BYTES: usize = 8;

/// Compaction is considered once the log holds this many records.
const COMPACT_MIN_RECORDS: usize = 1024;

/// Compact when the log is this many times larger than the live state.
const COMPACT_RATIO: usize = 4;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogRecord {
    PutItem { item: SyncQueueItem },
    RemoveItem { id: String },
    PutConflict { conflict: ConflictRecord },
}

impl LogRecord {
    fn apply(self, state: &mut StoreState) {
        match self {
            LogRecord::PutItem { item } => state.put_item(&item),
            LogRecord::RemoveItem { id } => {
                state.items.remove(&id);
            }
            LogRecord::PutConflict { conflict } => {
                state.conflicts.insert(conflict.id.clone(), conflict);
            }
        }
    }
}

/// Log statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStoreStats {
    /// Records in the log file, including superseded ones.
    pub records: usize,
    /// Live queue items.
    pub items: usize,
    /// Conflict records.
    pub conflicts: usize,
}

struct Inner {
    file: File,
    state: StoreState,
    records: usize,
}

/// Durable store backed by a single log file.
pub struct FileStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl FileStore {
    /// Open or create the log at `path`, recovering its contents.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let recovered = recover(&path)?;
        if recovered.torn_bytes > 0 {
            warn!(
                path = %path.display(),
                bytes = recovered.torn_bytes,
                "Discarding torn write at end of log"
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(recovered.valid_len)?;
            file.sync_all()?;
        }

        let file = match OpenOptions::new().append(true).create_new(true).open(&path) {
            Ok(file) => {
                // The new directory entry must survive a crash too.
                file.sync_all()?;
                sync_parent(&path)?;
                debug!(path = %path.display(), "Created offline queue log");
                file
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                OpenOptions::new().append(true).open(&path)?
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            path = %path.display(),
            records = recovered.records,
            items = recovered.state.items.len(),
            conflicts = recovered.state.conflicts.len(),
            "Opened offline queue log"
        );

        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                file,
                state: recovered.state,
                records: recovered.records,
            }),
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current log statistics.
    pub fn stats(&self) -> FileStoreStats {
        let inner = self.inner.lock();
        FileStoreStats {
            records: inner.records,
            items: inner.state.items.len(),
            conflicts: inner.state.conflicts.len(),
        }
    }

    /// Rewrite the log so it holds only live records.
    pub fn compact(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        self.compact_locked(&mut inner)
    }

    fn compact_locked(&self, inner: &mut Inner) -> StoreResult<()> {
        let before = inner.records;
        let tmp = self.path.with_extension("compact");
        let mut out = File::create(&tmp)?;
        let mut records = 0;
        for item in inner.state.list_items() {
            out.write_all(encode(&LogRecord::PutItem { item })?.as_bytes())?;
            records += 1;
        }
        for conflict in inner.state.list_conflicts() {
            out.write_all(encode(&LogRecord::PutConflict { conflict })?.as_bytes())?;
            records += 1;
        }
        out.sync_all()?;
        drop(out);

        fs::rename(&tmp, &self.path)?;
        sync_parent(&self.path)?;
        inner.file = OpenOptions::new().append(true).open(&self.path)?;
        inner.records = records;

        debug!(
            path = %self.path.display(),
            before = before,
            after = records,
            "Compacted offline queue log"
        );
        Ok(())
    }

    fn append(&self, record: LogRecord) -> StoreResult<()> {
        let line = encode(&record)?;
        let mut inner = self.inner.lock();
        inner.file.write_all(line.as_bytes())?;
        inner.file.sync_data()?;
        inner.records += 1;
        record.apply(&mut inner.state);

        let live = inner.state.items.len() + inner.state.conflicts.len();
        if inner.records >= COMPACT_MIN_RECORDS && inner.records > live * COMPACT_RATIO {
            self.compact_locked(&mut inner)?;
        }
        Ok(())
    }
}

impl SyncStore for FileStore {
    fn put_item(&self, item: &SyncQueueItem) -> StoreResult<()> {
        self.append(LogRecord::PutItem { item: item.clone() })
    }

    fn remove_item(&self, id: &str) -> StoreResult<()> {
        if !self.inner.lock().state.items.contains_key(id) {
            return Ok(());
        }
        self.append(LogRecord::RemoveItem { id: id.to_string() })
    }

    fn get_item(&self, id: &str) -> StoreResult<Option<SyncQueueItem>> {
        Ok(self.inner.lock().state.items.get(id).cloned())
    }

    fn list_items(&self) -> StoreResult<Vec<SyncQueueItem>> {
        Ok(self.inner.lock().state.list_items())
    }

    fn put_conflict(&self, conflict: &ConflictRecord) -> StoreResult<()> {
        self.append(LogRecord::PutConflict {
            conflict: conflict.clone(),
        })
    }

    fn get_conflict(&self, id: &str) -> StoreResult<Option<ConflictRecord>> {
        Ok(self.inner.lock().state.conflicts.get(id).cloned())
    }

    fn list_conflicts(&self) -> StoreResult<Vec<ConflictRecord>> {
        Ok(self.inner.lock().state.list_conflicts())
    }

    fn next_sequence(&self) -> StoreResult<u64> {
        let mut inner = self.inner.lock();
        inner.state.last_sequence += 1;
        Ok(inner.state.last_sequence)
    }
}

struct Recovered {
    state: StoreState,
    records: usize,
    valid_len: u64,
    torn_bytes: usize,
}

fn recover(path: &Path) -> StoreResult<Recovered> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    let mut state = StoreState::default();
    let mut records = 0;
    let mut offset = 0;

    while offset < bytes.len() {
        let rest = &bytes[offset..];
        // A final line without its newline was never fully written.
        let Some(len) = rest.iter().position(|&b| b == b'\n') else {
            break;
        };
        match decode(&rest[..len]) {
            Ok(record) => {
                record.apply(&mut state);
                records += 1;
            }
            Err(reason) if offset + len + 1 == bytes.len() => {
                debug!(offset = offset, reason = %reason, "Damaged final record");
                break;
            }
            Err(reason) => {
                return Err(StoreError::Corruption(format!(
                    "{}: record at byte {}: {}",
                    path.display(),
                    offset,
                    reason
                )));
            }
        }
        offset += len + 1;
    }

    Ok(Recovered {
        state,
        records,
        valid_len: offset as u64,
        torn_bytes: bytes.len() - offset,
    })
}

fn checksum(json: &str) -> String {
    let digest = Sha256::digest(json.as_bytes());
    hex::encode(&digest[..CHECKSUM_BYTES])
}

fn encode(record: &LogRecord) -> StoreResult<String> {
    let json = serde_json::to_string(record)?;
    Ok(format!("{} {}\n", checksum(&json), json))
}

fn decode(line: &[u8]) -> Result<LogRecord, String> {
    let line = std::str::from_utf8(line).map_err(|e| e.to_string())?;
    let (sum, json) = line
        .split_once(' ')
        .ok_or_else(|| "missing checksum".to_string())?;
    if sum != checksum(json) {
        return Err("checksum mismatch".to_string());
    }
    serde_json::from_str(json).map_err(|e| e.to_string())
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> StoreResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> StoreResult<()> {
    Ok(())
}
