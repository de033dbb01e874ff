//! RocksDB store.

use parking_lot::Mutex;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteOptions, DB};
use serde::de::DeserializeOwned;
use std::path::Path;
use tracing::info;

use super::{sort_conflicts, sort_items, SyncStore};
use crate::error::{StoreError, StoreResult};
use crate::item::{ConflictRecord, SyncQueueItem};

/// Column family names.
const CF_QUEUE: &str = "queue";
const CF_CONFLICTS: &str = "conflicts";
const CF_META: &str = "meta";

const LAST_SEQUENCE_KEY: &[u8] = b"last_sequence";

fn rocks_err(e: rocksdb::Error) -> StoreError {
    StoreError::Io(std::io::Error::other(e.to_string()))
}

/// Durable store backed by RocksDB. Every write is synced.
pub struct RocksStore {
    db: DB,
    last_sequence: Mutex<u64>,
}

impl RocksStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = [CF_QUEUE, CF_CONFLICTS, CF_META]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect::<Vec<_>>();
        let db = DB::open_cf_descriptors(&opts, path.as_ref(), cfs).map_err(rocks_err)?;

        let mut store = Self {
            db,
            last_sequence: Mutex::new(0),
        };
        let stored = store
            .db
            .get_cf(store.cf(CF_META)?, LAST_SEQUENCE_KEY)
            .map_err(rocks_err)?
            .map(|raw| decode_sequence(&raw))
            .transpose()?
            .unwrap_or(0);
        let highest = store
            .list_items()?
            .last()
            .map(|item| item.sequence)
            .unwrap_or(0);
        store.last_sequence = Mutex::new(stored.max(highest));

        info!(path = %path.as_ref().display(), "Opened RocksDB offline store");
        Ok(store)
    }

    fn cf(&self, name: &str) -> StoreResult<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Corruption(format!("missing column family {}", name)))
    }

    fn put<T: serde::Serialize>(&self, cf: &str, key: &str, value: &T) -> StoreResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.db
            .put_cf_opt(self.cf(cf)?, key.as_bytes(), bytes, &synced())
            .map_err(rocks_err)
    }

    fn get<T: DeserializeOwned>(&self, cf: &str, key: &str) -> StoreResult<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key.as_bytes()).map_err(rocks_err)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn all<T: DeserializeOwned>(&self, cf: &str) -> StoreResult<Vec<T>> {
        let mut out = Vec::new();
        for entry in self.db.iterator_cf(self.cf(cf)?, IteratorMode::Start) {
            let (_, value) = entry.map_err(rocks_err)?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }
}

fn synced() -> WriteOptions {
    let mut opts = WriteOptions::default();
    opts.set_sync(true);
    opts
}

fn decode_sequence(raw: &[u8]) -> StoreResult<u64> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| StoreError::Corruption("invalid sequence record".to_string()))?;
    Ok(u64::from_be_bytes(bytes))
}

impl SyncStore for RocksStore {
    fn put_item(&self, item: &SyncQueueItem) -> StoreResult<()> {
        self.put(CF_QUEUE, &item.id, item)
    }

    fn remove_item(&self, id: &str) -> StoreResult<()> {
        self.db
            .delete_cf_opt(self.cf(CF_QUEUE)?, id.as_bytes(), &synced())
            .map_err(rocks_err)
    }

    fn get_item(&self, id: &str) -> StoreResult<Option<SyncQueueItem>> {
        self.get(CF_QUEUE, id)
    }

    fn list_items(&self) -> StoreResult<Vec<SyncQueueItem>> {
        let mut items = self.all(CF_QUEUE)?;
        sort_items(&mut items);
        Ok(items)
    }

    fn put_conflict(&self, conflict: &ConflictRecord) -> StoreResult<()> {
        self.put(CF_CONFLICTS, &conflict.id, conflict)
    }

    fn get_conflict(&self, id: &str) -> StoreResult<Option<ConflictRecord>> {
        self.get(CF_CONFLICTS, id)
    }

    fn list_conflicts(&self) -> StoreResult<Vec<ConflictRecord>> {
        let mut conflicts = self.all(CF_CONFLICTS)?;
        sort_conflicts(&mut conflicts);
        Ok(conflicts)
    }

    fn next_sequence(&self) -> StoreResult<u64> {
        let mut last = self.last_sequence.lock();
        let next = *last + 1;
        self.db
            .put_cf_opt(
                self.cf(CF_META)?,
                LAST_SEQUENCE_KEY,
                next.to_be_bytes(),
                &synced(),
            )
            .map_err(rocks_err)?;
        *last = next;
        Ok(next)
    }
}
