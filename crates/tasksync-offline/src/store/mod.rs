//! Durable storage for queue items and conflict records.
//!
//! Writes return only once the record is durable for the backend in use,
//! so a mutation acknowledged by [`OfflineQueue::enqueue`](crate::OfflineQueue::enqueue)
//! survives a process restart.

mod file;
mod memory;
#[cfg(feature = "rocksdb-backend")]
mod rocks;

pub use file::{FileStore, FileStoreStats};
pub use memory::MemoryStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

use crate::error::StoreResult;
use crate::item::{ConflictRecord, SyncQueueItem};

/// Persistence for the offline queue.
pub trait SyncStore: Send + Sync {
    /// Insert or replace a queue item.
    fn put_item(&self, item: &SyncQueueItem) -> StoreResult<()>;

    /// Remove a queue item. Removing a missing item is not an error.
    fn remove_item(&self, id: &str) -> StoreResult<()>;

    /// Get a queue item by id.
    fn get_item(&self, id: &str) -> StoreResult<Option<SyncQueueItem>>;

    /// All queue items in enqueue order.
    fn list_items(&self) -> StoreResult<Vec<SyncQueueItem>>;

    /// Insert or replace a conflict record.
    fn put_conflict(&self, conflict: &ConflictRecord) -> StoreResult<()>;

    /// Get a conflict record by id.
    fn get_conflict(&self, id: &str) -> StoreResult<Option<ConflictRecord>>;

    /// All conflict records, oldest first.
    fn list_conflicts(&self) -> StoreResult<Vec<ConflictRecord>>;

    /// Reserve the next enqueue sequence number.
    fn next_sequence(&self) -> StoreResult<u64>;
}

fn sort_items(items: &mut [SyncQueueItem]) {
    items.sort_by_key(|item| item.sequence);
}

fn sort_conflicts(conflicts: &mut [ConflictRecord]) {
    conflicts.sort_by(|a, b| {
        a.detected_at
            .cmp(&b.detected_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}
