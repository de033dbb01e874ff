//! In-memory store for tests.

use parking_lot::RwLock;
use std::collections::HashMap;

use super::{sort_conflicts, sort_items, SyncStore};
use crate::error::StoreResult;
use crate::item::{ConflictRecord, SyncQueueItem};

/// Store state, also used as the index behind [`FileStore`](super::FileStore).
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    pub(crate) items: HashMap<String, SyncQueueItem>,
    pub(crate) conflicts: HashMap<String, ConflictRecord>,
    pub(crate) last_sequence: u64,
}

impl StoreState {
    pub(crate) fn put_item(&mut self, item: &SyncQueueItem) {
        self.last_sequence = self.last_sequence.max(item.sequence);
        self.items.insert(item.id.clone(), item.clone());
    }

    pub(crate) fn list_items(&self) -> Vec<SyncQueueItem> {
        let mut items: Vec<_> = self.items.values().cloned().collect();
        sort_items(&mut items);
        items
    }

    pub(crate) fn list_conflicts(&self) -> Vec<ConflictRecord> {
        let mut conflicts: Vec<_> = self.conflicts.values().cloned().collect();
        sort_conflicts(&mut conflicts);
        conflicts
    }
}

/// Volatile store; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SyncStore for MemoryStore {
    fn put_item(&self, item: &SyncQueueItem) -> StoreResult<()> {
        self.state.write().put_item(item);
        Ok(())
    }

    fn remove_item(&self, id: &str) -> StoreResult<()> {
        self.state.write().items.remove(id);
        Ok(())
    }

    fn get_item(&self, id: &str) -> StoreResult<Option<SyncQueueItem>> {
        Ok(self.state.read().items.get(id).cloned())
    }

    fn list_items(&self) -> StoreResult<Vec<SyncQueueItem>> {
        Ok(self.state.read().list_items())
    }

    fn put_conflict(&self, conflict: &ConflictRecord) -> StoreResult<()> {
        self.state
            .write()
            .conflicts
            .insert(conflict.id.clone(), conflict.clone());
        Ok(())
    }

    fn get_conflict(&self, id: &str) -> StoreResult<Option<ConflictRecord>> {
        Ok(self.state.read().conflicts.get(id).cloned())
    }

    fn list_conflicts(&self) -> StoreResult<Vec<ConflictRecord>> {
        Ok(self.state.read().list_conflicts())
    }

    fn next_sequence(&self) -> StoreResult<u64> {
        let mut state = self.state.write();
        state.last_sequence += 1;
        Ok(state.last_sequence)
    }
}
