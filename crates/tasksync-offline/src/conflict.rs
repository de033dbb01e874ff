//! Conflict detection and user-driven resolution.
//!
//! Conflicts are never settled automatically. A record stays unresolved
//! until the user picks [`Resolution::KeepLocal`] or
//! [`Resolution::KeepRemote`]; meanwhile only the conflicted resource is
//! held back.

use serde_json::Value;
use std::sync::Arc;
use tasksync_types::ResourceKind;
use tracing::{info, warn};

use crate::error::{OfflineError, Result};
use crate::item::{ConflictRecord, ItemStatus, Resolution, SyncQueueItem};
use crate::store::SyncStore;

/// What the caller must do after a resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionOutcome {
    /// The local mutation is queued again with `force`; replay it.
    Requeued(SyncQueueItem),
    /// The local mutation was dropped; apply the server state locally.
    AcceptRemote {
        resource_kind: ResourceKind,
        resource_id: String,
        /// `None` when the server no longer has the resource.
        remote: Option<Value>,
    },
}

/// Records conflicts found during replay and applies user decisions.
#[derive(Clone)]
pub struct ConflictResolver {
    store: Arc<dyn SyncStore>,
}

impl ConflictResolver {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    /// Mark `item` conflicted and persist a record with both versions.
    pub fn detect(&self, item: &mut SyncQueueItem, remote: Option<Value>) -> Result<ConflictRecord> {
        item.status = ItemStatus::Conflicted;
        item.last_error = Some(match remote {
            Some(_) => "resource changed on the server".to_string(),
            None => "resource deleted on the server".to_string(),
        });
        let record = ConflictRecord::new(item, remote);

        self.store.put_item(item)?;
        self.store.put_conflict(&record)?;

        warn!(
            conflict_id = %record.id,
            item_id = %item.id,
            resource = %item.resource_kind,
            resource_id = %item.resource_id,
            remotely_deleted = record.remotely_deleted(),
            "Replay conflict"
        );
        Ok(record)
    }

    /// Conflicts waiting for a decision, oldest first.
    pub fn unresolved(&self) -> Result<Vec<ConflictRecord>> {
        Ok(self
            .store
            .list_conflicts()?
            .into_iter()
            .filter(|c| !c.resolved)
            .collect())
    }

    /// Every conflict record, resolved or not.
    pub fn all(&self) -> Result<Vec<ConflictRecord>> {
        Ok(self.store.list_conflicts()?)
    }

    /// Look up a conflict.
    pub fn get(&self, id: &str) -> Result<ConflictRecord> {
        self.store
            .get_conflict(id)?
            .ok_or_else(|| OfflineError::ConflictNotFound(id.to_string()))
    }

    /// Apply the user's decision.
    ///
    /// The resolved conflict record is written before the queue item
    /// changes. If the item write is lost, [`ConflictResolver::recover`]
    /// finishes the job from the record.
    pub fn resolve(&self, id: &str, resolution: Resolution) -> Result<ResolutionOutcome> {
        let mut conflict = self.get(id)?;
        if conflict.resolved {
            return Err(OfflineError::AlreadyResolved(id.to_string()));
        }
        let item = match resolution {
            Resolution::KeepLocal => Some(
                self.store
                    .get_item(&conflict.queue_item_id)?
                    .ok_or_else(|| OfflineError::ItemNotFound(conflict.queue_item_id.clone()))?,
            ),
            Resolution::KeepRemote => None,
        };

        conflict.resolved = true;
        conflict.resolution = Some(resolution);
        self.store.put_conflict(&conflict)?;

        let outcome = self.settle(&conflict, resolution, item)?;
        info!(
            conflict_id = %conflict.id,
            resolution = %resolution,
            resource_id = %conflict.resource_id,
            "Conflict resolved"
        );
        Ok(outcome)
    }

    /// Finish resolutions whose queue item was not updated, e.g. after a
    /// crash between the two writes. Returns how many were finished.
    pub fn recover(&self) -> Result<usize> {
        let conflicts = self.store.list_conflicts()?;
        let mut finished = 0;
        for item in self.store.list_items()? {
            if item.status != ItemStatus::Conflicted {
                continue;
            }
            let for_item = || conflicts.iter().filter(|c| c.queue_item_id == item.id);
            if for_item().any(|c| !c.resolved) {
                continue;
            }
            let Some((conflict, resolution)) = for_item()
                .filter_map(|c| c.resolution.map(|r| (c, r)))
                .last()
            else {
                continue;
            };
            warn!(
                conflict_id = %conflict.id,
                item_id = %item.id,
                resolution = %resolution,
                "Finishing interrupted conflict resolution"
            );
            self.settle(conflict, resolution, Some(item.clone()))?;
            finished += 1;
        }
        Ok(finished)
    }

    fn settle(
        &self,
        conflict: &ConflictRecord,
        resolution: Resolution,
        item: Option<SyncQueueItem>,
    ) -> Result<ResolutionOutcome> {
        match (resolution, item) {
            (Resolution::KeepLocal, Some(mut item)) => {
                item.force = true;
                item.status = ItemStatus::Pending;
                item.retry_count = 0;
                item.last_error = None;
                self.store.put_item(&item)?;
                Ok(ResolutionOutcome::Requeued(item))
            }
            (Resolution::KeepLocal, None) => {
                Err(OfflineError::ItemNotFound(conflict.queue_item_id.clone()))
            }
            (Resolution::KeepRemote, _) => {
                self.store.remove_item(&conflict.queue_item_id)?;
                Ok(ResolutionOutcome::AcceptRemote {
                    resource_kind: conflict.resource_kind,
                    resource_id: conflict.resource_id.clone(),
                    remote: conflict.remote.clone(),
                })
            }
        }
    }
}
