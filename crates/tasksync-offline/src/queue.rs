//! Durable offline mutation queue and replay.
//!
//! Items are replayed in enqueue order per resource. An item that cannot
//! be applied right now (deferred, conflicted or failed) holds back every
//! later item for the same resource, while other resources carry on.
//!
//! Edits made offline against the same server version form a chain: once
//! one of them is applied, the rest are moved onto the version the server
//! returned so they do not conflict with their own predecessor.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tasksync_types::ResourceKind;
use tracing::{debug, info, warn};

use crate::conflict::ConflictResolver;
use crate::error::{OfflineError, Result};
use crate::item::{ConflictRecord, ItemStatus, SyncQueueItem};
use crate::retry::RetryPolicy;
use crate::store::SyncStore;
use crate::transport::{SendError, SyncTransport};

/// A queued mutation the server accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncedItem {
    pub item: SyncQueueItem,
    /// Canonical resource returned by the server.
    pub resource: Value,
}

/// Outcome of a replay.
#[derive(Debug, Clone, Default)]
pub struct ReplayReport {
    /// Items applied by the server, in send order.
    pub synced: Vec<SyncedItem>,
    /// New conflicts.
    pub conflicts: Vec<ConflictRecord>,
    /// Items that reached the retry ceiling or were rejected.
    pub failed: Vec<SyncQueueItem>,
    /// Items left pending after a retriable failure in the last pass.
    pub deferred: usize,
    /// Items skipped in the last pass because an earlier item for the
    /// same resource could not be applied.
    pub held_back: usize,
    /// Passes over the queue.
    pub rounds: u32,
}

impl ReplayReport {
    fn merge(&mut self, pass: ReplayReport) {
        self.synced.extend(pass.synced);
        self.conflicts.extend(pass.conflicts);
        self.failed.extend(pass.failed);
        self.deferred = pass.deferred;
        self.held_back = pass.held_back;
        self.rounds += pass.rounds;
    }
}

/// Client-side queue of mutations made while disconnected.
pub struct OfflineQueue {
    store: Arc<dyn SyncStore>,
    resolver: ConflictResolver,
    policy: RetryPolicy,
    replay_lock: tokio::sync::Mutex<()>,
}

impl OfflineQueue {
    /// Create a queue with the default retry policy.
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self::with_policy(store, RetryPolicy::default())
    }

    /// Create a queue with a custom retry policy.
    pub fn with_policy(store: Arc<dyn SyncStore>, policy: RetryPolicy) -> Self {
        Self {
            resolver: ConflictResolver::new(store.clone()),
            store,
            policy,
            replay_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Conflict resolver sharing this queue's store.
    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    /// Retry policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Persist a mutation. Once this returns the item survives a restart.
    pub fn enqueue(&self, mut item: SyncQueueItem) -> Result<SyncQueueItem> {
        item.sequence = self.store.next_sequence()?;
        item.status = ItemStatus::Pending;
        item.retry_count = 0;
        item.last_error = None;
        self.store.put_item(&item)?;

        debug!(
            item_id = %item.id,
            sequence = item.sequence,
            operation = %item.kind,
            resource = %item.resource_kind,
            resource_id = %item.resource_id,
            "Mutation queued"
        );
        Ok(item)
    }

    /// All items in enqueue order.
    pub fn items(&self) -> Result<Vec<SyncQueueItem>> {
        Ok(self.store.list_items()?)
    }

    /// Items waiting to be sent.
    pub fn pending(&self) -> Result<Vec<SyncQueueItem>> {
        self.with_status(ItemStatus::Pending)
    }

    /// Items that gave up and wait for the user.
    pub fn failed(&self) -> Result<Vec<SyncQueueItem>> {
        self.with_status(ItemStatus::Failed)
    }

    fn with_status(&self, status: ItemStatus) -> Result<Vec<SyncQueueItem>> {
        Ok(self
            .items()?
            .into_iter()
            .filter(|i| i.status == status)
            .collect())
    }

    /// Number of queued items in any state.
    pub fn len(&self) -> Result<usize> {
        Ok(self.store.list_items()?.len())
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Reset a failed item so the next replay tries it again.
    pub fn retry_failed(&self, id: &str) -> Result<SyncQueueItem> {
        let mut item = self.get_with_status(id, ItemStatus::Failed)?;
        item.status = ItemStatus::Pending;
        item.retry_count = 0;
        item.last_error = None;
        self.store.put_item(&item)?;
        info!(item_id = %id, "Failed mutation reset for retry");
        Ok(item)
    }

    /// Drop a failed item after the user acknowledged it.
    pub fn discard(&self, id: &str) -> Result<SyncQueueItem> {
        let item = self.get_with_status(id, ItemStatus::Failed)?;
        self.store.remove_item(id)?;
        info!(item_id = %id, resource_id = %item.resource_id, "Failed mutation discarded");
        Ok(item)
    }

    fn get_with_status(&self, id: &str, status: ItemStatus) -> Result<SyncQueueItem> {
        let item = self
            .store
            .get_item(id)?
            .ok_or_else(|| OfflineError::ItemNotFound(id.to_string()))?;
        if item.status != status {
            return Err(OfflineError::InvalidState {
                id: id.to_string(),
                status: item.status,
            });
        }
        Ok(item)
    }

    /// Replay until nothing is deferred or every deferred item has used
    /// up its attempts, backing off between passes.
    pub async fn replay(&self, transport: &dyn SyncTransport) -> Result<ReplayReport> {
        let _guard = self.replay_lock.lock().await;
        let mut report = ReplayReport::default();

        loop {
            let pass = self.pass(transport).await?;
            let deferred = pass.deferred;
            report.merge(pass);

            if deferred == 0 || report.rounds >= self.policy.max_attempts {
                break;
            }
            let delay = self.policy.delay_for_attempt(report.rounds);
            debug!(
                deferred = deferred,
                delay_ms = delay.as_millis() as u64,
                "Backing off before next replay pass"
            );
            tokio::time::sleep(delay).await;
        }

        info!(
            synced = report.synced.len(),
            conflicts = report.conflicts.len(),
            failed = report.failed.len(),
            deferred = report.deferred,
            rounds = report.rounds,
            "Replay finished"
        );
        Ok(report)
    }

    /// A single pass over the queue.
    pub async fn replay_once(&self, transport: &dyn SyncTransport) -> Result<ReplayReport> {
        let _guard = self.replay_lock.lock().await;
        self.pass(transport).await
    }

    async fn pass(&self, transport: &dyn SyncTransport) -> Result<ReplayReport> {
        let mut report = ReplayReport {
            rounds: 1,
            ..Default::default()
        };
        let mut blocked: HashSet<(ResourceKind, String)> = HashSet::new();
        self.resolver.recover()?;

        for queued in self.store.list_items()? {
            // Earlier items in this pass may have rebased this one.
            let Some(mut item) = self.store.get_item(&queued.id)? else {
                continue;
            };
            let key = (item.resource_kind, item.resource_id.clone());
            if blocked.contains(&key) {
                report.held_back += 1;
                continue;
            }
            if item.status != ItemStatus::Pending {
                blocked.insert(key);
                continue;
            }

            match transport.send(&item.to_request()).await {
                Ok(resource) => {
                    self.store.remove_item(&item.id)?;
                    debug!(item_id = %item.id, resource_id = %item.resource_id, "Mutation synced");
                    self.rebase_followers(&item, &resource)?;
                    report.synced.push(SyncedItem { item, resource });
                }
                Err(SendError::Retriable(reason)) => {
                    item.retry_count += 1;
                    item.last_error = Some(reason.clone());
                    if item.retry_count >= self.policy.max_attempts {
                        item.status = ItemStatus::Failed;
                        warn!(
                            item_id = %item.id,
                            attempts = item.retry_count,
                            error = %reason,
                            "Mutation failed after retries"
                        );
                        self.store.put_item(&item)?;
                        report.failed.push(item);
                    } else {
                        debug!(
                            item_id = %item.id,
                            attempt = item.retry_count,
                            error = %reason,
                            "Mutation deferred"
                        );
                        self.store.put_item(&item)?;
                        report.deferred += 1;
                    }
                    blocked.insert(key);
                }
                Err(SendError::Conflict { remote }) => {
                    let record = self.resolver.detect(&mut item, remote)?;
                    report.conflicts.push(record);
                    blocked.insert(key);
                }
                Err(SendError::Rejected { code, message }) => {
                    item.status = ItemStatus::Failed;
                    item.last_error = Some(format!("{}: {}", code, message));
                    warn!(item_id = %item.id, code = %code, error = %message, "Mutation rejected");
                    self.store.put_item(&item)?;
                    report.failed.push(item);
                    blocked.insert(key);
                }
            }
        }
        Ok(report)
    }

    /// Move later items that were based on the same version as `synced`
    /// onto the version the server just produced.
    fn rebase_followers(&self, synced: &SyncQueueItem, resource: &Value) -> Result<()> {
        let (Some(old), Some(new)) = (
            synced.base_version,
            resource.get("version").and_then(Value::as_u64),
        ) else {
            return Ok(());
        };
        if old == new {
            return Ok(());
        }

        for mut follower in self.store.list_items()? {
            let same_resource = follower.resource_kind == synced.resource_kind
                && follower.resource_id == synced.resource_id;
            if !same_resource
                || follower.sequence <= synced.sequence
                || follower.status == ItemStatus::Conflicted
                || follower.base_version != Some(old)
            {
                continue;
            }
            follower.base_version = Some(new);
            self.store.put_item(&follower)?;
            debug!(
                item_id = %follower.id,
                resource_id = %follower.resource_id,
                from = old,
                to = new,
                "Queued mutation rebased"
            );
        }
        Ok(())
    }
}
