//! Queue items and conflict records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tasksync_realtime::MutationRequest;
use tasksync_types::{now_millis, MutationVerb, ResourceKind};

/// Kind of queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    /// Server verb for this operation.
    pub fn verb(self) -> MutationVerb {
        match self {
            OperationKind::Create => MutationVerb::Create,
            OperationKind::Update => MutationVerb::Update,
            OperationKind::Delete => MutationVerb::Delete,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb().as_str())
    }
}

/// Replay state of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Waiting to be sent.
    Pending,
    /// The server rejected it as a conflict; waiting for a resolution.
    Conflicted,
    /// Gave up; waiting for the user to retry or discard.
    Failed,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Conflicted => "conflicted",
            ItemStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A mutation made while offline, waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: String,
    /// Monotonic enqueue order.
    pub sequence: u64,
    pub kind: OperationKind,
    pub resource_kind: ResourceKind,
    pub resource_id: String,
    /// Local resource fields.
    pub payload: Value,
    /// Server version the local edit was based on.
    #[serde(default)]
    pub base_version: Option<u64>,
    /// Unix milliseconds when the user made the change.
    pub client_timestamp: u64,
    pub retry_count: u32,
    pub status: ItemStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Overwrite server state on replay.
    #[serde(default)]
    pub force: bool,
}

impl SyncQueueItem {
    /// Create a pending item. The sequence is assigned by the queue.
    pub fn new(
        kind: OperationKind,
        resource_kind: ResourceKind,
        resource_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sequence: 0,
            kind,
            resource_kind,
            resource_id: resource_id.into(),
            payload,
            base_version: None,
            client_timestamp: now_millis(),
            retry_count: 0,
            status: ItemStatus::Pending,
            last_error: None,
            force: false,
        }
    }

    /// Set the server version the edit was based on.
    pub fn with_base_version(mut self, version: u64) -> Self {
        self.base_version = Some(version);
        self
    }

    /// Key used for per-resource ordering.
    pub fn resource_key(&self) -> (ResourceKind, &str) {
        (self.resource_kind, self.resource_id.as_str())
    }

    /// Build the server request for this item.
    ///
    /// Forced items carry no base version.
    pub fn to_request(&self) -> MutationRequest {
        let mut fields = match &self.payload {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        for control in ["id", "base_version", "force"] {
            fields.remove(control);
        }
        MutationRequest {
            kind: self.resource_kind,
            verb: self.kind.verb(),
            resource_id: Some(self.resource_id.clone()),
            base_version: if self.force { None } else { self.base_version },
            force: self.force,
            fields,
        }
    }
}

/// How a conflict was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Re-issue the local mutation with `force`.
    KeepLocal,
    /// Drop the local mutation and accept the server state.
    KeepRemote,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::KeepLocal => f.write_str("keep_local"),
            Resolution::KeepRemote => f.write_str("keep_remote"),
        }
    }
}

/// A replayed mutation the server refused because its state had moved on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: String,
    pub queue_item_id: String,
    pub operation: OperationKind,
    pub resource_kind: ResourceKind,
    pub resource_id: String,
    pub local: Value,
    /// Server state; `None` when the resource was deleted remotely.
    pub remote: Option<Value>,
    pub detected_at: u64,
    pub resolved: bool,
    #[serde(default)]
    pub resolution: Option<Resolution>,
}

impl ConflictRecord {
    /// Record a conflict for a queue item.
    pub fn new(item: &SyncQueueItem, remote: Option<Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            queue_item_id: item.id.clone(),
            operation: item.kind,
            resource_kind: item.resource_kind,
            resource_id: item.resource_id.clone(),
            local: item.payload.clone(),
            remote,
            detected_at: now_millis(),
            resolved: false,
            resolution: None,
        }
    }

    /// Whether the server no longer has the resource.
    pub fn remotely_deleted(&self) -> bool {
        self.remote.is_none()
    }
}
