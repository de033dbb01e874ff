//! Mutation persistence seam.
//!
//! The hub never persists anything itself: it hands each validated
//! mutation to a [`MutationBackend`] and only emits events for what the
//! backend accepted. [`MemoryBackend`] is a versioned reference store for
//! development and tests.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tasksync_types::{now_millis, MutationVerb, ResourceKind, UserId};
use thiserror::Error;

use crate::protocol::MutationRequest;

/// Errors returned by a mutation backend.
#[derive(Debug, Error)]
pub enum MutationError {
    /// The request was well-formed but rejected.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The resource does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// The resource changed since the client's base version, or was
    /// deleted. `current` is the server state, `None` if deleted.
    #[error("resource was modified or deleted remotely")]
    Conflict { current: Option<Value> },

    /// Storage is temporarily unavailable; the client may retry.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MutationError {
    /// Stable code carried in ack error objects.
    pub fn code(&self) -> &'static str {
        match self {
            MutationError::Validation(_) => "VALIDATION_ERROR",
            MutationError::NotFound(_) => "NOT_FOUND",
            MutationError::Conflict { .. } => "CONFLICT",
            MutationError::Unavailable(_) => "UNAVAILABLE",
            MutationError::Internal(_) => "INTERNAL",
        }
    }
}

/// Persists mutations on behalf of a user.
#[async_trait]
pub trait MutationBackend: Send + Sync + 'static {
    /// Apply a mutation and return the canonical persisted resource.
    async fn apply(&self, owner: &UserId, request: &MutationRequest)
        -> Result<Value, MutationError>;
}

#[derive(Debug, Clone)]
struct Record {
    fields: Map<String, Value>,
    version: u64,
}

impl Record {
    fn to_value(&self, id: &str) -> Value {
        let mut map = self.fields.clone();
        map.insert("id".into(), Value::String(id.to_string()));
        map.insert("version".into(), json!(self.version));
        Value::Object(map)
    }
}

type Key = (UserId, ResourceKind, String);

/// In-memory, versioned resource store.
///
/// Non-forced updates and deletes of a missing resource, and updates
/// whose `base_version` is stale, are conflicts. Forced mutations always
/// win: a forced update of a deleted resource re-creates it and a forced
/// delete of a missing resource succeeds.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<Key, Record>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of a resource.
    pub fn get(&self, owner: &UserId, kind: ResourceKind, id: &str) -> Option<Value> {
        self.records
            .read()
            .get(&(owner.clone(), kind, id.to_string()))
            .map(|r| r.to_value(id))
    }

    /// Number of stored resources across all users.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn apply_sync(&self, owner: &UserId, req: &MutationRequest) -> Result<Value, MutationError> {
        let mut records = self.records.write();

        let id = match (&req.resource_id, req.verb) {
            (_, MutationVerb::Reorder) => return reorder(&mut records, owner, req),
            (Some(id), _) => id.clone(),
            (None, MutationVerb::Create) => uuid::Uuid::new_v4().to_string(),
            (None, _) => return Err(MutationError::Validation("id is required".into())),
        };
        let key = (owner.clone(), req.kind, id.clone());
        let existing = records.get(&key);

        match req.verb {
            MutationVerb::Create => {
                if let Some(existing) = existing {
                    if !req.force {
                        return Err(MutationError::Conflict {
                            current: Some(existing.to_value(&id)),
                        });
                    }
                }
                let version = existing.map_or(1, |r| r.version + 1);
                let mut fields = req.fields.clone();
                fields
                    .entry("created_at")
                    .or_insert_with(|| json!(now_millis()));
                let record = Record { fields, version };
                let value = record.to_value(&id);
                records.insert(key, record);
                Ok(value)
            }
            MutationVerb::Update => {
                let record = match (existing, req.force) {
                    (None, false) => return Err(MutationError::Conflict { current: None }),
                    (None, true) => Record {
                        fields: req.fields.clone(),
                        version: 1,
                    },
                    (Some(current), force) => {
                        if !force && req.base_version.is_some_and(|v| v != current.version) {
                            return Err(MutationError::Conflict {
                                current: Some(current.to_value(&id)),
                            });
                        }
                        let mut fields = current.fields.clone();
                        for (k, v) in &req.fields {
                            fields.insert(k.clone(), v.clone());
                        }
                        Record {
                            fields,
                            version: current.version + 1,
                        }
                    }
                };
                let value = record.to_value(&id);
                records.insert(key, record);
                Ok(value)
            }
            MutationVerb::Delete => match existing {
                None if req.force => Ok(json!({ "id": id, "deleted": true })),
                None => Err(MutationError::Conflict { current: None }),
                Some(current) => {
                    if !req.force && req.base_version.is_some_and(|v| v != current.version) {
                        return Err(MutationError::Conflict {
                            current: Some(current.to_value(&id)),
                        });
                    }
                    records.remove(&key);
                    Ok(json!({ "id": id, "deleted": true }))
                }
            },
            MutationVerb::Reorder => reorder(&mut records, owner, req),
        }
    }
}

fn reorder(
    records: &mut HashMap<Key, Record>,
    owner: &UserId,
    req: &MutationRequest,
) -> Result<Value, MutationError> {
    let items = req
        .fields
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| MutationError::Validation("items must be an array".into()))?;

    let mut applied = Vec::with_capacity(items.len());
    for item in items {
        let id = item
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| MutationError::Validation("each item needs an id".into()))?;
        let position = item
            .get("position")
            .and_then(Value::as_i64)
            .ok_or_else(|| MutationError::Validation("each item needs a position".into()))?;

        // Items deleted elsewhere are skipped; ordering is advisory.
        if let Some(record) = records.get_mut(&(owner.clone(), req.kind, id.to_string())) {
            record.fields.insert("position".into(), json!(position));
            record.version += 1;
            applied.push(json!({ "id": id, "position": position }));
        }
    }
    Ok(json!({ "items": applied }))
}

#[async_trait]
impl MutationBackend for MemoryBackend {
    async fn apply(
        &self,
        owner: &UserId,
        request: &MutationRequest,
    ) -> Result<Value, MutationError> {
        self.apply_sync(owner, request)
    }
}
