//! Client-side view of a user's resources, kept current from server events.
//!
//! Events are idempotent upserts keyed by resource id: redelivered or
//! stale events (older `version`) leave the state unchanged.

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use tasksync_realtime::{EventName, Notification, OutboundEvent};
use tasksync_types::{MutationVerb, PresenceStatus, ResourceKind, UserId};
use tracing::{debug, trace};

use crate::conflict::ResolutionOutcome;
use crate::queue::SyncedItem;

/// Event ids remembered for duplicate detection.
const SEEN_CAPACITY: usize = 1024;

/// What applying an event changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Upserted { kind: ResourceKind, id: String },
    Removed { kind: ResourceKind, id: String },
    Reordered { count: usize },
    Presence { user_id: UserId, status: PresenceStatus },
    Typing { user_id: UserId, task_id: String, typing: bool },
    Notification,
    Activity,
    /// Already applied, or older than the local copy.
    Unchanged,
}

#[derive(Default)]
struct SeenEvents {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenEvents {
    /// Returns false if the id was already seen.
    fn insert(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        if self.order.len() > SEEN_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }
}

type Key = (ResourceKind, String);

/// Local resource cache plus the presence of watched users.
#[derive(Default)]
pub struct LocalState {
    resources: RwLock<HashMap<Key, Value>>,
    presence: RwLock<HashMap<UserId, PresenceStatus>>,
    typing: RwLock<HashSet<(UserId, String)>>,
    notifications: Mutex<Vec<Notification>>,
    seen: Mutex<SeenEvents>,
}

impl LocalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a server event.
    pub fn apply_event(&self, event: &OutboundEvent) -> Applied {
        if !self.seen.lock().insert(&event.event_id) {
            trace!(event_id = %event.event_id, "Duplicate event");
            return Applied::Unchanged;
        }

        if let Some((kind, verb)) = event.event.as_mutation() {
            return match verb {
                MutationVerb::Create | MutationVerb::Update => {
                    self.upsert(kind, event.data.clone())
                }
                MutationVerb::Delete => match resource_id(&event.data) {
                    Some(id) => self.remove(kind, &id),
                    None => Applied::Unchanged,
                },
                MutationVerb::Reorder => self.reorder(kind, &event.data),
            };
        }

        match event.event {
            EventName::PresenceOnline | EventName::PresenceOffline | EventName::PresenceStatus => {
                let user_id = event.data.get("user_id").and_then(Value::as_str);
                let status = event
                    .data
                    .get("status")
                    .and_then(|s| serde_json::from_value::<PresenceStatus>(s.clone()).ok());
                match (user_id, status) {
                    (Some(user), Some(status)) => {
                        let user_id = UserId::new(user);
                        if status == PresenceStatus::Offline {
                            self.presence.write().remove(&user_id);
                            self.typing.write().retain(|(u, _)| u != &user_id);
                        } else {
                            self.presence.write().insert(user_id.clone(), status);
                        }
                        Applied::Presence { user_id, status }
                    }
                    _ => Applied::Unchanged,
                }
            }
            EventName::PresenceTyping => {
                let user = event.data.get("user_id").and_then(Value::as_str);
                let task = event.data.get("task_id").and_then(Value::as_str);
                let typing = event.data.get("typing").and_then(Value::as_bool);
                match (user, task, typing) {
                    (Some(user), Some(task), Some(typing)) => {
                        let key = (UserId::new(user), task.to_string());
                        if typing {
                            self.typing.write().insert(key.clone());
                        } else {
                            self.typing.write().remove(&key);
                        }
                        Applied::Typing {
                            user_id: key.0,
                            task_id: key.1,
                            typing,
                        }
                    }
                    _ => Applied::Unchanged,
                }
            }
            EventName::Notification => {
                match serde_json::from_value::<Notification>(event.data.clone()) {
                    Ok(n) => {
                        self.notifications.lock().push(n);
                        Applied::Notification
                    }
                    Err(e) => {
                        debug!(error = %e, "Malformed notification");
                        Applied::Unchanged
                    }
                }
            }
            EventName::ActivityFeed => Applied::Activity,
            _ => Applied::Unchanged,
        }
    }

    /// Record a change made locally, before it reaches the server.
    pub fn apply_local(&self, kind: ResourceKind, id: &str, resource: Option<Value>) {
        let key = (kind, id.to_string());
        match resource {
            Some(value) => {
                self.resources.write().insert(key, value);
            }
            None => {
                self.resources.write().remove(&key);
            }
        }
    }

    /// Adopt the server's copy after a replayed mutation succeeded.
    pub fn apply_synced(&self, synced: &SyncedItem) -> Applied {
        let kind = synced.item.resource_kind;
        if synced.resource.get("deleted").and_then(Value::as_bool) == Some(true) {
            return self.remove(kind, &synced.item.resource_id);
        }
        self.upsert(kind, synced.resource.clone())
    }

    /// Apply the local side of a conflict resolution.
    pub fn apply_resolution(&self, outcome: &ResolutionOutcome) {
        if let ResolutionOutcome::AcceptRemote {
            resource_kind,
            resource_id,
            remote,
        } = outcome
        {
            self.apply_local(*resource_kind, resource_id, remote.clone());
        }
    }

    /// Current local copy of a resource.
    pub fn get(&self, kind: ResourceKind, id: &str) -> Option<Value> {
        self.resources.read().get(&(kind, id.to_string())).cloned()
    }

    /// Number of cached resources of a kind.
    pub fn count(&self, kind: ResourceKind) -> usize {
        self.resources.read().keys().filter(|(k, _)| *k == kind).count()
    }

    /// Last known status of a watched user.
    pub fn presence(&self, user_id: &UserId) -> PresenceStatus {
        self.presence
            .read()
            .get(user_id)
            .copied()
            .unwrap_or(PresenceStatus::Offline)
    }

    /// Whether `user_id` is typing in `task_id`.
    pub fn is_typing(&self, user_id: &UserId, task_id: &str) -> bool {
        self.typing
            .read()
            .contains(&(user_id.clone(), task_id.to_string()))
    }

    /// Notifications received so far.
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    fn upsert(&self, kind: ResourceKind, data: Value) -> Applied {
        let Some(id) = resource_id(&data) else {
            return Applied::Unchanged;
        };
        let key = (kind, id.clone());
        let mut resources = self.resources.write();
        if let (Some(current), Some(incoming)) = (
            resources.get(&key).and_then(version),
            version(&data),
        ) {
            if incoming <= current {
                return Applied::Unchanged;
            }
        }
        resources.insert(key, data);
        Applied::Upserted { kind, id }
    }

    fn remove(&self, kind: ResourceKind, id: &str) -> Applied {
        match self.resources.write().remove(&(kind, id.to_string())) {
            Some(_) => Applied::Removed {
                kind,
                id: id.to_string(),
            },
            None => Applied::Unchanged,
        }
    }

    fn reorder(&self, kind: ResourceKind, data: &Value) -> Applied {
        let Some(items) = data.get("items").and_then(Value::as_array) else {
            return Applied::Unchanged;
        };
        let mut resources = self.resources.write();
        let mut count = 0;
        for item in items {
            let (Some(id), Some(position)) = (
                item.get("id").and_then(Value::as_str),
                item.get("position"),
            ) else {
                continue;
            };
            if let Some(Value::Object(fields)) = resources.get_mut(&(kind, id.to_string())) {
                fields.insert("position".into(), position.clone());
                count += 1;
            }
        }
        Applied::Reordered { count }
    }
}

fn resource_id(data: &Value) -> Option<String> {
    match data.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn version(data: &Value) -> Option<u64> {
    data.get("version").and_then(Value::as_u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(name: EventName, data: Value) -> OutboundEvent {
        OutboundEvent::new(name, data)
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let state = LocalState::new();
        let created = event(
            EventName::TodoCreated,
            json!({"id": "t1", "title": "A", "version": 1}),
        );
        assert!(matches!(state.apply_event(&created), Applied::Upserted { .. }));
        assert_eq!(state.apply_event(&created), Applied::Unchanged);

        // Same content under a new event id: version guards it.
        let again = event(
            EventName::TodoUpdated,
            json!({"id": "t1", "title": "A", "version": 1}),
        );
        assert_eq!(state.apply_event(&again), Applied::Unchanged);

        let newer = event(
            EventName::TodoUpdated,
            json!({"id": "t1", "title": "B", "version": 2}),
        );
        state.apply_event(&newer);
        assert_eq!(state.get(ResourceKind::Task, "t1").unwrap()["title"], "B");
        assert_eq!(state.count(ResourceKind::Task), 1);
    }

    #[test]
    fn test_stale_event_is_ignored() {
        let state = LocalState::new();
        state.apply_event(&event(
            EventName::TagUpdated,
            json!({"id": "g1", "name": "new", "version": 5}),
        ));
        state.apply_event(&event(
            EventName::TagUpdated,
            json!({"id": "g1", "name": "old", "version": 3}),
        ));
        assert_eq!(state.get(ResourceKind::Tag, "g1").unwrap()["name"], "new");
    }

    #[test]
    fn test_delete_and_reorder() {
        let state = LocalState::new();
        for id in ["t1", "t2"] {
            state.apply_event(&event(
                EventName::TodoCreated,
                json!({"id": id, "version": 1, "position": 0}),
            ));
        }
        let applied = state.apply_event(&event(
            EventName::TodoReordered,
            json!({"items": [{"id": "t1", "position": 2}, {"id": "gone", "position": 3}]}),
        ));
        assert_eq!(applied, Applied::Reordered { count: 1 });
        assert_eq!(state.get(ResourceKind::Task, "t1").unwrap()["position"], 2);

        state.apply_event(&event(
            EventName::TodoDeleted,
            json!({"id": "t2", "deleted": true}),
        ));
        assert!(state.get(ResourceKind::Task, "t2").is_none());
    }

    #[test]
    fn test_presence_and_typing() {
        let state = LocalState::new();
        let bob = UserId::new("bob");
        state.apply_event(&event(
            EventName::PresenceOnline,
            json!({"user_id": "bob", "status": "online"}),
        ));
        state.apply_event(&event(
            EventName::PresenceTyping,
            json!({"user_id": "bob", "task_id": "t1", "typing": true}),
        ));
        assert_eq!(state.presence(&bob), PresenceStatus::Online);
        assert!(state.is_typing(&bob, "t1"));

        state.apply_event(&event(
            EventName::PresenceOffline,
            json!({"user_id": "bob", "status": "offline"}),
        ));
        assert_eq!(state.presence(&bob), PresenceStatus::Offline);
        assert!(!state.is_typing(&bob, "t1"));
    }

    #[test]
    fn test_keep_remote_outcome_replaces_local_copy() {
        let state = LocalState::new();
        state.apply_local(ResourceKind::Task, "t1", Some(json!({"id": "t1", "title": "Local"})));
        state.apply_resolution(&ResolutionOutcome::AcceptRemote {
            resource_kind: ResourceKind::Task,
            resource_id: "t1".into(),
            remote: None,
        });
        assert!(state.get(ResourceKind::Task, "t1").is_none());
    }
}
