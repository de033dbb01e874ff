//! Per-user activity feed with bounded retention.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tasksync_types::{now_millis, MutationVerb, ResourceKind, UserId};

use crate::registry::ShardedRegistry;

/// Retention limits for the activity feed.
#[derive(Debug, Clone)]
pub struct ActivityConfig {
    /// Events kept per user.
    pub max_per_user: usize,
    /// Events older than this are pruned.
    pub max_age: Duration,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            max_per_user: 100,
            max_age: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// What the actor did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityAction {
    Created,
    Updated,
    Completed,
    Deleted,
    Shared,
}

impl ActivityAction {
    /// Action for a mutation. Reorders are not feed-worthy, and an update
    /// whose `changes` set `completed: true` is reported as a completion.
    ///
    /// `changes` holds the fields the client sent, not the saved record:
    /// a completed task that is later retitled is an update.
    pub fn from_mutation(verb: MutationVerb, changes: &Value) -> Option<Self> {
        match verb {
            MutationVerb::Create => Some(ActivityAction::Created),
            MutationVerb::Update if changes.get("completed") == Some(&Value::Bool(true)) => {
                Some(ActivityAction::Completed)
            }
            MutationVerb::Update => Some(ActivityAction::Updated),
            MutationVerb::Delete => Some(ActivityAction::Deleted),
            MutationVerb::Reorder => None,
        }
    }
}

/// One entry of a user's activity feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: String,
    pub actor: UserId,
    pub action: ActivityAction,
    pub entity_kind: ResourceKind,
    pub entity_id: String,
    /// Display title of the entity at the time of the action.
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub metadata: Value,
    /// Unix milliseconds.
    pub timestamp: u64,
}

impl ActivityEvent {
    /// Create an event stamped now.
    pub fn new(
        actor: UserId,
        action: ActivityAction,
        entity_kind: ResourceKind,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            actor,
            action,
            entity_kind,
            entity_id: entity_id.into(),
            title: String::new(),
            metadata: Value::Null,
            timestamp: now_millis(),
        }
    }

    /// Set the display title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Derive a feed entry from a persisted mutation.
    ///
    /// Identity and title come from the saved `payload` (`id`, then `title`
    /// or `name`); the action comes from the requested `changes`.
    pub fn from_mutation(
        actor: &UserId,
        kind: ResourceKind,
        verb: MutationVerb,
        payload: &Value,
        changes: &Value,
    ) -> Option<Self> {
        let action = ActivityAction::from_mutation(verb, changes)?;
        let entity_id = match payload.get("id")? {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let title = payload
            .get("title")
            .or_else(|| payload.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        Some(Self::new(actor.clone(), action, kind, entity_id).with_title(title))
    }
}

/// In-memory activity log, newest last.
#[derive(Debug, Default)]
pub struct ActivityLog {
    config: ActivityConfig,
    feeds: ShardedRegistry<VecDeque<ActivityEvent>>,
}

impl ActivityLog {
    /// Create a log with the given retention.
    pub fn new(config: ActivityConfig) -> Self {
        Self {
            config,
            feeds: ShardedRegistry::default(),
        }
    }

    /// Append an event, pruning the actor's feed.
    pub fn append(&self, event: ActivityEvent) {
        let cutoff = self.cutoff();
        let max = self.config.max_per_user;
        let actor = event.actor.clone();
        self.feeds.mutate(&actor, |slot| {
            let feed = slot.get_or_insert_with(VecDeque::new);
            feed.push_back(event);
            trim(feed, max, cutoff);
        });
    }

    /// Most recent events for `user`, newest first.
    pub fn recent(&self, user: &UserId, limit: usize) -> Vec<ActivityEvent> {
        let cutoff = self.cutoff();
        self.feeds.read(user, |feed| {
            feed.map(|f| {
                f.iter()
                    .rev()
                    .filter(|e| e.timestamp >= cutoff)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
        })
    }

    /// Drop expired events across all users. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let cutoff = self.cutoff();
        let max = self.config.max_per_user;
        let mut removed = 0;
        self.feeds.retain(|_, feed| {
            let before = feed.len();
            trim(feed, max, cutoff);
            removed += before - feed.len();
            !feed.is_empty()
        });
        removed
    }

    /// Number of users with a non-empty feed.
    pub fn user_count(&self) -> usize {
        self.feeds.len()
    }

    fn cutoff(&self) -> u64 {
        now_millis().saturating_sub(self.config.max_age.as_millis() as u64)
    }
}

fn trim(feed: &mut VecDeque<ActivityEvent>, max: usize, cutoff: u64) {
    while feed.front().is_some_and(|e| e.timestamp < cutoff) {
        feed.pop_front();
    }
    while feed.len() > max {
        feed.pop_front();
    }
}
