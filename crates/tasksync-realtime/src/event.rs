//! Server-to-client event types.

use serde::{Deserialize, Serialize};
use tasksync_types::{now_millis, MutationVerb, ResourceKind};

/// An event pushed to connected clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent {
    /// Event name (`todo:created`, `presence:typing`, ...).
    pub event: EventName,

    /// Event payload data.
    pub data: serde_json::Value,

    /// Unix timestamp (milliseconds) when the event was emitted.
    pub timestamp: u64,

    /// Unique event ID. Lets clients drop duplicates.
    pub event_id: String,
}

impl OutboundEvent {
    /// Create a new outbound event.
    pub fn new(event: EventName, data: serde_json::Value) -> Self {
        Self {
            event,
            data,
            timestamp: now_millis(),
            event_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Category used on the cross-node bridge.
    pub fn category(&self) -> EventCategory {
        self.event.category()
    }
}

/// Every notification the server can push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventName {
    #[serde(rename = "todo:created")]
    TodoCreated,
    #[serde(rename = "todo:updated")]
    TodoUpdated,
    #[serde(rename = "todo:deleted")]
    TodoDeleted,
    #[serde(rename = "todo:reordered")]
    TodoReordered,
    #[serde(rename = "category:created")]
    CategoryCreated,
    #[serde(rename = "category:updated")]
    CategoryUpdated,
    #[serde(rename = "category:deleted")]
    CategoryDeleted,
    #[serde(rename = "tag:created")]
    TagCreated,
    #[serde(rename = "tag:updated")]
    TagUpdated,
    #[serde(rename = "tag:deleted")]
    TagDeleted,
    #[serde(rename = "presence:online")]
    PresenceOnline,
    #[serde(rename = "presence:offline")]
    PresenceOffline,
    #[serde(rename = "presence:status")]
    PresenceStatus,
    #[serde(rename = "presence:typing")]
    PresenceTyping,
    #[serde(rename = "activity:feed")]
    ActivityFeed,
    #[serde(rename = "notification")]
    Notification,
}

impl EventName {
    /// Map a completed mutation to its notification.
    ///
    /// Returns `None` for combinations that do not exist (reordering is
    /// only defined for tasks).
    pub fn from_mutation(kind: ResourceKind, verb: MutationVerb) -> Option<Self> {
        use MutationVerb::*;
        use ResourceKind::*;

        let name = match (kind, verb) {
            (Task, Create) => EventName::TodoCreated,
            (Task, Update) => EventName::TodoUpdated,
            (Task, Delete) => EventName::TodoDeleted,
            (Task, Reorder) => EventName::TodoReordered,
            (Category, Create) => EventName::CategoryCreated,
            (Category, Update) => EventName::CategoryUpdated,
            (Category, Delete) => EventName::CategoryDeleted,
            (Tag, Create) => EventName::TagCreated,
            (Tag, Update) => EventName::TagUpdated,
            (Tag, Delete) => EventName::TagDeleted,
            (Category, Reorder) | (Tag, Reorder) => return None,
        };
        Some(name)
    }

    /// Resource kind and verb for mutation events.
    pub fn as_mutation(self) -> Option<(ResourceKind, MutationVerb)> {
        use MutationVerb::*;
        use ResourceKind::*;

        match self {
            EventName::TodoCreated => Some((Task, Create)),
            EventName::TodoUpdated => Some((Task, Update)),
            EventName::TodoDeleted => Some((Task, Delete)),
            EventName::TodoReordered => Some((Task, Reorder)),
            EventName::CategoryCreated => Some((Category, Create)),
            EventName::CategoryUpdated => Some((Category, Update)),
            EventName::CategoryDeleted => Some((Category, Delete)),
            EventName::TagCreated => Some((Tag, Create)),
            EventName::TagUpdated => Some((Tag, Update)),
            EventName::TagDeleted => Some((Tag, Delete)),
            EventName::PresenceOnline
            | EventName::PresenceOffline
            | EventName::PresenceStatus
            | EventName::PresenceTyping
            | EventName::ActivityFeed
            | EventName::Notification => None,
        }
    }

    /// Bridge category this event travels on.
    pub fn category(self) -> EventCategory {
        match self {
            EventName::PresenceOnline
            | EventName::PresenceOffline
            | EventName::PresenceStatus
            | EventName::PresenceTyping => EventCategory::PresenceSync,
            EventName::ActivityFeed => EventCategory::ActivitySync,
            EventName::Notification => EventCategory::NotificationSync,
            _ => EventCategory::TaskSync,
        }
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            EventName::TodoCreated => "todo:created",
            EventName::TodoUpdated => "todo:updated",
            EventName::TodoDeleted => "todo:deleted",
            EventName::TodoReordered => "todo:reordered",
            EventName::CategoryCreated => "category:created",
            EventName::CategoryUpdated => "category:updated",
            EventName::CategoryDeleted => "category:deleted",
            EventName::TagCreated => "tag:created",
            EventName::TagUpdated => "tag:updated",
            EventName::TagDeleted => "tag:deleted",
            EventName::PresenceOnline => "presence:online",
            EventName::PresenceOffline => "presence:offline",
            EventName::PresenceStatus => "presence:status",
            EventName::PresenceTyping => "presence:typing",
            EventName::ActivityFeed => "activity:feed",
            EventName::Notification => "notification",
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel families on the cross-node bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventCategory {
    TaskSync,
    PresenceSync,
    ActivitySync,
    NotificationSync,
}

impl EventCategory {
    /// All categories; every node subscribes to each of them.
    pub const ALL: [EventCategory; 4] = [
        EventCategory::TaskSync,
        EventCategory::PresenceSync,
        EventCategory::ActivitySync,
        EventCategory::NotificationSync,
    ];

    /// Channel name.
    pub fn as_str(self) -> &'static str {
        match self {
            EventCategory::TaskSync => "task-sync",
            EventCategory::PresenceSync => "presence-sync",
            EventCategory::ActivitySync => "activity-sync",
            EventCategory::NotificationSync => "notification-sync",
        }
    }

    /// Parse a channel name.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
