//! Notification types for user alerts.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tasksync_types::{now_millis, UserId};

use crate::event::{EventName, OutboundEvent};

/// A notification for a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Unique notification ID.
    pub id: String,
    /// User who receives this notification.
    pub user_id: UserId,
    /// Notification type.
    pub kind: NotificationKind,
    /// Brief title.
    pub title: String,
    /// Notification body.
    pub body: String,
    /// Resource the notification points at, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    /// Whether the notification has been read.
    pub read: bool,
    /// When the notification was created (Unix milliseconds).
    pub created_at: u64,
    /// Additional metadata.
    #[serde(default)]
    pub metadata: Value,
}

impl Notification {
    /// Create a new notification.
    pub fn new(
        user_id: UserId,
        kind: NotificationKind,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            kind,
            title: title.into(),
            body: body.into(),
            resource_id: None,
            read: false,
            created_at: now_millis(),
            metadata: Value::Null,
        }
    }

    /// Point the notification at a resource.
    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Set metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Mark as read.
    pub fn mark_read(&mut self) {
        self.read = true;
    }

    /// The `notification` event carrying this notification.
    pub fn to_event(&self) -> OutboundEvent {
        OutboundEvent::new(EventName::Notification, serde_json::json!(self))
    }
}

/// Types of notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A task is due.
    Reminder,
    /// Someone shared a task or list.
    Shared,
    /// Mentioned in a task.
    Mention,
    /// Service message.
    System,
}

impl NotificationKind {
    /// Get a human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            NotificationKind::Reminder => "Reminder",
            NotificationKind::Shared => "Shared with you",
            NotificationKind::Mention => "Mentioned",
            NotificationKind::System => "System",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_creation() {
        let mut n = Notification::new(
            UserId::new("alice"),
            NotificationKind::Reminder,
            "Due soon",
            "Water the plants",
        )
        .with_resource("t1");

        assert!(!n.id.is_empty());
        assert!(!n.read);
        assert_eq!(n.resource_id.as_deref(), Some("t1"));

        n.mark_read();
        assert!(n.read);
    }

    #[test]
    fn test_notification_event() {
        let n = Notification::new(
            UserId::new("alice"),
            NotificationKind::Shared,
            "Shared",
            "Bob shared a list",
        );
        let event = n.to_event();
        assert_eq!(event.event, EventName::Notification);
        assert_eq!(event.data["kind"], "shared");
        assert_eq!(event.data["user_id"], "alice");
    }

    #[test]
    fn test_labels() {
        assert_eq!(NotificationKind::Mention.label(), "Mentioned");
    }
}
