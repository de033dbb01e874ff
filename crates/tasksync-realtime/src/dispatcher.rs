//! Event dispatcher: turns persisted mutations, presence transitions,
//! activity and notifications into deliveries, locally and across nodes.

use serde_json::{json, Value};
use std::sync::Arc;
use tasksync_types::{MutationVerb, ResourceKind, UserId};
use tracing::{debug, warn};

use crate::activity::{ActivityEvent, ActivityLog};
use crate::bridge::{BridgeSink, CrossNodeBridge, DeliveryTarget};
use crate::error::RealtimeError;
use crate::event::{EventName, OutboundEvent};
use crate::notification::Notification;
use crate::presence::{PresenceAnnouncement, PresenceChange, PresenceTracker};
use crate::router::{DeliveryReport, RoomRouter};

/// Fans events out to local connections and to the bridge.
#[derive(Debug)]
pub struct EventDispatcher {
    router: Arc<RoomRouter>,
    presence: Arc<PresenceTracker>,
    activity: Arc<ActivityLog>,
    bridge: Option<Arc<CrossNodeBridge>>,
}

impl EventDispatcher {
    pub fn new(
        router: Arc<RoomRouter>,
        presence: Arc<PresenceTracker>,
        activity: Arc<ActivityLog>,
        bridge: Option<Arc<CrossNodeBridge>>,
    ) -> Self {
        Self {
            router,
            presence,
            activity,
            bridge,
        }
    }

    /// Announce a persisted mutation to every connection of `owner`, on
    /// every node, and record it in the owner's activity feed.
    ///
    /// Call exactly once per successful persistence. Delivery failures are
    /// logged, never returned: only an impossible kind/verb pair fails.
    ///
    /// The payload doubles as the requested changes when classifying the
    /// activity. Use [`EventDispatcher::emit_mutation`] when they differ.
    pub fn emit(
        &self,
        kind: ResourceKind,
        verb: MutationVerb,
        payload: Value,
        owner: &UserId,
    ) -> Result<OutboundEvent, RealtimeError> {
        let changes = payload.clone();
        self.emit_mutation(kind, verb, payload, &changes, owner)
    }

    /// Like [`EventDispatcher::emit`], with the activity action derived
    /// from the fields the client asked to change rather than the saved
    /// record.
    pub fn emit_mutation(
        &self,
        kind: ResourceKind,
        verb: MutationVerb,
        payload: Value,
        changes: &Value,
        owner: &UserId,
    ) -> Result<OutboundEvent, RealtimeError> {
        let name = EventName::from_mutation(kind, verb).ok_or_else(|| {
            RealtimeError::InvalidPayload {
                operation: format!("{}:{}", kind.wire_prefix(), verb.as_str()),
                reason: "no such mutation".to_string(),
            }
        })?;

        let activity = ActivityEvent::from_mutation(owner, kind, verb, &payload, changes);
        let event = OutboundEvent::new(name, payload);
        let report = self.fanout(DeliveryTarget::User(owner.clone()), &event);
        debug!(
            user_id = %owner,
            event = %event.event,
            delivered = report.delivered,
            "Emitted mutation event"
        );

        if let Some(activity) = activity {
            self.record_activity(activity);
        }
        Ok(event)
    }

    /// Append to the actor's feed and push `activity:feed` to their
    /// subscribed connections.
    pub fn record_activity(&self, activity: ActivityEvent) {
        let actor = activity.actor.clone();
        let event = OutboundEvent::new(EventName::ActivityFeed, json!(activity));
        self.activity.append(activity);
        self.fanout(DeliveryTarget::ActivitySubscribers(actor), &event);
    }

    /// Deliver a notification to its recipient.
    pub fn notify(&self, notification: &Notification) -> OutboundEvent {
        let event = notification.to_event();
        self.fanout(DeliveryTarget::User(notification.user_id.clone()), &event);
        event
    }

    /// Tell watchers about a presence transition.
    ///
    /// Status transitions are delivered locally only; other nodes derive
    /// their own from the announcement. Typing is not announced, so it is
    /// bridged as an event.
    pub fn presence_changed(&self, change: &PresenceChange) {
        let target = DeliveryTarget::Watchers(change.subject().clone());
        let event = change.to_event();
        match change {
            PresenceChange::Typing { .. } => {
                self.fanout(target, &event);
            }
            PresenceChange::Online(_)
            | PresenceChange::Offline { .. }
            | PresenceChange::Status(_) => {
                self.deliver_local(&target, &event);
            }
        }
    }

    /// Publish this node's status for `user` to other nodes.
    pub fn announce_presence(&self, user: &UserId) {
        if let Some(bridge) = &self.bridge {
            bridge.publish_presence(self.presence.local_announcement(user));
        }
    }

    /// Re-announce every locally connected user.
    pub fn announce_all(&self) {
        if let Some(bridge) = &self.bridge {
            for announcement in self.presence.local_announcements() {
                bridge.publish_presence(announcement);
            }
        }
    }

    fn fanout(&self, target: DeliveryTarget, event: &OutboundEvent) -> DeliveryReport {
        let report = self.deliver_local(&target, event);
        if let Some(bridge) = &self.bridge {
            bridge.publish_event(target, event.clone());
        }
        report
    }

    fn deliver_local(&self, target: &DeliveryTarget, event: &OutboundEvent) -> DeliveryReport {
        let report = match target {
            DeliveryTarget::User(user) => self.router.deliver(user, event),
            DeliveryTarget::Watchers(user) => self.router.deliver_to_watchers(user, event),
            DeliveryTarget::ActivitySubscribers(user) => self.router.deliver_activity(user, event),
        };
        if report.failed > 0 {
            warn!(
                event = %event.event,
                failed = report.failed,
                "Some connections closed during delivery"
            );
        }
        report
    }
}

impl BridgeSink for EventDispatcher {
    fn deliver_remote(&self, target: &DeliveryTarget, event: &OutboundEvent) {
        self.deliver_local(target, event);
    }

    fn presence_remote(&self, origin: &str, announcement: &PresenceAnnouncement) {
        if let Some(change) = self.presence.apply_remote(origin, announcement) {
            let target = DeliveryTarget::Watchers(change.subject().clone());
            self.deliver_local(&target, &change.to_event());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityConfig;
    use crate::bridge::MemoryPubSub;
    use crate::connection::{create_connection, Connection, ConnectionReceiver};
    use crate::notification::NotificationKind;
    use crate::presence::PresenceConfig;
    use tasksync_types::{DeviceClass, PresenceStatus, Transport};

    fn dispatcher(bridge: Option<Arc<CrossNodeBridge>>) -> (EventDispatcher, Arc<RoomRouter>) {
        let router = Arc::new(RoomRouter::new());
        let (presence, _rx) = PresenceTracker::new(PresenceConfig::default());
        let activity = Arc::new(ActivityLog::new(ActivityConfig::default()));
        (
            EventDispatcher::new(router.clone(), presence, activity, bridge),
            router,
        )
    }

    fn join(router: &RoomRouter, user: &str) -> (Arc<Connection>, ConnectionReceiver) {
        let (c, rx) = create_connection(UserId::new(user), Transport::InProcess, DeviceClass::Web);
        router.join(c.clone());
        (c, rx)
    }

    #[test]
    fn test_emit_reaches_owner_only() {
        let (d, router) = dispatcher(None);
        let (_a, mut rx_a) = join(&router, "alice");
        let (_b, mut rx_b) = join(&router, "bob");

        let event = d
            .emit(
                ResourceKind::Task,
                MutationVerb::Create,
                json!({"id": "t1", "title": "A"}),
                &UserId::new("alice"),
            )
            .unwrap();
        assert_eq!(event.event, EventName::TodoCreated);
        assert!(rx_a.try_recv().unwrap().contains("todo:created"));
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_emit_rejects_impossible_mutation() {
        let (d, _router) = dispatcher(None);
        let err = d
            .emit(
                ResourceKind::Tag,
                MutationVerb::Reorder,
                json!({}),
                &UserId::new("alice"),
            )
            .unwrap_err();
        assert!(matches!(err, RealtimeError::InvalidPayload { .. }));
    }

    #[test]
    fn test_emit_feeds_activity_subscribers() {
        let (d, router) = dispatcher(None);
        let (a, mut rx) = join(&router, "alice");
        a.set_activity_subscribed(true);

        d.emit(
            ResourceKind::Task,
            MutationVerb::Delete,
            json!({"id": "t1", "deleted": true}),
            &UserId::new("alice"),
        )
        .unwrap();

        assert!(rx.try_recv().unwrap().contains("todo:deleted"));
        let feed = rx.try_recv().unwrap();
        assert!(feed.contains("activity:feed"));
        assert!(feed.contains("\"action\":\"deleted\""));
    }

    #[test]
    fn test_notify() {
        let (d, router) = dispatcher(None);
        let (_a, mut rx) = join(&router, "alice");
        d.notify(&Notification::new(
            UserId::new("alice"),
            NotificationKind::System,
            "Hi",
            "Welcome",
        ));
        assert!(rx.try_recv().unwrap().contains("\"event\":\"notification\""));
    }

    #[test]
    fn test_remote_presence_reaches_local_watchers() {
        let (d, router) = dispatcher(None);
        let (watcher, mut rx) = join(&router, "bob");
        watcher.watch(UserId::new("alice")).unwrap();
        router.watch(&UserId::new("alice"), watcher.clone());

        d.presence_remote(
            "node-b",
            &PresenceAnnouncement {
                user_id: UserId::new("alice"),
                status: PresenceStatus::Online,
                device: DeviceClass::Mobile,
                last_activity: 1,
                seq: 1,
            },
        );
        assert!(rx.try_recv().unwrap().contains("presence:online"));
    }

    #[tokio::test]
    async fn test_remote_delivery_is_not_republished() {
        let pubsub = MemoryPubSub::new();
        let mut spy = crate::bridge::PubSub::subscribe(&pubsub).await.unwrap();
        let bridge = Arc::new(CrossNodeBridge::new("node-a", Arc::new(pubsub)));
        let (d, router) = dispatcher(Some(bridge.clone()));
        let d = Arc::new(d);
        bridge.start(d.clone()).await.unwrap();

        let (_a, mut rx) = join(&router, "alice");
        d.deliver_remote(
            &DeliveryTarget::User(UserId::new("alice")),
            &OutboundEvent::new(EventName::TodoUpdated, json!({"id": "t1"})),
        );
        assert!(rx.try_recv().is_ok());

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(spy.try_recv().is_err());
        assert_eq!(bridge.stats().published, 0);
    }
}
