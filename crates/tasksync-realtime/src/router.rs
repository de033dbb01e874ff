//! Room router: per-user delivery groups on this node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tasksync_types::{ConnectionId, UserId};
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::event::OutboundEvent;
use crate::protocol::ServerFrame;
use crate::registry::ShardedRegistry;

/// Connections of one user, keyed by connection id.
type Room = HashMap<ConnectionId, Arc<Connection>>;

/// Maps each user to the live connections that belong to them, and each
/// watched user to the connections watching their presence.
///
/// `join` and `leave` are only called by the hub's connection lifecycle.
#[derive(Debug, Default)]
pub struct RoomRouter {
    rooms: ShardedRegistry<Room>,
    watchers: ShardedRegistry<Room>,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Outcome of one delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Connections that accepted the frame.
    pub delivered: usize,
    /// Connections that were closed mid-broadcast.
    pub failed: usize,
}

impl RoomRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to its owner's room.
    pub fn join(&self, connection: Arc<Connection>) {
        let user = connection.user_id.clone();
        let id = connection.id.clone();
        self.rooms.mutate(&user, |slot| {
            slot.get_or_insert_with(HashMap::new).insert(id, connection);
        });
        debug!(user_id = %user, "Connection joined room");
    }

    /// Remove a connection from its room and from every watch list.
    ///
    /// After this returns no delivery will pick the connection up.
    pub fn leave(&self, connection: &Connection) {
        connection.close();
        self.rooms.mutate(&connection.user_id, |slot| {
            if let Some(room) = slot.as_mut() {
                room.remove(&connection.id);
                if room.is_empty() {
                    *slot = None;
                }
            }
        });
        for subject in connection.take_watched() {
            self.remove_watcher(&subject, &connection.id);
        }
        debug!(user_id = %connection.user_id, connection_id = %connection.id, "Connection left room");
    }

    /// Register `connection` as a presence watcher of `subject`.
    pub fn watch(&self, subject: &UserId, connection: Arc<Connection>) {
        let id = connection.id.clone();
        self.watchers.mutate(subject, |slot| {
            slot.get_or_insert_with(HashMap::new).insert(id, connection);
        });
    }

    /// Remove a presence watcher.
    pub fn unwatch(&self, subject: &UserId, connection_id: &str) {
        self.remove_watcher(subject, connection_id);
    }

    fn remove_watcher(&self, subject: &UserId, connection_id: &str) {
        self.watchers.mutate(subject, |slot| {
            if let Some(watchers) = slot.as_mut() {
                watchers.remove(connection_id);
                if watchers.is_empty() {
                    *slot = None;
                }
            }
        });
    }

    /// Deliver an event to every connection of `user` on this node.
    ///
    /// A user with no connections is a no-op.
    pub fn deliver(&self, user: &UserId, event: &OutboundEvent) -> DeliveryReport {
        let targets = self.rooms.read(user, snapshot);
        self.send_all(targets, event)
    }

    /// Deliver to the connections of `user` that opted into the activity feed.
    pub fn deliver_activity(&self, user: &UserId, event: &OutboundEvent) -> DeliveryReport {
        let targets = self.rooms.read(user, |room| {
            room.map(|r| {
                r.values()
                    .filter(|c| c.activity_subscribed())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
        });
        self.send_all(targets, event)
    }

    /// Deliver to every local connection watching `subject`.
    pub fn deliver_to_watchers(&self, subject: &UserId, event: &OutboundEvent) -> DeliveryReport {
        let targets = self.watchers.read(subject, snapshot);
        self.send_all(targets, event)
    }

    /// Send one frame to a single connection.
    pub fn send_to(&self, connection: &Connection, frame: &ServerFrame) -> bool {
        match frame.to_json() {
            Ok(json) => connection.send(json).is_ok(),
            Err(e) => {
                warn!(error = %e, "Failed to encode frame");
                false
            }
        }
    }

    fn send_all(&self, targets: Vec<Arc<Connection>>, event: &OutboundEvent) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        if targets.is_empty() {
            return report;
        }

        let json = match ServerFrame::Event(event.clone()).to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(event = %event.event, error = %e, "Failed to encode event");
                return report;
            }
        };

        for connection in targets {
            match connection.send(json.clone()) {
                Ok(()) => report.delivered += 1,
                Err(_) => {
                    // Closed between snapshot and send; the lifecycle will
                    // remove it, nothing else to do here.
                    debug!(connection_id = %connection.id, event = %event.event, "Skipping closed connection");
                    report.failed += 1;
                }
            }
        }

        self.delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.failed.fetch_add(report.failed as u64, Ordering::Relaxed);
        report
    }

    /// Number of live connections for `user` on this node.
    pub fn connection_count(&self, user: &UserId) -> usize {
        self.rooms.read(user, |room| room.map_or(0, HashMap::len))
    }

    /// Total live connections on this node.
    pub fn total_connections(&self) -> usize {
        let mut total = 0;
        self.rooms.for_each(|_, room| total += room.len());
        total
    }

    /// Number of users with at least one connection on this node.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Find a connection by id.
    pub fn find(&self, user: &UserId, connection_id: &str) -> Option<Arc<Connection>> {
        self.rooms
            .read(user, |room| room.and_then(|r| r.get(connection_id).cloned()))
    }

    /// Frames delivered and failed since start.
    pub fn delivery_totals(&self) -> (u64, u64) {
        (
            self.delivered.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}

fn snapshot(room: Option<&Room>) -> Vec<Arc<Connection>> {
    room.map(|r| r.values().cloned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::create_connection;
    use crate::event::EventName;
    use tasksync_types::{DeviceClass, Transport};

    fn connect(
        router: &RoomRouter,
        user: &str,
    ) -> (Arc<Connection>, crate::connection::ConnectionReceiver) {
        let (c, rx) = create_connection(UserId::new(user), Transport::InProcess, DeviceClass::Web);
        router.join(c.clone());
        (c, rx)
    }

    fn event() -> OutboundEvent {
        OutboundEvent::new(EventName::TodoCreated, serde_json::json!({"id": "t1"}))
    }

    #[test]
    fn test_deliver_reaches_all_connections_of_user() {
        let router = RoomRouter::new();
        let (_a1, mut rx1) = connect(&router, "alice");
        let (_a2, mut rx2) = connect(&router, "alice");
        let (_b, mut rxb) = connect(&router, "bob");

        let report = router.deliver(&UserId::new("alice"), &event());
        assert_eq!(report.delivered, 2);

        assert!(rx1.try_recv().unwrap().contains("todo:created"));
        assert!(rx2.try_recv().is_ok());
        assert!(rxb.try_recv().is_err());
    }

    #[test]
    fn test_deliver_to_absent_user_is_noop() {
        let router = RoomRouter::new();
        let report = router.deliver(&UserId::new("nobody"), &event());
        assert_eq!(report, DeliveryReport::default());
    }

    #[test]
    fn test_dead_connection_does_not_block_others() {
        let router = RoomRouter::new();
        let (_a1, rx1) = connect(&router, "alice");
        let (_a2, mut rx2) = connect(&router, "alice");

        // Socket died without going through leave().
        drop(rx1);

        let report = router.deliver(&UserId::new("alice"), &event());
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_leave_removes_connection_and_room() {
        let router = RoomRouter::new();
        let (a1, _rx1) = connect(&router, "alice");
        let (a2, mut rx2) = connect(&router, "alice");
        assert_eq!(router.connection_count(&UserId::new("alice")), 2);

        router.leave(&a1);
        assert_eq!(router.connection_count(&UserId::new("alice")), 1);
        assert!(a1.is_closed());

        router.deliver(&UserId::new("alice"), &event());
        assert!(rx2.try_recv().is_ok());

        router.leave(&a2);
        assert_eq!(router.room_count(), 0);
        assert_eq!(router.total_connections(), 0);
    }

    #[test]
    fn test_watchers() {
        let router = RoomRouter::new();
        let (watcher, mut rx) = connect(&router, "bob");
        let (_other, mut other_rx) = connect(&router, "carol");

        watcher.watch(UserId::new("alice")).unwrap();
        router.watch(&UserId::new("alice"), watcher.clone());

        let presence = OutboundEvent::new(EventName::PresenceOnline, serde_json::json!({}));
        let report = router.deliver_to_watchers(&UserId::new("alice"), &presence);
        assert_eq!(report.delivered, 1);
        assert!(rx.try_recv().unwrap().contains("presence:online"));
        assert!(other_rx.try_recv().is_err());

        router.leave(&watcher);
        let report = router.deliver_to_watchers(&UserId::new("alice"), &presence);
        assert_eq!(report.delivered, 0);
    }

    #[test]
    fn test_activity_delivery_requires_opt_in() {
        let router = RoomRouter::new();
        let (subscribed, mut rx1) = connect(&router, "alice");
        let (_plain, mut rx2) = connect(&router, "alice");
        subscribed.set_activity_subscribed(true);

        let feed = OutboundEvent::new(EventName::ActivityFeed, serde_json::json!({}));
        router.deliver_activity(&UserId::new("alice"), &feed);

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_find_and_totals() {
        let router = RoomRouter::new();
        let (a, _rx) = connect(&router, "alice");
        assert!(router.find(&UserId::new("alice"), &a.id).is_some());
        assert!(router.find(&UserId::new("bob"), &a.id).is_none());

        router.deliver(&UserId::new("alice"), &event());
        assert_eq!(router.delivery_totals(), (1, 0));
    }
}
