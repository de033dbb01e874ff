//! Presence and typing state.
//!
//! A user's effective status is the strongest status among their open
//! connections on this node and the last status each other node announced
//! for them. The tracker only computes transitions; the hub decides who
//! hears about them.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tasksync_types::{now_millis, ConnectionId, DeviceClass, PresenceStatus, UserId};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::event::{EventName, OutboundEvent};
use crate::registry::ShardedRegistry;

/// Presence tuning.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Typing indicators expire after this long without a refresh.
    pub typing_timeout: Duration,
    /// Remote statuses older than this are dropped.
    pub remote_ttl: Duration,
    /// How often local statuses are re-announced to other nodes.
    pub heartbeat_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            typing_timeout: Duration::from_secs(5),
            remote_ttl: Duration::from_secs(90),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Effective presence of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub device: DeviceClass,
    /// Unix milliseconds of the last status-relevant activity.
    pub last_activity: u64,
    /// Open connections on this node.
    pub connections: usize,
}

/// A node's view of one of its local users, as sent over the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceAnnouncement {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub device: DeviceClass,
    pub last_activity: u64,
    /// Increases with every announcement the sending node makes. Receivers
    /// ignore an announcement that is not newer than the last one they
    /// applied from that node for that user.
    pub seq: u64,
}

/// A transition watchers should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    /// Effective status left `offline`.
    Online(PresenceRecord),
    /// Effective status became `offline`.
    Offline { user_id: UserId, last_activity: u64 },
    /// Effective status moved between online, away and busy.
    Status(PresenceRecord),
    /// Typing indicator for a task turned on or off.
    Typing {
        user_id: UserId,
        task_id: String,
        typing: bool,
    },
}

impl PresenceChange {
    /// The user whose presence changed.
    pub fn subject(&self) -> &UserId {
        match self {
            PresenceChange::Online(r) | PresenceChange::Status(r) => &r.user_id,
            PresenceChange::Offline { user_id, .. } | PresenceChange::Typing { user_id, .. } => {
                user_id
            }
        }
    }

    /// Build the event pushed to watchers.
    pub fn to_event(&self) -> OutboundEvent {
        match self {
            PresenceChange::Online(record) => {
                OutboundEvent::new(EventName::PresenceOnline, json!(record))
            }
            PresenceChange::Status(record) => {
                OutboundEvent::new(EventName::PresenceStatus, json!(record))
            }
            PresenceChange::Offline {
                user_id,
                last_activity,
            } => OutboundEvent::new(
                EventName::PresenceOffline,
                json!({
                    "user_id": user_id,
                    "status": PresenceStatus::Offline,
                    "last_activity": last_activity,
                }),
            ),
            PresenceChange::Typing {
                user_id,
                task_id,
                typing,
            } => OutboundEvent::new(
                EventName::PresenceTyping,
                json!({ "user_id": user_id, "task_id": task_id, "typing": typing }),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LocalConnection {
    status: PresenceStatus,
    device: DeviceClass,
}

#[derive(Debug, Clone)]
struct RemoteStatus {
    status: PresenceStatus,
    device: DeviceClass,
    last_activity: u64,
    seen_at: Instant,
}

/// Newest announcement seen from one node for one user.
#[derive(Debug, Clone, Copy)]
struct RemoteMark {
    seq: u64,
    seen_at: Instant,
}

#[derive(Debug, Default)]
struct UserPresence {
    connections: HashMap<ConnectionId, LocalConnection>,
    remote: HashMap<String, RemoteStatus>,
    /// Task id to the generation of the pending timeout.
    typing: HashMap<String, u64>,
    last_activity: u64,
    last_device: DeviceClass,
}

impl UserPresence {
    fn local_status(&self) -> PresenceStatus {
        self.connections
            .values()
            .fold(PresenceStatus::Offline, |acc, c| acc.merge(c.status))
    }

    fn effective_status(&self) -> PresenceStatus {
        self.remote
            .values()
            .fold(self.local_status(), |acc, r| acc.merge(r.status))
    }

    fn effective_device(&self) -> DeviceClass {
        if !self.connections.is_empty() {
            return self.last_device;
        }
        self.remote
            .values()
            .max_by_key(|r| r.last_activity)
            .map_or(self.last_device, |r| r.device)
    }

    fn effective_last_activity(&self) -> u64 {
        self.remote
            .values()
            .map(|r| r.last_activity)
            .fold(self.last_activity, u64::max)
    }

    fn record(&self, user_id: &UserId) -> PresenceRecord {
        PresenceRecord {
            user_id: user_id.clone(),
            status: self.effective_status(),
            device: self.effective_device(),
            last_activity: self.effective_last_activity(),
            connections: self.connections.len(),
        }
    }

    fn is_idle(&self) -> bool {
        self.connections.is_empty() && self.remote.is_empty() && self.typing.is_empty()
    }
}

/// Compare effective status before and after a mutation.
fn transition(
    user_id: &UserId,
    before: PresenceStatus,
    slot: &UserPresence,
) -> Option<PresenceChange> {
    let after = slot.effective_status();
    if before == after {
        return None;
    }
    let change = match (before, after) {
        (_, PresenceStatus::Offline) => PresenceChange::Offline {
            user_id: user_id.clone(),
            last_activity: slot.effective_last_activity(),
        },
        (PresenceStatus::Offline, _) => PresenceChange::Online(slot.record(user_id)),
        _ => PresenceChange::Status(slot.record(user_id)),
    };
    Some(change)
}

/// Authoritative presence registry for this node.
#[derive(Debug)]
pub struct PresenceTracker {
    config: PresenceConfig,
    users: ShardedRegistry<UserPresence>,
    /// Per user, the newest sequence applied from each remote node. Kept
    /// apart from `users` so it survives the user going offline.
    remote_marks: ShardedRegistry<HashMap<String, RemoteMark>>,
    /// Seeded from the wall clock so a restarted node outranks its
    /// previous run.
    announce_seq: AtomicU64,
    generation: Mutex<u64>,
    expired: mpsc::UnboundedSender<PresenceChange>,
}

/// Receives typing indicators that timed out.
pub type ExpiryReceiver = mpsc::UnboundedReceiver<PresenceChange>;

impl PresenceTracker {
    /// Create a tracker and the channel its typing timeouts report on.
    pub fn new(config: PresenceConfig) -> (Arc<Self>, ExpiryReceiver) {
        let (expired, rx) = mpsc::unbounded_channel();
        let tracker = Arc::new(Self {
            config,
            users: ShardedRegistry::default(),
            remote_marks: ShardedRegistry::default(),
            announce_seq: AtomicU64::new(now_millis()),
            generation: Mutex::new(0),
            expired,
        });
        (tracker, rx)
    }

    /// Tracker configuration.
    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// A connection opened. The first one takes the user online.
    pub fn connection_opened(
        &self,
        user_id: &UserId,
        connection_id: &str,
        device: DeviceClass,
    ) -> Option<PresenceChange> {
        self.users.mutate(user_id, |slot| {
            let slot = slot.get_or_insert_with(UserPresence::default);
            let before = slot.effective_status();
            slot.connections.insert(
                connection_id.to_string(),
                LocalConnection {
                    status: PresenceStatus::Online,
                    device,
                },
            );
            slot.last_activity = now_millis();
            slot.last_device = device;
            transition(user_id, before, slot)
        })
    }

    /// A connection closed. Returns the resulting transitions, including
    /// typing indicators cleared because the user left this node.
    pub fn connection_closed(&self, user_id: &UserId, connection_id: &str) -> Vec<PresenceChange> {
        self.users.mutate(user_id, |entry| {
            let mut changes = Vec::new();
            let Some(slot) = entry.as_mut() else {
                return changes;
            };
            let before = slot.effective_status();
            if slot.connections.remove(connection_id).is_none() {
                return changes;
            }
            slot.last_activity = now_millis();

            if slot.connections.is_empty() {
                for task_id in slot.typing.drain().map(|(task, _)| task) {
                    changes.push(PresenceChange::Typing {
                        user_id: user_id.clone(),
                        task_id,
                        typing: false,
                    });
                }
            }
            changes.extend(transition(user_id, before, slot));

            if slot.is_idle() {
                *entry = None;
            }
            changes
        })
    }

    /// Explicit status change from one connection.
    pub fn update_status(
        &self,
        user_id: &UserId,
        connection_id: &str,
        status: PresenceStatus,
        device: Option<DeviceClass>,
    ) -> Option<PresenceChange> {
        self.users.mutate(user_id, |entry| {
            let slot = entry.as_mut()?;
            let before = slot.effective_status();
            let conn = slot.connections.get_mut(connection_id)?;
            conn.status = status;
            if let Some(device) = device {
                conn.device = device;
                slot.last_device = device;
            }
            slot.last_activity = now_millis();
            transition(user_id, before, slot)
        })
    }

    /// Start or refresh a typing indicator and arm its timeout.
    ///
    /// Only the first start emits a change; refreshes just push the
    /// deadline out.
    pub fn typing_start(self: &Arc<Self>, user_id: &UserId, task_id: &str) -> Option<PresenceChange> {
        let generation = {
            let mut g = self.generation.lock();
            *g += 1;
            *g
        };

        let was_typing = self.users.mutate(user_id, |entry| {
            let slot = entry.get_or_insert_with(UserPresence::default);
            slot.last_activity = now_millis();
            slot.typing.insert(task_id.to_string(), generation).is_some()
        });

        let tracker = Arc::downgrade(self);
        let user = user_id.clone();
        let task = task_id.to_string();
        let timeout = self.config.typing_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tracker) = tracker.upgrade() {
                if let Some(change) = tracker.expire_typing(&user, &task, generation) {
                    debug!(user_id = %user, task_id = %task, "Typing indicator expired");
                    let _ = tracker.expired.send(change);
                }
            }
        });

        (!was_typing).then(|| PresenceChange::Typing {
            user_id: user_id.clone(),
            task_id: task_id.to_string(),
            typing: true,
        })
    }

    /// Clear a typing indicator.
    pub fn typing_stop(&self, user_id: &UserId, task_id: &str) -> Option<PresenceChange> {
        self.users.mutate(user_id, |entry| {
            let slot = entry.as_mut()?;
            slot.typing.remove(task_id)?;
            if slot.is_idle() {
                *entry = None;
            }
            Some(PresenceChange::Typing {
                user_id: user_id.clone(),
                task_id: task_id.to_string(),
                typing: false,
            })
        })
    }

    fn expire_typing(
        &self,
        user_id: &UserId,
        task_id: &str,
        generation: u64,
    ) -> Option<PresenceChange> {
        self.users.mutate(user_id, |entry| {
            let slot = entry.as_mut()?;
            if slot.typing.get(task_id) != Some(&generation) {
                return None;
            }
            slot.typing.remove(task_id);
            if slot.is_idle() {
                *entry = None;
            }
            Some(PresenceChange::Typing {
                user_id: user_id.clone(),
                task_id: task_id.to_string(),
                typing: false,
            })
        })
    }

    /// Whether a typing indicator is active.
    pub fn is_typing(&self, user_id: &UserId, task_id: &str) -> bool {
        self.users
            .read(user_id, |slot| slot.is_some_and(|s| s.typing.contains_key(task_id)))
    }

    /// Record a status announced by another node.
    ///
    /// Announcements that arrive out of order are dropped: an older
    /// `online` never overrides a newer `offline` from the same node.
    pub fn apply_remote(
        &self,
        node_id: &str,
        announcement: &PresenceAnnouncement,
    ) -> Option<PresenceChange> {
        let user_id = &announcement.user_id;
        let fresh = self.remote_marks.mutate(user_id, |entry| {
            let marks = entry.get_or_insert_with(HashMap::new);
            if marks.get(node_id).is_some_and(|m| m.seq >= announcement.seq) {
                return false;
            }
            marks.insert(
                node_id.to_string(),
                RemoteMark {
                    seq: announcement.seq,
                    seen_at: Instant::now(),
                },
            );
            true
        });
        if !fresh {
            debug!(
                user_id = %user_id,
                node_id = %node_id,
                seq = announcement.seq,
                "Ignoring out-of-order presence announcement"
            );
            return None;
        }

        self.users.mutate(user_id, |entry| {
            if entry.is_none() && announcement.status == PresenceStatus::Offline {
                return None;
            }
            let slot = entry.get_or_insert_with(UserPresence::default);
            let before = slot.effective_status();
            if announcement.status == PresenceStatus::Offline {
                slot.remote.remove(node_id);
            } else {
                slot.remote.insert(
                    node_id.to_string(),
                    RemoteStatus {
                        status: announcement.status,
                        device: announcement.device,
                        last_activity: announcement.last_activity,
                        seen_at: Instant::now(),
                    },
                );
            }
            let change = transition(user_id, before, slot);
            if slot.is_idle() {
                *entry = None;
            }
            change
        })
    }

    /// Drop remote statuses not refreshed within the TTL.
    pub fn sweep_remote(&self) -> Vec<PresenceChange> {
        let ttl = self.config.remote_ttl;
        self.remote_marks.retain(|_, marks| {
            marks.retain(|_, m| m.seen_at.elapsed() <= ttl);
            !marks.is_empty()
        });
        let mut stale_users = Vec::new();
        self.users.for_each(|user, slot| {
            if slot.remote.values().any(|r| r.seen_at.elapsed() > ttl) {
                stale_users.push(user.clone());
            }
        });

        let mut changes = Vec::new();
        for user_id in stale_users {
            let change = self.users.mutate(&user_id, |entry| {
                let slot = entry.as_mut()?;
                let before = slot.effective_status();
                slot.remote.retain(|_, r| r.seen_at.elapsed() <= ttl);
                let change = transition(&user_id, before, slot);
                if slot.is_idle() {
                    *entry = None;
                }
                change
            });
            changes.extend(change);
        }
        changes
    }

    /// What this node announces for `user_id`.
    pub fn local_announcement(&self, user_id: &UserId) -> PresenceAnnouncement {
        self.users.read(user_id, |slot| match slot {
            Some(s) => PresenceAnnouncement {
                user_id: user_id.clone(),
                status: s.local_status(),
                device: s.last_device,
                last_activity: s.last_activity,
                seq: self.next_seq(),
            },
            None => PresenceAnnouncement {
                user_id: user_id.clone(),
                status: PresenceStatus::Offline,
                device: DeviceClass::Unknown,
                last_activity: now_millis(),
                seq: self.next_seq(),
            },
        })
    }

    /// Announcements for every user connected to this node.
    pub fn local_announcements(&self) -> Vec<PresenceAnnouncement> {
        let mut out = Vec::new();
        self.users.for_each(|user, slot| {
            if !slot.connections.is_empty() {
                out.push(PresenceAnnouncement {
                    user_id: user.clone(),
                    status: slot.local_status(),
                    device: slot.last_device,
                    last_activity: slot.last_activity,
                    seq: self.next_seq(),
                });
            }
        });
        out
    }

    fn next_seq(&self) -> u64 {
        self.announce_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Effective record for a user; unknown users are offline.
    pub fn record(&self, user_id: &UserId) -> PresenceRecord {
        self.users.read(user_id, |slot| match slot {
            Some(s) => s.record(user_id),
            None => PresenceRecord {
                user_id: user_id.clone(),
                status: PresenceStatus::Offline,
                device: DeviceClass::Unknown,
                last_activity: 0,
                connections: 0,
            },
        })
    }

    /// Effective status for a user.
    pub fn status(&self, user_id: &UserId) -> PresenceStatus {
        self.users.read(user_id, |slot| {
            slot.map_or(PresenceStatus::Offline, UserPresence::effective_status)
        })
    }

    /// Records for several users.
    pub fn query(&self, user_ids: &[UserId]) -> Vec<PresenceRecord> {
        user_ids.iter().map(|u| self.record(u)).collect()
    }

    /// Users with an effective status other than offline.
    pub fn online_count(&self) -> usize {
        let mut n = 0;
        self.users.for_each(|_, slot| {
            if slot.effective_status() != PresenceStatus::Offline {
                n += 1;
            }
        });
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (Arc<PresenceTracker>, ExpiryReceiver) {
        PresenceTracker::new(PresenceConfig::default())
    }

    fn alice() -> UserId {
        UserId::new("alice")
    }

    #[tokio::test]
    async fn test_first_connection_goes_online() {
        let (t, _rx) = tracker();
        assert_eq!(t.status(&alice()), PresenceStatus::Offline);

        let change = t.connection_opened(&alice(), "c1", DeviceClass::Web);
        assert!(matches!(change, Some(PresenceChange::Online(ref r)) if r.connections == 1));
        assert_eq!(t.status(&alice()), PresenceStatus::Online);

        // Second connection does not re-announce.
        assert!(t.connection_opened(&alice(), "c2", DeviceClass::Mobile).is_none());
        assert_eq!(t.record(&alice()).connections, 2);
    }

    #[tokio::test]
    async fn test_last_connection_goes_offline() {
        let (t, _rx) = tracker();
        t.connection_opened(&alice(), "c1", DeviceClass::Web);
        t.connection_opened(&alice(), "c2", DeviceClass::Web);

        assert!(t.connection_closed(&alice(), "c1").is_empty());
        assert_eq!(t.status(&alice()), PresenceStatus::Online);

        let changes = t.connection_closed(&alice(), "c2");
        assert!(matches!(
            changes.as_slice(),
            [PresenceChange::Offline { .. }]
        ));
        assert_eq!(t.status(&alice()), PresenceStatus::Offline);
        assert_eq!(t.record(&alice()).connections, 0);
    }

    #[tokio::test]
    async fn test_status_is_union_of_connections() {
        let (t, _rx) = tracker();
        t.connection_opened(&alice(), "c1", DeviceClass::Web);
        t.connection_opened(&alice(), "c2", DeviceClass::Mobile);

        // One connection going away still leaves the other online.
        assert!(t
            .update_status(&alice(), "c1", PresenceStatus::Away, None)
            .is_none());
        assert_eq!(t.status(&alice()), PresenceStatus::Online);

        let change = t.update_status(&alice(), "c2", PresenceStatus::Busy, None);
        assert!(matches!(change, Some(PresenceChange::Status(ref r)) if r.status == PresenceStatus::Busy));

        let changes = t.connection_closed(&alice(), "c2");
        assert!(matches!(
            changes.as_slice(),
            [PresenceChange::Status(r)] if r.status == PresenceStatus::Away
        ));
    }

    #[tokio::test]
    async fn test_update_for_unknown_connection_is_ignored() {
        let (t, _rx) = tracker();
        assert!(t
            .update_status(&alice(), "nope", PresenceStatus::Busy, None)
            .is_none());
        assert_eq!(t.status(&alice()), PresenceStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_expires_without_stop() {
        let (t, mut rx) = tracker();
        t.connection_opened(&alice(), "c1", DeviceClass::Web);

        let change = t.typing_start(&alice(), "task-1");
        assert!(matches!(change, Some(PresenceChange::Typing { typing: true, .. })));
        assert!(t.is_typing(&alice(), "task-1"));

        tokio::time::sleep(Duration::from_secs(6)).await;

        let expired = rx.recv().await.unwrap();
        assert_eq!(
            expired,
            PresenceChange::Typing {
                user_id: alice(),
                task_id: "task-1".into(),
                typing: false
            }
        );
        assert!(!t.is_typing(&alice(), "task-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_refresh_extends_deadline() {
        let (t, mut rx) = tracker();
        t.connection_opened(&alice(), "c1", DeviceClass::Web);

        t.typing_start(&alice(), "task-1");
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(t.typing_start(&alice(), "task-1").is_none());
        tokio::time::sleep(Duration::from_secs(3)).await;

        // The first timer fired but was superseded.
        assert!(t.is_typing(&alice(), "task-1"));
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rx.recv().await.is_some());
        assert!(!t.is_typing(&alice(), "task-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_stop_cancels_timeout() {
        let (t, mut rx) = tracker();
        t.connection_opened(&alice(), "c1", DeviceClass::Web);
        t.typing_start(&alice(), "task-1");

        let stop = t.typing_stop(&alice(), "task-1");
        assert!(matches!(stop, Some(PresenceChange::Typing { typing: false, .. })));
        assert!(t.typing_stop(&alice(), "task-1").is_none());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_clears_typing() {
        let (t, _rx) = tracker();
        t.connection_opened(&alice(), "c1", DeviceClass::Web);
        t.typing_start(&alice(), "task-1");

        let changes = t.connection_closed(&alice(), "c1");
        assert_eq!(changes.len(), 2);
        assert!(matches!(changes[0], PresenceChange::Typing { typing: false, .. }));
        assert!(!t.is_typing(&alice(), "task-1"));
    }

    #[tokio::test]
    async fn test_remote_presence_union() {
        let (t, _rx) = tracker();
        let remote = PresenceAnnouncement {
            user_id: alice(),
            status: PresenceStatus::Busy,
            device: DeviceClass::Mobile,
            last_activity: 10,
            seq: 1,
        };

        let change = t.apply_remote("node-b", &remote);
        assert!(matches!(change, Some(PresenceChange::Online(_))));
        assert_eq!(t.status(&alice()), PresenceStatus::Busy);

        // Local connection is stronger.
        let change = t.connection_opened(&alice(), "c1", DeviceClass::Web);
        assert!(matches!(change, Some(PresenceChange::Status(_))));
        assert_eq!(t.status(&alice()), PresenceStatus::Online);

        // Closing locally falls back to the remote status, not offline.
        let changes = t.connection_closed(&alice(), "c1");
        assert!(matches!(
            changes.as_slice(),
            [PresenceChange::Status(r)] if r.status == PresenceStatus::Busy
        ));

        let offline = PresenceAnnouncement {
            status: PresenceStatus::Offline,
            seq: 2,
            ..remote
        };
        assert!(matches!(
            t.apply_remote("node-b", &offline),
            Some(PresenceChange::Offline { .. })
        ));
        assert_eq!(t.status(&alice()), PresenceStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_remote_is_swept() {
        let (t, _rx) = tracker();
        t.apply_remote(
            "node-b",
            &PresenceAnnouncement {
                user_id: alice(),
                status: PresenceStatus::Online,
                device: DeviceClass::Web,
                last_activity: 0,
                seq: 1,
            },
        );
        assert!(t.sweep_remote().is_empty());

        tokio::time::advance(Duration::from_secs(91)).await;
        let changes = t.sweep_remote();
        assert!(matches!(changes.as_slice(), [PresenceChange::Offline { .. }]));
        assert_eq!(t.status(&alice()), PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn test_reordered_remote_announcements_are_ignored() {
        let (t, _rx) = tracker();
        let online = PresenceAnnouncement {
            user_id: alice(),
            status: PresenceStatus::Online,
            device: DeviceClass::Web,
            last_activity: 0,
            seq: 5,
        };
        let offline = PresenceAnnouncement {
            status: PresenceStatus::Offline,
            seq: 6,
            ..online.clone()
        };

        // The offline overtook the online it supersedes.
        assert!(t.apply_remote("node-b", &offline).is_none());
        assert!(t.apply_remote("node-b", &online).is_none());
        assert_eq!(t.status(&alice()), PresenceStatus::Offline);

        // A duplicate is ignored too, while other nodes are independent.
        assert!(t.apply_remote("node-b", &offline).is_none());
        assert!(t.apply_remote("node-c", &online).is_some());
        assert_eq!(t.status(&alice()), PresenceStatus::Online);

        let newer = PresenceAnnouncement {
            seq: 7,
            status: PresenceStatus::Busy,
            ..online
        };
        t.apply_remote("node-b", &newer);
        assert_eq!(t.status(&alice()), PresenceStatus::Online);
        assert_eq!(t.query(&[alice()])[0].status, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn test_local_announcements_are_sequenced() {
        let (t, _rx) = tracker();
        let first = t.local_announcement(&alice());
        t.connection_opened(&alice(), "c1", DeviceClass::Web);
        let second = t.local_announcement(&alice());
        assert!(second.seq > first.seq);
        assert!(t.local_announcements()[0].seq > second.seq);
    }

    #[tokio::test]
    async fn test_local_announcements() {
        let (t, _rx) = tracker();
        t.connection_opened(&alice(), "c1", DeviceClass::Tablet);
        t.update_status(&alice(), "c1", PresenceStatus::Away, None);

        let all = t.local_announcements();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, PresenceStatus::Away);
        assert_eq!(all[0].device, DeviceClass::Tablet);

        let bob = t.local_announcement(&UserId::new("bob"));
        assert_eq!(bob.status, PresenceStatus::Offline);
    }

    #[test]
    fn test_change_events() {
        let change = PresenceChange::Typing {
            user_id: alice(),
            task_id: "t1".into(),
            typing: true,
        };
        let event = change.to_event();
        assert_eq!(event.event, EventName::PresenceTyping);
        assert_eq!(event.data["task_id"], "t1");
        assert_eq!(change.subject(), &alice());

        let offline = PresenceChange::Offline {
            user_id: alice(),
            last_activity: 5,
        };
        assert_eq!(offline.to_event().data["status"], "offline");
    }
}
