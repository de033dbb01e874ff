//! Live connection handles.

use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tasksync_types::{now_millis, ConnectionId, DeviceClass, Transport, UserId};
use tokio::sync::mpsc;

use crate::error::RealtimeError;

/// Maximum users one connection may watch for presence.
pub const MAX_WATCHES_PER_CONNECTION: usize = 100;

/// An authenticated client connection.
///
/// The connection always belongs to exactly one user. Outbound frames go
/// through an unbounded channel drained by the transport's writer task,
/// which keeps per-connection ordering.
#[derive(Debug)]
pub struct Connection {
    /// Unique connection identifier.
    pub id: ConnectionId,
    /// Owning user.
    pub user_id: UserId,
    /// Negotiated transport.
    pub transport: Transport,
    /// Device class reported at handshake.
    pub device: DeviceClass,
    /// Unix milliseconds at creation.
    pub created_at: u64,
    sender: mpsc::UnboundedSender<String>,
    /// Users whose presence this connection watches.
    watching: RwLock<HashSet<UserId>>,
    activity_subscribed: AtomicBool,
    closed: AtomicBool,
}

impl Connection {
    /// Create a new connection with a message sender.
    pub fn new(
        id: ConnectionId,
        user_id: UserId,
        transport: Transport,
        device: DeviceClass,
        sender: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            id,
            user_id,
            transport,
            device,
            created_at: now_millis(),
            sender,
            watching: RwLock::new(HashSet::new()),
            activity_subscribed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Send a message to this connection.
    pub fn send(&self, message: String) -> Result<(), RealtimeError> {
        if self.is_closed() {
            return Err(RealtimeError::ChannelClosed);
        }
        self.sender
            .send(message)
            .map_err(|_| RealtimeError::ChannelClosed)
    }

    /// Mark the connection closed; later sends fail fast.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.sender.is_closed()
    }

    /// Start watching a user's presence. Returns true if newly added.
    pub fn watch(&self, user: UserId) -> Result<bool, RealtimeError> {
        let mut watching = self.watching.write();
        if watching.contains(&user) {
            return Ok(false);
        }
        if watching.len() >= MAX_WATCHES_PER_CONNECTION {
            return Err(RealtimeError::WatchLimit(MAX_WATCHES_PER_CONNECTION));
        }
        Ok(watching.insert(user))
    }

    /// Watch every user in `users`, or none of them if that would exceed
    /// [`MAX_WATCHES_PER_CONNECTION`]. Returns the users not already watched.
    pub fn watch_all(&self, users: &[UserId]) -> Result<Vec<UserId>, RealtimeError> {
        let mut watching = self.watching.write();
        let mut added: Vec<UserId> = Vec::new();
        for user in users {
            if !watching.contains(user) && !added.contains(user) {
                added.push(user.clone());
            }
        }
        if watching.len() + added.len() > MAX_WATCHES_PER_CONNECTION {
            return Err(RealtimeError::WatchLimit(MAX_WATCHES_PER_CONNECTION));
        }
        watching.extend(added.iter().cloned());
        Ok(added)
    }

    /// Stop watching a user's presence.
    pub fn unwatch(&self, user: &UserId) -> bool {
        self.watching.write().remove(user)
    }

    /// Whether this connection watches `user`.
    pub fn is_watching(&self, user: &UserId) -> bool {
        self.watching.read().contains(user)
    }

    /// Drain the watched set.
    pub fn take_watched(&self) -> Vec<UserId> {
        self.watching.write().drain().collect()
    }

    /// Number of watched users.
    pub fn watch_count(&self) -> usize {
        self.watching.read().len()
    }

    /// Toggle the activity feed subscription.
    pub fn set_activity_subscribed(&self, on: bool) {
        self.activity_subscribed.store(on, Ordering::SeqCst);
    }

    /// Whether the connection receives `activity:feed`.
    pub fn activity_subscribed(&self) -> bool {
        self.activity_subscribed.load(Ordering::SeqCst)
    }
}

/// Handle for receiving frames destined for the transport.
pub type ConnectionReceiver = mpsc::UnboundedReceiver<String>;

/// Create a new connection with its frame receiver.
pub fn create_connection(
    user_id: UserId,
    transport: Transport,
    device: DeviceClass,
) -> (Arc<Connection>, ConnectionReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let id = uuid::Uuid::new_v4().to_string();
    let connection = Arc::new(Connection::new(id, user_id, transport, device, sender));
    (connection, receiver)
}
