//! Common types for TaskSync.
//!
//! This crate holds the vocabulary shared between the server-side
//! real-time crates and the client-side offline queue: user identities,
//! resource kinds, mutation verbs and presence states.

mod identity;
mod presence;
mod resource;

pub use identity::{ConnectionId, UserId};
pub use presence::{DeviceClass, PresenceStatus, Transport};
pub use resource::{MutationVerb, ResourceKind};

/// Current wall-clock time as Unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
