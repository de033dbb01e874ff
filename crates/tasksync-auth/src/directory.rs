//! Identity lookup.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tasksync_types::UserId;

/// A user account as seen by the authenticator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// User id.
    pub id: UserId,
    /// Optional display name.
    pub display_name: Option<String>,
    /// Deactivated accounts may not connect.
    pub active: bool,
}

impl Identity {
    /// Creates an active identity.
    pub fn active(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            active: true,
        }
    }

    /// Sets the display name.
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }
}

/// Resolves a subject id to an account.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Look up `subject`; `None` if no such account exists.
    async fn lookup(&self, subject: &UserId) -> Option<Identity>;
}

/// Thread-safe in-memory identity directory.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    identities: RwLock<HashMap<UserId, Identity>>,
}

impl MemoryDirectory {
    /// Create a new empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an identity.
    pub fn insert(&self, identity: Identity) {
        self.identities.write().insert(identity.id.clone(), identity);
    }

    /// Insert an active identity with the given id.
    pub fn insert_active(&self, id: &str) {
        self.insert(Identity::active(id));
    }

    /// Mark an identity inactive. Returns false if it does not exist.
    pub fn deactivate(&self, id: &UserId) -> bool {
        match self.identities.write().get_mut(id) {
            Some(identity) => {
                identity.active = false;
                true
            }
            None => false,
        }
    }

    /// Number of known identities.
    pub fn len(&self) -> usize {
        self.identities.read().len()
    }

    /// Returns true if the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.identities.read().is_empty()
    }
}

#[async_trait]
impl IdentityDirectory for MemoryDirectory {
    async fn lookup(&self, subject: &UserId) -> Option<Identity> {
        self.identities.read().get(subject).cloned()
    }
}
