//! Resource kinds and mutation verbs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of synchronized resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Task,
    Category,
    Tag,
}

impl ResourceKind {
    /// Prefix used on the wire (`todo:create`, `category:created`, ...).
    pub fn wire_prefix(self) -> &'static str {
        match self {
            ResourceKind::Task => "todo",
            ResourceKind::Category => "category",
            ResourceKind::Tag => "tag",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Task => "task",
            ResourceKind::Category => "category",
            ResourceKind::Tag => "tag",
        };
        f.write_str(s)
    }
}

/// A mutation applied to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationVerb {
    Create,
    Update,
    Delete,
    /// Bulk position change; only meaningful for tasks.
    Reorder,
}

impl MutationVerb {
    /// Imperative form used by client operations.
    pub fn as_str(self) -> &'static str {
        match self {
            MutationVerb::Create => "create",
            MutationVerb::Update => "update",
            MutationVerb::Delete => "delete",
            MutationVerb::Reorder => "reorder",
        }
    }

    /// Past-tense form used by server notifications.
    pub fn past_tense(self) -> &'static str {
        match self {
            MutationVerb::Create => "created",
            MutationVerb::Update => "updated",
            MutationVerb::Delete => "deleted",
            MutationVerb::Reorder => "reordered",
        }
    }
}

impl fmt::Display for MutationVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
