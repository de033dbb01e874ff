//! The seam between the replay loop and the network.

use async_trait::async_trait;
use serde_json::Value;
use tasksync_realtime::{AckReply, MutationRequest};
use thiserror::Error;

/// Why the server did not apply a replayed mutation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SendError {
    /// Try again later: connection lost, timeout, server unavailable.
    #[error("retriable: {0}")]
    Retriable(String),

    /// The server's state moved on. `remote` is its current copy, `None`
    /// when the resource no longer exists.
    #[error("conflict")]
    Conflict { remote: Option<Value> },

    /// The server refused the mutation outright; retrying cannot help.
    #[error("rejected ({code}): {message}")]
    Rejected { code: String, message: String },
}

impl SendError {
    /// Classify a failed ack.
    pub fn from_ack(ack: AckReply) -> Self {
        let (code, message) = match ack.error {
            Some(e) => (e.code, e.message),
            None => ("UNKNOWN".to_string(), "operation failed".to_string()),
        };
        match code.as_str() {
            "CONFLICT" => SendError::Conflict {
                remote: ack.data.filter(|d| !d.is_null()),
            },
            "UNAVAILABLE" | "INTERNAL" | "CONNECTION_LIMIT" => SendError::Retriable(message),
            _ => SendError::Rejected { code, message },
        }
    }
}

/// Sends queued mutations to the server.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Send one mutation and wait for its ack. Returns the persisted resource.
    async fn send(&self, request: &MutationRequest) -> Result<Value, SendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_acks() {
        let conflict = AckReply::err(None, "CONFLICT", "changed").with_data(json!({"v": 2}));
        assert_eq!(
            SendError::from_ack(conflict),
            SendError::Conflict {
                remote: Some(json!({"v": 2}))
            }
        );

        let deleted = AckReply::err(None, "CONFLICT", "gone").with_data(Value::Null);
        assert_eq!(
            SendError::from_ack(deleted),
            SendError::Conflict { remote: None }
        );

        assert!(matches!(
            SendError::from_ack(AckReply::err(None, "UNAVAILABLE", "db down")),
            SendError::Retriable(_)
        ));
        assert!(matches!(
            SendError::from_ack(AckReply::err(None, "VALIDATION_ERROR", "bad title")),
            SendError::Rejected { code, .. } if code == "VALIDATION_ERROR"
        ));
    }
}
