//! Error types for the real-time module.

use tasksync_auth::AuthError;
use thiserror::Error;

/// Errors that can occur in real-time operations.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// The handshake credential was refused.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Connection limit reached.
    #[error("connection limit reached: max {0} connections")]
    ConnectionLimit(usize),

    /// Presence watch limit exceeded for one connection.
    #[error("watch limit exceeded: max {0} watched users")]
    WatchLimit(usize),

    /// Connection not found.
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    /// The client sent an operation name that does not exist.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    /// The operation payload did not match its schema.
    #[error("invalid payload for {operation}: {reason}")]
    InvalidPayload {
        /// Operation name.
        operation: String,
        /// Parse failure.
        reason: String,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Cross-node bridge failure.
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,
}

impl RealtimeError {
    /// Stable code carried in ack error objects.
    pub fn code(&self) -> &'static str {
        match self {
            RealtimeError::Auth(e) => e.code(),
            RealtimeError::ConnectionLimit(_) => "CONNECTION_LIMIT",
            RealtimeError::WatchLimit(_) => "WATCH_LIMIT",
            RealtimeError::ConnectionNotFound(_) => "NOT_CONNECTED",
            RealtimeError::UnknownOperation(_) => "UNKNOWN_OPERATION",
            RealtimeError::InvalidPayload { .. } | RealtimeError::Serialization(_) => {
                "INVALID_PAYLOAD"
            }
            RealtimeError::Bridge(_) | RealtimeError::ChannelClosed => "INTERNAL",
        }
    }
}

/// Errors raised by pub/sub transports behind the cross-node bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("subscribe error: {0}")]
    Subscribe(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("bridge already started")]
    AlreadyStarted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_errors_pass_through_message() {
        let err: RealtimeError = AuthError::MissingCredential.into();
        assert_eq!(err.to_string(), "authentication required");
        assert_eq!(err.code(), "AUTH_REQUIRED");
    }

    #[test]
    fn test_codes() {
        assert_eq!(
            RealtimeError::UnknownOperation("x".into()).code(),
            "UNKNOWN_OPERATION"
        );
        assert_eq!(RealtimeError::WatchLimit(10).code(), "WATCH_LIMIT");
    }
}
