//! Error types for the auth crate.

use thiserror::Error;

/// Reasons a connection attempt is refused.
///
/// The `Display` output of each variant is the exact message sent to the
/// refused client; details stay in the variant for logging.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No credential was presented at handshake.
    #[error("authentication required")]
    MissingCredential,

    /// The credential is malformed, badly signed, expired or of the wrong type.
    #[error("invalid token")]
    InvalidToken {
        /// Why verification failed.
        reason: String,
    },

    /// The subject does not exist or is deactivated.
    #[error("user not found")]
    UserNotFound(String),

    /// Key material could not be parsed.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl AuthError {
    /// Convenience constructor for [`AuthError::InvalidToken`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        AuthError::InvalidToken {
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code for the wire.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingCredential => "AUTH_REQUIRED",
            AuthError::InvalidToken { .. } => "INVALID_TOKEN",
            AuthError::UserNotFound(_) => "USER_NOT_FOUND",
            AuthError::InvalidKey(_) | AuthError::Serialization(_) => "AUTH_INTERNAL",
        }
    }
}

/// Result type for auth operations.
pub type Result<T> = std::result::Result<T, AuthError>;
