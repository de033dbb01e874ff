//! Handshake-time connection authentication.

use std::sync::Arc;
use tasksync_types::UserId;
use tracing::{debug, warn};

use crate::directory::IdentityDirectory;
use crate::error::{AuthError, Result};
use crate::token::{CredentialVerifier, TokenType};

/// Identity bound to a connection after a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedIdentity {
    /// The authenticated user.
    pub user_id: UserId,
    /// Display name, when the directory knows one.
    pub display_name: Option<String>,
}

/// Verifies the handshake credential and resolves it to an active user.
#[derive(Clone)]
pub struct ConnectionAuthenticator {
    verifier: Arc<dyn CredentialVerifier>,
    directory: Arc<dyn IdentityDirectory>,
}

impl ConnectionAuthenticator {
    /// Create an authenticator from its collaborators.
    pub fn new(
        verifier: Arc<dyn CredentialVerifier>,
        directory: Arc<dyn IdentityDirectory>,
    ) -> Self {
        Self {
            verifier,
            directory,
        }
    }

    /// Authenticate a handshake credential.
    ///
    /// Order of checks: presence, signature/expiry, token type, directory.
    pub async fn authenticate(&self, credential: Option<&str>) -> Result<AuthenticatedIdentity> {
        let token = match credential.map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => return Err(AuthError::MissingCredential),
        };

        let verified = self.verifier.verify(token).inspect_err(|e| {
            debug!(error = ?e, "Credential verification failed");
        })?;

        if verified.token_type != TokenType::Access {
            return Err(AuthError::invalid(format!(
                "wrong token type: {:?}",
                verified.token_type
            )));
        }

        let identity = self
            .directory
            .lookup(&verified.subject_id)
            .await
            .ok_or_else(|| AuthError::UserNotFound(verified.subject_id.to_string()))?;

        if !identity.active {
            warn!(user_id = %identity.id, "Deactivated user attempted to connect");
            return Err(AuthError::UserNotFound(identity.id.to_string()));
        }

        Ok(AuthenticatedIdentity {
            user_id: identity.id,
            display_name: identity.display_name,
        })
    }
}

/// Pick the credential out of the handshake.
///
/// The `token` query parameter wins over an `Authorization: Bearer` header.
/// Message payloads are never consulted.
pub fn extract_credential<'a>(
    query_token: Option<&'a str>,
    authorization: Option<&'a str>,
) -> Option<&'a str> {
    if let Some(token) = query_token.filter(|t| !t.trim().is_empty()) {
        return Some(token);
    }

    authorization.and_then(|value| {
        let (scheme, token) = value.trim().split_once(' ')?;
        if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
            Some(token.trim())
        } else {
            None
        }
    })
}
