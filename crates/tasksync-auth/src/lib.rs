//! Connection authentication for TaskSync.
//!
//! This crate provides:
//! - **Tokens**: Ed25519-signed bearer tokens (`claims.signature`, base64url)
//! - **Verification**: The [`CredentialVerifier`] seam and its Ed25519 implementation
//! - **Directory**: The [`IdentityDirectory`] seam for active/inactive lookup
//! - **Authenticator**: Binds a verified identity to a new connection
//!
//! Token issuance belongs to the surrounding application; [`TokenSigner`]
//! exists for development tooling and tests.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use tasksync_auth::{
//!     ConnectionAuthenticator, Ed25519Verifier, MemoryDirectory, TokenSigner, TokenType,
//! };
//!
//! # tokio_test_block(async {
//! let signer = TokenSigner::generate();
//! let verifier = Ed25519Verifier::new(signer.verification_key());
//! let directory = MemoryDirectory::new();
//! directory.insert_active("alice");
//!
//! let auth = ConnectionAuthenticator::new(Arc::new(verifier), Arc::new(directory));
//! let token = signer.issue("alice", TokenType::Access, 3600).unwrap();
//!
//! let identity = auth.authenticate(Some(&token)).await.unwrap();
//! assert_eq!(identity.user_id.as_str(), "alice");
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f)
//! # }
//! ```

mod authenticator;
mod directory;
mod error;
mod token;

pub use authenticator::{extract_credential, AuthenticatedIdentity, ConnectionAuthenticator};
pub use directory::{Identity, IdentityDirectory, MemoryDirectory};
pub use error::{AuthError, Result};
pub use token::{
    CredentialVerifier, Ed25519Verifier, TokenClaims, TokenSigner, TokenType, VerifiedCredential,
};
