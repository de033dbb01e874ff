//! Bearer token format and verification.
//!
//! Format: `base64url(claims_json) "." base64url(signature)`, where the
//! signature is Ed25519 over the raw claims JSON bytes.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_consensus::{Signature, SigningKey, VerificationKey};
use serde::{Deserialize, Serialize};
use tasksync_types::UserId;

use crate::error::{AuthError, Result};

/// Allowed clock skew when checking `iat`, in seconds.
const CLOCK_SKEW_SECS: u64 = 60;

/// Kind of token; only access tokens may open a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

/// Signed claims carried by a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject (user id).
    pub sub: String,
    /// Token type.
    pub typ: TokenType,
    /// Issued-at, Unix seconds.
    pub iat: u64,
    /// Expiry, Unix seconds.
    pub exp: u64,
}

impl TokenClaims {
    /// Check if the claims are expired at `now` (Unix seconds).
    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.exp
    }
}

/// Result of a successful credential verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedCredential {
    /// The subject the token was issued to.
    pub subject_id: UserId,
    /// The token type.
    pub token_type: TokenType,
}

/// Verifies a presented credential.
///
/// Implementations check signature and expiry only; the caller enforces the
/// token type and resolves the subject.
pub trait CredentialVerifier: Send + Sync {
    /// Verify `token`, returning its subject and type.
    fn verify(&self, token: &str) -> Result<VerifiedCredential>;
}

/// Verifies Ed25519-signed tokens against a single verification key.
#[derive(Debug, Clone)]
pub struct Ed25519Verifier {
    key: VerificationKey,
}

impl Ed25519Verifier {
    /// Create a verifier for the given key.
    pub fn new(key: VerificationKey) -> Self {
        Self { key }
    }

    /// Create a verifier from a hex-encoded 32-byte verification key.
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key.trim()).map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AuthError::InvalidKey("expected 32 bytes".to_string()))?;
        let key =
            VerificationKey::try_from(bytes).map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }

    /// Decode and verify a token, returning its claims.
    pub fn decode(&self, token: &str) -> Result<TokenClaims> {
        let (claims_part, sig_part) = token
            .trim()
            .split_once('.')
            .ok_or_else(|| AuthError::invalid("missing signature segment"))?;

        let claims_bytes = URL_SAFE_NO_PAD
            .decode(claims_part)
            .map_err(|e| AuthError::invalid(format!("claims encoding: {}", e)))?;
        let sig_bytes = URL_SAFE_NO_PAD
            .decode(sig_part)
            .map_err(|e| AuthError::invalid(format!("signature encoding: {}", e)))?;
        let sig_bytes: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| AuthError::invalid("signature length"))?;

        self.key
            .verify(&Signature::from(sig_bytes), &claims_bytes)
            .map_err(|_| AuthError::invalid("bad signature"))?;

        let claims: TokenClaims = serde_json::from_slice(&claims_bytes)
            .map_err(|e| AuthError::invalid(format!("claims: {}", e)))?;

        let now = now_secs();
        if claims.is_expired_at(now) {
            return Err(AuthError::invalid("expired"));
        }
        if claims.iat > now + CLOCK_SKEW_SECS {
            return Err(AuthError::invalid("issued in the future"));
        }
        if claims.sub.is_empty() {
            return Err(AuthError::invalid("empty subject"));
        }

        Ok(claims)
    }
}

impl CredentialVerifier for Ed25519Verifier {
    fn verify(&self, token: &str) -> Result<VerifiedCredential> {
        let claims = self.decode(token)?;
        Ok(VerifiedCredential {
            subject_id: UserId::new(claims.sub),
            token_type: claims.typ,
        })
    }
}

/// Issues tokens. For development tooling and tests.
pub struct TokenSigner {
    key: SigningKey,
}

impl TokenSigner {
    /// Generate a fresh random signing key.
    pub fn generate() -> Self {
        Self {
            key: SigningKey::new(rand::thread_rng()),
        }
    }

    /// Load a signing key from 32 hex-encoded bytes.
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key.trim()).map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AuthError::InvalidKey("expected 32 bytes".to_string()))?;
        Ok(Self {
            key: SigningKey::from(bytes),
        })
    }

    /// Hex encoding of the secret key.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    /// The matching verification key.
    pub fn verification_key(&self) -> VerificationKey {
        self.key.verification_key()
    }

    /// Hex encoding of the verification key, as read by [`Ed25519Verifier::from_hex`].
    pub fn verification_key_hex(&self) -> String {
        hex::encode(self.key.verification_key().to_bytes())
    }

    /// Issue a token for `subject` valid for `ttl_secs`.
    pub fn issue(&self, subject: &str, typ: TokenType, ttl_secs: u64) -> Result<String> {
        let iat = now_secs();
        self.sign_claims(&TokenClaims {
            sub: subject.to_string(),
            typ,
            iat,
            exp: iat + ttl_secs,
        })
    }

    /// Sign arbitrary claims.
    pub fn sign_claims(&self, claims: &TokenClaims) -> Result<String> {
        let claims_bytes =
            serde_json::to_vec(claims).map_err(|e| AuthError::Serialization(e.to_string()))?;
        let signature = self.key.sign(&claims_bytes);
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&claims_bytes),
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_issue_and_verify() {
        let signer = TokenSigner::generate();
        let verifier = Ed25519Verifier::new(signer.verification_key());

        let token = signer.issue("alice", TokenType::Access, 60).unwrap();
        let verified = verifier.verify(&token).unwrap();

        assert_eq!(verified.subject_id, UserId::new("alice"));
        assert_eq!(verified.token_type, TokenType::Access);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let signer = TokenSigner::generate();
        let other = TokenSigner::generate();
        let verifier = Ed25519Verifier::new(other.verification_key());

        let token = signer.issue("alice", TokenType::Access, 60).unwrap();
        assert!(matches!(
            verifier.verify(&token),
            Err(AuthError::InvalidToken { .. })
        ));
    }

    #[test]
    fn test_expired_rejected() {
        let signer = TokenSigner::generate();
        let verifier = Ed25519Verifier::new(signer.verification_key());

        let now = now_secs();
        let token = signer
            .sign_claims(&TokenClaims {
                sub: "alice".into(),
                typ: TokenType::Access,
                iat: now - 120,
                exp: now - 60,
            })
            .unwrap();

        let err = verifier.verify(&token).unwrap_err();
        match err {
            AuthError::InvalidToken { reason } => assert_eq!(reason, "expired"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_tampered_claims_rejected() {
        let signer = TokenSigner::generate();
        let verifier = Ed25519Verifier::new(signer.verification_key());

        let token = signer.issue("alice", TokenType::Access, 60).unwrap();
        let (_, sig) = token.split_once('.').unwrap();
        let forged_claims = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&TokenClaims {
                sub: "mallory".into(),
                typ: TokenType::Access,
                iat: now_secs(),
                exp: now_secs() + 60,
            })
            .unwrap(),
        );

        let forged = format!("{}.{}", forged_claims, sig);
        assert!(verifier.verify(&forged).is_err());
    }

    #[test]
    fn test_hex_round_trip_keys() {
        let signer = TokenSigner::generate();
        let verifier = Ed25519Verifier::from_hex(&signer.verification_key_hex()).unwrap();
        let restored = TokenSigner::from_hex(&signer.secret_hex()).unwrap();

        let token = restored.issue("bob", TokenType::Refresh, 60).unwrap();
        let verified = verifier.verify(&token).unwrap();
        assert_eq!(verified.token_type, TokenType::Refresh);
    }

    #[test]
    fn test_bad_hex_key() {
        assert!(matches!(
            Ed25519Verifier::from_hex("abcd"),
            Err(AuthError::InvalidKey(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_garbage_never_verifies(input in ".{0,200}") {
            let signer = TokenSigner::generate();
            let verifier = Ed25519Verifier::new(signer.verification_key());
            prop_assert!(verifier.verify(&input).is_err());
        }
    }
}
