//! Token authentication for the sync service.
//!
//! Tokens are HMAC-SHA256 signed and carry their issue time, so the
//! service can check them without keeping any per-token state.
//!
//! ## Token Format
//!
//! Tokens are composed of:
//! - 16 bytes: replica id
//! - 8 bytes: issue time (Unix millis, big-endian)
//! - 32 bytes: HMAC-SHA256 over the above followed by the scope name
//!
//! Total: 56 bytes, lowercase hex for transport (112 characters).

use crate::error::{ServerError, ServerResult};
use cloudsync_protocol::ReplicaId;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

const TOKEN_LEN: usize = 56;
const SIGNED_LEN: usize = 24;

/// Authentication configuration.
#[derive(Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// How long a token stays valid after it is issued.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret", &"<redacted>")
            .field("token_expiry", &self.token_expiry)
            .finish()
    }
}

/// Issues and checks replica tokens.
#[derive(Debug, Clone)]
pub struct TokenValidator {
    config: AuthConfig,
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Issues a token for `replica` in `scope`, valid from now.
    ///
    /// # Errors
    ///
    /// Returns an error if the HMAC key is unusable.
    pub fn create_token(&self, replica: ReplicaId, scope: &str) -> ServerResult<String> {
        self.create_token_at(replica, scope, now_ms())
    }

    /// Issues a token with an explicit issue time.
    ///
    /// # Errors
    ///
    /// Returns an error if the HMAC key is unusable.
    pub fn create_token_at(
        &self,
        replica: ReplicaId,
        scope: &str,
        issued_ms: u64,
    ) -> ServerResult<String> {
        let mut token = Vec::with_capacity(TOKEN_LEN);
        token.extend_from_slice(replica.as_bytes());
        token.extend_from_slice(&issued_ms.to_be_bytes());
        let signature = self.sign(&token, scope)?;
        token.extend_from_slice(&signature);
        Ok(to_hex(&token))
    }

    /// Checks a token presented by `replica` for `scope`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotAuthorized`] if the token is malformed,
    /// issued to another replica or scope, or expired.
    pub fn validate_token(&self, token: &[u8], replica: ReplicaId, scope: &str) -> ServerResult<()> {
        self.validate_token_at(token, replica, scope, now_ms())
    }

    /// Checks a token against an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`validate_token`](Self::validate_token).
    pub fn validate_token_at(
        &self,
        token: &[u8],
        replica: ReplicaId,
        scope: &str,
        now_ms: u64,
    ) -> ServerResult<()> {
        let raw = from_hex(token)
            .filter(|raw| raw.len() == TOKEN_LEN)
            .ok_or_else(|| ServerError::NotAuthorized("malformed token".into()))?;

        let (signed, signature) = raw.split_at(SIGNED_LEN);
        if &signed[..16] != replica.as_bytes() {
            return Err(ServerError::NotAuthorized(
                "token issued to another replica".into(),
            ));
        }

        let mut mac = self.mac()?;
        mac.update(signed);
        mac.update(scope.as_bytes());
        mac.verify_slice(signature)
            .map_err(|_| ServerError::NotAuthorized("invalid token signature".into()))?;

        let mut issued = [0u8; 8];
        issued.copy_from_slice(&signed[16..SIGNED_LEN]);
        let issued_ms = u64::from_be_bytes(issued);
        let expiry_ms = u64::try_from(self.config.token_expiry.as_millis()).unwrap_or(u64::MAX);
        if now_ms > issued_ms.saturating_add(expiry_ms) {
            return Err(ServerError::NotAuthorized("token expired".into()));
        }

        Ok(())
    }

    fn mac(&self) -> ServerResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(format!("invalid HMAC key: {e}")))
    }

    fn sign(&self, data: &[u8], scope: &str) -> ServerResult<[u8; 32]> {
        let mut mac = self.mac()?;
        mac.update(data);
        mac.update(scope.as_bytes());
        Ok(mac.finalize().into_bytes().into())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn from_hex(text: &[u8]) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    text.chunks(2)
        .map(|pair| {
            let s = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(s, 16).ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret-key-32-bytes-long!!";

    fn validator() -> TokenValidator {
        TokenValidator::new(AuthConfig::new(SECRET.to_vec()))
    }

    fn replica() -> ReplicaId {
        ReplicaId::from_bytes([1; 16])
    }

    #[test]
    fn create_and_validate_token() {
        let validator = validator();
        let token = validator.create_token(replica(), "notes").unwrap();
        assert_eq!(token.len(), TOKEN_LEN * 2);
        assert!(validator
            .validate_token(token.as_bytes(), replica(), "notes")
            .is_ok());
    }

    #[test]
    fn reject_wrong_replica() {
        let validator = validator();
        let token = validator.create_token(replica(), "notes").unwrap();
        let other = ReplicaId::from_bytes([2; 16]);
        assert!(validator
            .validate_token(token.as_bytes(), other, "notes")
            .is_err());
    }

    #[test]
    fn reject_wrong_scope() {
        let validator = validator();
        let token = validator.create_token(replica(), "notes").unwrap();
        assert!(validator
            .validate_token(token.as_bytes(), replica(), "billing")
            .is_err());
    }

    #[test]
    fn reject_wrong_secret() {
        let token = validator().create_token(replica(), "notes").unwrap();
        let other = TokenValidator::new(AuthConfig::new(b"another-secret".to_vec()));
        assert!(other
            .validate_token(token.as_bytes(), replica(), "notes")
            .is_err());
    }

    #[test]
    fn reject_expired_token() {
        let validator =
            TokenValidator::new(AuthConfig::new(SECRET.to_vec()).with_expiry(Duration::from_secs(60)));
        let token = validator.create_token_at(replica(), "notes", 1_000).unwrap();

        assert!(validator
            .validate_token_at(token.as_bytes(), replica(), "notes", 61_000)
            .is_ok());
        let err = validator
            .validate_token_at(token.as_bytes(), replica(), "notes", 61_001)
            .unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn reject_malformed_tokens() {
        let validator = validator();
        let tokens: [&[u8]; 4] = [b"", b"abc", b"zz", &[b'0'; 110]];
        for token in tokens {
            assert!(validator.validate_token(token, replica(), "notes").is_err());
        }
    }

    #[test]
    fn reject_tampered_issue_time() {
        let validator = validator();
        let token = validator.create_token_at(replica(), "notes", 1_000).unwrap();
        let mut tampered = token.into_bytes();
        // Last hex digit of the issue time.
        let i = SIGNED_LEN * 2 - 1;
        tampered[i] = if tampered[i] == b'f' { b'e' } else { b'f' };
        assert!(validator
            .validate_token_at(&tampered, replica(), "notes", 2_000)
            .is_err());
    }

    #[test]
    fn debug_redacts_secret() {
        let debug = format!("{:?}", AuthConfig::new(SECRET.to_vec()));
        assert!(!debug.contains("test-secret"));
    }
}
