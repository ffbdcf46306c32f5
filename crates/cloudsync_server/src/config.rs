//! Service configuration.

use crate::auth::AuthConfig;
use std::time::Duration;

/// Configuration for the sync service.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum deltas returned by one pull.
    pub max_pull_batch: u32,
    /// Maximum entries accepted in one push.
    pub max_push_batch: u32,
    /// Token validation; `None` accepts any token.
    pub auth: Option<AuthConfig>,
    /// Schema hash replicas must present; `None` accepts any.
    pub schema_hash: Option<u64>,
}

impl ServerConfig {
    /// Creates a configuration with default limits and no authentication.
    pub fn new() -> Self {
        Self {
            max_pull_batch: 100,
            max_push_batch: 100,
            auth: None,
            schema_hash: None,
        }
    }

    /// Sets the maximum pull batch size.
    pub fn with_max_pull_batch(mut self, size: u32) -> Self {
        self.max_pull_batch = size;
        self
    }

    /// Sets the maximum push batch size.
    pub fn with_max_push_batch(mut self, size: u32) -> Self {
        self.max_push_batch = size;
        self
    }

    /// Enables authentication with the given secret.
    pub fn with_auth(mut self, secret: Vec<u8>) -> Self {
        self.auth = Some(AuthConfig::new(secret));
        self
    }

    /// Enables authentication with the given secret and token lifetime.
    pub fn with_auth_expiry(mut self, secret: Vec<u8>, expiry: Duration) -> Self {
        self.auth = Some(AuthConfig::new(secret).with_expiry(expiry));
        self
    }

    /// Requires replicas to present `hash`.
    pub fn with_schema_hash(mut self, hash: u64) -> Self {
        self.schema_hash = Some(hash);
        self
    }

    /// Returns true if tokens are checked.
    pub fn require_auth(&self) -> bool {
        self.auth.is_some()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}
