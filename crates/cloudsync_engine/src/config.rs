//! Configuration for the sync engine.
//!
//! Every struct here can be built in code with `with_*` setters or loaded
//! from a JSON document, which is how the C ABI and the CLI receive it.
//! Durations are written as milliseconds in JSON.

use crate::error::{SyncError, SyncResult};
use serde::Deserialize;
use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Sync scope (the remote dataset this replica mirrors).
    pub scope: String,
    /// Server URL.
    pub server_url: String,
    /// Protocol version.
    pub protocol_version: u16,
    /// Hash of the local schema; the remote rejects mismatches.
    pub schema_hash: u64,
    /// Initial session credential.
    pub auth_token: Option<String>,
    /// Maximum number of changes per pull request.
    pub pull_batch_size: u32,
    /// Maximum number of entries per push request.
    pub push_batch_size: u32,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// What to do with a trigger while a cycle is running.
    pub trigger_policy: TriggerPolicy,
    /// Per-request timeout handed to the HTTP client.
    #[serde(with = "millis")]
    pub timeout: Duration,
    /// Options for the local replica this configuration opens.
    pub replica: ReplicaOptions,
}

impl SyncConfig {
    /// Creates a configuration for `scope` on the server at `server_url`.
    pub fn new(scope: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            server_url: server_url.into(),
            protocol_version: cloudsync_protocol::PROTOCOL_VERSION,
            schema_hash: 0,
            auth_token: None,
            pull_batch_size: 100,
            push_batch_size: 100,
            retry: RetryConfig::default(),
            trigger_policy: TriggerPolicy::default(),
            timeout: Duration::from_secs(30),
            replica: ReplicaOptions::default(),
        }
    }

    /// Parses a JSON configuration document. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if the document is not valid JSON for
    /// this struct or fails validation.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks invariants the engine relies on.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] naming the offending field.
    pub fn validate(&self) -> SyncResult<()> {
        if self.protocol_version == 0
            || self.protocol_version > cloudsync_protocol::PROTOCOL_VERSION
        {
            return Err(SyncError::Config(format!(
                "protocol_version {} is not supported",
                self.protocol_version
            )));
        }
        if self.pull_batch_size == 0 {
            return Err(SyncError::Config("pull_batch_size must be positive".into()));
        }
        if self.push_batch_size == 0 {
            return Err(SyncError::Config("push_batch_size must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config("retry.max_attempts must be positive".into()));
        }
        Ok(())
    }

    /// Sets the schema hash.
    pub fn with_schema_hash(mut self, hash: u64) -> Self {
        self.schema_hash = hash;
        self
    }

    /// Sets the initial auth token.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Sets the pull batch size.
    pub fn with_pull_batch_size(mut self, size: u32) -> Self {
        self.pull_batch_size = size;
        self
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: u32) -> Self {
        self.push_batch_size = size;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the trigger policy.
    pub fn with_trigger_policy(mut self, policy: TriggerPolicy) -> Self {
        self.trigger_policy = policy;
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the replica options.
    pub fn with_replica_options(mut self, options: ReplicaOptions) -> Self {
        self.replica = options;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("main", "")
    }
}

/// Behavior of `trigger_sync` while a cycle is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPolicy {
    /// Return the running cycle's handle and run exactly one more cycle
    /// after it, however many triggers arrive meanwhile.
    #[default]
    Coalesce,
    /// Fail the trigger with `SyncAlreadyRunning`.
    Reject,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration with `max_attempts` attempts.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Delay before attempt `attempt` (0-indexed; attempt 0 has none).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let secs = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            Duration::from_secs_f64(secs + secs * 0.25 * clock_jitter())
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Cheap jitter source in `[0, 1)` from the clock's sub-second nanos.
fn clock_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}

/// Options for opening a local replica.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplicaOptions {
    /// Create the replica directory if it does not exist.
    pub create_if_missing: bool,
    /// Sync every durable write to disk before returning.
    pub sync_on_write: bool,
    /// Maximum number of unacknowledged change log entries.
    pub max_pending_entries: Option<usize>,
    /// Maximum change log size in bytes.
    pub change_log_capacity: Option<u64>,
}

impl ReplicaOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether a missing directory is created.
    pub fn with_create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    /// Sets whether writes are synced before returning.
    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }

    /// Bounds the number of pending change log entries.
    pub fn with_max_pending_entries(mut self, max: usize) -> Self {
        self.max_pending_entries = Some(max);
        self
    }

    /// Bounds the change log size in bytes.
    pub fn with_change_log_capacity(mut self, bytes: u64) -> Self {
        self.change_log_capacity = Some(bytes);
        self
    }
}

impl Default for ReplicaOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_write: true,
            max_pending_entries: None,
            change_log_capacity: None,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new("notes", "https://sync.example.com")
            .with_schema_hash(0xDEAD)
            .with_pull_batch_size(50)
            .with_push_batch_size(25)
            .with_trigger_policy(TriggerPolicy::Reject)
            .with_timeout(Duration::from_secs(60));

        assert_eq!(config.scope, "notes");
        assert_eq!(config.server_url, "https://sync.example.com");
        assert_eq!(config.schema_hash, 0xDEAD);
        assert_eq!(config.pull_batch_size, 50);
        assert_eq!(config.push_batch_size, 25);
        assert_eq!(config.trigger_policy, TriggerPolicy::Reject);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn json_config_with_defaults() {
        let config = SyncConfig::from_json(
            r#"{
                "scope": "inventory",
                "server_url": "https://sync.example.com",
                "schema_hash": 42,
                "trigger_policy": "reject",
                "retry": { "max_attempts": 5, "initial_delay": 20 },
                "timeout": 1500
            }"#,
        )
        .unwrap();

        assert_eq!(config.scope, "inventory");
        assert_eq!(config.schema_hash, 42);
        assert_eq!(config.trigger_policy, TriggerPolicy::Reject);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(20));
        assert_eq!(config.retry.max_delay, Duration::from_secs(30));
        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert_eq!(config.pull_batch_size, 100);
    }

    #[test]
    fn json_config_carries_replica_options() {
        let config = SyncConfig::from_json(
            r#"{ "replica": { "max_pending_entries": 10, "sync_on_write": false } }"#,
        )
        .unwrap();
        assert_eq!(config.replica.max_pending_entries, Some(10));
        assert!(!config.replica.sync_on_write);
        assert!(config.replica.create_if_missing);
        assert_eq!(config.replica.change_log_capacity, None);

        let defaults = SyncConfig::from_json("{}").unwrap();
        assert_eq!(defaults.replica.max_pending_entries, None);
    }

    #[test]
    fn json_config_rejects_unknown_protocol_versions() {
        for version in [0, cloudsync_protocol::PROTOCOL_VERSION + 1] {
            let err = SyncConfig::from_json(&format!(r#"{{ "protocol_version": {version} }}"#))
                .unwrap_err();
            assert!(matches!(err, SyncError::Config(msg) if msg.contains("protocol_version")));
        }
    }

    #[test]
    fn json_config_rejects_zero_batches() {
        let err = SyncConfig::from_json(r#"{ "push_batch_size": 0 }"#).unwrap_err();
        assert!(matches!(err, SyncError::Config(msg) if msg.contains("push_batch_size")));

        assert!(SyncConfig::from_json("not json").is_err());
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        assert!(config.delay_for_attempt(2) >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_without_jitter_is_exact() {
        let config = RetryConfig::new(4)
            .with_initial_delay(Duration::from_millis(10))
            .with_jitter(false);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(40));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);
        assert!(config.delay_for_attempt(5) <= Duration::from_millis(6250));
    }

    #[test]
    fn replica_options_defaults() {
        let options = ReplicaOptions::new();
        assert!(options.create_if_missing);
        assert!(options.sync_on_write);
        assert!(options.max_pending_entries.is_none());

        let bounded = options.with_max_pending_entries(10).with_change_log_capacity(4096);
        assert_eq!(bounded.max_pending_entries, Some(10));
        assert_eq!(bounded.change_log_capacity, Some(4096));
    }
}
