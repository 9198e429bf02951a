//! Coordination configuration.
//!
//! Configuration can be loaded from:
//! 1. TOML file (`.taskcast.toml`)
//! 2. Environment variables (with `TASKCAST_` prefix)
//!
//! Environment variables override TOML configuration.
//!
//! # Example TOML Configuration
//!
//! ```toml
//! [taskcast.store]
//! url = "redis://127.0.0.1:6379"
//! key_prefix = "rag"
//!
//! [taskcast.lock]
//! acquire_timeout_ms = 5000
//! write_lease_ms = 30000
//! jitter = "full"
//!
//! [taskcast.registry]
//! record_ttl_secs = 3600
//!
//! [taskcast.stream]
//! poll_interval_ms = 2000
//! heartbeat_interval_ms = 10000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lock::{Jitter, LockConfig};

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = ".taskcast.toml";

/// Upper bound on every millisecond setting (one year).
pub const MAX_DURATION_MS: u64 = 365 * 24 * 60 * 60 * 1000;

/// Upper bound on the record TTL (one year).
pub const MAX_RECORD_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordConfig {
    /// Store connection and key layout.
    pub store: StoreSettings,
    /// Lock timing.
    pub lock: LockSettings,
    /// Task record retention.
    pub registry: RegistrySettings,
    /// Stream timing.
    pub stream: StreamSettings,
}

/// Store connection and key layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Redis URL; unused by the in-memory store.
    pub url: String,
    /// Prefix for every key and channel this crate touches.
    pub key_prefix: String,
    /// Per-channel buffer of the in-memory store.
    pub channel_capacity: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "taskcast".to_string(),
            channel_capacity: 256,
        }
    }
}

/// Lock timing, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// Upper bound on any single acquire loop.
    pub acquire_timeout_ms: u64,
    /// Lease on a writer's hold of the write-flag.
    pub write_lease_ms: u64,
    /// Lease on the reader group's keys.
    pub read_lease_ms: u64,
    /// Lease on the operation-lock.
    pub op_lease_ms: u64,
    /// First retry delay.
    pub backoff_base_ms: u64,
    /// Retry delay cap.
    pub backoff_max_ms: u64,
    /// Jitter policy name: `none`, `full` or `equal`.
    pub jitter: Jitter,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self::from(&LockConfig::default())
    }
}

impl From<&LockConfig> for LockSettings {
    fn from(config: &LockConfig) -> Self {
        let ms = |d: Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        Self {
            acquire_timeout_ms: ms(config.acquire_timeout),
            write_lease_ms: ms(config.write_lease),
            read_lease_ms: ms(config.read_lease),
            op_lease_ms: ms(config.op_lease),
            backoff_base_ms: ms(config.backoff_base),
            backoff_max_ms: ms(config.backoff_max),
            jitter: config.jitter,
        }
    }
}

impl LockSettings {
    /// Converts to the runtime lock configuration.
    pub fn to_lock_config(&self) -> LockConfig {
        LockConfig {
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            write_lease: Duration::from_millis(self.write_lease_ms),
            read_lease: Duration::from_millis(self.read_lease_ms),
            op_lease: Duration::from_millis(self.op_lease_ms),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            jitter: self.jitter,
        }
    }
}

/// Task record retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// How long a record survives after its last write.
    pub record_ttl_secs: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            record_ttl_secs: 86_400,
        }
    }
}

impl RegistrySettings {
    /// Record TTL as a duration.
    pub fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.record_ttl_secs)
    }
}

/// Stream timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Registry read interval in polling mode.
    pub poll_interval_ms: u64,
    /// Heartbeat interval in push mode.
    pub heartbeat_interval_ms: u64,
    /// Frames buffered between the stream's tasks and its reader.
    pub buffer: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            heartbeat_interval_ms: 10_000,
            buffer: 32,
        }
    }
}

impl StreamSettings {
    /// Poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Heartbeat interval as a duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl CoordConfig {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. `.taskcast.toml` in the working directory, if present
    /// 3. Default values
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for a malformed file, [`ConfigError::Invalid`]
    /// if the merged result fails [`validate`](Self::validate).
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(DEFAULT_CONFIG_FILE) {
            Ok(contents) => Self::from_toml(&contents)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`load`](Self::load).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let mut config = Self::from_toml(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML content (the `[taskcast]` table).
    ///
    /// # Examples
    ///
    /// ```
    /// use taskcast::config::CoordConfig;
    ///
    /// let config = CoordConfig::from_toml(r#"
    ///     [taskcast.stream]
    ///     poll_interval_ms = 500
    /// "#).unwrap();
    /// assert_eq!(config.stream.poll_interval_ms, 500);
    /// assert_eq!(config.store.key_prefix, "taskcast");
    /// ```
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        struct FullConfig {
            #[serde(default)]
            taskcast: CoordConfig,
        }

        let full: FullConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(full.taskcast)
    }

    /// Apply `TASKCAST_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary lookup. Unparseable values are
    /// logged and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            name: &str,
            slot: &mut T,
        ) {
            if let Some(raw) = lookup(name) {
                match raw.trim().parse() {
                    Ok(v) => *slot = v,
                    Err(_) => tracing::warn!(variable = name, value = %raw, "ignoring invalid override"),
                }
            }
        }

        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;

        if let Some(url) = lookup("TASKCAST_STORE_URL") {
            self.store.url = url;
        }
        if let Some(prefix) = lookup("TASKCAST_KEY_PREFIX") {
            self.store.key_prefix = prefix;
        }
        parsed(lookup, "TASKCAST_CHANNEL_CAPACITY", &mut self.store.channel_capacity);

        parsed(lookup, "TASKCAST_LOCK_ACQUIRE_TIMEOUT_MS", &mut self.lock.acquire_timeout_ms);
        parsed(lookup, "TASKCAST_LOCK_WRITE_LEASE_MS", &mut self.lock.write_lease_ms);
        parsed(lookup, "TASKCAST_LOCK_READ_LEASE_MS", &mut self.lock.read_lease_ms);
        parsed(lookup, "TASKCAST_LOCK_OP_LEASE_MS", &mut self.lock.op_lease_ms);
        parsed(lookup, "TASKCAST_LOCK_BACKOFF_BASE_MS", &mut self.lock.backoff_base_ms);
        parsed(lookup, "TASKCAST_LOCK_BACKOFF_MAX_MS", &mut self.lock.backoff_max_ms);
        parsed(lookup, "TASKCAST_LOCK_JITTER", &mut self.lock.jitter);

        parsed(lookup, "TASKCAST_RECORD_TTL_SECS", &mut self.registry.record_ttl_secs);

        parsed(lookup, "TASKCAST_POLL_INTERVAL_MS", &mut self.stream.poll_interval_ms);
        parsed(lookup, "TASKCAST_HEARTBEAT_INTERVAL_MS", &mut self.stream.heartbeat_interval_ms);
        parsed(lookup, "TASKCAST_STREAM_BUFFER", &mut self.stream.buffer);
    }

    /// Rejects zero or out-of-range intervals and leases, zero buffers, an
    /// operation lease that does not outlast the acquire timeout, and an
    /// empty key prefix.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("lock.acquire_timeout_ms", self.lock.acquire_timeout_ms, MAX_DURATION_MS),
            ("lock.write_lease_ms", self.lock.write_lease_ms, MAX_DURATION_MS),
            ("lock.read_lease_ms", self.lock.read_lease_ms, MAX_DURATION_MS),
            ("lock.op_lease_ms", self.lock.op_lease_ms, MAX_DURATION_MS),
            ("lock.backoff_base_ms", self.lock.backoff_base_ms, MAX_DURATION_MS),
            ("lock.backoff_max_ms", self.lock.backoff_max_ms, MAX_DURATION_MS),
            ("registry.record_ttl_secs", self.registry.record_ttl_secs, MAX_RECORD_TTL_SECS),
            ("stream.poll_interval_ms", self.stream.poll_interval_ms, MAX_DURATION_MS),
            ("stream.heartbeat_interval_ms", self.stream.heartbeat_interval_ms, MAX_DURATION_MS),
        ];
        for (field, value, max) in durations {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{field} must be greater than zero")));
            }
            if value > max {
                return Err(ConfigError::Invalid(format!("{field} must be at most {max}")));
            }
        }
        // A first reader holds the operation-lock while it waits on the
        // write-flag, for up to the acquire timeout.
        if self.lock.op_lease_ms <= self.lock.acquire_timeout_ms {
            return Err(ConfigError::Invalid(
                "lock.op_lease_ms must be greater than lock.acquire_timeout_ms".to_string(),
            ));
        }
        if self.store.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "store.channel_capacity must be greater than zero".to_string(),
            ));
        }
        if self.stream.buffer == 0 {
            return Err(ConfigError::Invalid(
                "stream.buffer must be greater than zero".to_string(),
            ));
        }
        if self.store.key_prefix.is_empty() {
            return Err(ConfigError::Invalid("store.key_prefix must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// IO error reading configuration file.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// TOML parse error.
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}
