//! TOML configuration for the event subsystem.
//!
//! Every field has a default, so an empty document is a valid config.
//! Durations are integer `*_ms` / `*_secs` fields.
//!
//! ```toml
//! [event_store]
//! enabled = true
//! retention_secs = 2592000
//! async_persistence = true
//!
//! [retry_worker]
//! check_interval_ms = 5000
//!
//! [retry_policy]
//! kind = "exponential"
//! max_retries = 5
//! ```

use crate::persisted::PersistenceConfig;
use crate::retry::{ExponentialBackoff, FixedDelay, LinearBackoff, RetryPolicy};
use crate::worker::RetryWorkerConfig;
use eventline_core::event_store::EventStoreOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Environment variable holding the config file path.
pub const CONFIG_ENV: &str = "EVENTLINE_CONFIG";

const THIRTY_DAYS_SECS: u64 = 30 * 24 * 60 * 60;

/// Longest accepted retention window, about a hundred years.
pub const MAX_RETENTION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that was read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid TOML or has wrongly typed fields.
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid configuration value: {0}")]
    Validation(String),
}

/// Event store and persistence settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventStoreConfig {
    /// Persist events at all.
    pub enabled: bool,
    /// Lifetime of stored events (`0` keeps them forever).
    pub retention_secs: u64,
    /// Chunk size for batch writes.
    pub batch_size: usize,
    /// Bound on each synchronous write.
    pub write_timeout_ms: u64,
    /// Write through the background consumer.
    pub async_persistence: bool,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_secs: THIRTY_DAYS_SECS,
            batch_size: 100,
            write_timeout_ms: 5000,
            async_persistence: false,
        }
    }
}

impl EventStoreConfig {
    /// Options for an event store backend.
    #[must_use]
    pub const fn store_options(&self) -> EventStoreOptions {
        EventStoreOptions {
            enabled: self.enabled,
            retention: if self.retention_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(self.retention_secs))
            },
            batch_size: self.batch_size,
        }
    }

    /// Settings for the persisted bus.
    #[must_use]
    pub fn persistence_config(&self) -> PersistenceConfig {
        PersistenceConfig {
            async_persistence: self.async_persistence,
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            flush_batch_size: self.batch_size,
            ..PersistenceConfig::default()
        }
    }
}

/// Retry worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryWorkerSettings {
    /// Time between ticks.
    pub check_interval_ms: u64,
    /// Items per tick.
    pub batch_size: usize,
}

impl Default for RetryWorkerSettings {
    fn default() -> Self {
        Self {
            check_interval_ms: 10_000,
            batch_size: 100,
        }
    }
}

impl RetryWorkerSettings {
    /// Runtime worker config.
    #[must_use]
    pub const fn worker_config(&self) -> RetryWorkerConfig {
        RetryWorkerConfig {
            check_interval: Duration::from_millis(self.check_interval_ms),
            batch_size: self.batch_size,
        }
    }
}

/// Which retry policy to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPolicyKind {
    /// [`ExponentialBackoff`]
    #[default]
    Exponential,
    /// [`FixedDelay`]
    Fixed,
    /// [`LinearBackoff`]
    Linear,
}

/// Retry policy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    /// Policy kind.
    pub kind: RetryPolicyKind,
    /// Attempts before giving up.
    pub max_retries: u32,
    /// First delay (the fixed delay for `fixed`).
    pub initial_delay_ms: u64,
    /// Delay cap.
    pub max_delay_ms: u64,
    /// Exponential growth factor.
    pub multiplier: f64,
    /// Jitter fraction for exponential backoff.
    pub randomization: f64,
    /// Linear step.
    pub increment_ms: u64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            kind: RetryPolicyKind::Exponential,
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            randomization: 0.1,
            increment_ms: 1000,
        }
    }
}

impl RetryPolicyConfig {
    /// Build the configured policy.
    #[must_use]
    pub fn build(&self) -> Arc<dyn RetryPolicy> {
        let initial = Duration::from_millis(self.initial_delay_ms);
        let max = Duration::from_millis(self.max_delay_ms);
        match self.kind {
            RetryPolicyKind::Exponential => Arc::new(
                ExponentialBackoff::builder()
                    .max_retries(self.max_retries)
                    .initial_delay(initial)
                    .max_delay(max)
                    .multiplier(self.multiplier)
                    .randomization(self.randomization)
                    .build(),
            ),
            RetryPolicyKind::Fixed => Arc::new(FixedDelay::new(self.max_retries, initial)),
            RetryPolicyKind::Linear => Arc::new(LinearBackoff::new(
                self.max_retries,
                initial,
                Duration::from_millis(self.increment_ms),
                max,
            )),
        }
    }
}

/// Dead letter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// How long dead letters are kept.
    pub retention_secs: u64,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            retention_secs: THIRTY_DAYS_SECS,
        }
    }
}

impl DeadLetterConfig {
    /// Retention window.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSystemConfig {
    /// `[event_store]`
    pub event_store: EventStoreConfig,
    /// `[retry_worker]`
    pub retry_worker: RetryWorkerSettings,
    /// `[retry_policy]`
    pub retry_policy: RetryPolicyConfig,
    /// `[dead_letter]`
    pub dead_letter: DeadLetterConfig,
}

impl EventSystemConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::Validation`].
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the file cannot be read, otherwise
    /// see [`EventSystemConfig::from_toml_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&document)
    }

    /// Load the file named by `EVENTLINE_CONFIG`, or the defaults when unset.
    ///
    /// # Errors
    ///
    /// See [`EventSystemConfig::from_file`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_optional_path(std::env::var_os(CONFIG_ENV).map(PathBuf::from))
    }

    fn from_optional_path(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                tracing::info!(path = %path.display(), "Loading event system configuration");
                Self::from_file(path)
            }
            None => {
                tracing::debug!("{CONFIG_ENV} not set, using default configuration");
                Ok(Self::default())
            }
        }
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn require(ok: bool, message: &str) -> Result<(), ConfigError> {
            if ok {
                Ok(())
            } else {
                Err(ConfigError::Validation(message.to_string()))
            }
        }

        let store = &self.event_store;
        require(store.batch_size > 0, "event_store.batch_size must be positive")?;
        require(store.write_timeout_ms > 0, "event_store.write_timeout_ms must be positive")?;
        require(
            store.retention_secs <= MAX_RETENTION_SECS,
            "event_store.retention_secs exceeds the maximum retention",
        )?;

        let worker = &self.retry_worker;
        require(worker.check_interval_ms > 0, "retry_worker.check_interval_ms must be positive")?;
        require(worker.batch_size > 0, "retry_worker.batch_size must be positive")?;

        let policy = &self.retry_policy;
        require(
            policy.initial_delay_ms <= policy.max_delay_ms,
            "retry_policy.initial_delay_ms must not exceed max_delay_ms",
        )?;
        require(
            policy.multiplier.is_finite() && policy.multiplier >= 1.0,
            "retry_policy.multiplier must be at least 1.0",
        )?;
        require(
            (0.0..=1.0).contains(&policy.randomization),
            "retry_policy.randomization must be within 0.0..=1.0",
        )?;

        let retention = self.dead_letter.retention_secs;
        require(retention > 0, "dead_letter.retention_secs must be positive")?;
        require(
            retention <= MAX_RETENTION_SECS,
            "dead_letter.retention_secs exceeds the maximum retention",
        )
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use eventline_core::handler::HandlerError;
    use std::io::Write;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = EventSystemConfig::from_toml_str("").unwrap();

        assert_eq!(config, EventSystemConfig::default());
        assert_eq!(config.retry_worker.worker_config(), RetryWorkerConfig::default());
        assert_eq!(config.event_store.store_options(), EventStoreOptions::default());
        assert_eq!(config.dead_letter.retention(), Duration::from_secs(THIRTY_DAYS_SECS));
    }

    #[test]
    fn test_partial_document_overrides_fields() {
        let config = EventSystemConfig::from_toml_str(
            r#"
            [event_store]
            async_persistence = true
            retention_secs = 0

            [retry_worker]
            check_interval_ms = 250

            [retry_policy]
            kind = "linear"
            max_retries = 5
            "#,
        )
        .unwrap();

        assert!(config.event_store.persistence_config().async_persistence);
        assert_eq!(config.event_store.store_options().retention, None);
        assert_eq!(
            config.retry_worker.worker_config().check_interval,
            Duration::from_millis(250)
        );
        assert_eq!(config.retry_worker.batch_size, 100);
        assert_eq!(config.retry_policy.kind, RetryPolicyKind::Linear);
    }

    #[test]
    fn test_built_policies_follow_kind() {
        let err = HandlerError::failed("x");
        let linear = RetryPolicyConfig {
            kind: RetryPolicyKind::Linear,
            max_retries: 2,
            initial_delay_ms: 100,
            increment_ms: 50,
            ..RetryPolicyConfig::default()
        }
        .build();
        assert_eq!(linear.delay(2), Duration::from_millis(200));
        assert!(linear.should_retry(&err, 1));
        assert!(!linear.should_retry(&err, 2));

        let fixed = RetryPolicyConfig {
            kind: RetryPolicyKind::Fixed,
            initial_delay_ms: 300,
            ..RetryPolicyConfig::default()
        }
        .build();
        assert_eq!(fixed.delay(7), Duration::from_millis(300));
        assert_eq!(fixed.max_retries(), 3);

        let exponential = RetryPolicyConfig {
            randomization: 0.0,
            ..RetryPolicyConfig::default()
        }
        .build();
        assert_eq!(exponential.delay(2), Duration::from_secs(4));
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let cases = [
            "[retry_worker]\ncheck_interval_ms = 0",
            "[event_store]\nbatch_size = 0",
            "[retry_policy]\nrandomization = 1.5",
            "[retry_policy]\nmultiplier = 0.5",
            "[retry_policy]\ninitial_delay_ms = 5000\nmax_delay_ms = 10",
            "[event_store]\nretention_secs = 9223372036854775807",
            "[dead_letter]\nretention_secs = 9223372036854775807",
        ];
        for case in cases {
            assert!(
                matches!(EventSystemConfig::from_toml_str(case), Err(ConfigError::Validation(_))),
                "expected validation error for {case:?}"
            );
        }
    }

    #[test]
    fn test_accepts_retention_at_the_limit() {
        let config = EventSystemConfig::from_toml_str(&format!(
            "[event_store]\nretention_secs = {MAX_RETENTION_SECS}\n\n\
             [dead_letter]\nretention_secs = {MAX_RETENTION_SECS}"
        ))
        .unwrap();
        assert_eq!(
            config.dead_letter.retention(),
            Duration::from_secs(MAX_RETENTION_SECS)
        );
    }

    #[test]
    fn test_rejects_unknown_policy_kind() {
        let err = EventSystemConfig::from_toml_str("[retry_policy]\nkind = \"random\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file_and_missing_file() {
        let dir = std::env::temp_dir().join(format!("eventline-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("events.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[retry_policy]\nmax_retries = 7").unwrap();

        let config = EventSystemConfig::from_optional_path(Some(path.clone())).unwrap();
        assert_eq!(config.retry_policy.max_retries, 7);

        let missing = EventSystemConfig::from_file(dir.join("missing.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));

        assert_eq!(
            EventSystemConfig::from_optional_path(None).unwrap(),
            EventSystemConfig::default()
        );
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
