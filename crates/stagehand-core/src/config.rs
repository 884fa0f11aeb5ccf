//! Engine configuration (TOML).
//!
//! ```toml
//! worker_name = "gpu-box-1"
//! lease_secs = 30
//!
//! [capacity]
//! cpu = 16
//! gpu = 1
//! ram = 128000
//!
//! [backoff]
//! base_ms = 100
//! max_ms = 2000
//! ```
//!
//! Every key is optional; missing keys take the `Default` values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::app::backoff::BackoffPolicy;
use crate::domain::Resources;

/// Upper bound for `lease_secs` and `heartbeat_timeout_secs` (one week).
pub const MAX_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Display name of this worker in the workers relation.
    pub worker_name: String,

    /// Declared machine capacity.
    pub capacity: Resources,

    pub lease_secs: u64,

    /// Claim loop interval when work is flowing.
    pub poll_interval_ms: u64,

    /// Interval of each dependency poller's tick.
    pub dependency_poll_interval_ms: u64,

    pub heartbeat_interval_ms: u64,

    /// Workers silent for this long are not live.
    pub heartbeat_timeout_secs: u64,

    /// Idle backoff of the claim loop.
    pub backoff: BackoffPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_name: "worker".to_string(),
            capacity: Resources::new(8, 1, 64_000),
            lease_secs: 30,
            poll_interval_ms: 200,
            dependency_poll_interval_ms: 500,
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_secs: 30,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("lease_secs", self.lease_secs),
            ("poll_interval_ms", self.poll_interval_ms),
            ("dependency_poll_interval_ms", self.dependency_poll_interval_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("heartbeat_timeout_secs", self.heartbeat_timeout_secs),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
        }
        let bounded = [
            ("lease_secs", self.lease_secs),
            ("heartbeat_timeout_secs", self.heartbeat_timeout_secs),
        ];
        if let Some((name, v)) = bounded.iter().find(|(_, v)| *v > MAX_DURATION_SECS) {
            return Err(ConfigError::Invalid(format!(
                "{name} ({v}) exceeds the maximum of {MAX_DURATION_SECS}"
            )));
        }
        if self.heartbeat_interval_ms >= self.lease_secs.saturating_mul(1_000) {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_interval_ms ({}) must be shorter than the lease ({}s)",
                self.heartbeat_interval_ms, self.lease_secs
            )));
        }
        if self.backoff.multiplier.is_nan() || self.backoff.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff.multiplier must be >= 1.0, got {}",
                self.backoff.multiplier
            )));
        }
        if self.backoff.base_ms > self.backoff.max_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff.base_ms ({}) exceeds backoff.max_ms ({})",
                self.backoff.base_ms, self.backoff.max_ms
            )));
        }
        Ok(())
    }

    /// Clamped to `MAX_DURATION_SECS` for configs that skipped `validate`.
    pub fn lease_duration(&self) -> chrono::Duration {
        bounded_secs(self.lease_secs)
    }

    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        bounded_secs(self.heartbeat_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn dependency_poll_interval(&self) -> Duration {
        Duration::from_millis(self.dependency_poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

fn bounded_secs(secs: u64) -> chrono::Duration {
    // MAX_DURATION_SECS fits in i64
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_file_is_the_default() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn partial_tables_fill_in_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            worker_name = "gpu-box-1"
            lease_secs = 60

            [capacity]
            cpu = 16
            gpu = 2

            [backoff]
            max_ms = 5000
            "#,
        )
        .unwrap();

        assert_eq!(config.worker_name, "gpu-box-1");
        assert_eq!(config.capacity, Resources::new(16, 2, 0));
        assert_eq!(config.lease_duration(), chrono::Duration::seconds(60));
        assert_eq!(config.backoff.max_ms, 5000);
        assert_eq!(config.backoff.base_ms, 100);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = EngineConfig::from_toml_str("lease_seconds = 30").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[rstest]
    #[case::zero_lease("lease_secs = 0")]
    #[case::zero_poll("poll_interval_ms = 0")]
    #[case::heartbeat_longer_than_lease("lease_secs = 5\nheartbeat_interval_ms = 5000")]
    #[case::shrinking_backoff("[backoff]\nmultiplier = 0.5")]
    #[case::base_over_max("[backoff]\nbase_ms = 3000\nmax_ms = 1000")]
    #[case::lease_out_of_range("lease_secs = 9000000000000")]
    #[case::heartbeat_timeout_out_of_range("heartbeat_timeout_secs = 604801")]
    fn invalid_values_are_rejected(#[case] toml: &str) {
        let err = EngineConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "{err}");
    }

    #[test]
    fn durations_are_clamped_without_validation() {
        let config = EngineConfig {
            lease_secs: u64::MAX,
            ..EngineConfig::default()
        };
        assert_eq!(
            config.lease_duration(),
            chrono::Duration::seconds(MAX_DURATION_SECS as i64)
        );
    }

    #[test]
    fn missing_file_reports_the_path() {
        let err = EngineConfig::load("/nonexistent/stagehand.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/stagehand.toml"));
    }
}
