//! Persistence configuration.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The TOML text could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// A value is out of its allowed range.
    #[error("Invalid configuration value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Tuning of the matcher, the replayers and the periodic bookkeeping.
///
/// # Config File Format
///
/// ```toml
/// [persistence]
/// safety_phase_duration_ms = 30000
/// replay_batch_size = 200
/// storage_timeout_ms = 10000
/// matcher_batch_size = 200
/// matcher_batch_delay_ms = 50
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Length of the safety phase that closes each replay.
    pub safety_phase_duration_ms: u64,
    /// Extra wait on top of the safety phase during shutdown.
    pub shutdown_grace_ms: u64,
    /// Messages read from storage per replay batch.
    pub replay_batch_size: usize,
    /// Retries of a timed-out replay read or send before the session is cancelled.
    pub replay_max_batch_retries: u32,
    /// Pause between two replay retries.
    pub replay_retry_delay_ms: u64,
    /// Budget of one storage call.
    pub storage_timeout_ms: u64,
    /// Budget of one send to a replayed peer.
    pub send_timeout_ms: u64,
    /// Entries written per storage batch.
    pub matcher_batch_size: usize,
    /// Time the matcher waits for a batch to fill.
    pub matcher_batch_delay_ms: u64,
    /// Retries of a failed storage write before the batch is reported lost.
    pub matcher_max_write_retries: u32,
    /// Interval of the non-acked count publication.
    pub non_acked_count_publish_interval_ms: u64,
    /// Interval of the oldest non-acked timestamp bookkeeping.
    pub oldest_non_acked_update_interval_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            safety_phase_duration_ms: 30_000,
            shutdown_grace_ms: 5_000,
            replay_batch_size: 200,
            replay_max_batch_retries: 5,
            replay_retry_delay_ms: 500,
            storage_timeout_ms: 10_000,
            send_timeout_ms: 5_000,
            matcher_batch_size: 200,
            matcher_batch_delay_ms: 50,
            matcher_max_write_retries: 5,
            non_acked_count_publish_interval_ms: 10_000,
            oldest_non_acked_update_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    persistence: PersistenceConfig,
}

impl PersistenceConfig {
    /// Short phases and small batches for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            safety_phase_duration_ms: 100,
            shutdown_grace_ms: 100,
            replay_batch_size: 2,
            replay_max_batch_retries: 3,
            replay_retry_delay_ms: 5,
            storage_timeout_ms: 200,
            send_timeout_ms: 200,
            matcher_batch_size: 50,
            matcher_batch_delay_ms: 5,
            matcher_max_write_retries: 3,
            non_acked_count_publish_interval_ms: 50,
            oldest_non_acked_update_interval_ms: 50,
        }
    }

    /// Parse the `[persistence]` table of a TOML document.
    ///
    /// Missing keys keep their default value.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        file.persistence.validate()?;
        Ok(file.persistence)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("replay_batch_size", self.replay_batch_size as u64),
            ("matcher_batch_size", self.matcher_batch_size as u64),
            ("storage_timeout_ms", self.storage_timeout_ms),
            ("send_timeout_ms", self.send_timeout_ms),
            (
                "non_acked_count_publish_interval_ms",
                self.non_acked_count_publish_interval_ms,
            ),
            (
                "oldest_non_acked_update_interval_ms",
                self.oldest_non_acked_update_interval_ms,
            ),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be positive".into(),
                });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn safety_phase_duration(&self) -> Duration {
        Duration::from_millis(self.safety_phase_duration_ms)
    }

    /// Longest time shutdown waits for replayers to finish.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.safety_phase_duration_ms + self.shutdown_grace_ms)
    }

    #[must_use]
    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    #[must_use]
    pub fn replay_retry_delay(&self) -> Duration {
        Duration::from_millis(self.replay_retry_delay_ms)
    }

    #[must_use]
    pub fn matcher_batch_delay(&self) -> Duration {
        Duration::from_millis(self.matcher_batch_delay_ms)
    }

    #[must_use]
    pub fn non_acked_count_publish_interval(&self) -> Duration {
        Duration::from_millis(self.non_acked_count_publish_interval_ms)
    }

    #[must_use]
    pub fn oldest_non_acked_update_interval(&self) -> Duration {
        Duration::from_millis(self.oldest_non_acked_update_interval_ms)
    }
}
