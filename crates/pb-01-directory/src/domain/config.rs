//! Directory configuration.

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

/// Tuning of the directory server and client.
///
/// # Config File Format
///
/// ```toml
/// [directory]
/// peer_ping_timeout_ms = 5000
/// transient_peer_decommission_timeout_ms = 30000
/// persistent_peer_decommission_timeout_ms = 86400000
/// max_concurrent_pings = 10
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Silence after which a peer is marked not responding.
    pub peer_ping_timeout_ms: u64,
    /// Silence after which a transient peer is decommissioned.
    pub transient_peer_decommission_timeout_ms: u64,
    /// Silence after which a persistent peer is decommissioned; never if unset.
    pub persistent_peer_decommission_timeout_ms: Option<u64>,
    /// Pings in flight during one dead-peer check.
    pub max_concurrent_pings: usize,
    /// Interval between two dead-peer checks.
    pub dead_peer_check_interval_ms: u64,
    /// Client-side budget for the registration round trip.
    pub registration_timeout_ms: u64,
    /// Client-side cap on events buffered for a peer it does not know yet.
    pub max_buffered_events_per_peer: usize,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            peer_ping_timeout_ms: 5_000,
            transient_peer_decommission_timeout_ms: 30_000,
            persistent_peer_decommission_timeout_ms: None,
            max_concurrent_pings: 10,
            dead_peer_check_interval_ms: 5_000,
            registration_timeout_ms: 10_000,
            max_buffered_events_per_peer: 256,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    directory: DirectoryConfig,
}

impl DirectoryConfig {
    /// Short timeouts for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            peer_ping_timeout_ms: 100,
            transient_peer_decommission_timeout_ms: 500,
            persistent_peer_decommission_timeout_ms: None,
            max_concurrent_pings: 10,
            dead_peer_check_interval_ms: 50,
            registration_timeout_ms: 1_000,
            max_buffered_events_per_peer: 16,
        }
    }

    /// Parse the `[directory]` table of a TOML document.
    ///
    /// Missing keys keep their default value.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        file.directory.validate()?;
        Ok(file.directory)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_pings == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrent_pings",
                reason: "must be at least 1".into(),
            });
        }
        if self.transient_peer_decommission_timeout_ms < self.peer_ping_timeout_ms {
            return Err(ConfigError::Invalid {
                field: "transient_peer_decommission_timeout_ms",
                reason: "must not be shorter than peer_ping_timeout_ms".into(),
            });
        }
        if let Some(persistent) = self.persistent_peer_decommission_timeout_ms {
            if persistent < self.peer_ping_timeout_ms {
                return Err(ConfigError::Invalid {
                    field: "persistent_peer_decommission_timeout_ms",
                    reason: "must not be shorter than peer_ping_timeout_ms".into(),
                });
            }
        }
        if self.dead_peer_check_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "dead_peer_check_interval_ms",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    /// Registration budget as a `Duration`.
    #[must_use]
    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    /// Dead-peer check interval as a `Duration`.
    #[must_use]
    pub fn dead_peer_check_interval(&self) -> Duration {
        Duration::from_millis(self.dead_peer_check_interval_ms)
    }
}
