//! Host configuration
//!
//! Every knob has a default, so an empty file (or no file) is a valid
//! configuration. Durations are expressed in milliseconds.

use crate::error::ConfigError;
use crate::plugin::protocol::{MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Bound on a single pricing call. Long enough for a live billing API
    /// round trip, short enough to bound what the user waits for.
    pub call_timeout_ms: u64,
    /// How long a freshly spawned plugin has to start listening
    pub startup_timeout_ms: u64,
    /// Grace period between the shutdown signal and a forced kill
    pub shutdown_grace_ms: u64,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Consecutive missed probes before an instance is declared dead
    pub dead_after_missed_probes: u32,
    /// Restarts allowed per plugin before it is permanently failed
    pub restart_cap: u32,
    pub protocol: ProtocolRange,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            startup_timeout_ms: 5_000,
            shutdown_grace_ms: 3_000,
            probe_interval_ms: 10_000,
            probe_timeout_ms: 2_000,
            dead_after_missed_probes: 3,
            restart_cap: 3,
            protocol: ProtocolRange::default(),
        }
    }
}

/// Inclusive range of protocol versions the host accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtocolRange {
    pub min: u32,
    pub max: u32,
}

impl Default for ProtocolRange {
    fn default() -> Self {
        Self {
            min: MIN_PROTOCOL_VERSION,
            max: MAX_PROTOCOL_VERSION,
        }
    }
}

impl ProtocolRange {
    pub fn contains(&self, version: u32) -> bool {
        (self.min..=self.max).contains(&version)
    }
}

impl HostConfig {
    /// Load configuration from a YAML file and validate it
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_yaml(&content).map_err(|err| match err {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })?;

        tracing::debug!("Loaded host configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to unit, not to a mapping
        let config: HostConfig = if content.trim().is_empty() {
            HostConfig::default()
        } else {
            serde_yaml::from_str(content).map_err(|err| ConfigError::Parse {
                path: "<inline>".into(),
                message: err.to_string(),
            })?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("call_timeout_ms", self.call_timeout_ms),
            ("startup_timeout_ms", self.startup_timeout_ms),
            ("probe_interval_ms", self.probe_interval_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{field} must be greater than zero")));
            }
        }

        if self.dead_after_missed_probes == 0 {
            return Err(ConfigError::Invalid(
                "dead_after_missed_probes must be at least 1".to_string(),
            ));
        }

        if self.protocol.min == 0 || self.protocol.min > self.protocol.max {
            return Err(ConfigError::Invalid(format!(
                "protocol range {}..={} is empty or starts at zero",
                self.protocol.min, self.protocol.max
            )));
        }

        if self.protocol.min > MAX_PROTOCOL_VERSION || self.protocol.max < MIN_PROTOCOL_VERSION {
            return Err(ConfigError::Invalid(format!(
                "protocol range {}..={} does not overlap the versions this host speaks ({}..={})",
                self.protocol.min, self.protocol.max, MIN_PROTOCOL_VERSION, MAX_PROTOCOL_VERSION
            )));
        }

        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}
