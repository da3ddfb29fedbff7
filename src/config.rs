//! Mesh Configuration
//!
//! Tunable protocol constants. Interoperating nodes must agree on these or
//! route quality becomes inconsistent (though never unsafe).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::protocol::MAX_TTL;

pub const INITIAL_MESSAGE_TQ: u8 = 255;
pub const INITIAL_MESSAGE_TTL: u8 = 5;
pub const HOP_PENALTY: u8 = 15;
pub const OGM_INTERVAL_SECS: u64 = 2;
pub const PURGE_INTERVAL_SECS: u64 = 200;
pub const NETWORK_STAT_UPDATE_INTERVAL_SECS: u64 = 1;
pub const SLIDING_WINDOW_SIZE: usize = 12;
pub const DEVICE_EXPIRATION_SECS: u64 = 200;

/// Protocol parameters for one mesh node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub initial_message_tq: u8,
    pub initial_message_ttl: u8,
    pub hop_penalty: u8,
    pub ogm_interval_secs: u64,
    pub purge_interval_secs: u64,
    pub network_stat_update_interval_secs: u64,
    pub sliding_window_size: usize,
    pub device_expiration_secs: u64,
}

impl MeshConfig {
    pub fn new() -> Self {
        Self {
            initial_message_tq: INITIAL_MESSAGE_TQ,
            initial_message_ttl: INITIAL_MESSAGE_TTL,
            hop_penalty: HOP_PENALTY,
            ogm_interval_secs: OGM_INTERVAL_SECS,
            purge_interval_secs: PURGE_INTERVAL_SECS,
            network_stat_update_interval_secs: NETWORK_STAT_UPDATE_INTERVAL_SECS,
            sliding_window_size: SLIDING_WINDOW_SIZE,
            device_expiration_secs: DEVICE_EXPIRATION_SECS,
        }
    }

    /// Load and validate a configuration from a JSON file.
    /// Missing fields fall back to the protocol defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn ogm_interval(&self) -> Duration {
        Duration::from_secs(self.ogm_interval_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    pub fn network_stat_update_interval(&self) -> Duration {
        Duration::from_secs(self.network_stat_update_interval_secs)
    }

    pub fn device_expiration(&self) -> Duration {
        Duration::from_secs(self.device_expiration_secs)
    }

    /// Export configuration to JSON
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    /// Update from a partial JSON object; only the fields present change.
    /// The update is applied atomically: an invalid result leaves `self` untouched.
    pub fn update_from_json(&mut self, json: Value) -> Result<(), ConfigError> {
        let mut merged = self.to_json();
        if let (Some(target), Some(patch)) = (merged.as_object_mut(), json.as_object()) {
            for (key, value) in patch {
                target.insert(key.clone(), value.clone());
            }
        } else {
            return Err(ConfigError::Invalid("configuration update must be a JSON object".into()));
        }

        let updated: Self = serde_json::from_value(merged)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_message_ttl > MAX_TTL {
            return Err(ConfigError::Invalid(format!(
                "initial ttl {} exceeds protocol maximum {}",
                self.initial_message_ttl, MAX_TTL
            )));
        }

        if self.initial_message_tq == 0 {
            return Err(ConfigError::Invalid("initial tq must be greater than 0".into()));
        }

        if self.sliding_window_size == 0 {
            return Err(ConfigError::Invalid("sliding window size must be greater than 0".into()));
        }

        if self.ogm_interval_secs == 0
            || self.purge_interval_secs == 0
            || self.network_stat_update_interval_secs == 0
        {
            return Err(ConfigError::Invalid("timer intervals must be greater than 0".into()));
        }

        if self.device_expiration_secs <= self.ogm_interval_secs {
            return Err(ConfigError::Invalid(
                "device expiration must be longer than the OGM interval".into(),
            ));
        }

        Ok(())
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self::new()
    }
}
