//! Engine configuration.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Session-wide engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeout for update tracking when the caller does not supply one (ms).
    /// Default: 5000
    pub default_update_timeout_ms: u64,

    /// Trigger `hydrate()` the first time a Hydrator's status is read.
    /// Default: false
    pub hydrate_on_access: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_update_timeout_ms: 5000,
            hydrate_on_access: false,
        }
    }
}

impl EngineConfig {
    /// Parse from a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn default_update_timeout(&self) -> Duration {
        Duration::from_millis(self.default_update_timeout_ms)
    }
}
