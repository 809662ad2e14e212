//! Liaison configuration.

use std::path::Path;
use std::time::Duration;

use hymnal_common::{HymnalError, ResultExt};
use hymnal_sw::SupervisorConfig;
use serde::{Deserialize, Serialize};

/// User-facing notification texts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiaisonTexts {
    pub offline: String,
    pub online: String,
    pub update_available: String,
    pub install_available: String,
    pub ios_instructions: String,
    pub mobile_instructions: String,
    pub installed: String,
}

impl Default for LiaisonTexts {
    fn default() -> Self {
        Self {
            offline: "You are offline. Saved hymns are still available.".to_string(),
            online: "Back online".to_string(),
            update_available: "A new version of the hymnal is available".to_string(),
            install_available: "Install the hymnal for quick offline access".to_string(),
            ios_instructions: "To install, tap Share and then \"Add to Home Screen\"".to_string(),
            mobile_instructions: "Install the hymnal from your browser menu".to_string(),
            installed: "Hymnal installed".to_string(),
        }
    }
}

/// Configuration for [`crate::ClientLiaison`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiaisonConfig {
    /// Well-known path the supervisor script is served from.
    pub script_path: String,

    /// Registration scope. `None` uses the script's directory.
    pub scope: Option<String>,

    /// Lifetime of connectivity notifications, in milliseconds.
    pub transient_ms: u64,

    /// Lifetime of install instructions, in milliseconds.
    pub instructions_ms: u64,

    pub texts: LiaisonTexts,

    /// Configuration handed to the supervisor at registration.
    pub worker: SupervisorConfig,
}

impl Default for LiaisonConfig {
    fn default() -> Self {
        Self {
            script_path: "/sw.js".to_string(),
            scope: None,
            transient_ms: 3_000,
            instructions_ms: 10_000,
            texts: LiaisonTexts::default(),
            worker: SupervisorConfig::default(),
        }
    }
}

impl LiaisonConfig {
    pub fn from_json_str(json: &str) -> Result<Self, HymnalError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| HymnalError::config_with_source("invalid liaison config", e))?;
        if !config.script_path.starts_with('/') {
            return Err(HymnalError::config(format!(
                "script_path must be absolute: {}",
                config.script_path
            )));
        }
        config.worker.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, HymnalError> {
        let raw = std::fs::read_to_string(path)
            .context(format!("reading config {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    pub fn transient(&self) -> Duration {
        Duration::from_millis(self.transient_ms)
    }

    pub fn instructions(&self) -> Duration {
        Duration::from_millis(self.instructions_ms)
    }
}
