//! Supervisor configuration.
//!
//! Cache names, pattern lists and deadlines are injected per generation
//! instead of living in module-level constants, so two generations (or a
//! test double) can run side by side with different settings.

use std::path::Path;
use std::time::Duration;

use hymnal_common::{HymnalError, ResultExt};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

/// Per-strategy network deadlines, in milliseconds. `None` leaves the
/// deadline to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchDeadlines {
    pub network_first_ms: Option<u64>,
    pub cache_first_ms: Option<u64>,
    pub revalidate_ms: Option<u64>,
}

impl Default for FetchDeadlines {
    fn default() -> Self {
        Self {
            network_first_ms: Some(8_000),
            cache_first_ms: Some(15_000),
            revalidate_ms: Some(15_000),
        }
    }
}

impl FetchDeadlines {
    /// No deadlines at all.
    pub fn none() -> Self {
        Self {
            network_first_ms: None,
            cache_first_ms: None,
            revalidate_ms: None,
        }
    }

    pub fn network_first(&self) -> Option<Duration> {
        self.network_first_ms.map(Duration::from_millis)
    }

    pub fn cache_first(&self) -> Option<Duration> {
        self.cache_first_ms.map(Duration::from_millis)
    }

    pub fn revalidate(&self) -> Option<Duration> {
        self.revalidate_ms.map(Duration::from_millis)
    }
}

/// Configuration for one supervisor generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// App-specific cache-name prefix.
    pub cache_prefix: String,

    /// Generation number baked into every cache name.
    pub generation: u32,

    /// Paths stored in the critical cache at install.
    pub critical_assets: Vec<String>,

    /// Paths tried, in order, as the offline navigation page.
    pub fallback_assets: Vec<String>,

    /// URL regexes served network-first.
    pub network_first_patterns: Vec<String>,

    /// URL regexes served cache-first.
    pub cache_first_patterns: Vec<String>,

    /// URL regexes (case-insensitive) for telemetry short-circuited offline.
    pub analytics_patterns: Vec<String>,

    /// LRU cap for the dynamic cache. `None` means unbounded.
    pub dynamic_cache_max_entries: Option<usize>,

    /// Network deadlines per strategy.
    pub deadlines: FetchDeadlines,

    /// Activate right after install instead of waiting for old clients.
    pub skip_waiting_on_install: bool,

    /// Text carried by the `SW_INSTALLED` broadcast.
    pub installed_message: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            cache_prefix: "hymnal".to_string(),
            generation: 1,
            critical_assets: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/manifest.json".to_string(),
            ],
            fallback_assets: vec!["/".to_string(), "/index.html".to_string()],
            network_first_patterns: vec![r"/static/hymns\.json$".to_string(), r"/api/".to_string()],
            cache_first_patterns: vec![
                r"\.(png|jpg|jpeg|svg|gif|webp|ico)$".to_string(),
                r"\.(js|css)$".to_string(),
                r"/static/".to_string(),
            ],
            analytics_patterns: vec![r"cloud\.umami\.is".to_string(), r"umami".to_string()],
            dynamic_cache_max_entries: Some(250),
            deadlines: FetchDeadlines::default(),
            skip_waiting_on_install: true,
            installed_message: "Hymnal is ready to work offline".to_string(),
        }
    }
}

impl SupervisorConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, HymnalError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| HymnalError::config_with_source("invalid supervisor config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn from_json_file(path: &Path) -> Result<Self, HymnalError> {
        let raw = std::fs::read_to_string(path)
            .context(format!("reading config {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    /// Reject configurations the supervisor cannot run with.
    pub fn validate(&self) -> Result<(), HymnalError> {
        if self.cache_prefix.trim().is_empty() {
            return Err(HymnalError::config("cache_prefix must not be empty"));
        }
        if self.dynamic_cache_max_entries == Some(0) {
            return Err(HymnalError::config(
                "dynamic_cache_max_entries must be positive (use null for unbounded)",
            ));
        }
        for asset in self.critical_assets.iter().chain(&self.fallback_assets) {
            if !asset.starts_with('/') {
                return Err(HymnalError::config(format!(
                    "asset path must be absolute: {asset}"
                )));
            }
        }
        let patterns = self
            .network_first_patterns
            .iter()
            .chain(&self.cache_first_patterns)
            .chain(&self.analytics_patterns);
        for pattern in patterns {
            RegexBuilder::new(pattern)
                .build()
                .map_err(|e| HymnalError::config_with_source(format!("bad pattern {pattern}"), e))?;
        }
        Ok(())
    }

    /// Cache holding the install-time critical assets.
    pub fn critical_cache_name(&self) -> String {
        format!("{}-v{}", self.cache_prefix, self.generation)
    }

    /// Cache for general static assets.
    pub fn static_cache_name(&self) -> String {
        format!("{}-static-v{}", self.cache_prefix, self.generation)
    }

    /// Cache for network responses collected at runtime.
    pub fn dynamic_cache_name(&self) -> String {
        format!("{}-dynamic-v{}", self.cache_prefix, self.generation)
    }

    /// Names this generation keeps alive through activation.
    ///
    /// The critical cache is kept alongside static and dynamic because the
    /// offline navigation fallback is served from it.
    pub fn retained_cache_names(&self) -> [String; 3] {
        [
            self.critical_cache_name(),
            self.static_cache_name(),
            self.dynamic_cache_name(),
        ]
    }

    /// A cache is stale if it carries our prefix but is not one of ours.
    pub fn is_stale_cache(&self, name: &str) -> bool {
        let prefix = format!("{}-", self.cache_prefix);
        name.starts_with(&prefix) && !self.retained_cache_names().iter().any(|n| n == name)
    }
}
