//! Overlay configuration for per-plugin enablement and settings
//!
//! Human-edited `plugins.yaml` at the plugin root. Plugin-specific settings
//! are opaque to the host; only `enabled` and the global `settings` keys are
//! interpreted here.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::application::errors::CycleError;

/// Per-plugin overlay entry
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PluginEntry {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Free-form plugin settings, handed to the plugin as-is
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_enabled() -> bool {
    true
}

impl Default for PluginEntry {
    fn default() -> Self {
        Self {
            enabled: true,
            config: serde_json::Value::Null,
        }
    }
}

/// Global lifecycle settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct OverlaySettings {
    pub hot_reload: bool,
    pub reload_check_interval_secs: u64,
    pub init_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        Self {
            hot_reload: true,
            reload_check_interval_secs: 3,
            init_timeout_secs: 10,
            shutdown_timeout_secs: 5,
        }
    }
}

impl OverlaySettings {
    pub fn reload_check_interval(&self) -> Duration {
        Duration::from_secs(self.reload_check_interval_secs.max(1))
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs.max(1))
    }
}

/// Parsed overlay document
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PluginOverlay {
    pub plugins: HashMap<String, PluginEntry>,
    pub settings: OverlaySettings,
}

impl PluginOverlay {
    /// Load the overlay document.
    ///
    /// A missing file yields the defaults (everything enabled); a document
    /// that fails to parse is fatal to the calling reload cycle.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CycleError> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("No overlay config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| CycleError::ConfigParse(format!("failed to read overlay: {}", e)))?;

        serde_yaml::from_str(&content).map_err(|e| {
            CycleError::ConfigParse(format!("malformed overlay {}: {}", path.display(), e))
        })
    }

    /// A plugin with no overlay entry defaults to enabled
    pub fn enabled(&self, name: &str) -> bool {
        self.plugins.get(name).map(|e| e.enabled).unwrap_or(true)
    }

    /// Merged settings for one plugin; always a JSON object
    pub fn settings_for(&self, name: &str) -> serde_json::Value {
        match self.plugins.get(name).map(|e| &e.config) {
            Some(serde_json::Value::Object(map)) => serde_json::Value::Object(map.clone()),
            _ => serde_json::Value::Object(Default::default()),
        }
    }

    /// Warn about overlay entries with no discovered candidate. Declaring a
    /// future plugin is allowed, so this is never an error.
    pub fn warn_unknown_entries<'a>(&self, discovered: impl Iterator<Item = &'a str>) {
        let discovered: std::collections::HashSet<&str> = discovered.collect();
        for name in self.plugins.keys() {
            if !discovered.contains(name.as_str()) {
                tracing::warn!("Overlay entry '{}' has no discovered plugin", name);
            }
        }
    }
}
