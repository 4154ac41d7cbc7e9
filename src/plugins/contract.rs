//! Capability contracts all plugins implement
//!
//! A plugin opts into one or more capabilities through the tags it declares
//! in its metadata; the host switches on those tags, never on runtime type
//! inspection.

use std::collections::BTreeSet;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::application::errors::PluginError;
use crate::domain::entities::{CommandSpec, StatsQuery, StatsReport};

/// Capabilities a plugin can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Exposes chat commands
    Commands,
    /// Produces read-only statistics reports
    Statistics,
}

impl Capability {
    pub fn as_str(&self) -> &str {
        match self {
            Capability::Commands => "commands",
            Capability::Statistics => "statistics",
        }
    }
}

/// Immutable metadata declared by a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: Option<String>,
    pub capabilities: BTreeSet<Capability>,
}

impl PluginMetadata {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            author: None,
            capabilities: BTreeSet::new(),
        }
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Validate the host-owned invariants: a well-formed unique name and at
    /// least one declared capability. Uniqueness across a cycle is checked
    /// by the lifecycle controller.
    pub fn validate(&self) -> Result<(), PluginError> {
        static NAME_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_-]*$").unwrap());

        if self.name.is_empty() {
            return Err(PluginError::Validation("plugin name is empty".to_string()));
        }
        if !NAME_RE.is_match(&self.name) {
            return Err(PluginError::Validation(format!(
                "invalid plugin name '{}'",
                self.name
            )));
        }
        if self.capabilities.is_empty() {
            return Err(PluginError::Validation(format!(
                "plugin '{}' declares no capability",
                self.name
            )));
        }
        Ok(())
    }
}

/// Host-provided context handed to a plugin's `initialize`.
///
/// A plugin only ever sees its own merged settings, never the full overlay.
#[derive(Debug, Clone)]
pub struct HostContext {
    /// Name the plugin is registered under
    pub plugin_name: String,
    /// Merged settings for this plugin (code defaults overlaid by config)
    pub settings: serde_json::Value,
    /// Host identification, e.g. for plugin log prefixes
    pub host_name: String,
    pub host_version: String,
}

impl HostContext {
    pub fn new(plugin_name: impl Into<String>, settings: serde_json::Value) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            settings,
            host_name: "tally-bot".to_string(),
            host_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Typed access into this plugin's settings map
    pub fn setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.settings
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Base contract every plugin implements.
///
/// Methods take `&self`; a plugin manages its own interior mutability so the
/// host can hold shared handles across registry generations. `initialize`
/// and `shutdown` run under a bounded timeout and are only ever called
/// sequentially by the lifecycle controller.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn metadata(&self) -> PluginMetadata;

    async fn initialize(&self, ctx: &HostContext) -> Result<(), PluginError>;

    async fn shutdown(&self) -> Result<(), PluginError>;

    /// Commands offered by a command-capable plugin. Ignored unless the
    /// `commands` capability is declared.
    fn commands(&self) -> Vec<CommandSpec> {
        Vec::new()
    }

    /// Statistics entry point for a statistics-capable plugin. Read-only by
    /// contract. Ignored unless the `statistics` capability is declared.
    async fn stats(&self, _query: StatsQuery) -> Result<StatsReport, PluginError> {
        Err(PluginError::ExecutionFailed(
            "plugin is not statistics-capable".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_validation_rejects_empty_name() {
        let meta = PluginMetadata::new("", "0.1.0").with_capability(Capability::Commands);
        assert!(matches!(meta.validate(), Err(PluginError::Validation(_))));
    }

    #[test]
    fn test_metadata_validation_rejects_bad_identifier() {
        let meta = PluginMetadata::new("Bad Name!", "0.1.0").with_capability(Capability::Commands);
        assert!(meta.validate().is_err());
    }

    #[test]
    fn test_metadata_validation_requires_capability() {
        let meta = PluginMetadata::new("chat-activity", "0.1.0");
        let err = meta.validate().unwrap_err();
        assert!(err.to_string().contains("no capability"));
    }

    #[test]
    fn test_metadata_validation_accepts_well_formed() {
        let meta = PluginMetadata::new("chat-activity", "0.1.0")
            .with_description("Per-chat message counters")
            .with_capability(Capability::Commands)
            .with_capability(Capability::Statistics);
        assert!(meta.validate().is_ok());
        assert!(meta.has_capability(Capability::Statistics));
    }

    #[test]
    fn test_host_context_typed_setting() {
        let ctx = HostContext::new(
            "chat-activity",
            serde_json::json!({ "limit": 5, "label": "top" }),
        );
        assert_eq!(ctx.setting::<u32>("limit"), Some(5));
        assert_eq!(ctx.setting::<String>("label").as_deref(), Some("top"));
        assert_eq!(ctx.setting::<u32>("missing"), None);
    }
}
