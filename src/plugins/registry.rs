//! Registry snapshots - the unit of publication for a reload cycle
//!
//! A `Registry` is immutable once built. The lifecycle controller replaces
//! the published snapshot atomically; readers never observe a half-built
//! command table.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::entities::CommandHandler;
use crate::plugins::contract::{Capability, Plugin, PluginMetadata};
use crate::plugins::discovery::SourceKind;

/// Lifecycle state of a plugin record.
///
/// Transitions are monotonic within one reload generation:
/// `Discovered → Loading → {Active | Failed}`,
/// `Active → {Failed | ShuttingDown}` and `ShuttingDown → Retired`.
/// `Disabled` is terminal until the plugin is re-enabled by config and
/// rediscovered in a later generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginState {
    Discovered,
    Loading,
    Active,
    Failed,
    Disabled,
    ShuttingDown,
    Retired,
}

impl PluginState {
    pub fn as_str(&self) -> &str {
        match self {
            PluginState::Discovered => "discovered",
            PluginState::Loading => "loading",
            PluginState::Active => "active",
            PluginState::Failed => "failed",
            PluginState::Disabled => "disabled",
            PluginState::ShuttingDown => "shutting-down",
            PluginState::Retired => "retired",
        }
    }

    /// Whether `next` is a legal successor within one generation
    pub fn can_transition_to(&self, next: PluginState) -> bool {
        use PluginState::*;
        matches!(
            (self, next),
            (Discovered, Loading)
                | (Discovered, Disabled)
                | (Loading, Active)
                | (Loading, Failed)
                | (Active, Failed)
                | (Active, ShuttingDown)
                | (ShuttingDown, Retired)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PluginState::Failed | PluginState::Disabled | PluginState::Retired
        )
    }
}

/// Mutable-only-by-the-controller record for one plugin
#[derive(Clone)]
pub struct PluginRecord {
    pub metadata: PluginMetadata,
    /// `None` only when the candidate failed before instantiation
    pub instance: Option<Arc<dyn Plugin>>,
    pub state: PluginState,
    pub source_path: PathBuf,
    pub source_kind: SourceKind,
    /// Source signature at load time, compared against discovery to decide
    /// carry-over versus rebuild
    pub signature: u64,
    /// Merged settings handed to the plugin at initialize time
    pub settings: serde_json::Value,
    pub activated_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl PluginRecord {
    pub fn is_active(&self) -> bool {
        self.state == PluginState::Active
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.metadata.has_capability(capability)
    }
}

impl std::fmt::Debug for PluginRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRecord")
            .field("name", &self.metadata.name)
            .field("state", &self.state)
            .field("source_path", &self.source_path)
            .field("last_error", &self.last_error)
            .finish()
    }
}

/// Derived command table entry; never hand-edited
#[derive(Clone)]
pub struct CommandRegistration {
    pub command_name: String,
    pub plugin_name: String,
    pub description: Option<String>,
    pub handler: CommandHandler,
}

impl std::fmt::Debug for CommandRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistration")
            .field("command_name", &self.command_name)
            .field("plugin_name", &self.plugin_name)
            .finish()
    }
}

/// Immutable snapshot of all plugins and the derived command table
pub struct Registry {
    pub generation: u64,
    /// Records by plugin name, iteration in name order
    pub records: BTreeMap<String, PluginRecord>,
    /// Command name to registration; unique per invariant
    pub commands: HashMap<String, CommandRegistration>,
}

impl Registry {
    /// The pre-first-cycle snapshot
    pub fn empty() -> Self {
        Self {
            generation: 0,
            records: BTreeMap::new(),
            commands: HashMap::new(),
        }
    }

    pub fn command(&self, name: &str) -> Option<&CommandRegistration> {
        self.commands.get(name)
    }

    pub fn record(&self, name: &str) -> Option<&PluginRecord> {
        self.records.get(name)
    }

    /// `{command_name → description}` from this one snapshot, for help
    /// surfaces
    pub fn command_descriptions(&self) -> BTreeMap<String, String> {
        self.commands
            .iter()
            .map(|(name, reg)| {
                let desc = reg
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("provided by {}", reg.plugin_name));
                (name.clone(), desc)
            })
            .collect()
    }

    pub fn active_records(&self) -> impl Iterator<Item = &PluginRecord> {
        self.records.values().filter(|r| r.is_active())
    }

    /// Active statistics-capable plugins, in name order
    pub fn stats_plugins(&self) -> Vec<(String, Arc<dyn Plugin>)> {
        self.records
            .values()
            .filter(|r| r.is_active() && r.has_capability(Capability::Statistics))
            .filter_map(|r| {
                r.instance
                    .as_ref()
                    .map(|p| (r.metadata.name.clone(), Arc::clone(p)))
            })
            .collect()
    }
}
