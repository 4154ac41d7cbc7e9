//! Build-time plugin factory registry
//!
//! Plugin implementations are compiled into the host and registered here as
//! constructors. Discovery decides *which* factories are live for a given
//! cycle; a candidate whose entry has no registered factory fails to load
//! without affecting the rest of the cycle.

use std::collections::HashMap;
use std::sync::Arc;

use crate::application::errors::PluginError;
use crate::plugins::contract::Plugin;

/// Constructor producing a fresh plugin instance
pub type PluginConstructor = Arc<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// Registry of available plugin constructors, keyed by entry name
#[derive(Default, Clone)]
pub struct FactoryRegistry {
    factories: HashMap<String, PluginConstructor>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the plugins shipped in this binary
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::plugins::builtin::register(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, entry: impl Into<String>, constructor: F)
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        let entry = entry.into();
        if self
            .factories
            .insert(entry.clone(), Arc::new(constructor))
            .is_some()
        {
            tracing::warn!("Factory '{}' registered twice, keeping the latest", entry);
        }
    }

    /// Construct a fresh instance for `entry`
    pub fn construct(&self, entry: &str) -> Result<Arc<dyn Plugin>, PluginError> {
        let constructor = self.factories.get(entry).ok_or_else(|| {
            PluginError::Load(format!("no factory registered for entry '{}'", entry))
        })?;
        Ok(constructor())
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.factories.contains_key(entry)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}
