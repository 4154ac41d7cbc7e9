//! Plugins compiled into the host binary
//!
//! These keep the shipped binary usable out of the box. Their internals are
//! deliberately small; they exist to exercise the command and statistics
//! capabilities end to end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::application::errors::PluginError;
use crate::domain::entities::{CommandSpec, StatsQuery, StatsReport};
use crate::plugins::contract::{Capability, HostContext, Plugin, PluginMetadata};
use crate::plugins::factory::FactoryRegistry;

/// Register every builtin with the factory registry
pub fn register(registry: &mut FactoryRegistry) {
    registry.register("chat-activity", || {
        Arc::new(ChatActivityPlugin::new()) as Arc<dyn Plugin>
    });
    registry.register("word-stats", || {
        Arc::new(WordStatsPlugin::new()) as Arc<dyn Plugin>
    });
}

/// Per-chat message counters with a `top` command
pub struct ChatActivityPlugin {
    counts: Arc<Mutex<HashMap<String, u64>>>,
    /// How many chats the `top` command lists; overridable via settings
    limit: Arc<AtomicUsize>,
}

impl ChatActivityPlugin {
    pub fn new() -> Self {
        Self {
            counts: Arc::new(Mutex::new(HashMap::new())),
            limit: Arc::new(AtomicUsize::new(5)),
        }
    }
}

impl Default for ChatActivityPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for ChatActivityPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new("chat-activity", env!("CARGO_PKG_VERSION"))
            .with_description("Counts command traffic per chat")
            .with_capability(Capability::Commands)
            .with_capability(Capability::Statistics)
    }

    async fn initialize(&self, ctx: &HostContext) -> Result<(), PluginError> {
        if let Some(limit) = ctx.setting::<usize>("limit") {
            self.limit.store(limit.max(1), Ordering::Relaxed);
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), PluginError> {
        self.counts
            .lock()
            .map_err(|_| PluginError::ShutdownFailed("counter lock poisoned".to_string()))?
            .clear();
        Ok(())
    }

    fn commands(&self) -> Vec<CommandSpec> {
        let counts = Arc::clone(&self.counts);
        let limit = Arc::clone(&self.limit);
        vec![CommandSpec::new("top", move |msg| {
            let mut counts = counts
                .lock()
                .map_err(|_| {
                    crate::application::errors::CommandError::ExecutionFailed(
                        "counter lock poisoned".to_string(),
                    )
                })?;
            *counts.entry(msg.chat_id.clone()).or_insert(0) += 1;

            let mut ranked: Vec<(&String, &u64)> = counts.iter().collect();
            ranked.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
            let lines: Vec<String> = ranked
                .iter()
                .take(limit.load(Ordering::Relaxed))
                .map(|(chat, n)| format!("{}: {}", chat, n))
                .collect();
            Ok(format!("Most active chats:\n{}", lines.join("\n")))
        })
        .with_description("List the most active chats")
        .with_usage("/top")]
    }

    async fn stats(&self, query: StatsQuery) -> Result<StatsReport, PluginError> {
        let counts = self
            .counts
            .lock()
            .map_err(|_| PluginError::ExecutionFailed("counter lock poisoned".to_string()))?;
        let data = serde_json::json!({
            "chats": counts.len(),
            "total": counts.values().sum::<u64>(),
            "scope": format!("{:?}", query.scope),
        });
        Ok(StatsReport::new("chat-activity", "Chat activity", data))
    }
}

/// Word frequency tallies, statistics capability only
pub struct WordStatsPlugin {
    words: Arc<Mutex<HashMap<String, u64>>>,
}

impl WordStatsPlugin {
    pub fn new() -> Self {
        Self {
            words: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Tally every whitespace-separated word of `text`
    pub fn observe(&self, text: &str) {
        if let Ok(mut words) = self.words.lock() {
            for word in text.split_whitespace() {
                *words.entry(word.to_lowercase()).or_insert(0) += 1;
            }
        }
    }
}

impl Default for WordStatsPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for WordStatsPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new("word-stats", env!("CARGO_PKG_VERSION"))
            .with_description("Word frequency tallies")
            .with_capability(Capability::Statistics)
    }

    async fn initialize(&self, _ctx: &HostContext) -> Result<(), PluginError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn stats(&self, _query: StatsQuery) -> Result<StatsReport, PluginError> {
        let words = self
            .words
            .lock()
            .map_err(|_| PluginError::ExecutionFailed("tally lock poisoned".to_string()))?;
        let mut ranked: Vec<(&String, &u64)> = words.iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        let top: Vec<serde_json::Value> = ranked
            .iter()
            .take(10)
            .map(|(w, n)| serde_json::json!({ "word": w, "count": n }))
            .collect();
        Ok(StatsReport::new(
            "word-stats",
            "Word frequencies",
            serde_json::json!({ "distinct": words.len(), "top": top }),
        ))
    }
}
