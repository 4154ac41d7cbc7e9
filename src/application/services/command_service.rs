//! Command dispatch over the published registry snapshot
//!
//! Every dispatch resolves against one snapshot, so a command enumeration
//! and the lookups that follow it are consistent even while a reload cycle
//! is publishing a new generation.

use std::sync::Arc;

use crate::domain::entities::{Content, Message};
use crate::plugins::manager::{PluginManager, ReloadRequest};

/// Command names owned by the host. Plugins cannot claim these.
pub const BUILTIN_COMMANDS: &[&str] = &["help", "version", "plugins", "reload"];

pub struct CommandService {
    manager: Arc<PluginManager>,
    prefix: String,
}

impl CommandService {
    pub fn new(manager: Arc<PluginManager>, prefix: impl Into<String>) -> Self {
        Self {
            manager,
            prefix: prefix.into(),
        }
    }

    /// Parse a raw input line into a command message. Lines without the
    /// command prefix are not commands.
    pub fn parse(&self, chat_id: &str, line: &str) -> Option<Message> {
        let rest = line.trim().strip_prefix(&self.prefix)?;
        let mut parts = rest.split_whitespace();
        let name = parts.next()?;
        if name.is_empty() {
            return None;
        }
        let args: Vec<String> = parts.map(|s| s.to_string()).collect();
        Some(Message::from_command(chat_id, name, args))
    }

    /// Dispatch one command message and produce the reply text. Host
    /// built-ins resolve first; anything else goes to the command table of
    /// the current snapshot.
    pub async fn dispatch(&self, message: Message) -> String {
        let Content::Command { name, .. } = &message.content else {
            return "Not a command".to_string();
        };
        let name = name.clone();

        match name.as_str() {
            "help" => self.help(),
            "version" => format!("tally-bot {}", env!("CARGO_PKG_VERSION")),
            "plugins" => self.plugin_listing(),
            "reload" => self.manual_reload().await,
            _ => self.dispatch_plugin_command(&name, message),
        }
    }

    fn dispatch_plugin_command(&self, name: &str, message: Message) -> String {
        let registry = self.manager.registry();
        let Some(registration) = registry.command(name) else {
            return format!("Unknown command: {}. Try {}help", name, self.prefix);
        };

        match (registration.handler)(message) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(
                    command = %name,
                    plugin = %registration.plugin_name,
                    "Command failed: {}",
                    e
                );
                format!("Command '{}' failed: {}", name, e)
            }
        }
    }

    fn help(&self) -> String {
        let registry = self.manager.registry();
        let mut lines = vec!["Available commands:".to_string()];
        for name in BUILTIN_COMMANDS {
            lines.push(format!("  {}{}", self.prefix, name));
        }
        for (name, desc) in registry.command_descriptions() {
            lines.push(format!("  {}{} - {}", self.prefix, name, desc));
        }
        lines.join("\n")
    }

    fn plugin_listing(&self) -> String {
        let registry = self.manager.registry();
        if registry.records.is_empty() {
            return format!("No plugins (generation {})", registry.generation);
        }

        let mut lines = vec![format!("Plugins (generation {}):", registry.generation)];
        for record in registry.records.values() {
            let mut line = format!(
                "  {} {} [{}]",
                record.metadata.name,
                record.metadata.version,
                record.state.as_str()
            );
            if let Some(err) = &record.last_error {
                line.push_str(&format!(" - {}", err));
            }
            lines.push(line);
        }
        lines.join("\n")
    }

    async fn manual_reload(&self) -> String {
        match self.manager.reload(ReloadRequest::manual()).await {
            Ok(outcome) => format!(
                "Reloaded: generation {}, {} active, {} carried, {} failed",
                outcome.generation,
                outcome.activated.len(),
                outcome.carried.len(),
                outcome.failed.len()
            ),
            Err(e) => format!("Reload failed: {}", e),
        }
    }
}
