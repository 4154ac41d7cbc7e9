use std::sync::Arc;

use crate::application::errors::CommandError;
use crate::domain::entities::Message;

/// Command handler function type.
///
/// Handlers are shared (`Arc`) so a registry snapshot can reference them
/// without taking ownership away from the declaring plugin.
pub type CommandHandler = Arc<dyn Fn(Message) -> Result<String, CommandError> + Send + Sync>;

/// A command declared by a command-capable plugin
#[derive(Clone)]
pub struct CommandSpec {
    pub name: String,
    pub description: Option<String>,
    pub usage: Option<String>,
    pub handler: CommandHandler,
}

impl CommandSpec {
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Message) -> Result<String, CommandError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: None,
            usage: None,
            handler: Arc::new(handler),
        }
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    pub fn with_usage(mut self, usage: impl Into<String>) -> Self {
        self.usage = Some(usage.into());
        self
    }
}

impl std::fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSpec")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("usage", &self.usage)
            .finish()
    }
}
