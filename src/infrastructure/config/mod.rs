//! Host configuration management

use crate::application::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Host configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub bot: BotConfig,
    pub plugins: PluginDirConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BotConfig {
    pub name: String,
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PluginDirConfig {
    pub directory: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bot: BotConfig {
                name: "tally-bot".to_string(),
                prefix: "/".to_string(),
            },
            plugins: PluginDirConfig {
                directory: PathBuf::from("./plugins"),
            },
        }
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Config::default().bot
    }
}

impl Default for PluginDirConfig {
    fn default() -> Self {
        Config::default().plugins
    }
}

impl Config {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Parse(format!("Failed to read config: {}", e)))?;

        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse config: {}", e)))
    }

    /// Load `path` if it exists, otherwise fall back to the defaults
    pub fn load_or_default(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        if path.is_file() {
            Self::load(path)
        } else {
            tracing::info!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Write a starter config file. Refuses to overwrite an existing one.
    pub fn init_file(path: impl Into<PathBuf>) -> Result<(), ConfigError> {
        let path = path.into();
        if path.exists() {
            return Err(ConfigError::InvalidValue(format!(
                "config already exists at {}",
                path.display()
            )));
        }
        let content = serde_yaml::to_string(&Self::default())
            .map_err(|e| ConfigError::Parse(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&path, content)
            .map_err(|e| ConfigError::Parse(format!("Failed to write config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bot.name, "tally-bot");
        assert_eq!(config.bot.prefix, "/");
        assert_eq!(config.plugins.directory, PathBuf::from("./plugins"));
    }

    #[test]
    fn test_load_partial_document_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "bot:\n  name: counter\n  prefix: '!'\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.bot.name, "counter");
        assert_eq!(config.bot.prefix, "!");
        assert_eq!(config.plugins.directory, PathBuf::from("./plugins"));
    }

    #[test]
    fn test_load_or_default_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("config.yaml")).unwrap();
        assert_eq!(config.bot.name, "tally-bot");
    }

    #[test]
    fn test_malformed_config_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "bot: [nope\n").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_init_file_round_trips_and_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        Config::init_file(&path).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.bot.prefix, "/");
        assert!(Config::init_file(&path).is_err());
    }
}
