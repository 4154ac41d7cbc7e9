//! Application layer errors

use thiserror::Error;

/// Errors that abort an entire reload cycle.
///
/// When one of these occurs the previously published registry and overlay
/// configuration stay in force; nothing is partially applied.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Config parse error: {0}")]
    ConfigParse(String),
}

/// Errors scoped to a single plugin within a reload cycle.
///
/// These mark the offending record `Failed` and are captured as its
/// `last_error`; the cycle continues for every other candidate.
#[derive(Error, Debug, Clone)]
pub enum PluginError {
    #[error("Load error: {0}")]
    Load(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Initialization failed: {0}")]
    InitFailed(String),

    #[error("Initialization timed out after {0}s")]
    InitTimeout(u64),

    #[error("Shutdown failed: {0}")]
    ShutdownFailed(String),

    #[error("Shutdown timed out after {0}s")]
    ShutdownTimeout(u64),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

/// Command dispatch errors
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Command not found: {0}")]
    NotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

/// Host configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
