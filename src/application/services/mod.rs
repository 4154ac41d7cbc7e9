//! Application services

pub mod command_service;

pub use command_service::{CommandService, BUILTIN_COMMANDS};
