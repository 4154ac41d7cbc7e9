//! Domain layer - Core business objects with no external dependencies
//!
//! This layer contains:
//! - Entities: Core business objects (User, Message, CommandSpec, stats types)

pub mod entities;
