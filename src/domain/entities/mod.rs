//! Core domain entities

pub mod command;
pub mod message;
pub mod stats;
pub mod user;

pub use command::{CommandHandler, CommandSpec};
pub use message::{Content, Message};
pub use stats::{StatsQuery, StatsReport};
pub use user::User;
