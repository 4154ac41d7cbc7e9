//! Plugin lifecycle subsystem
//!
//! Discovery finds candidates on disk, the overlay decides what is enabled,
//! the factory registry provides implementations, and the manager drives the
//! reload protocol that publishes immutable registry snapshots.

pub mod builtin;
pub mod contract;
pub mod discovery;
pub mod factory;
pub mod manager;
pub mod overlay;
pub mod registry;
pub mod watcher;

pub use factory::FactoryRegistry;
pub use manager::{PluginManager, ReloadRequest};
pub use watcher::PluginWatcher;
