//! Application layer - services and error types

pub mod errors;
pub mod services;
