// src/utils/mod.rs
//! Common utilities: configuration and error types

pub mod config;
pub mod errors;

pub use config::{EngineConfig, ObservabilityConfig};
pub use errors::{EngineError, Result};
