// src/lib.rs
//! Sandbox Engine Library
//!
//! Serialized, cached execution of Python snippets inside a sandboxed
//! interpreter process, for interactive documentation and notebooks.
//!
//! # Architecture
//!
//! - **runtime**: task queue, sandbox worker, session, async bridge,
//!   interpreter process and its virtual filesystem
//! - **cache**: persistent result cache keyed by code and auxiliary files
//! - **facade**: `Runner` and the reactive `ResultHook`
//! - **observability**: tracing and metrics
//! - **utils**: configuration and error types

pub mod cache;
pub mod facade;
pub mod observability;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use cache::{CachedResult, ResultCache};
pub use facade::{ResultHook, ResultState, ResultValue, RunOptions, Runner};
pub use runtime::protocol::{AuxiliaryFile, AuxiliaryFiles, InterpreterStatus};
pub use runtime::queue::{LoggingObserver, TaskObserver, TaskQueue};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
