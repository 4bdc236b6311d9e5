// src/utils/errors.rs
//! Engine error types

use thiserror::Error;

/// Result alias used throughout the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced by the sandbox engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// The interpreter executable could not be found or started
    #[error("failed to spawn interpreter process: {0}")]
    ProcessSpawnFailed(String),

    /// Cold start of the execution environment failed
    #[error("environment initialization failed: {0}")]
    InitializationFailed(String),

    /// Failure while talking to a running interpreter
    #[error("runtime error: {0}")]
    RuntimeError(String),

    /// A message crossed the host/sandbox boundary in an unexpected shape
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An auxiliary file path escapes the virtual filesystem root
    #[error("invalid sandbox path '{0}'")]
    SandboxPath(String),

    /// Generic task rejection; details were already streamed on stderr
    #[error("script execution failed")]
    ScriptFailed,

    /// The sandbox worker stopped before settling the task
    #[error("sandbox worker is gone")]
    WorkerGone,

    #[error("storage failed: {0}")]
    StorageFailed(String),

    #[error("compression failed: {0}")]
    CompressionFailed(String),

    #[error("asset fetch failed for {url}: {reason}")]
    AssetFetch { url: String, reason: String },

    #[error("remote cache error: {0}")]
    RemoteCache(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::StorageFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_failure_is_generic() {
        assert_eq!(EngineError::ScriptFailed.to_string(), "script execution failed");
    }

    #[test]
    fn test_io_conversion() {
        let err: EngineError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, EngineError::Io(_)));
    }
}
