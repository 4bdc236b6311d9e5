// src/utils/config.rs
//! Engine configuration
//!
//! Layered with the `config` crate:
//!
//! 1. Built-in defaults
//! 2. `sandbox-engine.toml` in the working directory, or the file named by
//!    `SANDBOX_ENGINE_CONFIG`
//! 3. Environment variables, e.g. `SANDBOX_ENGINE_CACHE__MAX_SIZE_BYTES=1048576`

use crate::cache::{CacheConfig, RemoteCacheConfig};
use crate::runtime::sandbox::SandboxConfig;
use crate::runtime::session::RuntimeConfig;
use crate::utils::errors::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "SANDBOX_ENGINE_CONFIG";

const DEFAULT_CONFIG_FILE: &str = "sandbox-engine";
const ENV_PREFIX: &str = "SANDBOX_ENGINE";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interpreter, virtual filesystem and package settings
    pub runtime: RuntimeConfig,

    /// OS-level limits applied to the interpreter process
    pub sandbox: SandboxConfig,

    /// Persistent result cache
    pub cache: CacheConfig,

    /// Shared remote memo store consulted after a local miss
    pub remote: RemoteCacheConfig,

    /// Logging and metrics
    pub observability: ObservabilityConfig,
}

/// Logging and metrics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Emit logs as JSON lines instead of human-readable text
    pub json_logs: bool,

    /// Install the Prometheus metrics recorder
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            json_logs: false,
            metrics: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from defaults, optional file, and environment
    pub fn load() -> Result<Self> {
        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::load_from(Some(Path::new(&path))),
            None => Self::load_from(None),
        }
    }

    /// Load configuration, reading `path` when given (it must exist)
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let defaults = Config::try_from(&EngineConfig::default())?;

        let mut builder = Config::builder().add_source(defaults);
        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false)),
        };

        let config = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize::<EngineConfig>()?;

        Ok(config)
    }
}

/// Base directory for everything the engine persists locally
pub fn default_data_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("sandbox-engine")
}
