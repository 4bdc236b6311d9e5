// src/runtime/sandbox.rs
//! OS-level limits for the interpreter process
//!
//! Provides:
//! - Address-space limit (RLIMIT_AS)
//! - Open file limit (RLIMIT_NOFILE)
//!
//! Limits are installed in the child between fork and exec. A limit the
//! kernel refuses is skipped; the interpreter still starts.

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

/// Sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Enable memory limiting
    pub limit_memory: bool,

    /// Memory limit in MB
    pub memory_limit_mb: u64,

    /// Maximum open file descriptors (0 disables the limit)
    pub max_open_files: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            limit_memory: true,
            memory_limit_mb: 2048,
            max_open_files: 256,
        }
    }
}

impl SandboxConfig {
    fn memory_limit_bytes(&self) -> Option<u64> {
        self.memory_limit_mb.checked_mul(1024 * 1024)
    }

    /// No limits at all
    pub fn unlimited() -> Self {
        Self {
            limit_memory: false,
            memory_limit_mb: 0,
            max_open_files: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.limit_memory && self.memory_limit_mb < 64 {
            return Err(EngineError::Config(
                "sandbox memory limit cannot be less than 64MB".into(),
            ));
        }
        if self.limit_memory && self.memory_limit_bytes().is_none() {
            return Err(EngineError::Config(format!(
                "sandbox memory limit of {}MB is out of range",
                self.memory_limit_mb
            )));
        }
        if self.max_open_files != 0 && self.max_open_files < 16 {
            return Err(EngineError::Config(
                "sandbox open file limit cannot be less than 16".into(),
            ));
        }
        Ok(())
    }
}

/// Resource limits resolved from a [`SandboxConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub address_space_bytes: Option<u64>,
    pub open_files: Option<u64>,
}

/// Applies limits to interpreter commands before they are spawned
#[derive(Debug, Clone)]
pub struct Sandbox {
    limits: ResourceLimits,
}

impl Sandbox {
    pub fn new(config: &SandboxConfig) -> Result<Self> {
        config.validate()?;

        let limits = ResourceLimits {
            address_space_bytes: config
                .limit_memory
                .then(|| config.memory_limit_mb.saturating_mul(1024 * 1024)),
            open_files: (config.max_open_files != 0).then_some(config.max_open_files),
        };

        Ok(Self { limits })
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }

    /// Arrange for the limits to be set in the child process
    #[cfg(unix)]
    pub fn apply(&self, command: &mut Command) {
        let limits = self.limits;
        if limits.address_space_bytes.is_none() && limits.open_files.is_none() {
            return;
        }

        debug!(
            "Applying sandbox limits: address space {:?}, open files {:?}",
            limits.address_space_bytes, limits.open_files
        );

        // SAFETY: the closure only calls setrlimit, which is async-signal-safe,
        // and allocates nothing.
        unsafe {
            command.pre_exec(move || {
                use nix::sys::resource::{setrlimit, Resource};

                if let Some(bytes) = limits.address_space_bytes {
                    let _ = setrlimit(Resource::RLIMIT_AS, bytes, bytes);
                }
                if let Some(files) = limits.open_files {
                    let _ = setrlimit(Resource::RLIMIT_NOFILE, files, files);
                }
                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    pub fn apply(&self, _command: &mut Command) {
        tracing::warn!("Sandbox limits are not supported on this platform");
    }
}
