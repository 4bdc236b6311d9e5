// src/runtime/process_manager.rs
//! Process manager for spawning the interpreter process
//!
//! Locates the interpreter executable on `PATH` (or takes an explicit
//! path) and starts it with piped stdio inside the sandbox limits. The
//! child is killed when its handle is dropped.

use crate::runtime::sandbox::Sandbox;
use crate::utils::errors::{EngineError, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Configuration for spawning a process
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Executable name or path
    pub program: String,

    /// Arguments passed after the program
    pub args: Vec<String>,

    /// Working directory
    pub work_dir: PathBuf,

    /// Environment variables
    pub env_vars: BTreeMap<String, String>,
}

/// Process manager for interpreter processes
pub struct ProcessManager {
    /// Paths to executables (cached)
    executable_paths: HashMap<String, PathBuf>,
}

impl ProcessManager {
    /// Create a new process manager
    pub fn new() -> Self {
        Self {
            executable_paths: HashMap::new(),
        }
    }

    /// Find an executable by name, or accept it as-is when it is a path
    pub fn find_executable(&mut self, program: &str) -> Result<PathBuf> {
        if let Some(path) = self.executable_paths.get(program) {
            return Ok(path.clone());
        }

        let candidate = Path::new(program);
        let path = if candidate.components().count() > 1 {
            if !candidate.exists() {
                return Err(EngineError::ProcessSpawnFailed(format!(
                    "Executable '{}' does not exist",
                    program
                )));
            }
            candidate.to_path_buf()
        } else {
            which::which(program).map_err(|e| {
                EngineError::ProcessSpawnFailed(format!(
                    "Executable '{}' not found in PATH: {}",
                    program, e
                ))
            })?
        };

        info!("Found {} at {:?}", program, path);
        self.executable_paths.insert(program.to_string(), path.clone());
        Ok(path)
    }

    /// Spawn a new process with piped stdio
    pub fn spawn(&mut self, config: &SpawnConfig, sandbox: &Sandbox) -> Result<Child> {
        let executable = self.find_executable(&config.program)?;

        debug!("Spawning {:?} {:?} in {:?}", executable, config.args, config.work_dir);

        let mut command = Command::new(executable);
        command
            .args(&config.args)
            .current_dir(&config.work_dir)
            .envs(&config.env_vars)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        sandbox.apply(&mut command);

        let child = command
            .spawn()
            .map_err(|e| EngineError::ProcessSpawnFailed(format!("Failed to spawn process: {}", e)))?;

        debug!("Process spawned with PID: {:?}", child.id());

        Ok(child)
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}
