// src/runtime/session.rs
//! Execution session manager
//!
//! Owns the one execution environment for the life of the application.
//! The environment is created on first use; concurrent callers during the
//! cold start all wait on the same initialization. Once created it is never
//! torn down.

use crate::observability::ENVIRONMENT_INITS;
use crate::runtime::assets::AssetCache;
use crate::runtime::interpreter::{Interpreter, PythonInterpreter};
use crate::runtime::sandbox::SandboxConfig;
use crate::utils::config::default_data_dir;
use crate::utils::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Interpreter and environment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Interpreter executable name or path
    pub python: String,

    /// Root of the environment's virtual filesystem
    pub work_dir: PathBuf,

    /// Packages resolved for every task in addition to the script's imports,
    /// by import name. Unavailable ones are only reported unless
    /// `install_missing_packages` is set.
    pub baseline_packages: Vec<String>,

    /// Install missing packages with pip instead of only reporting them
    pub install_missing_packages: bool,

    /// Only URLs under this prefix go through the asset cache
    pub asset_base_url: String,

    /// Runtime assets fetched at cold start into `<work_dir>/.runtime`
    pub assets: Vec<String>,

    /// Extra environment variables for the interpreter process
    pub env_vars: BTreeMap<String, String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            python: "python3".into(),
            work_dir: default_data_dir().join("vfs"),
            baseline_packages: vec!["numpy".into(), "matplotlib".into(), "pywt".into()],
            install_missing_packages: false,
            asset_base_url: "https://files.pythonhosted.org/".into(),
            assets: vec![],
            env_vars: BTreeMap::new(),
        }
    }
}

/// Performs a cold start of the execution environment
#[async_trait]
pub trait EnvironmentLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn Interpreter>>;
}

/// Launches the Python child process
pub struct PythonLauncher {
    runtime: RuntimeConfig,
    sandbox: SandboxConfig,
    assets: AssetCache,
}

impl PythonLauncher {
    pub fn new(runtime: RuntimeConfig, sandbox: SandboxConfig, asset_dir: PathBuf) -> Self {
        let assets = AssetCache::new(asset_dir, runtime.asset_base_url.clone());
        Self {
            runtime,
            sandbox,
            assets,
        }
    }
}

#[async_trait]
impl EnvironmentLauncher for PythonLauncher {
    async fn launch(&self) -> Result<Arc<dyn Interpreter>> {
        let interpreter = PythonInterpreter::start(&self.runtime, &self.sandbox, &self.assets).await?;
        Ok(Arc::new(interpreter))
    }
}

/// Lazily initialized, never torn down execution environment
pub struct Session {
    launcher: Box<dyn EnvironmentLauncher>,
    environment: OnceCell<Arc<dyn Interpreter>>,
}

impl Session {
    pub fn new(launcher: impl EnvironmentLauncher + 'static) -> Self {
        Self {
            launcher: Box::new(launcher),
            environment: OnceCell::new(),
        }
    }

    /// Return the environment, starting it on first use
    ///
    /// A failed cold start leaves the session uninitialized, so the next
    /// call tries again.
    pub async fn get_environment(&self) -> Result<Arc<dyn Interpreter>> {
        let environment = self
            .environment
            .get_or_try_init(|| async {
                info!("Initializing execution environment");
                let started = Instant::now();
                metrics::counter!(ENVIRONMENT_INITS).increment(1);

                match self.launcher.launch().await {
                    Ok(environment) => {
                        info!("Execution environment ready in {:?}", started.elapsed());
                        Ok(environment)
                    }
                    Err(e) => {
                        warn!("Execution environment failed to initialize: {}", e);
                        Err(e)
                    }
                }
            })
            .await?;
        Ok(Arc::clone(environment))
    }

    /// Eagerly start the environment
    pub async fn init(&self) -> Result<()> {
        self.get_environment().await.map(|_| ())
    }

    pub fn is_initialized(&self) -> bool {
        self.environment.initialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::ScriptedLauncher;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_concurrent_init_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ScriptedLauncher::new(dir.path()).with_launch_delay_ms(50);
        let stats = launcher.stats();
        let session = Arc::new(Session::new(launcher));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let session = Arc::clone(&session);
            handles.push(tokio::spawn(async move { session.get_environment().await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(stats.launches.load(Ordering::SeqCst), 1);
        assert!(session.is_initialized());
    }

    #[tokio::test]
    async fn test_same_environment_returned() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(ScriptedLauncher::new(dir.path()));
        assert!(!session.is_initialized());

        session.init().await.unwrap();
        let a = session.get_environment().await.unwrap();
        let b = session.get_environment().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_failed_init_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ScriptedLauncher::new(dir.path()).failing_first(1);
        let stats = launcher.stats();
        let session = Session::new(launcher);

        assert!(session.get_environment().await.is_err());
        assert!(!session.is_initialized());

        assert!(session.get_environment().await.is_ok());
        assert_eq!(stats.launches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_runtime_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.python, "python3");
        assert!(config.work_dir.ends_with("vfs"));
        assert!(config.asset_base_url.starts_with("https://"));
        assert_eq!(config.baseline_packages, vec!["numpy", "matplotlib", "pywt"]);
        assert!(!config.install_missing_packages);
    }
}
