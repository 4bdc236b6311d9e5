// src/runtime/vfs.rs
//! Virtual filesystem owned by the execution environment
//!
//! A directory that the interpreter uses as its working directory. Scripts
//! see it as `.`; auxiliary files are written here before a task runs and
//! removed after it finishes. Everything else in it (bootstrap modules,
//! installed packages) lives as long as the environment.

use crate::runtime::interpreter::RUNTIME_DIR;
use crate::runtime::protocol::AuxiliaryFiles;
use crate::utils::errors::{EngineError, Result};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Bootstrap modules the environment installs at the root
const RESERVED_FILES: &[&str] = &["sandbox_hooks.py", "host_bridge.py"];

/// Files and directories written for one task
#[derive(Debug, Default)]
pub struct MaterializedFiles {
    written: Vec<String>,
    dirs_created: HashSet<String>,
    mkdir_calls: usize,
}

impl MaterializedFiles {
    /// Relative paths of files written so far
    pub fn written(&self) -> &[String] {
        &self.written
    }

    /// Parent directories created for this task
    pub fn dirs_created(&self) -> &HashSet<String> {
        &self.dirs_created
    }

    /// Number of directory-creation calls issued
    pub fn mkdir_calls(&self) -> usize {
        self.mkdir_calls
    }

    pub fn is_empty(&self) -> bool {
        self.written.is_empty()
    }
}

/// Root-confined view of the environment's directory
#[derive(Debug, Clone)]
pub struct VirtualFs {
    root: PathBuf,
}

impl VirtualFs {
    /// Create (if needed) and open the filesystem rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|e| {
            EngineError::InitializationFailed(format!(
                "failed to create virtual filesystem at {:?}: {}",
                root, e
            ))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a relative sandbox path onto the host, refusing anything that
    /// could land outside the root.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let path = Path::new(relative);
        let mut resolved = self.root.clone();
        let mut depth = 0usize;

        for component in path.components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(EngineError::SandboxPath(relative.to_string()));
                }
            }
        }

        if depth == 0 {
            return Err(EngineError::SandboxPath(relative.to_string()));
        }
        Ok(resolved)
    }

    /// Create a directory and its parents
    pub async fn mkdir_tree(&self, relative: &str) -> Result<()> {
        let path = self.resolve(relative)?;
        fs::create_dir_all(&path).await?;
        Ok(())
    }

    pub async fn write_file(&self, relative: &str, contents: &[u8]) -> Result<()> {
        let path = self.resolve(relative)?;
        fs::write(&path, contents).await?;
        Ok(())
    }

    pub async fn read_file(&self, relative: &str) -> Result<Vec<u8>> {
        let path = self.resolve(relative)?;
        Ok(fs::read(&path).await?)
    }

    pub async fn unlink(&self, relative: &str) -> Result<()> {
        let path = self.resolve(relative)?;
        fs::remove_file(&path).await?;
        Ok(())
    }

    pub async fn exists(&self, relative: &str) -> bool {
        match self.resolve(relative) {
            Ok(path) => fs::metadata(path).await.is_ok(),
            Err(_) => false,
        }
    }

    /// Resolve a path a task may write. The environment's own bootstrap
    /// files and the runtime directory are off limits.
    pub fn resolve_task_path(&self, relative: &str) -> Result<PathBuf> {
        let resolved = self.resolve(relative)?;
        let mut parts = resolved
            .strip_prefix(&self.root)
            .map_err(|_| EngineError::SandboxPath(relative.to_string()))?
            .components();
        let first = parts.next().map(|c| c.as_os_str());
        let reserved = match (first, parts.next()) {
            (Some(name), _) if name == RUNTIME_DIR => true,
            (Some(name), None) => RESERVED_FILES.iter().any(|r| name == *r),
            _ => false,
        };
        if reserved {
            return Err(EngineError::SandboxPath(relative.to_string()));
        }
        Ok(resolved)
    }

    /// Write every auxiliary file, creating each parent directory once.
    ///
    /// Every path is checked before anything is written. `record` is filled
    /// as files land, so a caller can clean up whatever was written even
    /// when this returns an error part way through.
    pub async fn materialize(&self, files: &AuxiliaryFiles, record: &mut MaterializedFiles) -> Result<()> {
        for name in files.keys() {
            self.resolve_task_path(name)?;
        }

        for (name, content) in files {
            let bytes = content.to_bytes()?;

            if let Some(parent) = parent_dir(name) {
                if !record.dirs_created.contains(&parent) {
                    self.mkdir_tree(&parent).await?;
                    record.mkdir_calls += 1;
                    record.dirs_created.insert(parent);
                }
            }

            self.write_file(name, &bytes).await?;
            record.written.push(name.clone());
            debug!("Materialized auxiliary file {} ({} bytes)", name, bytes.len());
        }
        Ok(())
    }

    /// Remove the files a task wrote. Failures are logged and skipped.
    pub async fn cleanup(&self, record: &MaterializedFiles) -> usize {
        let mut failures = 0;
        for name in &record.written {
            if let Err(e) = self.unlink(name).await {
                warn!("Failed to clean up file {}: {}", name, e);
                failures += 1;
            }
        }
        failures
    }
}

fn parent_dir(name: &str) -> Option<String> {
    let trimmed = name.trim_start_matches("./");
    let (dir, _) = trimmed.rsplit_once('/')?;
    if dir.is_empty() {
        None
    } else {
        Some(dir.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::protocol::AuxiliaryFile;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_resolve_rejects_escapes() {
        let dir = tempdir().unwrap();
        let vfs = VirtualFs::open(dir.path()).await.unwrap();

        assert!(vfs.resolve("a/b.txt").is_ok());
        assert!(vfs.resolve("./a.txt").is_ok());
        assert!(matches!(vfs.resolve("../x"), Err(EngineError::SandboxPath(_))));
        assert!(vfs.resolve("a/../../x").is_err());
        assert!(vfs.resolve("/etc/passwd").is_err());
        assert!(vfs.resolve("").is_err());
        assert!(vfs.resolve(".").is_err());
    }

    #[tokio::test]
    async fn test_materialize_creates_each_directory_once() {
        let dir = tempdir().unwrap();
        let vfs = VirtualFs::open(dir.path()).await.unwrap();

        let mut files = AuxiliaryFiles::new();
        files.insert("data/a.txt".into(), AuxiliaryFile::Text("a".into()));
        files.insert("data/b.txt".into(), AuxiliaryFile::Text("b".into()));
        files.insert("data/deep/c.bin".into(), AuxiliaryFile::from_bytes(&[1, 2, 3]));
        files.insert("top.py".into(), AuxiliaryFile::Text("x = 1".into()));

        let mut record = MaterializedFiles::default();
        vfs.materialize(&files, &mut record).await.unwrap();

        assert_eq!(record.written().len(), 4);
        assert_eq!(record.mkdir_calls(), 2);
        assert!(record.dirs_created().contains("data"));
        assert!(record.dirs_created().contains("data/deep"));
        assert_eq!(vfs.read_file("data/deep/c.bin").await.unwrap(), vec![1, 2, 3]);
        assert_eq!(vfs.read_file("top.py").await.unwrap(), b"x = 1");

        assert_eq!(vfs.cleanup(&record).await, 0);
        assert!(!vfs.exists("data/a.txt").await);
        assert!(!vfs.exists("top.py").await);
        // Directories stay; only files are task-scoped
        assert!(dir.path().join("data/deep").is_dir());
    }

    #[tokio::test]
    async fn test_partial_materialize_is_recorded() {
        let dir = tempdir().unwrap();
        let vfs = VirtualFs::open(dir.path()).await.unwrap();

        let mut files = AuxiliaryFiles::new();
        files.insert("a.txt".into(), AuxiliaryFile::Text("a".into()));
        files.insert(
            "b.bin".into(),
            AuxiliaryFile::Binary {
                base64: "***".into(),
            },
        );

        let mut record = MaterializedFiles::default();
        assert!(vfs.materialize(&files, &mut record).await.is_err());
        assert_eq!(record.written(), &["a.txt".to_string()]);
        assert_eq!(vfs.cleanup(&record).await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_tolerates_missing_files() {
        let dir = tempdir().unwrap();
        let vfs = VirtualFs::open(dir.path()).await.unwrap();

        let mut files = AuxiliaryFiles::new();
        files.insert("gone.txt".into(), AuxiliaryFile::Text("x".into()));
        let mut record = MaterializedFiles::default();
        vfs.materialize(&files, &mut record).await.unwrap();
        vfs.unlink("gone.txt").await.unwrap();

        assert_eq!(vfs.cleanup(&record).await, 1);
    }

    #[tokio::test]
    async fn test_materialize_refuses_environment_files() {
        let dir = tempdir().unwrap();
        let vfs = VirtualFs::open(dir.path()).await.unwrap();
        vfs.write_file("host_bridge.py", b"original").await.unwrap();

        for name in [
            "host_bridge.py",
            "./sandbox_hooks.py",
            ".runtime/sandbox_driver.py",
            "./.runtime/assets/x",
        ] {
            let mut files = AuxiliaryFiles::new();
            files.insert("ok.txt".into(), AuxiliaryFile::Text("fine".into()));
            files.insert(name.into(), AuxiliaryFile::Text("hijack".into()));

            let mut record = MaterializedFiles::default();
            let err = vfs.materialize(&files, &mut record).await.unwrap_err();
            assert!(matches!(err, EngineError::SandboxPath(_)), "{}", name);
            assert!(record.is_empty());
        }

        assert_eq!(vfs.read_file("host_bridge.py").await.unwrap(), b"original");
        assert!(!vfs.exists("ok.txt").await);
        assert!(!dir.path().join(".runtime").exists());

        // Same names below a directory are ordinary files
        assert!(vfs.resolve_task_path("lib/host_bridge.py").is_ok());
        assert!(vfs.resolve_task_path("data/.runtime").is_ok());
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("a/b/c.txt"), Some("a/b".to_string()));
        assert_eq!(parent_dir("./a/c.txt"), Some("a".to_string()));
        assert_eq!(parent_dir("c.txt"), None);
    }
}
