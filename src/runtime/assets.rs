// src/runtime/assets.rs
//! Cache-first fetch for runtime assets
//!
//! Runtime downloads (wheels, support modules) are large and never change
//! for a given URL, so they are kept on disk and served from there on later
//! cold starts. Only URLs under the runtime's own distribution base are
//! cached; anything else is fetched straight through.

use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Persistent, URL-keyed asset cache
pub struct AssetCache {
    dir: PathBuf,
    base_url: String,
    client: reqwest::Client,
}

impl AssetCache {
    pub fn new(dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Whether `url` belongs to the runtime distribution and may be cached
    pub fn is_cacheable(&self, url: &str) -> bool {
        !self.base_url.is_empty() && url.starts_with(&self.base_url)
    }

    /// On-disk location for a cacheable URL
    pub fn cache_path(&self, url: &str) -> PathBuf {
        self.dir.join(format!("{:016x}-{}", fnv1a64(url), file_name(url)))
    }

    /// Fetch `url`, consulting the on-disk cache first when in scope
    pub async fn fetch(&self, url: &str) -> Result<Bytes> {
        if !self.is_cacheable(url) {
            return self.download(url).await;
        }

        let path = self.cache_path(url);
        if let Ok(cached) = fs::read(&path).await {
            info!("Using cached response for {}", url);
            return Ok(Bytes::from(cached));
        }

        let body = self.download(url).await?;
        self.store(&path, &body).await?;
        Ok(body)
    }

    /// Fetch `url` and write it into `dest_dir`, returning the written path
    pub async fn fetch_into(&self, url: &str, dest_dir: &Path) -> Result<PathBuf> {
        let body = self.fetch(url).await?;
        fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(file_name(url));
        fs::write(&dest, &body).await?;
        debug!("Installed asset {} -> {:?}", url, dest);
        Ok(dest)
    }

    async fn download(&self, url: &str) -> Result<Bytes> {
        let fetch_error = |reason: String| EngineError::AssetFetch {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?
            .error_for_status()
            .map_err(|e| fetch_error(e.to_string()))?;

        response.bytes().await.map_err(|e| fetch_error(e.to_string()))
    }

    async fn store(&self, path: &Path, body: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        // Write then rename so a crash never leaves a truncated entry behind
        let partial = path.with_extension("partial");
        fs::write(&partial, body).await?;
        fs::rename(&partial, path).await?;
        Ok(())
    }
}

fn file_name(url: &str) -> String {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    let name = trimmed.rsplit('/').find(|segment| !segment.is_empty()).unwrap_or("asset");
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect()
}

fn fnv1a64(input: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    input.bytes().fold(OFFSET, |hash, byte| (hash ^ byte as u64).wrapping_mul(PRIME))
}
