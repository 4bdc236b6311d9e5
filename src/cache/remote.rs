// src/cache/remote.rs
//! Shared remote memo store
//!
//! A second tier behind the local cache. Memos are plain HTTP objects at
//! `<download_prefix><namespace>/<key>`: anyone can read them, and writing
//! needs an API key that buys a signed upload URL from the upload service.

use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Remote memo store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteCacheConfig {
    /// Consult the remote store at all
    pub enabled: bool,

    /// Public prefix memos are downloaded from
    pub download_prefix: String,

    /// Folder under the prefix holding this application's memos
    pub namespace: String,

    /// Endpoint handing out signed upload URLs
    pub upload_api_url: String,

    /// Bearer token for uploads; without it the store is read-only
    pub api_key: Option<String>,
}

impl Default for RemoteCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            download_prefix: "https://tempory.net/f/memobin/".into(),
            namespace: "wavelets".into(),
            upload_api_url: "https://hub.tempory.net/api/uploadFile".into(),
            api_key: None,
        }
    }
}

/// A remote key-value store of serialized results
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// `Ok(None)` when no memo exists for `key`
    async fn load(&self, key: &str) -> Result<Option<String>>;

    async fn save(&self, key: &str, value: &str) -> Result<()>;

    /// Whether `save` can succeed at all
    fn can_save(&self) -> bool;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadRequest<'a> {
    app_name: &'a str,
    file_path: &'a str,
    size: usize,
    user_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadGrant {
    upload_url: String,
    download_url: String,
}

/// [`RemoteStore`] over HTTP with signed uploads
pub struct MemobinStore {
    client: reqwest::Client,
    config: RemoteCacheConfig,
}

impl MemobinStore {
    pub fn new(config: RemoteCacheConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Path of a memo relative to the download prefix
    pub fn file_path(&self, key: &str) -> String {
        format!("{}/{}", self.config.namespace, key)
    }

    pub fn memo_url(&self, key: &str) -> String {
        format!("{}{}", self.config.download_prefix, self.file_path(key))
    }

    async fn signed_upload_url(&self, api_key: &str, key: &str, size: usize) -> Result<String> {
        let file_path = self.file_path(key);
        let request = UploadRequest {
            app_name: "memobin",
            file_path: &file_path,
            size,
            user_id: &self.config.namespace,
        };

        let grant: UploadGrant = self
            .client
            .post(&self.config.upload_api_url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| remote_error("failed to get signed upload url", e))?
            .json()
            .await
            .map_err(|e| remote_error("invalid upload grant", e))?;

        let expected = self.memo_url(key);
        if grant.download_url != expected {
            return Err(EngineError::RemoteCache(format!(
                "upload grant is for {} instead of {}",
                grant.download_url, expected
            )));
        }
        Ok(grant.upload_url)
    }
}

#[async_trait]
impl RemoteStore for MemobinStore {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        let url = self.memo_url(key);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| remote_error("failed to load memo", e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!("No remote memo for {}", key);
            return Ok(None);
        }
        let body = response
            .error_for_status()
            .map_err(|e| remote_error("failed to load memo", e))?
            .text()
            .await
            .map_err(|e| remote_error("failed to read memo", e))?;
        Ok(Some(body))
    }

    async fn save(&self, key: &str, value: &str) -> Result<()> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| EngineError::RemoteCache("remote cache API key not set".into()))?;

        let upload_url = self.signed_upload_url(api_key, key, value.len()).await?;
        info!("Uploading memo for key: {}", key);
        self.client
            .put(&upload_url)
            .body(value.to_string())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| remote_error("failed to upload memo", e))?;
        Ok(())
    }

    fn can_save(&self) -> bool {
        self.config.api_key.is_some()
    }
}

fn remote_error(context: &str, err: reqwest::Error) -> EngineError {
    EngineError::RemoteCache(format!("{}: {}", context, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memo_url_layout() {
        let store = MemobinStore::new(RemoteCacheConfig::default());
        assert_eq!(
            store.memo_url("pyodideResult/1/42"),
            "https://tempory.net/f/memobin/wavelets/pyodideResult/1/42"
        );
        assert_eq!(store.file_path("k"), "wavelets/k");
    }

    #[tokio::test]
    async fn test_save_without_key_is_refused() {
        let store = MemobinStore::new(RemoteCacheConfig::default());
        assert!(!store.can_save());
        let err = store.save("k", "{}").await.unwrap_err();
        assert!(matches!(err, EngineError::RemoteCache(_)));
    }

    #[test]
    fn test_disabled_by_default() {
        let config = RemoteCacheConfig::default();
        assert!(!config.enabled);
        assert!(config.api_key.is_none());
    }
}
