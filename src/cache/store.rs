// src/cache/store.rs
//! Persistent result cache using SQLite
//!
//! One row per key holding the JSON of `{result, images}` (zstd-compressed
//! past a threshold), its uncompressed size, and the time it was written.
//! After every write the sizes are summed; if the total exceeds the ceiling
//! the whole table is cleared. There is no partial eviction.
//!
//! Read failures of any kind are reported as a miss.

use crate::cache::compressor::{CompressionLevel, Compressor, Encoding};
use crate::cache::key::compute_key;
use crate::observability::{CACHE_HITS, CACHE_MISSES, CACHE_PURGES};
use crate::runtime::protocol::AuxiliaryFiles;
use crate::utils::config::default_data_dir;
use crate::utils::errors::{EngineError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Disable to run every task
    pub enabled: bool,

    /// Directory holding the database
    pub dir: PathBuf,

    /// SQLite database file name
    pub db_name: String,

    /// Total stored size above which the cache is cleared
    pub max_size_bytes: u64,

    /// Cache format version; part of every key
    pub version: u32,

    /// Payloads at least this large are compressed
    pub compress_threshold_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_data_dir(),
            db_name: "results.db".to_string(),
            max_size_bytes: 100 * 1024 * 1024,
            version: 1,
            compress_threshold_bytes: 64 * 1024,
        }
    }
}

/// What is stored per key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    pub result: Value,
    pub images: Vec<Value>,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: u64,
    pub total_size_bytes: u64,
}

/// Size-bounded persistent result cache
pub struct ResultCache {
    db: Option<Arc<Mutex<Connection>>>,
    version: u32,
    max_size_bytes: u64,
    compressor: Compressor,
}

impl ResultCache {
    /// Open (creating if needed) the cache described by `config`
    pub async fn open(config: &CacheConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir).await.map_err(|e| {
            EngineError::StorageFailed(format!("Failed to create directory: {}", e))
        })?;

        let db_path = config.dir.join(&config.db_name);
        let conn = Connection::open(&db_path)
            .map_err(|e| EngineError::StorageFailed(format!("Failed to open database: {}", e)))?;

        let cache = Self {
            db: Some(Arc::new(Mutex::new(conn))),
            version: config.version,
            max_size_bytes: config.max_size_bytes,
            compressor: Compressor::new(CompressionLevel::Balanced, config.compress_threshold_bytes),
        };
        cache.init_schema().await?;

        info!("Result cache opened at {:?}", db_path);
        Ok(cache)
    }

    /// A cache that stores nothing and always misses
    pub fn disabled(version: u32) -> Self {
        Self {
            db: None,
            version,
            max_size_bytes: 0,
            compressor: Compressor::default(),
        }
    }

    /// Open the cache, falling back to a disabled one when it is turned off
    /// or storage is unavailable
    pub async fn open_or_disabled(config: &CacheConfig) -> Self {
        if !config.enabled {
            return Self::disabled(config.version);
        }
        match Self::open(config).await {
            Ok(cache) => cache,
            Err(e) => {
                warn!("Result cache unavailable, continuing without it: {}", e);
                Self::disabled(config.version)
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.db.is_some()
    }

    /// Key for `code` run with `files`, in this cache's version namespace
    pub fn key_for(&self, code: &str, files: Option<&AuxiliaryFiles>) -> Result<String> {
        compute_key(self.version, code, files)
    }

    async fn init_schema(&self) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let db = db.lock().await;

        db.execute(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                payload BLOB NOT NULL,
                encoding TEXT NOT NULL,
                size INTEGER NOT NULL,
                timestamp INTEGER NOT NULL
            )
            "#,
            [],
        )
        .map_err(|e| EngineError::StorageFailed(format!("Schema creation failed: {}", e)))?;

        Ok(())
    }

    /// Look up `key`. Any storage or decoding failure is a miss.
    pub async fn get(&self, key: &str) -> Option<CachedResult> {
        let db = self.db.as_ref()?;

        match self.read(db, key).await {
            Ok(Some(entry)) => {
                metrics::counter!(CACHE_HITS).increment(1);
                debug!("Cache hit for {}", key);
                Some(entry)
            }
            Ok(None) => {
                metrics::counter!(CACHE_MISSES).increment(1);
                None
            }
            Err(e) => {
                metrics::counter!(CACHE_MISSES).increment(1);
                warn!("Error accessing cache entry {}: {}", key, e);
                None
            }
        }
    }

    async fn read(&self, db: &Mutex<Connection>, key: &str) -> Result<Option<CachedResult>> {
        let row: Option<(Vec<u8>, String)> = {
            let db = db.lock().await;
            db.query_row(
                "SELECT payload, encoding FROM cache_entries WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| EngineError::StorageFailed(format!("Lookup failed: {}", e)))?
        };

        let Some((payload, encoding)) = row else {
            return Ok(None);
        };
        let json = self.compressor.decode(Encoding::parse(&encoding)?, &payload)?;
        Ok(Some(serde_json::from_slice(&json)?))
    }

    /// Store `value` under `key`, clearing the whole cache if it has grown
    /// past its ceiling
    pub async fn set(&self, key: &str, value: &CachedResult) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };

        let json = serde_json::to_vec(value)?;
        let size = json.len() as i64;
        let (encoding, payload) = self.compressor.encode(&json)?;

        let db = db.lock().await;
        db.execute(
            r#"
            INSERT OR REPLACE INTO cache_entries (key, payload, encoding, size, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                key,
                payload,
                encoding.as_str(),
                size,
                chrono::Utc::now().timestamp_millis(),
            ],
        )
        .map_err(|e| EngineError::StorageFailed(format!("Failed to write entry: {}", e)))?;

        debug!("Cached {} ({} bytes)", key, size);

        let total: i64 = db
            .query_row("SELECT COALESCE(SUM(size), 0) FROM cache_entries", [], |row| row.get(0))
            .map_err(|e| EngineError::StorageFailed(format!("Size query failed: {}", e)))?;

        if total as u64 > self.max_size_bytes {
            db.execute("DELETE FROM cache_entries", [])
                .map_err(|e| EngineError::StorageFailed(format!("Failed to clear cache: {}", e)))?;
            metrics::counter!(CACHE_PURGES).increment(1);
            info!(
                "Cache size exceeded {} bytes. Cleared entire cache.",
                self.max_size_bytes
            );
        }

        Ok(())
    }

    /// Entry count and total stored size
    pub async fn stats(&self) -> Result<CacheStats> {
        let Some(db) = &self.db else {
            return Ok(CacheStats {
                entries: 0,
                total_size_bytes: 0,
            });
        };
        let db = db.lock().await;

        let (entries, total): (i64, i64) = db
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM cache_entries",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| EngineError::StorageFailed(format!("Stats query failed: {}", e)))?;

        Ok(CacheStats {
            entries: entries as u64,
            total_size_bytes: total as u64,
        })
    }

    /// Remove every entry, returning how many there were
    pub async fn clear(&self) -> Result<usize> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let db = db.lock().await;
        let removed = db
            .execute("DELETE FROM cache_entries", [])
            .map_err(|e| EngineError::StorageFailed(format!("Failed to clear cache: {}", e)))?;
        Ok(removed)
    }
}
