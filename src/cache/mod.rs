// src/cache/mod.rs
//! Persistent, content-addressed result cache
//!
//! - **key**: deterministic keys from code and auxiliary files
//! - **store**: SQLite-backed store with full-clear eviction
//! - **compressor**: zstd for large payloads
//! - **remote**: optional shared memo store behind the local one

pub mod compressor;
pub mod key;
pub mod remote;
pub mod store;

pub use key::{compute_key, CACHE_KEY_PREFIX};
pub use remote::{MemobinStore, RemoteCacheConfig, RemoteStore};
pub use store::{CacheConfig, CacheStats, CachedResult, ResultCache};
