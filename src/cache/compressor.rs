// src/cache/compressor.rs
//! zstd compression for stored cache payloads
//!
//! Small payloads are stored as-is; anything at or above the threshold is
//! compressed. The encoding is stored next to the payload so either form
//! reads back.

use crate::utils::errors::{EngineError, Result};
use tracing::debug;

/// Compression levels
#[derive(Debug, Clone, Copy)]
pub enum CompressionLevel {
    /// Fast compression (level 1)
    Fast,

    /// Balanced (level 3)
    Balanced,
}

impl CompressionLevel {
    pub fn as_i32(&self) -> i32 {
        match self {
            CompressionLevel::Fast => 1,
            CompressionLevel::Balanced => 3,
        }
    }
}

/// How a stored payload is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Plain,
    Zstd,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Plain => "plain",
            Encoding::Zstd => "zstd",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "plain" => Ok(Encoding::Plain),
            "zstd" => Ok(Encoding::Zstd),
            other => Err(EngineError::StorageFailed(format!(
                "unknown payload encoding '{}'",
                other
            ))),
        }
    }
}

/// Payload compressor using zstd
pub struct Compressor {
    level: CompressionLevel,
    threshold: usize,
}

impl Compressor {
    /// Compress payloads of at least `threshold` bytes
    pub fn new(level: CompressionLevel, threshold: usize) -> Self {
        Self { level, threshold }
    }

    /// Encode a payload for storage
    pub fn encode(&self, data: &[u8]) -> Result<(Encoding, Vec<u8>)> {
        if data.len() < self.threshold {
            return Ok((Encoding::Plain, data.to_vec()));
        }

        let level = self.level.as_i32();
        let compressed = zstd::encode_all(data, level)
            .map_err(|e| EngineError::CompressionFailed(format!("Compression error: {}", e)))?;

        debug!(
            "Compressed {} bytes -> {} bytes (ratio: {:.2}x)",
            data.len(),
            compressed.len(),
            data.len() as f64 / compressed.len().max(1) as f64
        );

        Ok((Encoding::Zstd, compressed))
    }

    /// Decode a stored payload
    pub fn decode(&self, encoding: Encoding, data: &[u8]) -> Result<Vec<u8>> {
        match encoding {
            Encoding::Plain => Ok(data.to_vec()),
            Encoding::Zstd => zstd::decode_all(data)
                .map_err(|e| EngineError::CompressionFailed(format!("Decompression error: {}", e))),
        }
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(CompressionLevel::Balanced, 64 * 1024)
    }
}
