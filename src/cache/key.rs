// src/cache/key.rs
//! Cache key derivation
//!
//! A key is `pyodideResult/<version>/<hash>`, where `<hash>` is a 32-bit
//! rolling hash (`h = h * 31 + unit` over UTF-16 code units, wrapping) of
//! the JSON text `{"code":…,"additionalFilesJson":…}`. The hash is not
//! cryptographic and collisions are possible; that is accepted for a local
//! cache of cheap-to-regenerate results. Bumping the version orphans every
//! older entry.

use crate::runtime::protocol::AuxiliaryFiles;
use crate::utils::errors::Result;

/// Namespace for every result cache key
pub const CACHE_KEY_PREFIX: &str = "pyodideResult";

/// 32-bit rolling hash of `text`
pub fn code_hash(text: &str) -> i32 {
    text.encode_utf16().fold(0i32, |hash, unit| {
        hash.wrapping_shl(5).wrapping_sub(hash).wrapping_add(unit as i32)
    })
}

/// JSON text standing in for the auxiliary files in a key
pub fn auxiliary_files_descriptor(files: &AuxiliaryFiles) -> Result<String> {
    Ok(serde_json::to_string(files)?)
}

/// Derive the cache key for `code` run with `files`
///
/// `None` and an empty map are different inputs and get different keys.
pub fn compute_key(version: u32, code: &str, files: Option<&AuxiliaryFiles>) -> Result<String> {
    let mut material = String::with_capacity(code.len() + 32);
    material.push_str("{\"code\":");
    material.push_str(&serde_json::to_string(code)?);
    if let Some(files) = files {
        material.push_str(",\"additionalFilesJson\":");
        material.push_str(&serde_json::to_string(&auxiliary_files_descriptor(files)?)?);
    }
    material.push('}');

    Ok(format!("{}/{}/{}", CACHE_KEY_PREFIX, version, code_hash(&material)))
}
