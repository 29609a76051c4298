//! Path utilities for engram directory resolution.

use anyhow::Result;
use std::path::PathBuf;

const ENGRAM_DIR: &str = ".engram";

/// Environment variable to override the engram data directory.
const ENGRAM_DIR_ENV: &str = "ENGRAM_DIR";

/// Resolve the engram data directory.
/// Priority: ENGRAM_DIR env var > ~/.engram/
pub fn resolve_engram_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENGRAM_DIR_ENV)
        && !dir.trim().is_empty()
    {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|h| h.join(ENGRAM_DIR))
        .ok_or_else(|| anyhow::anyhow!("Failed to determine home directory"))
}

/// Default database file path: ~/.engram/memory.redb
pub fn default_db_path() -> Result<PathBuf> {
    Ok(resolve_engram_dir()?.join("memory.redb"))
}

/// Default lexical index directory: ~/.engram/text-index/
pub fn default_index_dir() -> Result<PathBuf> {
    Ok(resolve_engram_dir()?.join("text-index"))
}
