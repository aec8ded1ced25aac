use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::path::Path;

use convsync_core::store::{CacheKey, DurableCache};
use convsync_core::{SqliteCache, SyncConfig};

fn open(config: &SyncConfig, session: &str) -> Result<SqliteCache> {
    SqliteCache::open(&config.data_dir, &config.cache_file, session)
        .with_context(|| format!("Failed to open cache at {}", config.cache_path().display()))
}

/// Entry counts for `session` plus the total across sessions.
pub fn cache_stats(config: &SyncConfig, session: &str) -> Result<Value> {
    let cache = open(config, session)?;
    let messages = cache.entries(CacheKey::MESSAGE_PREFIX)?.len();
    let conversations = cache.entries(CacheKey::CONVERSATION_PREFIX)?.len();

    Ok(json!({
        "path": path_string(&config.cache_path()),
        "session": session,
        "messages": messages,
        "conversations": conversations,
        "totalEntries": cache.total_entries()?,
    }))
}

/// Wipe every session's entries.
pub fn cache_clear(config: &SyncConfig) -> Result<Value> {
    let cache = open(config, "")?;
    let removed = cache.total_entries()?;
    cache.clear()?;

    Ok(json!({
        "path": path_string(&config.cache_path()),
        "removed": removed,
    }))
}

fn path_string(path: &Path) -> String {
    path.display().to_string()
}
