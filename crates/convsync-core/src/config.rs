use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    CACHE_FILE_NAME, DATA_DIR_NAME, DEFAULT_CHANNEL_PREFIX, DEFAULT_FETCH_TIMEOUT_MS,
    SNAPSHOT_PAGE_SIZE,
};

/// Engine configuration, loadable from a camelCase JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Directory holding the durable cache
    pub data_dir: PathBuf,
    /// Row cap per snapshot query
    pub page_size: usize,
    pub fetch_timeout_ms: u64,
    pub channel_prefix: String,
    pub cache_file: String,
}

impl SyncConfig {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            page_size: SNAPSHOT_PAGE_SIZE,
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
            cache_file: CACHE_FILE_NAME.to_string(),
        }
    }

    /// Platform data directory, falling back to the working directory
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DATA_DIR_NAME)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: SyncConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join(&self.cache_file)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(Self::default_data_dir())
    }
}
