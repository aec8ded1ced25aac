//! Engine-wide constants.

/// Row cap for a single snapshot query. Deltas larger than this lose their
/// oldest rows until the next full load; there is no pagination loop.
pub const SNAPSHOT_PAGE_SIZE: usize = 999;

/// Upper bound for one remote select call
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 30_000;

/// Realtime channel ids are `<prefix>:<organization_id>`
pub const DEFAULT_CHANNEL_PREFIX: &str = "org";

pub const CACHE_FILE_NAME: &str = "convsync_cache.db";

pub const DATA_DIR_NAME: &str = "convsync";

/// Column names shared by both tracked tables
pub mod columns {
    pub const ORGANIZATION_ID: &str = "organization_id";
    pub const UPDATED_AT: &str = "updated_at";
}
