pub mod cache;
pub mod db;
pub mod merge;
pub mod reconciled_store;

pub use cache::{CacheError, CacheKey, DurableCache, LocalCache};
pub use db::SqliteCache;
pub use merge::{merge_into, MergeOutcome, Versioned};
pub use reconciled_store::{PageSummary, ReconciledStore};
