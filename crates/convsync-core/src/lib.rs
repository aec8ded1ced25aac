pub mod config;
pub mod constants;
pub mod events;
pub mod memory;
pub mod models;
pub mod stats;
pub mod status;
pub mod store;
pub mod sync;
pub mod tracing_setup;

pub use config::SyncConfig;
pub use events::{Ingest, StoreChange};
pub use models::{Conversation, Message, OutgoingStatus, Stage};
pub use status::highest_status;
pub use store::{LocalCache, ReconciledStore, SqliteCache};
pub use sync::{SyncError, SyncSession};
