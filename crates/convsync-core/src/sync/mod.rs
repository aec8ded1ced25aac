pub mod realtime;
pub mod remote;
pub mod session;
pub mod snapshot;

pub use realtime::{DropReason, IngestorHandle, RealtimeIngestor, SubscriptionState};
pub use remote::{
    ChannelFilter, FilterOp, PushChannel, PushSink, QueryFilter, QueryOrder, RemoteError,
    RemoteSource, SelectQuery, SubscriptionId,
};
pub use session::{Applied, SessionState, SyncHealth, SyncReport, SyncSession};
pub use snapshot::{LoadKind, LoadRequest, SnapshotPage, SnapshotSynchronizer, SyncError};
