use crate::models::PushEvent;
use crate::sync::{LoadRequest, SnapshotPage, SubscriptionId, SyncError};

/// Notification emitted by the reconciled store whenever its contents change.
/// Drained by readers via `ReconciledStore::drain_changes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    ConversationChanged {
        organization_id: String,
        conversation_id: String,
    },
    MessageChanged {
        organization_id: String,
        conversation_id: String,
        message_id: String,
    },
    /// Organization left the authorized scope and its data was dropped
    OrganizationEvicted { organization_id: String },
    /// Everything dropped (session ended)
    Cleared,
}

/// Entry in the session's single ingestion queue.
///
/// Fetch tasks and push channels run wherever they like; they only ever hand
/// their results to the session through this queue, and the session applies
/// them one at a time.
#[derive(Debug)]
pub enum Ingest {
    /// A fetched page, applied atomically
    Snapshot(SnapshotPage),
    /// A fetch that failed; marks the session stale if still current
    SnapshotFailed {
        request: LoadRequest,
        error: SyncError,
    },
    /// Row change from a realtime subscription
    Push {
        subscription: SubscriptionId,
        event: PushEvent,
    },
    /// The push channel behind a subscription went away
    Detached { subscription: SubscriptionId },
}

impl Ingest {
    pub fn from_fetch(request: LoadRequest, result: Result<SnapshotPage, SyncError>) -> Self {
        match result {
            Ok(page) => Ingest::Snapshot(page),
            Err(error) => Ingest::SnapshotFailed { request, error },
        }
    }
}
