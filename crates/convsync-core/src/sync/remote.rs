//! Contracts of the external collaborators: remote reads and push delivery.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::mpsc::Sender;

use crate::events::Ingest;
use crate::models::{PushEvent, Table};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Subscription rejected: {0}")]
    Subscribe(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    In,
    /// Strictly greater than
    Gt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub column: String,
    pub op: FilterOp,
    pub value: serde_json::Value,
}

impl QueryFilter {
    pub fn new(column: &str, op: FilterOp, value: serde_json::Value) -> Self {
        Self {
            column: column.to_string(),
            op,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOrder {
    pub column: String,
    pub ascending: bool,
}

/// `select(table, filters, order, limit)` against the remote data service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectQuery {
    pub table: Table,
    pub filters: Vec<QueryFilter>,
    pub order: QueryOrder,
    pub limit: usize,
}

/// Remote read interface. Raises on transport or auth failure.
pub trait RemoteSource {
    fn select(
        &self,
        query: SelectQuery,
    ) -> impl Future<Output = Result<Vec<serde_json::Value>, RemoteError>> + Send;
}

/// Server-side equality filter attached to a push subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFilter {
    pub table: Table,
    pub column: String,
    pub value: String,
}

impl ChannelFilter {
    pub fn eq(table: Table, column: &str, value: &str) -> Self {
        Self {
            table,
            column: column.to_string(),
            value: value.to_string(),
        }
    }
}

/// Identifies one realtime subscription for the lifetime of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Where a push channel delivers events for one subscription.
///
/// Delivery only enqueues; nothing is applied until the session drains its
/// ingestion queue.
#[derive(Debug, Clone)]
pub struct PushSink {
    subscription: SubscriptionId,
    tx: Sender<Ingest>,
}

impl PushSink {
    pub(crate) fn new(subscription: SubscriptionId, tx: Sender<Ingest>) -> Self {
        Self { subscription, tx }
    }

    pub fn subscription(&self) -> SubscriptionId {
        self.subscription
    }

    /// Returns false once the session is gone.
    pub fn deliver(&self, event: PushEvent) -> bool {
        self.tx
            .send(Ingest::Push {
                subscription: self.subscription,
                event,
            })
            .is_ok()
    }

    /// Report that the underlying channel dropped.
    pub fn disconnected(&self) -> bool {
        self.tx
            .send(Ingest::Detached {
                subscription: self.subscription,
            })
            .is_ok()
    }
}

/// Remote push interface.
pub trait PushChannel {
    type Handle;

    fn subscribe(
        &mut self,
        channel_id: &str,
        filters: &[ChannelFilter],
        sink: PushSink,
    ) -> Result<Self::Handle, RemoteError>;

    /// Must stop delivery to the sink before returning.
    fn unsubscribe(&mut self, handle: Self::Handle);
}
