use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::constants::columns;
use crate::models::{Conversation, Message, Table};
use crate::sync::remote::{FilterOp, QueryFilter, QueryOrder, RemoteError, RemoteSource, SelectQuery};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Fetching {table} failed: {source}")]
    Remote {
        table: Table,
        #[source]
        source: RemoteError,
    },

    #[error("Fetching {table} timed out after {timeout:?}")]
    Timeout { table: Table, timeout: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    /// Unbounded load on scope establishment
    Full,
    /// Bounded below by the last-hidden watermark
    Delta,
}

/// One load, stamped with the session generation it was issued under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub generation: u64,
    pub scope: Vec<String>,
    pub since: Option<DateTime<Utc>>,
}

impl LoadRequest {
    pub fn kind(&self) -> LoadKind {
        if self.since.is_some() {
            LoadKind::Delta
        } else {
            LoadKind::Full
        }
    }
}

/// Both tables fetched for one request. Applied all-or-nothing.
#[derive(Debug, Clone)]
pub struct SnapshotPage {
    pub request: LoadRequest,
    pub conversations: Vec<Conversation>,
    pub messages: Vec<Message>,
}

/// Bulk and delta fetches against the remote read interface.
pub struct SnapshotSynchronizer<R> {
    remote: R,
    page_size: usize,
    fetch_timeout: Duration,
}

impl<R: RemoteSource> SnapshotSynchronizer<R> {
    pub fn new(remote: R, page_size: usize, fetch_timeout: Duration) -> Self {
        Self {
            remote,
            page_size,
            fetch_timeout,
        }
    }

    pub fn from_config(remote: R, config: &SyncConfig) -> Self {
        Self::new(remote, config.page_size, config.fetch_timeout())
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Conversations of `scope` updated after `since`, most recent first.
    /// An empty scope returns nothing without touching the remote.
    pub async fn load_conversations(
        &self,
        scope: &[String],
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Conversation>, SyncError> {
        self.load_table(Table::Conversations, scope, since).await
    }

    /// Messages of `scope` updated after `since`, most recent first.
    pub async fn load_messages(
        &self,
        scope: &[String],
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, SyncError> {
        self.load_table(Table::Messages, scope, since).await
    }

    /// Fetch both tables for `request`. Fails if either table fails.
    pub async fn fetch(&self, request: &LoadRequest) -> Result<SnapshotPage, SyncError> {
        let (conversations, messages) = futures::try_join!(
            self.load_conversations(&request.scope, request.since),
            self.load_messages(&request.scope, request.since),
        )?;

        debug!(
            generation = request.generation,
            kind = ?request.kind(),
            conversations = conversations.len(),
            messages = messages.len(),
            "snapshot fetched"
        );

        Ok(SnapshotPage {
            request: request.clone(),
            conversations,
            messages,
        })
    }

    pub fn build_query(
        &self,
        table: Table,
        scope: &[String],
        since: Option<DateTime<Utc>>,
    ) -> SelectQuery {
        let mut filters = vec![QueryFilter::new(
            columns::ORGANIZATION_ID,
            FilterOp::In,
            serde_json::json!(scope),
        )];
        if let Some(since) = since {
            filters.push(QueryFilter::new(
                columns::UPDATED_AT,
                FilterOp::Gt,
                serde_json::Value::String(since.to_rfc3339()),
            ));
        }

        SelectQuery {
            table,
            filters,
            order: QueryOrder {
                column: columns::UPDATED_AT.to_string(),
                ascending: false,
            },
            limit: self.page_size,
        }
    }

    async fn load_table<T: DeserializeOwned>(
        &self,
        table: Table,
        scope: &[String],
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<T>, SyncError> {
        if scope.is_empty() {
            return Ok(Vec::new());
        }

        let query = self.build_query(table, scope, since);
        let rows = tokio::time::timeout(self.fetch_timeout, self.remote.select(query))
            .await
            .map_err(|_| SyncError::Timeout {
                table,
                timeout: self.fetch_timeout,
            })?
            .map_err(|source| SyncError::Remote { table, source })?;

        if rows.len() >= self.page_size {
            // Known limitation: anything older than the cap waits for the next full load
            warn!(
                %table,
                page_size = self.page_size,
                "snapshot page hit the row cap; older rows were not fetched"
            );
        }

        let mut decoded = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<T>(row) {
                Ok(value) => decoded.push(value),
                Err(e) => warn!(%table, error = %e, "skipping undecodable row"),
            }
        }
        Ok(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRemote;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn message_row(org: &str, id: &str, updated: i64) -> serde_json::Value {
        json!({
            "id": id,
            "organization_id": org,
            "conversation_id": "c1",
            "direction": "incoming",
            "updated_at": ts(updated).to_rfc3339(),
        })
    }

    fn synchronizer(remote: MemoryRemote, page_size: usize) -> SnapshotSynchronizer<MemoryRemote> {
        SnapshotSynchronizer::new(remote, page_size, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_empty_scope_is_noop() {
        let remote = MemoryRemote::new();
        let sync = synchronizer(remote.clone(), 999);

        let messages = sync.load_messages(&[], None).await.unwrap();
        assert!(messages.is_empty());
        assert!(remote.queries().is_empty());
    }

    #[tokio::test]
    async fn test_scoped_and_ordered_descending() {
        let remote = MemoryRemote::new();
        remote.insert_row(Table::Messages, message_row("org-a", "m1", 1));
        remote.insert_row(Table::Messages, message_row("org-a", "m2", 3));
        remote.insert_row(Table::Messages, message_row("org-b", "m3", 2));
        let sync = synchronizer(remote, 999);

        let messages = sync.load_messages(&["org-a".to_string()], None).await.unwrap();
        let ids: Vec<_> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m1"]);
    }

    #[tokio::test]
    async fn test_since_is_exclusive() {
        let remote = MemoryRemote::new();
        remote.insert_row(Table::Messages, message_row("org-a", "m1", 10));
        remote.insert_row(Table::Messages, message_row("org-a", "m2", 11));
        let sync = synchronizer(remote, 999);

        let messages = sync
            .load_messages(&["org-a".to_string()], Some(ts(10)))
            .await
            .unwrap();
        let ids: Vec<_> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m2"]);
    }

    #[tokio::test]
    async fn test_page_cap_drops_oldest_rows() {
        let remote = MemoryRemote::new();
        for i in 0..5 {
            remote.insert_row(Table::Messages, message_row("org-a", &format!("m{}", i), i));
        }
        let sync = synchronizer(remote, 3);

        let messages = sync.load_messages(&["org-a".to_string()], None).await.unwrap();
        let ids: Vec<_> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m4", "m3", "m2"]);
    }

    #[tokio::test]
    async fn test_query_shape() {
        let sync = synchronizer(MemoryRemote::new(), 999);
        let query = sync.build_query(Table::Conversations, &["org-a".to_string()], Some(ts(0)));

        assert_eq!(query.table, Table::Conversations);
        assert_eq!(query.limit, 999);
        assert_eq!(query.order.column, "updated_at");
        assert!(!query.order.ascending);
        assert_eq!(query.filters[0].op, FilterOp::In);
        assert_eq!(query.filters[0].value, json!(["org-a"]));
        assert_eq!(query.filters[1].op, FilterOp::Gt);
    }

    #[tokio::test]
    async fn test_remote_failure_fails_whole_fetch() {
        let remote = MemoryRemote::new();
        remote.insert_row(Table::Messages, message_row("org-a", "m1", 1));
        remote.fail_table(Table::Conversations, RemoteError::Transport("boom".to_string()));
        let sync = synchronizer(remote, 999);

        let request = LoadRequest {
            generation: 1,
            scope: vec!["org-a".to_string()],
            since: None,
        };
        let err = sync.fetch(&request).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Remote {
                table: Table::Conversations,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_slow_remote_times_out() {
        let remote = MemoryRemote::new();
        remote.set_delay(Some(Duration::from_millis(200)));
        let sync = SnapshotSynchronizer::new(remote, 999, Duration::from_millis(10));

        let err = sync
            .load_conversations(&["org-a".to_string()], None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Timeout {
                table: Table::Conversations,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_undecodable_rows_are_skipped() {
        let remote = MemoryRemote::new();
        remote.insert_row(Table::Messages, message_row("org-a", "m1", 1));
        remote.insert_row(
            Table::Messages,
            json!({"id": "broken", "organization_id": "org-a", "updated_at": ts(2).to_rfc3339()}),
        );
        let sync = synchronizer(remote, 999);

        let messages = sync.load_messages(&["org-a".to_string()], None).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "m1");
    }
}
