//! In-memory collaborators: a remote table store, a loopback push channel and
//! a map-backed durable cache. Used by tests and by the CLI replay command.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use crate::models::{PushEvent, Table};
use crate::store::{CacheError, DurableCache};
use crate::sync::{ChannelFilter, FilterOp, PushChannel, PushSink, QueryFilter, RemoteError, RemoteSource, SelectQuery};

// ===== Remote =====

#[derive(Default)]
struct RemoteState {
    tables: BTreeMap<Table, Vec<Value>>,
    failures: BTreeMap<Table, RemoteError>,
    queries: Vec<SelectQuery>,
    delay: Option<Duration>,
}

/// Remote read interface over in-memory tables.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row, replacing any row with the same `id` in that table.
    pub fn insert_row(&self, table: Table, row: Value) {
        let mut state = self.state.lock();
        let rows = state.tables.entry(table).or_default();
        let id = row.get("id").cloned();
        if let Some(id) = id.filter(|id| !id.is_null()) {
            rows.retain(|existing| existing.get("id") != Some(&id));
        }
        rows.push(row);
    }

    pub fn row_count(&self, table: Table) -> usize {
        self.state.lock().tables.get(&table).map_or(0, Vec::len)
    }

    /// Make every select against `table` fail until cleared.
    pub fn fail_table(&self, table: Table, error: RemoteError) {
        self.state.lock().failures.insert(table, error);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Delay every select by `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().delay = delay;
    }

    /// Every query received so far, in arrival order.
    pub fn queries(&self) -> Vec<SelectQuery> {
        self.state.lock().queries.clone()
    }

    fn evaluate(&self, query: SelectQuery) -> (Result<Vec<Value>, RemoteError>, Option<Duration>) {
        let mut state = self.state.lock();
        state.queries.push(query.clone());
        let delay = state.delay;

        if let Some(error) = state.failures.get(&query.table) {
            return (Err(error.clone()), delay);
        }

        let mut rows: Vec<Value> = state
            .tables
            .get(&query.table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| query.filters.iter().all(|f| matches_filter(row, f)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let column = query.order.column.as_str();
        rows.sort_by(|a, b| {
            let ord = compare_values(a.get(column), b.get(column));
            if query.order.ascending {
                ord
            } else {
                ord.reverse()
            }
        });
        rows.truncate(query.limit);
        (Ok(rows), delay)
    }
}

impl RemoteSource for MemoryRemote {
    fn select(
        &self,
        query: SelectQuery,
    ) -> impl Future<Output = Result<Vec<Value>, RemoteError>> + Send {
        let (result, delay) = self.evaluate(query);
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            result
        }
    }
}

fn matches_filter(row: &Value, filter: &QueryFilter) -> bool {
    let Some(value) = row.get(&filter.column) else {
        return false;
    };
    match filter.op {
        FilterOp::Eq => value == &filter.value,
        FilterOp::In => filter
            .value
            .as_array()
            .is_some_and(|candidates| candidates.contains(value)),
        FilterOp::Gt => compare_values(Some(value), Some(&filter.value)) == Ordering::Greater,
    }
}

/// Timestamps compare as instants, other strings lexically, numbers numerically.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::String(a)), Some(Value::String(b))) => {
            match (parse_timestamp(a), parse_timestamp(b)) {
                (Some(a), Some(b)) => a.cmp(&b),
                _ => a.cmp(b),
            }
        }
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

// ===== Push =====

struct LoopbackSubscription {
    channel_id: String,
    filters: Vec<ChannelFilter>,
    sink: PushSink,
}

#[derive(Default)]
struct LoopbackState {
    subscriptions: BTreeMap<u64, LoopbackSubscription>,
    next_handle: u64,
    fail_subscribe: bool,
}

/// Push channel that delivers whatever the test emits.
#[derive(Clone, Default)]
pub struct LoopbackChannel {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver to every subscription whose server-side filters name `organization_id`.
    /// Returns the number of sinks that took the event.
    pub fn emit(&self, organization_id: &str, event: PushEvent) -> usize {
        let state = self.state.lock();
        state
            .subscriptions
            .values()
            .filter(|sub| sub.filters.iter().any(|f| f.value == organization_id))
            .filter(|sub| sub.sink.deliver(event.clone()))
            .count()
    }

    /// Deliver to every subscription on `channel_id`, bypassing the filters.
    pub fn emit_raw(&self, channel_id: &str, event: PushEvent) -> usize {
        let state = self.state.lock();
        state
            .subscriptions
            .values()
            .filter(|sub| sub.channel_id == channel_id)
            .filter(|sub| sub.sink.deliver(event.clone()))
            .count()
    }

    /// Drop every live subscription, notifying each sink.
    pub fn disconnect_all(&self) {
        let mut state = self.state.lock();
        for sub in std::mem::take(&mut state.subscriptions).into_values() {
            sub.sink.disconnected();
        }
    }

    pub fn active_channels(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut channels: Vec<String> = state
            .subscriptions
            .values()
            .map(|sub| sub.channel_id.clone())
            .collect();
        channels.sort();
        channels
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.state.lock().fail_subscribe = fail;
    }
}

impl PushChannel for LoopbackChannel {
    type Handle = u64;

    fn subscribe(
        &mut self,
        channel_id: &str,
        filters: &[ChannelFilter],
        sink: PushSink,
    ) -> Result<u64, RemoteError> {
        let mut state = self.state.lock();
        if state.fail_subscribe {
            return Err(RemoteError::Subscribe(format!("{} refused", channel_id)));
        }
        state.next_handle += 1;
        let handle = state.next_handle;
        state.subscriptions.insert(
            handle,
            LoopbackSubscription {
                channel_id: channel_id.to_string(),
                filters: filters.to_vec(),
                sink,
            },
        );
        Ok(handle)
    }

    fn unsubscribe(&mut self, handle: u64) {
        self.state.lock().subscriptions.remove(&handle);
    }
}

// ===== Cache =====

/// Map-backed durable cache with switchable write failures.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, AtomicOrdering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl DurableCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), CacheError> {
        if self.fail_writes.load(AtomicOrdering::SeqCst) {
            return Err(CacheError::Unavailable("writes disabled".to_string()));
        }
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.entries.lock().clear();
        Ok(())
    }

    fn entries(&self, prefix: &str) -> Result<Vec<(String, String)>, CacheError> {
        Ok(self
            .entries
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::QueryOrder;
    use serde_json::json;

    fn query(filters: Vec<QueryFilter>, limit: usize) -> SelectQuery {
        SelectQuery {
            table: Table::Messages,
            filters,
            order: QueryOrder {
                column: "updated_at".to_string(),
                ascending: false,
            },
            limit,
        }
    }

    #[tokio::test]
    async fn test_gt_compares_timestamps_as_instants() {
        let remote = MemoryRemote::new();
        remote.insert_row(Table::Messages, json!({"id": "a", "updated_at": "2024-05-01T10:00:00+02:00"}));
        remote.insert_row(Table::Messages, json!({"id": "b", "updated_at": "2024-05-01T09:00:00Z"}));

        let rows = remote
            .select(query(
                vec![QueryFilter::new("updated_at", FilterOp::Gt, json!("2024-05-01T08:30:00Z"))],
                10,
            ))
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[tokio::test]
    async fn test_insert_row_replaces_same_id() {
        let remote = MemoryRemote::new();
        remote.insert_row(Table::Messages, json!({"id": "a", "v": 1}));
        remote.insert_row(Table::Messages, json!({"id": "a", "v": 2}));
        assert_eq!(remote.row_count(Table::Messages), 1);
    }

    #[test]
    fn test_cache_entries_by_prefix() {
        let cache = MemoryCache::new();
        cache.put("message:1", "{}").unwrap();
        cache.put("message:2", "{}").unwrap();
        cache.put("conversation:1", "{}").unwrap();

        let keys: Vec<_> = cache
            .entries("message:")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["message:1", "message:2"]);

        cache.set_fail_writes(true);
        assert!(cache.put("message:3", "{}").is_err());
        assert_eq!(cache.len(), 3);
    }
}
