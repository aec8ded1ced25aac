use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::events::{Ingest, StoreChange};
use crate::models::{PushEvent, Table};
use crate::stats::SharedIngestStats;
use crate::store::{CacheError, DurableCache, LocalCache, MergeOutcome, PageSummary, ReconciledStore};
use crate::sync::realtime::{DropReason, RealtimeIngestor};
use crate::sync::remote::{PushChannel, RemoteSource, SubscriptionId};
use crate::sync::snapshot::{LoadKind, LoadRequest, SnapshotPage, SnapshotSynchronizer, SyncError};

/// Lifecycle state owned by the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    /// Authorized organization ids, deduplicated, in arrival order
    pub scope: Vec<String>,
    /// Bumped on every scope change and on session end
    pub generation: u64,
    /// Last-hidden watermark; lower bound of the next delta load
    pub hidden_since: Option<DateTime<Utc>>,
    pub signed_in: bool,
}

impl SessionState {
    /// Earliest hide wins until the watermark is consumed.
    pub fn mark_hidden(&mut self, at: DateTime<Utc>) {
        match self.hidden_since {
            Some(existing) if existing <= at => {}
            _ => self.hidden_since = Some(at),
        }
    }

    pub fn take_hidden_since(&mut self) -> Option<DateTime<Utc>> {
        self.hidden_since.take()
    }

    /// Put back a watermark whose delta load failed.
    pub fn restore_hidden_since(&mut self, since: DateTime<Utc>) {
        self.mark_hidden(since);
    }
}

/// Freshness indicator for readers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncHealth {
    /// The last load for the current scope failed
    pub stale: bool,
    pub last_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Result of one snapshot load run through the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub kind: LoadKind,
    pub fetched_conversations: usize,
    pub fetched_messages: usize,
    pub summary: PageSummary,
    /// The scope changed while the load was in flight; nothing was applied
    pub discarded: bool,
}

/// What `apply` did with one ingestion entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Page(PageSummary),
    PageFailed,
    /// Snapshot result from a superseded generation
    Discarded,
    Row(MergeOutcome),
    Dropped(DropReason),
    Detached,
}

/// Owns the reconciled store and everything that writes to it.
///
/// All mutation happens on the owning thread, inside `apply`. Fetches and push
/// channels hand their results over through the ingestion queue.
pub struct SyncSession<R, P: PushChannel, C> {
    store: ReconciledStore,
    cache: LocalCache<C>,
    synchronizer: Arc<SnapshotSynchronizer<R>>,
    ingestor: RealtimeIngestor<P>,
    ingest_tx: Sender<Ingest>,
    ingest_rx: Receiver<Ingest>,
    state: SessionState,
    health: SyncHealth,
    stats: SharedIngestStats,
}

impl<R, P, C> SyncSession<R, P, C>
where
    R: RemoteSource,
    P: PushChannel,
    C: DurableCache,
{
    pub fn new(config: &SyncConfig, remote: R, channel: P, cache: C) -> Self {
        let (ingest_tx, ingest_rx) = mpsc::channel();
        let ingestor = RealtimeIngestor::new(channel, &config.channel_prefix, ingest_tx.clone());

        Self {
            store: ReconciledStore::new(),
            cache: LocalCache::new(cache),
            synchronizer: Arc::new(SnapshotSynchronizer::from_config(remote, config)),
            ingestor,
            ingest_tx,
            ingest_rx,
            state: SessionState {
                signed_in: true,
                ..SessionState::default()
            },
            health: SyncHealth::default(),
            stats: SharedIngestStats::new(),
        }
    }

    /// Establish a new authorized scope: evict what left it, seed from the
    /// cache, run a full load, then attach realtime.
    ///
    /// A failed load is returned after realtime is attached, so live data
    /// still flows while the session is marked stale. A pending hide
    /// watermark is kept for the next resume.
    pub async fn set_scope(&mut self, scope: Vec<String>) -> Result<SyncReport, SyncError> {
        let mut deduped: Vec<String> = Vec::with_capacity(scope.len());
        for organization_id in scope {
            if !deduped.contains(&organization_id) {
                deduped.push(organization_id);
            }
        }

        self.state.generation += 1;
        self.state.scope = deduped;
        self.state.signed_in = true;
        self.health = SyncHealth::default();

        self.ingestor.unsubscribe_all();
        self.pump();

        let evicted = self.store.set_scope(self.state.scope.iter().cloned());
        info!(
            generation = self.state.generation,
            scope = ?self.state.scope,
            evicted = ?evicted,
            "scope changed"
        );

        self.warm_from_cache();
        let result = self.full_load().await;
        self.ingestor.subscribe(&self.state.scope);
        result
    }

    pub async fn full_load(&mut self) -> Result<SyncReport, SyncError> {
        let request = self.begin_load(None);
        self.run_load(request).await
    }

    pub fn became_hidden(&mut self, at: DateTime<Utc>) {
        debug!(at = %at, "session hidden");
        self.state.mark_hidden(at);
    }

    /// Re-attach dropped channels and close the gap since the session was
    /// hidden. Returns `None` when there is no watermark to load from.
    pub async fn became_visible(&mut self) -> Result<Option<SyncReport>, SyncError> {
        self.pump();
        let reattached = self.ingestor.reattach_detached();
        if reattached > 0 {
            info!(reattached, "realtime channels re-attached");
        }

        let Some(since) = self.state.take_hidden_since() else {
            return Ok(None);
        };
        let request = self.begin_load(Some(since));
        self.run_load(request).await.map(Some)
    }

    /// Stamp a load with the current generation and scope.
    pub fn begin_load(&self, since: Option<DateTime<Utc>>) -> LoadRequest {
        LoadRequest {
            generation: self.state.generation,
            scope: self.state.scope.clone(),
            since,
        }
    }

    /// Shared handle for fetching off the session; results go back through
    /// `ingest_sender`.
    pub fn synchronizer(&self) -> Arc<SnapshotSynchronizer<R>> {
        Arc::clone(&self.synchronizer)
    }

    pub fn ingest_sender(&self) -> Sender<Ingest> {
        self.ingest_tx.clone()
    }

    pub fn apply(&mut self, ingest: Ingest) -> Applied {
        match ingest {
            Ingest::Snapshot(page) => self.apply_page(page),
            Ingest::SnapshotFailed { request, error } => {
                if self.fail_load(&request, &error) {
                    Applied::PageFailed
                } else {
                    Applied::Discarded
                }
            }
            Ingest::Push {
                subscription,
                event,
            } => self.apply_push(subscription, &event),
            Ingest::Detached { subscription } => {
                self.ingestor.mark_detached(subscription);
                Applied::Detached
            }
        }
    }

    /// Apply everything queued so far. Returns the number of entries handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(ingest) = self.ingest_rx.try_recv() {
            self.apply(ingest);
            handled += 1;
        }
        handled
    }

    /// Sign-out: detach, drop all state, and clear the durable cache once.
    pub fn end_session(&mut self) -> Result<(), CacheError> {
        self.ingestor.unsubscribe_all();
        while self.ingest_rx.try_recv().is_ok() {}

        self.store.clear();
        let cleared = if self.state.signed_in {
            self.cache.clear()
        } else {
            Ok(())
        };

        self.state = SessionState {
            generation: self.state.generation + 1,
            ..SessionState::default()
        };
        self.health = SyncHealth::default();
        info!(generation = self.state.generation, "session ended");

        if let Err(e) = &cleared {
            warn!(error = %e, "cache clear failed");
        }
        cleared
    }

    /// Seed the store with cached rows of the current scope. Returns how many
    /// rows changed the store.
    pub fn warm_from_cache(&mut self) -> usize {
        let mut summary = PageSummary::default();
        for conversation in self.cache.cached_conversations() {
            summary.record(self.store.apply_conversation(conversation));
        }
        for message in self.cache.cached_messages() {
            summary.record(self.store.apply_message(message));
        }
        debug!(
            changed = summary.changed(),
            rejected = summary.rejected,
            "store warmed from cache"
        );
        summary.changed()
    }

    pub fn store(&self) -> &ReconciledStore {
        &self.store
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn health(&self) -> &SyncHealth {
        &self.health
    }

    pub fn stats(&self) -> &SharedIngestStats {
        &self.stats
    }

    pub fn cache(&self) -> &LocalCache<C> {
        &self.cache
    }

    pub fn ingestor(&self) -> &RealtimeIngestor<P> {
        &self.ingestor
    }

    pub fn drain_changes(&mut self) -> Vec<StoreChange> {
        self.store.drain_changes()
    }

    async fn run_load(&mut self, request: LoadRequest) -> Result<SyncReport, SyncError> {
        let kind = request.kind();
        let synchronizer = Arc::clone(&self.synchronizer);

        let page = match synchronizer.fetch(&request).await {
            Ok(page) => page,
            Err(error) => {
                self.fail_load(&request, &error);
                return Err(error);
            }
        };

        let fetched_conversations = page.conversations.len();
        let fetched_messages = page.messages.len();
        let (summary, discarded) = match self.apply_page(page) {
            Applied::Page(summary) => (summary, false),
            _ => (PageSummary::default(), true),
        };

        Ok(SyncReport {
            kind,
            fetched_conversations,
            fetched_messages,
            summary,
            discarded,
        })
    }

    fn apply_page(&mut self, page: SnapshotPage) -> Applied {
        if page.request.generation != self.state.generation {
            debug!(
                page_generation = page.request.generation,
                generation = self.state.generation,
                "discarding snapshot from superseded scope"
            );
            self.stats.record_page(true);
            return Applied::Discarded;
        }

        let mut summary = PageSummary::default();
        for conversation in page.conversations {
            let organization_id = conversation.organization_id.clone();
            let id = conversation.id.clone();
            let outcome = self.store.apply_conversation(conversation);
            self.record_and_mirror(Table::Conversations, &organization_id, &id, outcome);
            summary.record(outcome);
        }
        for message in page.messages {
            let organization_id = message.organization_id.clone();
            let id = message.id.clone();
            let outcome = self.store.apply_message(message);
            self.record_and_mirror(Table::Messages, &organization_id, &id, outcome);
            summary.record(outcome);
        }

        self.health = SyncHealth {
            stale: false,
            last_error: None,
            last_synced_at: Some(Utc::now()),
        };
        self.stats.record_page(false);
        info!(
            kind = ?page.request.kind(),
            inserted = summary.inserted,
            updated = summary.updated,
            unchanged = summary.unchanged,
            rejected = summary.rejected,
            "snapshot applied"
        );
        Applied::Page(summary)
    }

    fn apply_push(&mut self, subscription: SubscriptionId, event: &PushEvent) -> Applied {
        let row = match self.ingestor.accept(subscription, event) {
            Ok(row) => row,
            Err(reason) => {
                debug!(subscription = subscription.0, reason = %reason, "push event dropped");
                self.stats.record_dropped(&reason);
                return Applied::Dropped(reason);
            }
        };

        let table = row.table();
        let organization_id = row.organization_id().to_string();
        let id = row.id().to_string();
        let outcome = self.store.apply_row(row);
        self.record_and_mirror(table, &organization_id, &id, outcome);
        Applied::Row(outcome)
    }

    /// Mirror the store's current version of a changed row into the cache.
    fn record_and_mirror(&self, table: Table, organization_id: &str, id: &str, outcome: MergeOutcome) {
        self.stats.record_outcome(table, outcome);
        if !outcome.changed() {
            return;
        }
        match table {
            Table::Conversations => {
                if let Some(conversation) = self.store.conversation(organization_id, id) {
                    self.cache.put_conversation(conversation);
                }
            }
            Table::Messages => {
                if let Some(message) = self.store.message(organization_id, id) {
                    self.cache.put_message(message);
                }
            }
        }
    }

    /// Returns false if the failed load belonged to a superseded generation.
    fn fail_load(&mut self, request: &LoadRequest, error: &SyncError) -> bool {
        if request.generation != self.state.generation {
            debug!(generation = request.generation, error = %error, "ignoring failure of superseded load");
            return false;
        }

        warn!(kind = ?request.kind(), error = %error, "snapshot load failed");
        self.stats.record_fetch_failure();
        self.health.stale = true;
        self.health.last_error = Some(error.to_string());
        if let Some(since) = request.since {
            self.state.restore_hidden_since(since);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{LoopbackChannel, MemoryCache, MemoryRemote};
    use crate::models::{ChangeKind, Stage};
    use crate::sync::remote::RemoteError;
    use crate::sync::realtime::SubscriptionState;
    use chrono::TimeZone;
    use serde_json::{json, Value};

    type TestSession = SyncSession<MemoryRemote, LoopbackChannel, MemoryCache>;

    struct Harness {
        session: TestSession,
        remote: MemoryRemote,
        channel: LoopbackChannel,
        cache: MemoryCache,
    }

    fn harness() -> Harness {
        let remote = MemoryRemote::new();
        let channel = LoopbackChannel::new();
        let cache = MemoryCache::new();
        let config = SyncConfig::new("unused");
        let session = SyncSession::new(&config, remote.clone(), channel.clone(), cache.clone());
        Harness {
            session,
            remote,
            channel,
            cache,
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn orgs(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn conversation_row(org: &str, id: &str, updated: i64) -> Value {
        json!({
            "id": id,
            "organization_id": org,
            "updated_at": ts(updated).to_rfc3339(),
        })
    }

    fn message_row(org: &str, id: &str, updated: i64, stages: &[&str]) -> Value {
        let status: serde_json::Map<String, Value> = stages
            .iter()
            .map(|s| (s.to_string(), json!(ts(updated).to_rfc3339())))
            .collect();
        json!({
            "id": id,
            "organization_id": org,
            "conversation_id": "c1",
            "direction": "outgoing",
            "content": {"text": id},
            "status": status,
            "updated_at": ts(updated).to_rfc3339(),
        })
    }

    fn push(row: Value) -> PushEvent {
        PushEvent::new(Table::Messages, ChangeKind::Update, row)
    }

    #[tokio::test]
    async fn test_set_scope_loads_and_attaches() {
        let mut h = harness();
        h.remote.insert_row(Table::Conversations, conversation_row("org-a", "c1", 1));
        h.remote.insert_row(Table::Messages, message_row("org-a", "m1", 1, &["sent"]));

        let report = h.session.set_scope(orgs(&["org-a"])).await.unwrap();
        assert_eq!(report.kind, LoadKind::Full);
        assert_eq!(report.summary.inserted, 2);
        assert_eq!(h.session.store().conversation_count("org-a"), 1);
        assert_eq!(h.session.store().highest_status("org-a", "m1"), Some(Stage::Sent));
        assert_eq!(h.session.ingestor().state("org-a"), SubscriptionState::Attached);
        assert!(h.session.cache().get_message("m1").is_some());
        assert!(h.session.cache().get_conversation("c1").is_some());
        assert!(h.session.health().last_synced_at.is_some());
    }

    #[tokio::test]
    async fn test_push_events_merge_monotonically() {
        let mut h = harness();
        h.session.set_scope(orgs(&["org-a"])).await.unwrap();

        h.channel.emit("org-a", push(message_row("org-a", "m1", 5, &["sent", "delivered"])));
        h.channel.emit("org-a", push(message_row("org-a", "m1", 3, &["sent"])));
        // Duplicate delivery
        h.channel.emit("org-a", push(message_row("org-a", "m1", 5, &["sent", "delivered"])));
        assert_eq!(h.session.pump(), 3);

        let message = h.session.store().message("org-a", "m1").unwrap();
        assert_eq!(message.updated_at, ts(5));
        assert_eq!(message.highest_status(), Some(Stage::Delivered));
        assert_eq!(h.session.store().message_count("org-a"), 1);

        let stats = h.session.stats().snapshot();
        assert_eq!(stats.by_table[&Table::Messages].inserted, 1);
        assert_eq!(stats.by_table[&Table::Messages].unchanged, 2);
    }

    #[tokio::test]
    async fn test_conversation_push_moves_to_top_and_mirrors() {
        let mut h = harness();
        h.remote.insert_row(Table::Conversations, conversation_row("org-a", "c1", 1));
        h.remote.insert_row(Table::Conversations, conversation_row("org-a", "c2", 5));
        h.session.set_scope(orgs(&["org-a"])).await.unwrap();
        assert_eq!(h.session.store().conversations("org-a")[0].id, "c2");

        h.channel.emit(
            "org-a",
            PushEvent::new(
                Table::Conversations,
                ChangeKind::Update,
                conversation_row("org-a", "c1", 10),
            ),
        );
        assert_eq!(h.session.pump(), 1);

        let ids: Vec<_> = h
            .session
            .store()
            .conversations("org-a")
            .iter()
            .map(|c| c.id.clone())
            .collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert_eq!(
            h.session.cache().get_conversation("c1").map(|c| c.updated_at),
            Some(ts(10))
        );
        assert_eq!(
            h.session.stats().snapshot().by_table[&Table::Conversations].updated,
            1
        );
    }

    #[tokio::test]
    async fn test_disjoint_stages_converge_regardless_of_arrival_order() {
        let older = message_row("org-a", "m1", 10, &["sent", "failed"]);
        let newer = message_row("org-a", "m1", 20, &["sent", "delivered"]);

        let mut results = Vec::new();
        for rows in [[older.clone(), newer.clone()], [newer, older]] {
            let mut h = harness();
            h.session.set_scope(orgs(&["org-a"])).await.unwrap();
            for row in rows {
                h.channel.emit("org-a", push(row));
            }
            h.session.pump();

            let message = h.session.store().message("org-a", "m1").unwrap().clone();
            assert_eq!(message.updated_at, ts(20));
            assert_eq!(message.highest_status(), Some(Stage::Delivered));
            let cached = h.session.cache().get_message("m1").unwrap();
            assert_eq!(cached.updated_at, ts(20));
            assert_eq!(cached.highest_status(), Some(Stage::Delivered));
            results.push(message);
        }
        assert_eq!(results[0], results[1]);
    }

    #[tokio::test]
    async fn test_push_before_older_snapshot_keeps_newer_version() {
        let mut h = harness();
        h.session.set_scope(orgs(&["org-a"])).await.unwrap();

        let request = h.session.begin_load(None);
        h.remote.insert_row(Table::Messages, message_row("org-a", "m1", 10, &["sent"]));
        let result = h.session.synchronizer().fetch(&request).await;

        h.channel.emit("org-a", push(message_row("org-a", "m1", 20, &["sent", "read"])));
        h.session.ingest_sender().send(Ingest::from_fetch(request, result)).unwrap();
        h.session.pump();

        let message = h.session.store().message("org-a", "m1").unwrap();
        assert_eq!(message.updated_at, ts(20));
        assert_eq!(message.highest_status(), Some(Stage::Read));
        assert_eq!(
            h.session.cache().get_message("m1").map(|m| m.updated_at),
            Some(ts(20))
        );
    }

    #[tokio::test]
    async fn test_same_timestamp_unions_stages() {
        let mut h = harness();
        h.session.set_scope(orgs(&["org-a"])).await.unwrap();

        h.channel.emit("org-a", push(message_row("org-a", "m1", 7, &["sent", "failed"])));
        h.channel.emit("org-a", push(message_row("org-a", "m1", 7, &["delivered"])));
        h.session.pump();

        let message = h.session.store().message("org-a", "m1").unwrap();
        let status = message.status.as_ref().unwrap();
        assert!(status.contains(Stage::Sent));
        assert!(status.contains(Stage::Delivered));
        assert_eq!(message.highest_status(), Some(Stage::Failed));
    }

    #[tokio::test]
    async fn test_scope_change_evicts_and_resubscribes() {
        let mut h = harness();
        h.remote.insert_row(Table::Messages, message_row("org-a", "m1", 1, &[]));
        h.remote.insert_row(Table::Messages, message_row("org-b", "m2", 1, &[]));
        h.session.set_scope(orgs(&["org-a", "org-b"])).await.unwrap();
        assert_eq!(h.session.store().organization_ids(), vec!["org-a", "org-b"]);

        h.session.set_scope(orgs(&["org-b"])).await.unwrap();
        assert_eq!(h.session.store().organization_ids(), vec!["org-b"]);
        assert!(h.session.store().message("org-a", "m1").is_none());
        assert_eq!(h.channel.active_channels(), vec!["org:org-b"]);

        assert!(h
            .session
            .drain_changes()
            .contains(&StoreChange::OrganizationEvicted {
                organization_id: "org-a".to_string()
            }));
    }

    #[tokio::test]
    async fn test_no_old_scope_event_applied_after_switch() {
        let mut h = harness();
        h.session.set_scope(orgs(&["org-a"])).await.unwrap();

        // Queued but not yet applied when the scope changes
        h.channel.emit("org-a", push(message_row("org-a", "m1", 1, &[])));
        h.session.set_scope(orgs(&["org-b"])).await.unwrap();

        // Delivered over the raw channel id after teardown
        h.channel.emit_raw("org:org-a", push(message_row("org-a", "m2", 2, &[])));
        h.session.pump();

        assert!(h.session.store().message("org-a", "m1").is_none());
        assert!(h.session.store().message("org-a", "m2").is_none());
        assert!(h.session.stats().snapshot().dropped["stale_subscription"] >= 1);
    }

    #[tokio::test]
    async fn test_foreign_organization_row_dropped() {
        let mut h = harness();
        h.session.set_scope(orgs(&["org-a", "org-b"])).await.unwrap();

        h.channel.emit_raw("org:org-a", push(message_row("org-b", "m1", 1, &[])));
        h.session.pump();

        assert!(h.session.store().message("org-b", "m1").is_none());
        assert_eq!(h.session.stats().snapshot().dropped["foreign_organization"], 1);
    }

    #[tokio::test]
    async fn test_stale_generation_page_discarded() {
        let mut h = harness();
        h.session.set_scope(orgs(&["org-a"])).await.unwrap();

        let request = h.session.begin_load(None);
        h.remote.insert_row(Table::Messages, message_row("org-a", "m1", 1, &[]));
        let page = h.session.synchronizer().fetch(&request).await.unwrap();

        h.session.set_scope(orgs(&["org-a"])).await.unwrap();
        h.remote.insert_row(Table::Messages, message_row("org-a", "m1", 2, &[]));
        h.session.full_load().await.unwrap();

        assert_eq!(h.session.apply(Ingest::Snapshot(page)), Applied::Discarded);
        assert_eq!(h.session.store().message("org-a", "m1").unwrap().updated_at, ts(2));
        assert_eq!(h.session.stats().snapshot().pages_discarded, 1);
    }

    #[tokio::test]
    async fn test_superseded_load_failure_discarded() {
        let mut h = harness();
        h.session.set_scope(orgs(&["org-a"])).await.unwrap();
        let request = h.session.begin_load(None);

        h.session.set_scope(orgs(&["org-a"])).await.unwrap();
        let error = SyncError::Remote {
            table: Table::Messages,
            source: RemoteError::Transport("late".to_string()),
        };

        assert_eq!(
            h.session.apply(Ingest::from_fetch(request, Err(error))),
            Applied::Discarded
        );
        assert!(!h.session.health().stale);
        assert!(h.session.health().last_error.is_none());
        assert_eq!(h.session.stats().snapshot().fetch_failures, 0);
    }

    #[tokio::test]
    async fn test_gap_closed_by_delta_after_resume() {
        let mut h = harness();
        h.session.set_scope(orgs(&["org-a"])).await.unwrap();

        h.session.became_hidden(ts(100));
        h.channel.disconnect_all();
        // Written while no channel was attached
        h.remote.insert_row(Table::Messages, message_row("org-a", "m-gap", 150, &["sent"]));
        h.remote.insert_row(Table::Messages, message_row("org-a", "m-old", 50, &["sent"]));

        let report = h.session.became_visible().await.unwrap().unwrap();
        assert_eq!(report.kind, LoadKind::Delta);
        assert_eq!(report.fetched_messages, 1);
        assert!(h.session.store().message("org-a", "m-gap").is_some());
        assert!(h.session.store().message("org-a", "m-old").is_none());
        assert_eq!(h.session.ingestor().state("org-a"), SubscriptionState::Attached);
        assert_eq!(h.session.state().hidden_since, None);

        let last_query = h.remote.queries().pop().unwrap();
        assert_eq!(last_query.filters.len(), 2);
    }

    #[tokio::test]
    async fn test_watermark_survives_scope_change_while_hidden() {
        let mut h = harness();
        h.session.set_scope(orgs(&["org-a"])).await.unwrap();

        h.session.became_hidden(ts(100));
        h.session.set_scope(orgs(&["org-a", "org-b"])).await.unwrap();
        assert_eq!(h.session.state().hidden_since, Some(ts(100)));

        h.channel.disconnect_all();
        h.remote.insert_row(Table::Messages, message_row("org-a", "m-gap", 150, &["sent"]));

        let report = h.session.became_visible().await.unwrap().unwrap();
        assert_eq!(report.kind, LoadKind::Delta);
        assert!(h.session.store().message("org-a", "m-gap").is_some());
        assert_eq!(h.session.ingestor().state("org-a"), SubscriptionState::Attached);
        assert_eq!(h.session.ingestor().state("org-b"), SubscriptionState::Attached);
        assert_eq!(h.session.state().hidden_since, None);
    }

    #[tokio::test]
    async fn test_visible_without_hide_skips_delta() {
        let mut h = harness();
        h.session.set_scope(orgs(&["org-a"])).await.unwrap();
        let queries = h.remote.queries().len();

        assert_eq!(h.session.became_visible().await.unwrap(), None);
        assert_eq!(h.remote.queries().len(), queries);
    }

    #[tokio::test]
    async fn test_failed_delta_restores_watermark() {
        let mut h = harness();
        h.session.set_scope(orgs(&["org-a"])).await.unwrap();

        h.session.became_hidden(ts(100));
        h.session.became_hidden(ts(200));
        assert_eq!(h.session.state().hidden_since, Some(ts(100)));

        h.remote
            .fail_table(Table::Messages, RemoteError::Transport("offline".to_string()));
        assert!(h.session.became_visible().await.is_err());
        assert_eq!(h.session.state().hidden_since, Some(ts(100)));
        assert!(h.session.health().stale);

        h.remote.clear_failures();
        h.remote.insert_row(Table::Messages, message_row("org-a", "m1", 150, &[]));
        let report = h.session.became_visible().await.unwrap().unwrap();
        assert_eq!(report.fetched_messages, 1);
        assert!(!h.session.health().stale);
        assert_eq!(h.session.state().hidden_since, None);
    }

    #[tokio::test]
    async fn test_failed_full_load_still_attaches() {
        let mut h = harness();
        h.remote
            .fail_table(Table::Conversations, RemoteError::Unauthorized("expired".to_string()));
        h.remote.insert_row(Table::Messages, message_row("org-a", "m1", 1, &[]));

        let err = h.session.set_scope(orgs(&["org-a"])).await.unwrap_err();
        assert!(matches!(err, SyncError::Remote { table: Table::Conversations, .. }));
        // No partial application
        assert!(h.session.store().message("org-a", "m1").is_none());
        assert_eq!(h.session.ingestor().state("org-a"), SubscriptionState::Attached);
        assert!(h.session.health().last_error.is_some());
    }

    #[tokio::test]
    async fn test_cache_write_failure_does_not_fail_ingestion() {
        let mut h = harness();
        h.cache.set_fail_writes(true);
        h.remote.insert_row(Table::Messages, message_row("org-a", "m1", 1, &[]));

        h.session.set_scope(orgs(&["org-a"])).await.unwrap();
        h.channel.emit("org-a", push(message_row("org-a", "m2", 2, &[])));
        h.session.pump();

        assert!(h.session.store().message("org-a", "m1").is_some());
        assert!(h.session.store().message("org-a", "m2").is_some());
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn test_end_session_clears_cache_and_store() {
        let mut h = harness();
        h.remote.insert_row(Table::Messages, message_row("org-a", "m1", 1, &[]));
        h.session.set_scope(orgs(&["org-a"])).await.unwrap();
        assert!(!h.cache.is_empty());

        h.session.end_session().unwrap();
        assert!(h.cache.is_empty());
        assert!(h.session.cache().get_message("m1").is_none());
        assert!(h.session.store().is_empty());
        assert!(!h.session.state().signed_in);
        assert!(h.channel.active_channels().is_empty());

        // Already signed out; nothing more to clear
        h.cache.put("message:other", "{}").unwrap();
        h.session.end_session().unwrap();
        assert_eq!(h.cache.len(), 1);
    }

    #[tokio::test]
    async fn test_warm_start_serves_cached_rows() {
        let mut h = harness();
        h.remote.insert_row(Table::Messages, message_row("org-a", "m1", 1, &["sent"]));
        h.session.set_scope(orgs(&["org-a"])).await.unwrap();

        // Fresh session over the same cache while the remote is down
        let config = SyncConfig::new("unused");
        let offline = MemoryRemote::new();
        offline.fail_table(Table::Conversations, RemoteError::Transport("offline".to_string()));
        let mut session = SyncSession::new(&config, offline, LoopbackChannel::new(), h.cache.clone());

        assert!(session.set_scope(orgs(&["org-a"])).await.is_err());
        assert_eq!(session.store().highest_status("org-a", "m1"), Some(Stage::Sent));
        assert!(session.health().stale);
    }
}
