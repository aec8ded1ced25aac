use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::models::Table;
use crate::store::MergeOutcome;
use crate::sync::DropReason;

/// Per-table merge outcome counters
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TableStats {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    /// Rejected by the store for being outside the authorized scope
    pub out_of_scope: u64,
}

impl TableStats {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.unchanged + self.out_of_scope
    }
}

/// Stats for everything that went through the ingestion queue
#[derive(Debug, Default, Clone, Serialize)]
pub struct IngestStats {
    pub by_table: BTreeMap<Table, TableStats>,
    /// Push events dropped before reaching the store, by reason
    pub dropped: BTreeMap<String, u64>,
    pub pages_applied: u64,
    /// Pages fetched under a generation that was already superseded
    pub pages_discarded: u64,
    pub fetch_failures: u64,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_outcome(&mut self, table: Table, outcome: MergeOutcome) {
        let stats = self.by_table.entry(table).or_default();
        match outcome {
            MergeOutcome::Inserted => stats.inserted += 1,
            MergeOutcome::Replaced | MergeOutcome::StagesMerged => stats.updated += 1,
            MergeOutcome::Unchanged => stats.unchanged += 1,
            MergeOutcome::OutOfScope => stats.out_of_scope += 1,
        }
    }

    pub fn record_dropped(&mut self, reason: &DropReason) {
        *self.dropped.entry(drop_key(reason).to_string()).or_insert(0) += 1;
    }

    pub fn total_dropped(&self) -> u64 {
        self.dropped.values().sum()
    }
}

fn drop_key(reason: &DropReason) -> &'static str {
    match reason {
        DropReason::StaleSubscription => "stale_subscription",
        DropReason::NotAttached => "not_attached",
        DropReason::UntrackedTable(_) => "untracked_table",
        DropReason::Delete => "delete",
        DropReason::ForeignOrganization(_) => "foreign_organization",
        DropReason::Malformed(_) => "malformed",
    }
}

/// Thread-safe wrapper for ingest stats
#[derive(Debug, Clone)]
pub struct SharedIngestStats {
    inner: Arc<RwLock<IngestStats>>,
}

impl Default for SharedIngestStats {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedIngestStats {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(IngestStats::new())),
        }
    }

    pub fn record_outcome(&self, table: Table, outcome: MergeOutcome) {
        if let Ok(mut stats) = self.inner.write() {
            stats.record_outcome(table, outcome);
        }
    }

    pub fn record_dropped(&self, reason: &DropReason) {
        if let Ok(mut stats) = self.inner.write() {
            stats.record_dropped(reason);
        }
    }

    pub fn record_page(&self, discarded: bool) {
        if let Ok(mut stats) = self.inner.write() {
            if discarded {
                stats.pages_discarded += 1;
            } else {
                stats.pages_applied += 1;
            }
        }
    }

    pub fn record_fetch_failure(&self) {
        if let Ok(mut stats) = self.inner.write() {
            stats.fetch_failures += 1;
        }
    }

    pub fn snapshot(&self) -> IngestStats {
        self.inner.read().map(|s| s.clone()).unwrap_or_default()
    }
}
