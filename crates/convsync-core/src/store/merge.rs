//! Monotonic merge rule shared by every writer of the reconciled store.

use chrono::{DateTime, Utc};

use crate::models::{Conversation, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// First time this id was seen
    Inserted,
    /// A strictly newer `updated_at` replaced the stored record
    Replaced,
    /// Same `updated_at`; the incoming record contributed new status stages
    StagesMerged,
    /// Older or identical record; store untouched
    Unchanged,
    /// Row belongs to an organization outside the authorized scope
    OutOfScope,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        matches!(
            self,
            MergeOutcome::Inserted | MergeOutcome::Replaced | MergeOutcome::StagesMerged
        )
    }
}

pub trait Versioned {
    fn updated_at(&self) -> DateTime<Utc>;

    /// Called on the stored record when an incoming one carries the same
    /// `updated_at`. Returns true if the stored record changed.
    fn merge_tie(&mut self, _incoming: &Self) -> bool {
        false
    }
}

impl Versioned for Conversation {
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

impl Versioned for Message {
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn merge_tie(&mut self, incoming: &Self) -> bool {
        self.union_stages(incoming)
    }
}

/// Merge `incoming` into `existing`, last writer wins by `updated_at`.
/// A strictly newer record replaces the stored one outright.
pub fn merge_into<T: Versioned>(existing: &mut T, incoming: T) -> MergeOutcome {
    if incoming.updated_at() > existing.updated_at() {
        *existing = incoming;
        MergeOutcome::Replaced
    } else if incoming.updated_at() == existing.updated_at() && existing.merge_tie(&incoming) {
        MergeOutcome::StagesMerged
    } else {
        MergeOutcome::Unchanged
    }
}
