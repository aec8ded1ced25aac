use std::collections::{BTreeSet, HashMap};

use crate::events::StoreChange;
use crate::models::{Conversation, Message, Row, Stage};
use crate::store::merge::{merge_into, MergeOutcome};

/// Per-organization slice of the store.
#[derive(Debug, Default)]
struct OrganizationData {
    /// Sorted by updated_at descending (most recent first)
    conversations: Vec<Conversation>,
    /// Keyed by conversation id, each sorted by updated_at ascending
    messages_by_conversation: HashMap<String, Vec<Message>>,
    /// message id -> conversation id it is currently filed under
    message_locations: HashMap<String, String>,
}

fn conversation_precedes(a: &Conversation, b: &Conversation) -> bool {
    a.updated_at > b.updated_at || (a.updated_at == b.updated_at && a.id < b.id)
}

fn message_precedes(a: &Message, b: &Message) -> bool {
    a.updated_at < b.updated_at || (a.updated_at == b.updated_at && a.id < b.id)
}

impl OrganizationData {
    fn upsert_conversation(&mut self, incoming: Conversation) -> MergeOutcome {
        let Some(pos) = self.conversations.iter().position(|c| c.id == incoming.id) else {
            let insert_pos = self
                .conversations
                .partition_point(|c| conversation_precedes(c, &incoming));
            self.conversations.insert(insert_pos, incoming);
            return MergeOutcome::Inserted;
        };

        let outcome = merge_into(&mut self.conversations[pos], incoming);
        if outcome == MergeOutcome::Replaced {
            // updated_at moved; re-file to keep the list ordered
            let conversation = self.conversations.remove(pos);
            let insert_pos = self
                .conversations
                .partition_point(|c| conversation_precedes(c, &conversation));
            self.conversations.insert(insert_pos, conversation);
        }
        outcome
    }

    fn insert_message_sorted(&mut self, message: Message) {
        self.message_locations
            .insert(message.id.clone(), message.conversation_id.clone());
        let messages = self
            .messages_by_conversation
            .entry(message.conversation_id.clone())
            .or_default();
        let insert_pos = messages.partition_point(|m| message_precedes(m, &message));
        messages.insert(insert_pos, message);
    }

    fn take_message(&mut self, conversation_id: &str, message_id: &str) -> Option<Message> {
        let messages = self.messages_by_conversation.get_mut(conversation_id)?;
        let pos = messages.iter().position(|m| m.id == message_id)?;
        let message = messages.remove(pos);
        if messages.is_empty() {
            self.messages_by_conversation.remove(conversation_id);
        }
        Some(message)
    }

    fn upsert_message(&mut self, incoming: Message) -> MergeOutcome {
        let existing = self
            .message_locations
            .get(&incoming.id)
            .cloned()
            .and_then(|conversation_id| self.take_message(&conversation_id, &incoming.id));

        let Some(mut message) = existing else {
            self.insert_message_sorted(incoming);
            return MergeOutcome::Inserted;
        };

        let outcome = merge_into(&mut message, incoming);
        // Re-filed even when unchanged: position depends on updated_at and
        // conversation_id, both of which may have moved on replace
        self.insert_message_sorted(message);
        outcome
    }

    fn find_message(&self, message_id: &str) -> Option<&Message> {
        let conversation_id = self.message_locations.get(message_id)?;
        self.messages_by_conversation
            .get(conversation_id)?
            .iter()
            .find(|m| m.id == message_id)
    }

    fn message_count(&self) -> usize {
        self.message_locations.len()
    }
}

/// Counts of merge outcomes over one applied batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub rejected: usize,
}

impl PageSummary {
    pub fn record(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Inserted => self.inserted += 1,
            MergeOutcome::Replaced | MergeOutcome::StagesMerged => self.updated += 1,
            MergeOutcome::Unchanged => self.unchanged += 1,
            MergeOutcome::OutOfScope => self.rejected += 1,
        }
    }

    pub fn changed(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Converged, per-organization view of conversations and messages.
///
/// Single source of truth for readers. Every writer goes through
/// `apply_conversation` / `apply_message`, which enforce the authorized scope
/// and the monotonic merge rule.
#[derive(Debug, Default)]
pub struct ReconciledStore {
    scope: BTreeSet<String>,
    organizations: HashMap<String, OrganizationData>,
    pending_changes: Vec<StoreChange>,
}

impl ReconciledStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope(&self) -> &BTreeSet<String> {
        &self.scope
    }

    pub fn in_scope(&self, organization_id: &str) -> bool {
        self.scope.contains(organization_id)
    }

    /// Replace the authorized scope, evicting every organization that left it.
    /// Returns the evicted organization ids.
    pub fn set_scope<I>(&mut self, organization_ids: I) -> Vec<String>
    where
        I: IntoIterator<Item = String>,
    {
        self.scope = organization_ids.into_iter().collect();

        let evicted: Vec<String> = self
            .organizations
            .keys()
            .filter(|id| !self.scope.contains(*id))
            .cloned()
            .collect();

        for organization_id in &evicted {
            self.organizations.remove(organization_id);
            self.pending_changes.push(StoreChange::OrganizationEvicted {
                organization_id: organization_id.clone(),
            });
        }
        evicted
    }

    /// Drop all data and the scope.
    pub fn clear(&mut self) {
        self.scope.clear();
        self.organizations.clear();
        self.pending_changes.clear();
        self.pending_changes.push(StoreChange::Cleared);
    }

    pub fn apply_conversation(&mut self, conversation: Conversation) -> MergeOutcome {
        if !self.in_scope(&conversation.organization_id) {
            return MergeOutcome::OutOfScope;
        }

        let organization_id = conversation.organization_id.clone();
        let conversation_id = conversation.id.clone();
        let outcome = self
            .organizations
            .entry(organization_id.clone())
            .or_default()
            .upsert_conversation(conversation);

        if outcome.changed() {
            self.pending_changes.push(StoreChange::ConversationChanged {
                organization_id,
                conversation_id,
            });
        }
        outcome
    }

    pub fn apply_message(&mut self, message: Message) -> MergeOutcome {
        if !self.in_scope(&message.organization_id) {
            return MergeOutcome::OutOfScope;
        }

        let organization_id = message.organization_id.clone();
        let message_id = message.id.clone();
        let data = self.organizations.entry(organization_id.clone()).or_default();
        let outcome = data.upsert_message(message);

        if outcome.changed() {
            let conversation_id = data
                .message_locations
                .get(&message_id)
                .cloned()
                .unwrap_or_default();
            self.pending_changes.push(StoreChange::MessageChanged {
                organization_id,
                conversation_id,
                message_id,
            });
        }
        outcome
    }

    pub fn apply_row(&mut self, row: Row) -> MergeOutcome {
        match row {
            Row::Conversation(conversation) => self.apply_conversation(conversation),
            Row::Message(message) => self.apply_message(message),
        }
    }

    /// Apply a fetched page in one go.
    pub fn apply_page(
        &mut self,
        conversations: Vec<Conversation>,
        messages: Vec<Message>,
    ) -> PageSummary {
        let mut summary = PageSummary::default();
        for conversation in conversations {
            summary.record(self.apply_conversation(conversation));
        }
        for message in messages {
            summary.record(self.apply_message(message));
        }
        summary
    }

    // ===== Read side =====

    pub fn organization_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.organizations.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Conversations of an organization, most recently updated first.
    pub fn conversations(&self, organization_id: &str) -> &[Conversation] {
        self.organizations
            .get(organization_id)
            .map(|o| o.conversations.as_slice())
            .unwrap_or(&[])
    }

    pub fn conversation(&self, organization_id: &str, conversation_id: &str) -> Option<&Conversation> {
        self.conversations(organization_id)
            .iter()
            .find(|c| c.id == conversation_id)
    }

    /// Messages of a conversation, oldest update first.
    pub fn messages(&self, organization_id: &str, conversation_id: &str) -> &[Message] {
        self.organizations
            .get(organization_id)
            .and_then(|o| o.messages_by_conversation.get(conversation_id))
            .map(|m| m.as_slice())
            .unwrap_or(&[])
    }

    /// Ids of conversations holding at least one message, sorted. Includes
    /// conversations whose own row has not been seen yet.
    pub fn message_conversation_ids(&self, organization_id: &str) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .organizations
            .get(organization_id)
            .map(|o| o.messages_by_conversation.keys().map(String::as_str).collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub fn message(&self, organization_id: &str, message_id: &str) -> Option<&Message> {
        self.organizations.get(organization_id)?.find_message(message_id)
    }

    /// Effective delivery stage of an outgoing message.
    pub fn highest_status(&self, organization_id: &str, message_id: &str) -> Option<Stage> {
        self.message(organization_id, message_id)?.highest_status()
    }

    pub fn conversation_count(&self, organization_id: &str) -> usize {
        self.conversations(organization_id).len()
    }

    pub fn message_count(&self, organization_id: &str) -> usize {
        self.organizations
            .get(organization_id)
            .map(|o| o.message_count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.organizations.is_empty()
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.pending_changes.is_empty()
    }

    pub fn drain_changes(&mut self) -> Vec<StoreChange> {
        std::mem::take(&mut self.pending_changes)
    }
}
