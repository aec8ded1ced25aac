use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc::Sender;
use tracing::{debug, info, warn};

use crate::constants::columns;
use crate::events::Ingest;
use crate::models::{ChangeKind, PushEvent, Row, Table};
use crate::sync::remote::{ChannelFilter, PushChannel, PushSink, SubscriptionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Detached,
    Subscribing,
    Attached,
}

/// Why a push event was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Subscription was torn down or replaced
    StaleSubscription,
    /// Subscription exists but is not attached
    NotAttached,
    UntrackedTable(String),
    /// Delete events never remove rows
    Delete,
    ForeignOrganization(String),
    Malformed(String),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::StaleSubscription => write!(f, "stale subscription"),
            DropReason::NotAttached => write!(f, "subscription not attached"),
            DropReason::UntrackedTable(table) => write!(f, "untracked table {}", table),
            DropReason::Delete => write!(f, "delete event"),
            DropReason::ForeignOrganization(org) => write!(f, "row for organization {}", org),
            DropReason::Malformed(e) => write!(f, "malformed row: {}", e),
        }
    }
}

/// Returned by `subscribe`; releases the subscriptions it names.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IngestorHandle {
    subscriptions: Vec<SubscriptionId>,
}

impl IngestorHandle {
    pub fn subscriptions(&self) -> &[SubscriptionId] {
        &self.subscriptions
    }
}

struct OrgSubscription<H> {
    id: SubscriptionId,
    channel_id: String,
    state: SubscriptionState,
    handle: Option<H>,
}

/// Keeps one push subscription per organization in scope and filters what
/// they deliver before it reaches the store.
pub struct RealtimeIngestor<P: PushChannel> {
    channel: P,
    channel_prefix: String,
    ingest_tx: Sender<Ingest>,
    /// Keyed by organization id
    subscriptions: BTreeMap<String, OrgSubscription<P::Handle>>,
    next_id: u64,
}

impl<P: PushChannel> RealtimeIngestor<P> {
    pub fn new(channel: P, channel_prefix: &str, ingest_tx: Sender<Ingest>) -> Self {
        Self {
            channel,
            channel_prefix: channel_prefix.to_string(),
            ingest_tx,
            subscriptions: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn channel(&self) -> &P {
        &self.channel
    }

    /// Attach to every organization in `scope`, replacing whatever was attached.
    /// Channel failures leave the organization detached; they are not raised.
    pub fn subscribe(&mut self, scope: &[String]) -> IngestorHandle {
        self.unsubscribe_all();

        let mut handle = IngestorHandle::default();
        for organization_id in scope {
            if self.subscriptions.contains_key(organization_id) {
                continue;
            }
            handle.subscriptions.push(self.attach(organization_id));
        }
        handle
    }

    pub fn unsubscribe(&mut self, handle: IngestorHandle) {
        for id in handle.subscriptions {
            let organization_id = self
                .subscriptions
                .iter()
                .find(|(_, sub)| sub.id == id)
                .map(|(org, _)| org.clone());
            if let Some(organization_id) = organization_id {
                self.release(&organization_id);
            }
        }
    }

    pub fn unsubscribe_all(&mut self) {
        let organizations: Vec<String> = self.subscriptions.keys().cloned().collect();
        for organization_id in organizations {
            self.release(&organization_id);
        }
    }

    /// Re-subscribe every organization whose channel dropped. Returns how many
    /// were re-attached successfully.
    pub fn reattach_detached(&mut self) -> usize {
        let detached: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.state == SubscriptionState::Detached)
            .map(|(org, _)| org.clone())
            .collect();

        let mut reattached = 0;
        for organization_id in detached {
            self.release(&organization_id);
            self.attach(&organization_id);
            if self.state(&organization_id) == SubscriptionState::Attached {
                reattached += 1;
            }
        }
        reattached
    }

    /// The channel behind `id` went away. The gap is left for the next delta load.
    pub fn mark_detached(&mut self, id: SubscriptionId) -> bool {
        let Some((organization_id, sub)) = self.subscriptions.iter_mut().find(|(_, s)| s.id == id)
        else {
            return false;
        };
        if sub.state != SubscriptionState::Detached {
            info!(organization_id = %organization_id, channel = %sub.channel_id, "realtime channel detached");
            sub.state = SubscriptionState::Detached;
        }
        true
    }

    pub fn state(&self, organization_id: &str) -> SubscriptionState {
        self.subscriptions
            .get(organization_id)
            .map(|s| s.state)
            .unwrap_or(SubscriptionState::Detached)
    }

    pub fn attached_organizations(&self) -> Vec<&str> {
        self.subscriptions
            .iter()
            .filter(|(_, s)| s.state == SubscriptionState::Attached)
            .map(|(org, _)| org.as_str())
            .collect()
    }

    pub fn subscription_id(&self, organization_id: &str) -> Option<SubscriptionId> {
        self.subscriptions.get(organization_id).map(|s| s.id)
    }

    /// Filter and decode one delivered event.
    pub fn accept(&self, id: SubscriptionId, event: &PushEvent) -> Result<Row, DropReason> {
        let Some((organization_id, sub)) = self.subscriptions.iter().find(|(_, s)| s.id == id)
        else {
            return Err(DropReason::StaleSubscription);
        };
        if sub.state != SubscriptionState::Attached {
            return Err(DropReason::NotAttached);
        }

        let table = event
            .tracked_table()
            .ok_or_else(|| DropReason::UntrackedTable(event.table.clone()))?;
        if event.event == ChangeKind::Delete {
            return Err(DropReason::Delete);
        }

        let row = Row::decode(table, &event.new).map_err(|e| DropReason::Malformed(e.to_string()))?;
        if row.organization_id() != organization_id {
            return Err(DropReason::ForeignOrganization(row.organization_id().to_string()));
        }
        Ok(row)
    }

    fn attach(&mut self, organization_id: &str) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;

        let channel_id = format!("{}:{}", self.channel_prefix, organization_id);
        self.subscriptions.insert(
            organization_id.to_string(),
            OrgSubscription {
                id,
                channel_id: channel_id.clone(),
                state: SubscriptionState::Subscribing,
                handle: None,
            },
        );

        let filters = [
            ChannelFilter::eq(Table::Conversations, columns::ORGANIZATION_ID, organization_id),
            ChannelFilter::eq(Table::Messages, columns::ORGANIZATION_ID, organization_id),
        ];
        let sink = PushSink::new(id, self.ingest_tx.clone());
        let result = self.channel.subscribe(&channel_id, &filters, sink);

        if let Some(sub) = self.subscriptions.get_mut(organization_id) {
            match result {
                Ok(handle) => {
                    debug!(organization_id, channel = %channel_id, "realtime channel attached");
                    sub.handle = Some(handle);
                    sub.state = SubscriptionState::Attached;
                }
                Err(e) => {
                    warn!(organization_id, channel = %channel_id, error = %e, "realtime subscribe failed");
                    sub.state = SubscriptionState::Detached;
                }
            }
        }
        id
    }

    fn release(&mut self, organization_id: &str) {
        if let Some(sub) = self.subscriptions.remove(organization_id) {
            if let Some(handle) = sub.handle {
                self.channel.unsubscribe(handle);
            }
            debug!(organization_id, channel = %sub.channel_id, "realtime channel released");
        }
    }
}
