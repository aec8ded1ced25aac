use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{Conversation, Message};

/// Remote tables tracked by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Conversations,
    Messages,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Conversations => "conversations",
            Table::Messages => "messages",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conversations" => Ok(Table::Conversations),
            "messages" => Ok(Table::Messages),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    #[serde(alias = "INSERT")]
    Insert,
    #[serde(alias = "UPDATE")]
    Update,
    #[serde(alias = "DELETE")]
    Delete,
}

/// Row-change event as delivered by the push channel.
///
/// `table` stays a plain string: the delivery layer may over-deliver events for
/// tables this engine does not track, and those must be dropped, not fail decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    pub table: String,
    pub event: ChangeKind,
    #[serde(default)]
    pub new: serde_json::Value,
}

impl PushEvent {
    pub fn new(table: Table, event: ChangeKind, new: serde_json::Value) -> Self {
        Self {
            table: table.as_str().to_string(),
            event,
            new,
        }
    }

    pub fn tracked_table(&self) -> Option<Table> {
        self.table.parse().ok()
    }
}

/// A decoded row from either tracked table.
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Conversation(Conversation),
    Message(Message),
}

impl Row {
    pub fn decode(table: Table, value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        match table {
            Table::Conversations => Conversation::from_row(value).map(Row::Conversation),
            Table::Messages => Message::from_row(value).map(Row::Message),
        }
    }

    pub fn table(&self) -> Table {
        match self {
            Row::Conversation(_) => Table::Conversations,
            Row::Message(_) => Table::Messages,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Row::Conversation(c) => &c.id,
            Row::Message(m) => &m.id,
        }
    }

    pub fn organization_id(&self) -> &str {
        match self {
            Row::Conversation(c) => &c.organization_id,
            Row::Message(m) => &m.organization_id,
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            Row::Conversation(c) => c.updated_at,
            Row::Message(m) => m.updated_at,
        }
    }
}
