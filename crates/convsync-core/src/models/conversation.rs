use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// A conversation row as delivered by the remote read and push interfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub organization_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Inbox classification (e.g. "open", "pending", "closed")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default)]
    pub archived: bool,
    /// Denormalized attribute bag, e.g. `{"type": "group"}`
    #[serde(default, deserialize_with = "null_as_empty_map")]
    pub extra: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Decode a conversation from a raw JSON row.
    pub fn from_row(row: &serde_json::Value) -> Result<Self, serde_json::Error> {
        Conversation::deserialize(row)
    }

    /// `extra.type`, typically "direct" or "group".
    pub fn conversation_type(&self) -> Option<&str> {
        self.extra.get("type").and_then(|v| v.as_str())
    }
}

fn null_as_empty_map<'de, D>(
    deserializer: D,
) -> Result<serde_json::Map<String, serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<serde_json::Map<String, serde_json::Value>>::deserialize(deserializer)?
        .unwrap_or_default())
}
