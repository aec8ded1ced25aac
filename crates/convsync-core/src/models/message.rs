use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::outgoing_status::{OutgoingStatus, Stage};
use crate::status::highest_status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// A message row as delivered by the remote read and push interfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub organization_id: String,
    pub conversation_id: String,
    pub direction: Direction,
    /// Channel payload (text, media reference, template). Opaque to the engine.
    #[serde(default)]
    pub content: serde_json::Value,
    /// Accumulated delivery stages, only meaningful for outgoing messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<OutgoingStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Decode a message from a raw JSON row.
    pub fn from_row(row: &serde_json::Value) -> Result<Self, serde_json::Error> {
        Message::deserialize(row)
    }

    pub fn is_outgoing(&self) -> bool {
        self.direction == Direction::Outgoing
    }

    /// Effective delivery stage; `None` for incoming messages.
    pub fn highest_status(&self) -> Option<Stage> {
        self.is_outgoing()
            .then(|| highest_status(self.status.as_ref()))
    }

    /// Add any stage `other` reached that this record lacks.
    pub(crate) fn union_stages(&mut self, other: &Message) -> bool {
        let Some(old) = &other.status else {
            return false;
        };
        if let Some(current) = self.status.as_mut() {
            return current.absorb(old);
        }
        self.status = Some(old.clone());
        !old.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_row_outgoing_with_status() {
        let row = json!({
            "id": "m1",
            "organization_id": "org-a",
            "conversation_id": "c1",
            "direction": "outgoing",
            "content": {"text": "hi"},
            "status": {"sent": "2024-05-01T10:00:00Z", "delivered": "2024-05-01T10:00:05Z"},
            "updated_at": "2024-05-01T10:00:05Z"
        });

        let message = Message::from_row(&row).unwrap();
        assert!(message.is_outgoing());
        assert_eq!(message.highest_status(), Some(Stage::Delivered));
        assert_eq!(message.content["text"], "hi");
    }

    #[test]
    fn test_from_row_incoming_has_no_status() {
        let row = json!({
            "id": "m2",
            "organization_id": "org-a",
            "conversation_id": "c1",
            "direction": "incoming",
            "status": null,
            "updated_at": "2024-05-01T10:00:00Z"
        });

        let message = Message::from_row(&row).unwrap();
        assert_eq!(message.highest_status(), None);
        assert!(message.content.is_null());
    }

    #[test]
    fn test_from_row_rejects_missing_updated_at() {
        let row = json!({
            "id": "m3",
            "organization_id": "org-a",
            "conversation_id": "c1",
            "direction": "incoming"
        });
        assert!(Message::from_row(&row).is_err());
    }
}
