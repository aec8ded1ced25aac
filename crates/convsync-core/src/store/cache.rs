//! Local persistent cache: durable key-value storage of observed rows.
//!
//! The cache is strictly a cache. The reconciled store can always be rebuilt
//! from the remote source without it, so write failures are logged and
//! swallowed rather than propagated into ingestion.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

use crate::models::{Conversation, Message};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Cache unavailable: {0}")]
    Unavailable(String),
}

/// Durable storage primitive. Each call is atomic on its own; no cross-call
/// transactions are assumed.
pub trait DurableCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    fn put(&self, key: &str, value: &str) -> Result<(), CacheError>;
    fn clear(&self) -> Result<(), CacheError>;
    /// All entries whose key starts with `prefix`, in key order.
    fn entries(&self, prefix: &str) -> Result<Vec<(String, String)>, CacheError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKey<'a> {
    Message(&'a str),
    Conversation(&'a str),
}

impl CacheKey<'_> {
    pub const MESSAGE_PREFIX: &'static str = "message:";
    pub const CONVERSATION_PREFIX: &'static str = "conversation:";
}

impl fmt::Display for CacheKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Message(id) => write!(f, "{}{}", Self::MESSAGE_PREFIX, id),
            CacheKey::Conversation(id) => write!(f, "{}{}", Self::CONVERSATION_PREFIX, id),
        }
    }
}

/// Typed, fire-and-forget wrapper over a [`DurableCache`].
pub struct LocalCache<C> {
    inner: C,
}

impl<C: DurableCache> LocalCache<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn put_message(&self, message: &Message) {
        self.put_row(CacheKey::Message(&message.id), message);
    }

    pub fn put_conversation(&self, conversation: &Conversation) {
        self.put_row(CacheKey::Conversation(&conversation.id), conversation);
    }

    pub fn get_message(&self, id: &str) -> Option<Message> {
        self.get_row(CacheKey::Message(id))
    }

    pub fn get_conversation(&self, id: &str) -> Option<Conversation> {
        self.get_row(CacheKey::Conversation(id))
    }

    pub fn cached_messages(&self) -> Vec<Message> {
        self.rows_with_prefix(CacheKey::MESSAGE_PREFIX)
    }

    pub fn cached_conversations(&self) -> Vec<Conversation> {
        self.rows_with_prefix(CacheKey::CONVERSATION_PREFIX)
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        self.inner.clear()
    }

    fn put_row<T: Serialize>(&self, key: CacheKey<'_>, row: &T) {
        let key = key.to_string();
        let result = serde_json::to_string(row)
            .map_err(CacheError::from)
            .and_then(|value| self.inner.put(&key, &value));

        if let Err(e) = result {
            warn!(key = %key, error = %e, "cache write failed");
        }
    }

    fn get_row<T: DeserializeOwned>(&self, key: CacheKey<'_>) -> Option<T> {
        let key = key.to_string();
        match self.inner.get(&key) {
            Ok(Some(value)) => match serde_json::from_str(&value) {
                Ok(row) => Some(row),
                Err(e) => {
                    debug!(key = %key, error = %e, "discarding undecodable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "cache read failed");
                None
            }
        }
    }

    fn rows_with_prefix<T: DeserializeOwned>(&self, prefix: &str) -> Vec<T> {
        let entries = match self.inner.entries(prefix) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(prefix, error = %e, "cache scan failed");
                return Vec::new();
            }
        };

        entries
            .into_iter()
            .filter_map(|(key, value)| match serde_json::from_str(&value) {
                Ok(row) => Some(row),
                Err(e) => {
                    debug!(key = %key, error = %e, "discarding undecodable cache entry");
                    None
                }
            })
            .collect()
    }
}
