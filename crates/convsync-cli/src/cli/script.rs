use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::Path;

use convsync_core::models::{PushEvent, Table};

/// A scripted session: initial remote rows plus lifecycle steps, applied in order.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Script {
    #[serde(default)]
    pub remote: RemoteRows,
    pub steps: Vec<Step>,
}

/// Rows the remote holds before the first step
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteRows {
    #[serde(default)]
    pub conversations: Vec<serde_json::Value>,
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "step", rename_all = "camelCase")]
pub enum Step {
    SetScope {
        organizations: Vec<String>,
    },
    /// Delivered through the organization's subscription
    Push {
        organization: String,
        event: PushEvent,
    },
    /// Delivered on a channel id regardless of its filters
    PushRaw {
        channel: String,
        event: PushEvent,
    },
    Disconnect,
    Hide {
        at: DateTime<Utc>,
    },
    Show,
    RemoteInsert {
        table: Table,
        row: serde_json::Value,
    },
    RemoteFail {
        table: Table,
        error: String,
    },
    RemoteRecover,
    EndSession,
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::SetScope { .. } => "setScope",
            Step::Push { .. } => "push",
            Step::PushRaw { .. } => "pushRaw",
            Step::Disconnect => "disconnect",
            Step::Hide { .. } => "hide",
            Step::Show => "show",
            Step::RemoteInsert { .. } => "remoteInsert",
            Step::RemoteFail { .. } => "remoteFail",
            Step::RemoteRecover => "remoteRecover",
            Step::EndSession => "endSession",
        }
    }
}

impl Script {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read script: {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse script: {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Invalid script JSON")
    }
}
