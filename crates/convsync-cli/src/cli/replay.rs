use anyhow::Result;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use convsync_core::memory::{LoopbackChannel, MemoryRemote};
use convsync_core::models::{Conversation, Message, Stage, Table};
use convsync_core::stats::IngestStats;
use convsync_core::sync::{RemoteError, SyncHealth, SyncReport, SyncSession};
use convsync_core::{SqliteCache, SyncConfig};

use super::script::{Script, Step};

/// Cache session key used for replays
const REPLAY_SESSION: &str = "replay";

type ReplaySession = SyncSession<MemoryRemote, LoopbackChannel, SqliteCache>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highest_status: Option<Stage>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationView {
    pub id: String,
    pub conversations: Vec<Conversation>,
    pub messages: Vec<MessageView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepLog {
    pub index: usize,
    pub step: &'static str,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Final state of a replayed session.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayOutput {
    pub organizations: Vec<OrganizationView>,
    pub health: SyncHealth,
    pub stats: IngestStats,
    pub steps: Vec<StepLog>,
}

impl ReplayOutput {
    fn capture(session: &ReplaySession, steps: Vec<StepLog>) -> Self {
        let store = session.store();
        let organizations = session
            .state()
            .scope
            .iter()
            .map(|organization_id| {
                let messages = store
                    .message_conversation_ids(organization_id)
                    .into_iter()
                    .flat_map(|conversation_id| store.messages(organization_id, conversation_id))
                    .map(|message| MessageView {
                        highest_status: message.highest_status(),
                        message: message.clone(),
                    })
                    .collect();
                OrganizationView {
                    id: organization_id.clone(),
                    conversations: store.conversations(organization_id).to_vec(),
                    messages,
                }
            })
            .collect();

        Self {
            organizations,
            health: session.health().clone(),
            stats: session.stats().snapshot(),
            steps,
        }
    }

    pub fn organization(&self, id: &str) -> Option<&OrganizationView> {
        self.organizations.iter().find(|o| o.id == id)
    }
}

fn report_json(report: &SyncReport) -> Value {
    json!({
        "kind": format!("{:?}", report.kind).to_lowercase(),
        "fetchedConversations": report.fetched_conversations,
        "fetchedMessages": report.fetched_messages,
        "inserted": report.summary.inserted,
        "updated": report.summary.updated,
        "unchanged": report.summary.unchanged,
        "rejected": report.summary.rejected,
        "discarded": report.discarded,
    })
}

/// Run `script` against in-memory collaborators and an in-memory SQLite cache.
pub async fn replay(script: Script, config: &SyncConfig) -> Result<ReplayOutput> {
    let remote = MemoryRemote::new();
    for row in script.remote.conversations {
        remote.insert_row(Table::Conversations, row);
    }
    for row in script.remote.messages {
        remote.insert_row(Table::Messages, row);
    }

    let channel = LoopbackChannel::new();
    let cache = SqliteCache::open_in_memory(REPLAY_SESSION)?;
    let mut session = SyncSession::new(config, remote.clone(), channel.clone(), cache);

    let mut log = Vec::with_capacity(script.steps.len());
    for (index, step) in script.steps.into_iter().enumerate() {
        let name = step.name();
        debug!(index, step = name, "replaying step");

        let outcome: Result<Value, String> = match step {
            Step::SetScope { organizations } => session
                .set_scope(organizations)
                .await
                .map(|report| report_json(&report))
                .map_err(|e| e.to_string()),
            Step::Push {
                organization,
                event,
            } => {
                let delivered = channel.emit(&organization, event);
                let handled = session.pump();
                Ok(json!({ "delivered": delivered, "handled": handled }))
            }
            Step::PushRaw { channel: id, event } => {
                let delivered = channel.emit_raw(&id, event);
                let handled = session.pump();
                Ok(json!({ "delivered": delivered, "handled": handled }))
            }
            Step::Disconnect => {
                channel.disconnect_all();
                session.pump();
                Ok(json!({ "attached": session.ingestor().attached_organizations() }))
            }
            Step::Hide { at } => {
                session.became_hidden(at);
                Ok(Value::Null)
            }
            Step::Show => session
                .became_visible()
                .await
                .map(|report| report.as_ref().map(report_json).unwrap_or(Value::Null))
                .map_err(|e| e.to_string()),
            Step::RemoteInsert { table, row } => {
                remote.insert_row(table, row);
                Ok(Value::Null)
            }
            Step::RemoteFail { table, error } => {
                remote.fail_table(table, RemoteError::Transport(error));
                Ok(Value::Null)
            }
            Step::RemoteRecover => {
                remote.clear_failures();
                Ok(Value::Null)
            }
            Step::EndSession => session
                .end_session()
                .map(|_| Value::Null)
                .map_err(|e| e.to_string()),
        };

        let (result, error) = match outcome {
            Ok(result) => (result, None),
            Err(error) => (Value::Null, Some(error)),
        };
        log.push(StepLog {
            index,
            step: name,
            result,
            error,
        });
    }

    session.pump();
    Ok(ReplayOutput::capture(&session, log))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SyncConfig {
        SyncConfig::new("unused")
    }

    const SCRIPT: &str = r#"{
        "remote": {
            "conversations": [
                {"id": "c1", "organization_id": "org-a", "updated_at": "2024-05-01T09:00:00Z"},
                {"id": "c2", "organization_id": "org-a", "updated_at": "2024-05-01T09:30:00Z"}
            ],
            "messages": [
                {"id": "m1", "organization_id": "org-a", "conversation_id": "c1",
                 "direction": "outgoing", "status": {"sent": "2024-05-01T09:00:00Z"},
                 "updated_at": "2024-05-01T09:00:00Z"},
                {"id": "m9", "organization_id": "org-z", "conversation_id": "c9",
                 "direction": "incoming", "updated_at": "2024-05-01T09:00:00Z"}
            ]
        },
        "steps": [
            {"step": "setScope", "organizations": ["org-a"]},
            {"step": "push", "organization": "org-a",
             "event": {"table": "messages", "event": "UPDATE",
                       "new": {"id": "m1", "organization_id": "org-a", "conversation_id": "c1",
                               "direction": "outgoing",
                               "status": {"sent": "2024-05-01T09:00:00Z", "delivered": "2024-05-01T09:01:00Z"},
                               "updated_at": "2024-05-01T09:01:00Z"}}},
            {"step": "hide", "at": "2024-05-01T10:00:00Z"},
            {"step": "disconnect"},
            {"step": "remoteInsert", "table": "messages",
             "row": {"id": "m2", "organization_id": "org-a", "conversation_id": "c2",
                     "direction": "incoming", "content": {"text": "missed"},
                     "updated_at": "2024-05-01T10:05:00Z"}},
            {"step": "show"}
        ]
    }"#;

    #[tokio::test]
    async fn test_replay_converges() {
        let script = Script::from_json(SCRIPT).unwrap();
        let output = replay(script, &config()).await.unwrap();

        assert_eq!(output.organizations.len(), 1);
        let org = output.organization("org-a").unwrap();
        let conversation_ids: Vec<_> = org.conversations.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(conversation_ids, vec!["c2", "c1"]);

        let m1 = org.messages.iter().find(|m| m.message.id == "m1").unwrap();
        assert_eq!(m1.highest_status, Some(Stage::Delivered));
        // Closed by the delta load after the channel dropped
        assert!(org.messages.iter().any(|m| m.message.id == "m2"));

        let show = output.steps.last().unwrap();
        assert_eq!(show.step, "show");
        assert_eq!(show.result["kind"], "delta");
        assert_eq!(show.result["fetchedMessages"], 1);
        assert!(!output.health.stale);
    }

    #[tokio::test]
    async fn test_replay_records_failures_and_continues() {
        let json = r#"{
            "steps": [
                {"step": "remoteFail", "table": "messages", "error": "offline"},
                {"step": "setScope", "organizations": ["org-a"]},
                {"step": "remoteRecover"},
                {"step": "endSession"}
            ]
        }"#;
        let output = replay(Script::from_json(json).unwrap(), &config())
            .await
            .unwrap();

        assert!(output.steps[1].error.as_deref().unwrap().contains("offline"));
        assert!(output.steps[3].error.is_none());
        assert!(output.organizations.is_empty());
        assert_eq!(output.stats.fetch_failures, 1);
    }

    #[tokio::test]
    async fn test_output_serializes_highest_status() {
        let script = Script::from_json(SCRIPT).unwrap();
        let output = replay(script, &config()).await.unwrap();
        let value = serde_json::to_value(&output).unwrap();

        let messages = value["organizations"][0]["messages"].as_array().unwrap();
        let m1 = messages.iter().find(|m| m["id"] == "m1").unwrap();
        assert_eq!(m1["highestStatus"], "delivered");
        assert_eq!(m1["organization_id"], "org-a");
    }
}
