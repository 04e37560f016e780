//! Phoenix channel frames as spoken by the hosted change feed (protocol 1.0.0).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::message::types::ChangeRecord;
use crate::transport::ChannelRequest;

/// Topic used for socket-level heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Prefix the feed expects on every channel topic.
pub const TOPIC_PREFIX: &str = "realtime:";

/// Event names.
pub mod events {
    pub const JOIN: &str = "phx_join";
    pub const LEAVE: &str = "phx_leave";
    pub const REPLY: &str = "phx_reply";
    pub const ERROR: &str = "phx_error";
    pub const CLOSE: &str = "phx_close";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const SYSTEM: &str = "system";
    pub const POSTGRES_CHANGES: &str = "postgres_changes";
    pub const PRESENCE_STATE: &str = "presence_state";
    pub const PRESENCE_DIFF: &str = "presence_diff";
}

/// One message on the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Channel topic, or `phoenix` for socket-level messages.
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub payload: Value,
    /// Push reference, echoed in the matching reply.
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    /// Reference of the join that opened the channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl Frame {
    /// Join a channel for `request`.
    pub fn join(
        topic: &str,
        join_ref: &str,
        request: &ChannelRequest,
        access_token: Option<&str>,
    ) -> Self {
        let changes = &request.changes;
        let mut payload = json!({
            "config": {
                "broadcast": { "self": false, "ack": false },
                "presence": {
                    "key": request.presence.as_ref().map(|p| p.key.as_str()).unwrap_or(""),
                    "enabled": request.presence.is_some(),
                },
                "postgres_changes": [{
                    "event": changes.event.as_str(),
                    "schema": changes.schema,
                    "table": changes.table,
                    "filter": changes.expression(),
                }],
                "private": false,
            }
        });
        if let Some(token) = access_token {
            payload["access_token"] = Value::String(token.to_string());
        }

        Self {
            topic: topic.to_string(),
            event: events::JOIN.to_string(),
            payload,
            reference: Some(join_ref.to_string()),
            join_ref: Some(join_ref.to_string()),
        }
    }

    /// Leave a joined channel.
    pub fn leave(topic: &str, join_ref: &str, reference: String) -> Self {
        Self {
            topic: topic.to_string(),
            event: events::LEAVE.to_string(),
            payload: json!({}),
            reference: Some(reference),
            join_ref: Some(join_ref.to_string()),
        }
    }

    /// Socket keepalive.
    pub fn heartbeat(reference: String) -> Self {
        Self {
            topic: PHOENIX_TOPIC.to_string(),
            event: events::HEARTBEAT.to_string(),
            payload: json!({}),
            reference: Some(reference),
            join_ref: None,
        }
    }

    /// Serialize to the text sent on the socket.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a text message from the socket.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// `payload.status` of a reply or system event.
    pub fn status(&self) -> Option<&str> {
        self.payload.get("status").and_then(Value::as_str)
    }

    /// The inserted row carried by a `postgres_changes` frame.
    ///
    /// Returns `None` for other change types or malformed payloads.
    pub fn insert_record(&self) -> Option<ChangeRecord> {
        let data = self.payload.get("data")?;
        if data.get("type")?.as_str()? != "INSERT" {
            return None;
        }

        Some(ChangeRecord {
            schema: data.get("schema")?.as_str()?.to_string(),
            table: data.get("table")?.as_str()?.to_string(),
            commit_timestamp: data
                .get("commit_timestamp")
                .and_then(Value::as_str)
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map(|ts| ts.with_timezone(&Utc)),
            record: data.get("record")?.as_object()?.clone(),
        })
    }
}
