//! Change-feed records and per-channel events.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use market_core::result::AppResult;

use crate::channel::types::ChannelStatus;

use super::presence::PresenceState;

/// A row inserted into a watched table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Database schema of the table.
    pub schema: String,
    /// Table name.
    pub table: String,
    /// Commit time reported by the feed, if any.
    #[serde(default)]
    pub commit_timestamp: Option<DateTime<Utc>>,
    /// The inserted row, column name → value.
    #[serde(default)]
    pub record: Map<String, Value>,
}

impl ChangeRecord {
    /// Create a record for `schema.table` with the given row.
    pub fn new(schema: impl Into<String>, table: impl Into<String>, record: Map<String, Value>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            commit_timestamp: None,
            record,
        }
    }

    /// Returns a column value.
    pub fn column(&self, name: &str) -> Option<&Value> {
        self.record.get(name)
    }

    /// Returns a column rendered the way equality filters compare it.
    ///
    /// Strings compare verbatim, numbers and booleans by their JSON text.
    /// Null, arrays and objects never match a filter.
    pub fn column_text(&self, name: &str) -> Option<String> {
        match self.record.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Decode the row into a typed struct.
    pub fn decode<T: DeserializeOwned>(&self) -> AppResult<T> {
        Ok(serde_json::from_value(Value::Object(self.record.clone()))?)
    }
}

/// One event emitted by a transport for a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Subscription status transition.
    Status(ChannelStatus),
    /// A row matching the channel filter was inserted.
    Insert(ChangeRecord),
    /// Presence membership after a full state or diff was applied.
    PresenceSync(PresenceState),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct ChatMessage {
        id: i64,
        conversation_id: String,
        body: String,
    }

    fn sample() -> ChangeRecord {
        let row = serde_json::json!({
            "id": 42,
            "conversation_id": "conv-1",
            "body": "Is the asking price negotiable?",
            "read": false,
        });
        let Value::Object(map) = row else {
            unreachable!()
        };
        ChangeRecord::new("public", "messages", map)
    }

    #[test]
    fn test_column_text() {
        let record = sample();
        assert_eq!(record.column_text("conversation_id").as_deref(), Some("conv-1"));
        assert_eq!(record.column_text("id").as_deref(), Some("42"));
        assert_eq!(record.column_text("read").as_deref(), Some("false"));
        assert_eq!(record.column_text("missing"), None);
    }

    #[test]
    fn test_decode_typed_row() {
        let message: ChatMessage = sample().decode().expect("decode");
        assert_eq!(message.id, 42);
        assert_eq!(message.conversation_id, "conv-1");
        assert!(message.body.contains("negotiable"));
    }

    #[test]
    fn test_decode_mismatch_is_serialization_error() {
        let err = sample().decode::<Vec<String>>().unwrap_err();
        assert_eq!(err.kind, market_core::error::ErrorKind::Serialization);
        assert!(!err.is_validation());
    }
}
