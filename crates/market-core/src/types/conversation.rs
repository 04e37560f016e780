//! Validated conversation identifier.
//!
//! Conversation ids come from the REST layer as plain strings and end up
//! interpolated into channel topics and change-feed filters, so they are
//! restricted to a conservative character set.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Maximum accepted length of a conversation id.
pub const MAX_CONVERSATION_ID_LEN: usize = 128;

/// Identifier of a buyer/seller conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConversationId(String);

impl ConversationId {
    /// Parse and validate a conversation id.
    ///
    /// Surrounding whitespace is trimmed. The remainder must be non-empty,
    /// at most [`MAX_CONVERSATION_ID_LEN`] bytes, and consist only of ASCII
    /// alphanumerics, `-` and `_`.
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let id = raw.trim();

        if id.is_empty() {
            return Err(AppError::validation("conversation id must not be empty"));
        }
        if id.len() > MAX_CONVERSATION_ID_LEN {
            return Err(AppError::validation(format!(
                "conversation id exceeds {MAX_CONVERSATION_ID_LEN} characters"
            )));
        }
        if let Some(bad) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(AppError::validation(format!(
                "conversation id contains invalid character {bad:?}"
            )));
        }

        Ok(Self(id.to_string()))
    }

    /// Return the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ConversationId {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ConversationId {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ConversationId> for String {
    fn from(id: ConversationId) -> String {
        id.0
    }
}

impl AsRef<str> for ConversationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_uuid() {
        let raw = uuid::Uuid::new_v4().to_string();
        let id = ConversationId::parse(&raw).expect("uuid should be valid");
        assert_eq!(id.as_str(), raw);
    }

    #[test]
    fn test_trims_whitespace() {
        let id: ConversationId = "  conv-1 ".parse().expect("should parse");
        assert_eq!(id.to_string(), "conv-1");
    }

    #[test]
    fn test_rejects_empty() {
        assert!(ConversationId::parse("").is_err());
        assert!(ConversationId::parse("   ").is_err());
    }

    #[test]
    fn test_rejects_filter_injection() {
        let err = ConversationId::parse("conv-1,user_id=eq.2").unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_rejects_overlong() {
        let raw = "a".repeat(MAX_CONVERSATION_ID_LEN + 1);
        assert!(ConversationId::parse(&raw).is_err());
    }

    #[test]
    fn test_serde_validates() {
        let ok: ConversationId = serde_json::from_str("\"conv_2\"").expect("deserialize");
        assert_eq!(ok.as_str(), "conv_2");
        assert!(serde_json::from_str::<ConversationId>("\"\"").is_err());
    }
}
