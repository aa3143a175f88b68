//! Messages, outgoing attributes, and the ordered in-memory message log.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::MessageSid;

/// Attribute keys the client sets itself; caller metadata cannot override them.
pub const RESERVED_ATTRIBUTES: &[&str] = &["timestamp"];

/// Where a message's ordering position comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Origin {
    /// Sent by this session and not yet numbered by the server.
    Local,
    /// Confirmed by the server at `index`.
    Remote { index: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub sid: MessageSid,
    pub author: Option<String>,
    pub body: Option<String>,
    pub date_created: Option<DateTime<Utc>>,
    pub origin: Origin,
    #[serde(default)]
    pub attributes: Value,
}

impl Message {
    pub fn is_local_echo(&self) -> bool {
        self.origin == Origin::Local
    }

    pub fn author(&self) -> Option<&str> {
        self.author.as_deref().filter(|a| !a.trim().is_empty())
    }
}

/// Caller-supplied fields merged into a sent message's attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Attributes for an outgoing message: `timestamp` plus metadata fields.
///
/// Null metadata values and reserved keys are dropped.
pub fn build_attributes(metadata: Option<&MessageMetadata>, now: DateTime<Utc>) -> Value {
    let mut attributes = Map::new();

    if let Some(metadata) = metadata {
        if let Ok(Value::Object(fields)) = serde_json::to_value(metadata) {
            for (key, value) in fields {
                if value.is_null() || RESERVED_ATTRIBUTES.contains(&key.as_str()) {
                    continue;
                }
                attributes.insert(key, value);
            }
        }
    }

    attributes.insert(
        "timestamp".to_string(),
        Value::String(now.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    Value::Object(attributes)
}

/// Messages in arrival order.
///
/// History and live events interleave, so an added message whose sid is
/// already present replaces the existing entry instead of duplicating it.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new message. Returns false if it replaced an existing one.
    pub fn apply_added(&mut self, message: Message) -> bool {
        match self.position(&message.sid) {
            Some(index) => {
                self.messages[index] = message;
                false
            }
            None => {
                self.messages.push(message);
                true
            }
        }
    }

    /// Replace a message in place. Unknown sids are ignored.
    pub fn apply_updated(&mut self, message: Message) -> bool {
        match self.position(&message.sid) {
            Some(index) => {
                self.messages[index] = message;
                true
            }
            None => false,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn position(&self, sid: &MessageSid) -> Option<usize> {
        self.messages.iter().position(|m| &m.sid == sid)
    }
}

#[cfg(test)]
pub(crate) fn test_message(sid: &str, author: &str, body: &str, origin: Origin) -> Message {
    Message {
        sid: MessageSid::from(sid),
        author: Some(author.to_string()),
        body: Some(body.to_string()),
        date_created: None,
        origin,
        attributes: Value::Null,
    }
}
