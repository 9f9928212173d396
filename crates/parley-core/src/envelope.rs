//! Typed view of inbound webhook payloads.
//!
//! Unknown fields are preserved in `extra` maps so a message or conversation
//! serializes back to the JSON it was parsed from.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::{domain::ConversationId, errors::Error, Result};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Author's user id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    /// Lenient conversion: non-object values yield an empty message.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(_) => Ok(serde_json::from_value(value)?),
            _ => Ok(Self::default()),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn is_from_bot(&self) -> bool {
        self.role.as_deref() == Some("bot")
    }
}

/// Last-seen state of a conversation as embedded in events.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// String or numeric ids are accepted; anything else reads as absent.
    #[serde(
        default,
        deserialize_with = "lenient_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Map::is_empty"
    )]
    pub meta: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Conversation {
    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.id.clone().map(ConversationId)
    }
}

fn lenient_id<'de, D>(de: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(de)? {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn null_as_default<'de, D, T>(de: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(de)?.unwrap_or_default())
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<Conversation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One inbound platform event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Dot-delimited event name, e.g. `message.create.contact.chat`.
    pub event: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub data: EnvelopeData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Dispatch class of an envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Message,
    Notify,
    Activity,
    Unrecognized,
}

pub const MISSING_EVENT: &str = "Invalid payload, missing event";
pub const MISSING_CONVERSATION: &str = "Invalid payload, missing conversation";

impl Envelope {
    /// Parse a raw webhook body. Payloads without a string `event` are rejected.
    pub fn parse(raw: Value) -> Result<Self> {
        let has_event = raw
            .get("event")
            .and_then(Value::as_str)
            .is_some_and(|e| !e.is_empty());
        if !has_event {
            return Err(Error::InvalidPayload(MISSING_EVENT.to_string()));
        }
        serde_json::from_value(raw).map_err(|e| Error::InvalidPayload(e.to_string()))
    }

    pub fn kind(&self) -> EventKind {
        let name = self.event.as_str();
        if name.starts_with("message") || name == "conversation.message" {
            EventKind::Message
        } else if name == "channel.notify" {
            EventKind::Notify
        } else if self.activity.is_some() {
            EventKind::Activity
        } else {
            EventKind::Unrecognized
        }
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.data
            .conversation
            .as_ref()
            .and_then(Conversation::conversation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_or_blank_event_is_rejected() {
        for raw in [json!({}), json!({"event": ""}), json!({"event": 3}), json!(null)] {
            let err = Envelope::parse(raw).unwrap_err();
            assert_eq!(err.to_string(), format!("invalid payload: {MISSING_EVENT}"));
        }
    }

    #[test]
    fn classifies_event_names() {
        let kind = |raw: Value| Envelope::parse(raw).unwrap().kind();
        assert_eq!(kind(json!({"event": "message.create.contact"})), EventKind::Message);
        assert_eq!(kind(json!({"event": "conversation.message"})), EventKind::Message);
        assert_eq!(kind(json!({"event": "channel.notify"})), EventKind::Notify);
        assert_eq!(
            kind(json!({"event": "conversation.typing", "activity": {"type": "typing"}})),
            EventKind::Activity
        );
        assert_eq!(kind(json!({"event": "user.update"})), EventKind::Unrecognized);
    }

    #[test]
    fn message_and_conversation_round_trip_unknown_fields() {
        let raw = json!({
            "event": "message.create.contact.chat",
            "data": {
                "conversation": {"id": "c1", "organization": "o1", "meta": null, "channel": "web"},
                "message": {"id": "m1", "text": "hi", "type": "text", "user": "u1", "attachments": []}
            }
        });
        let env = Envelope::parse(raw.clone()).unwrap();
        let conv = env.data.conversation.clone().unwrap();
        assert!(conv.meta.is_empty());
        assert_eq!(conv.extra["channel"], "web");
        assert_eq!(env.conversation_id().unwrap().as_str(), "c1");

        let message = env.data.message.unwrap();
        assert_eq!(message.kind.as_deref(), Some("text"));
        assert_eq!(message.to_value(), raw["data"]["message"]);
    }

    #[test]
    fn conversation_id_is_lenient() {
        let id = |conversation: Value| {
            Envelope::parse(json!({"event": "channel.notify", "data": {"conversation": conversation}}))
                .unwrap()
                .conversation_id()
                .map(|id| id.as_str().to_string())
        };
        assert_eq!(id(json!({"id": "c1"})).as_deref(), Some("c1"));
        assert_eq!(id(json!({"id": 42})).as_deref(), Some("42"));
        assert_eq!(id(json!({"organization": "o1"})), None);
        assert_eq!(id(json!({"id": null})), None);
        assert_eq!(id(json!({"id": {"nested": true}})), None);
        assert_eq!(id(json!({"id": ""})), None);
    }

    #[test]
    fn bot_role_detection() {
        let m = Message::from_value(json!({"role": "bot"})).unwrap();
        assert!(m.is_from_bot());
        assert!(!Message::from_value(json!("x")).unwrap().is_from_bot());
    }
}
