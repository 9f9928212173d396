//! Outbound send pipeline: normalize, run send middleware, POST.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::{
    bot::Bot,
    domain::ConversationId,
    errors::Error,
    events::ErrorKind,
    middleware::{Chain, Flow},
    transport::{spawn_with_callback, Method},
    Result,
};

/// One outbound message. Unknown fields pass through untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Milliseconds the platform waits before delivering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
    /// Destination, filled in by the pipeline so send middleware can branch on it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// Overlay `fields` onto this message; later keys win.
    pub fn merge(&mut self, fields: &Map<String, Value>) -> Result<()> {
        let mut value = serde_json::to_value(&*self)?;
        if let Value::Object(obj) = &mut value {
            obj.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        *self = serde_json::from_value(value)?;
        Ok(())
    }
}

/// What `send` accepts: plain text, one message or an ordered batch.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Text(String),
    One(OutboundMessage),
    Many(Vec<OutboundMessage>),
}

impl Payload {
    /// Accept a string, an object or an array of objects.
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::String(text) => Ok(Self::Text(text)),
            Value::Object(_) => Ok(Self::One(serde_json::from_value(value)?)),
            Value::Array(_) => Ok(Self::Many(serde_json::from_value(value)?)),
            other => Err(Error::Config(format!(
                "cannot send a {} payload",
                json_type(&other)
            ))),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<OutboundMessage> for Payload {
    fn from(message: OutboundMessage) -> Self {
        Self::One(message)
    }
}

impl From<Vec<OutboundMessage>> for Payload {
    fn from(messages: Vec<OutboundMessage>) -> Self {
        Self::Many(messages)
    }
}

/// Normalized payload as seen by send middleware.
#[derive(Clone, Debug, PartialEq)]
pub struct OutboundPayload {
    pub conversation: ConversationId,
    pub messages: Vec<OutboundMessage>,
    /// Sent as a JSON array in one request rather than a single object.
    pub batch: bool,
}

impl OutboundPayload {
    pub(crate) fn prepare(
        conversation: ConversationId,
        payload: Payload,
        extra: Option<Value>,
    ) -> Result<Self> {
        let extra = match extra {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map),
            Some(other) => {
                return Err(Error::Config(format!(
                    "send options must be an object, got {}",
                    json_type(&other)
                )))
            }
        };

        let (mut messages, batch) = match payload {
            Payload::Text(text) => (vec![OutboundMessage::text(text)], false),
            Payload::One(message) => (vec![message], false),
            Payload::Many(messages) if messages.is_empty() => {
                return Err(Error::Config("cannot send an empty batch".to_string()))
            }
            Payload::Many(messages) => (messages, true),
        };

        if let Some(extra) = &extra {
            for message in &mut messages {
                message.merge(extra)?;
            }
        }

        let mut outbound = Self {
            conversation,
            messages,
            batch,
        };
        outbound.stamp();
        Ok(outbound)
    }

    /// Point every message at `self.conversation`.
    fn stamp(&mut self) {
        for message in &mut self.messages {
            message.conversation = Some(self.conversation.0.clone());
        }
    }

    pub fn body(&self) -> Result<Value> {
        if self.batch {
            return Ok(serde_json::to_value(&self.messages)?);
        }
        match self.messages.first() {
            Some(message) => Ok(serde_json::to_value(message)?),
            None => Err(Error::Config("nothing to send".to_string())),
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl Bot {
    /// Send to a conversation and wait for the platform's response.
    ///
    /// `extra` (an object) is merged into every message. A batch goes out as
    /// one request and the platform processes it in order; separate `send`
    /// calls are NOT ordered relative to each other, so await each one when
    /// ordering matters.
    ///
    /// A send middleware failure is reported on the error channel, returned,
    /// and nothing is posted. A halted payload resolves to `Value::Null`.
    pub async fn send(
        &self,
        conversation: impl Into<ConversationId>,
        payload: impl Into<Payload>,
        extra: Option<Value>,
    ) -> Result<Value> {
        let outbound = OutboundPayload::prepare(conversation.into(), payload.into(), extra)?;
        self.deliver(outbound).await
    }

    /// Callback flavour of [`Bot::send`].
    ///
    /// Argument problems fail here, before any middleware or network work.
    /// Otherwise returns `Ok(true)` at once and hands the outcome to `callback`
    /// on a later scheduler turn. Requires a tokio runtime.
    pub fn send_with_callback<F>(
        &self,
        conversation: impl Into<ConversationId>,
        payload: impl Into<Payload>,
        extra: Option<Value>,
        callback: F,
    ) -> Result<bool>
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        let outbound = OutboundPayload::prepare(conversation.into(), payload.into(), extra)?;
        let bot = self.clone();
        spawn_with_callback(async move { bot.deliver(outbound).await }, callback);
        Ok(true)
    }

    async fn deliver(&self, mut outbound: OutboundPayload) -> Result<Value> {
        match self.inner.send.run(self, &mut outbound).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Halt) => {
                debug!(conversation = %outbound.conversation, "send halted by middleware");
                return Ok(Value::Null);
            }
            Err(e) => {
                self.report(ErrorKind::Middleware, Some(Chain::Send), e.to_string());
                return Err(e);
            }
        }

        // Middleware may have redirected the payload.
        outbound.stamp();
        let path = format!(
            "conversations/{}/messages",
            urlencoding::encode(outbound.conversation.as_str())
        );
        let body = outbound.body()?;
        self.inner.rest.request(Method::Post, &path, body).await
    }
}
