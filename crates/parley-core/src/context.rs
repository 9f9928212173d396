//! Per-conversation capability handed to listeners.

use std::{future::Future, sync::Arc};

use serde_json::Value;

use crate::{
    bot::Bot,
    domain::ConversationId,
    envelope::{Conversation, Message},
    events::{FnListener, Listener},
    send::Payload,
    Result,
};

/// How the reply to an `ask` is handled.
pub enum Answer {
    /// Private single-use handler, removed once it fires.
    Once(Arc<dyn Listener>),
    /// A callback registered with [`Bot::define`], looked up when the reply arrives.
    Named(String),
}

impl Answer {
    pub fn once<F, Fut>(f: F) -> Self
    where
        F: Fn(Message, ConversationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::Once(Arc::new(FnListener(f)))
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }
}

/// Operations scoped to one conversation.
///
/// Cheap to build and clone. When no conversation id is known the context is
/// inert: every operation is a no-op that resolves to `Value::Null`.
#[derive(Clone, Debug)]
pub struct ConversationContext {
    bot: Bot,
    id: Option<ConversationId>,
}

impl ConversationContext {
    pub(crate) fn new(bot: Bot, id: Option<ConversationId>) -> Self {
        Self { bot, id }
    }

    pub fn id(&self) -> Option<&ConversationId> {
        self.id.as_ref()
    }

    pub fn is_inert(&self) -> bool {
        self.id.is_none()
    }

    pub fn bot(&self) -> &Bot {
        &self.bot
    }

    /// Send into this conversation. See [`Bot::send`] for ordering.
    pub async fn say(&self, payload: impl Into<Payload>, extra: Option<Value>) -> Result<Value> {
        match &self.id {
            Some(id) => self.bot.send(id, payload, extra).await,
            None => Ok(Value::Null),
        }
    }

    /// Callback flavour of [`ConversationContext::say`]. An inert context
    /// returns `Ok(false)` and never calls `callback`.
    pub fn say_with_callback<F>(
        &self,
        payload: impl Into<Payload>,
        extra: Option<Value>,
        callback: F,
    ) -> Result<bool>
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        match &self.id {
            Some(id) => self.bot.send_with_callback(id, payload, extra, callback),
            None => Ok(false),
        }
    }

    /// Send `payload`, then route the next qualifying message in this
    /// conversation to `answer` instead of the ordinary listeners.
    ///
    /// Only one ask is pending per conversation; arming a new one replaces it.
    /// If the send fails the ask is withdrawn.
    pub async fn ask(&self, payload: impl Into<Payload>, answer: Answer) -> Result<Value> {
        let Some(id) = &self.id else {
            return Ok(Value::Null);
        };
        let seq = self.bot.arm_ask(id, answer);
        let sent = self.bot.send(id, payload, None).await;
        if sent.is_err() {
            self.bot.disarm_ask(id, seq);
        }
        sent
    }

    pub async fn accept(&self) -> Result<Value> {
        self.say("/accept", None).await
    }

    pub async fn join(&self) -> Result<Value> {
        self.say("/join", None).await
    }

    pub async fn leave(&self) -> Result<Value> {
        self.say("/leave", None).await
    }

    /// Ask the platform to set conversation metadata.
    ///
    /// The local snapshot only changes when the platform echoes the
    /// conversation back in a later event, so [`ConversationContext::get`]
    /// may keep returning the old value for a while.
    pub async fn set(&self, key: &str, value: impl Into<Value>) -> Result<Value> {
        let value = match value.into() {
            Value::String(s) => s,
            other => other.to_string(),
        };
        self.say(format!("/set {key} {value}"), None).await
    }

    /// Read `meta[key]` from the cached snapshot.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.snapshot()?.meta.get(key).cloned()
    }

    pub fn snapshot(&self) -> Option<Arc<Conversation>> {
        self.bot.snapshot(self.id.as_ref()?.as_str())
    }
}
