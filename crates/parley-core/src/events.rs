//! Listener registry, event-name matching and the error channel.

use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::{
    context::ConversationContext, envelope::Message, errors::Error, middleware::Chain, Result,
};

/// Category of a non-fatal failure reported on the error channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Ingest,
    Middleware,
    Listener,
    Ask,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Ingest => "ingest",
            ErrorKind::Middleware => "middleware",
            ErrorKind::Listener => "listener",
            ErrorKind::Ask => "ask",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    /// Set for middleware failures.
    pub chain: Option<Chain>,
    pub message: String,
}

/// Everything broadcast to `Bot::subscribe` receivers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BotEvent {
    Error(ErrorEvent),
    /// A refreshed access token was adopted.
    Token(String),
}

/// Whether `pattern` matches the dot-delimited event `name`.
///
/// `*` matches exactly one segment, `**` one or more.
pub fn matches(pattern: &str, name: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let name: Vec<&str> = name.split('.').collect();
    match_segments(&pattern, &name)
}

fn match_segments(pattern: &[&str], name: &[&str]) -> bool {
    match (pattern.split_first(), name.split_first()) {
        (None, None) => true,
        (Some((&"**", rest)), Some(_)) => {
            (1..=name.len()).any(|k| name.get(k..).is_some_and(|tail| match_segments(rest, tail)))
        }
        (Some((&"*", rest)), Some((_, tail))) => match_segments(rest, tail),
        (Some((seg, rest)), Some((head, tail))) => seg == head && match_segments(rest, tail),
        _ => false,
    }
}

#[derive(Clone, Debug)]
enum FieldMatch {
    Pattern(Regex),
    Equals(Value),
}

/// Predicate over message fields; every listed field must match.
///
/// Field names may be dot paths into nested objects (`meta.lang`).
#[derive(Clone, Debug, Default)]
pub struct Shape {
    fields: Vec<(String, FieldMatch)>,
}

impl Shape {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for `Shape::new().regex("text", pattern)`.
    pub fn text(pattern: &str) -> Result<Self> {
        Self::new().regex("text", pattern)
    }

    pub fn regex(mut self, field: &str, pattern: &str) -> Result<Self> {
        let re = Regex::new(pattern)
            .map_err(|e| Error::Config(format!("invalid pattern for `{field}`: {e}")))?;
        self.fields.push((field.to_string(), FieldMatch::Pattern(re)));
        Ok(self)
    }

    pub fn equals(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.fields
            .push((field.to_string(), FieldMatch::Equals(value.into())));
        self
    }

    pub fn matches(&self, message: &Value) -> bool {
        self.fields.iter().all(|(field, want)| {
            let pointer = format!("/{}", field.replace('.', "/"));
            let Some(got) = message.pointer(&pointer) else {
                return false;
            };
            match want {
                FieldMatch::Pattern(re) => got.as_str().is_some_and(|s| re.is_match(s)),
                FieldMatch::Equals(v) => got == v,
            }
        })
    }
}

/// Application callback for dispatched events.
#[async_trait]
pub trait Listener: Send + Sync {
    async fn handle(&self, message: Message, ctx: ConversationContext) -> Result<()>;
}

/// Adapts an async closure into a [`Listener`].
pub(crate) struct FnListener<F>(pub F);

#[async_trait]
impl<F, Fut> Listener for FnListener<F>
where
    F: Fn(Message, ConversationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Message, ctx: ConversationContext) -> Result<()> {
        (self.0)(message, ctx).await
    }
}

/// Handle returned by registration, used to remove a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    pattern: String,
    shape: Option<Shape>,
    listener: Arc<dyn Listener>,
    once: bool,
}

#[derive(Default)]
pub(crate) struct Listeners {
    next_id: AtomicU64,
    regs: RwLock<Vec<Registration>>,
}

impl Listeners {
    pub(crate) fn add(
        &self,
        pattern: &str,
        shape: Option<Shape>,
        listener: Arc<dyn Listener>,
        once: bool,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.regs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Registration {
                id,
                pattern: pattern.to_string(),
                shape,
                listener,
                once,
            });
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut regs = self
            .regs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = regs.len();
        regs.retain(|r| r.id != id);
        regs.len() != before
    }

    /// Listeners to invoke for an event known by any of `names`, in
    /// registration order. Matching `once` registrations are removed.
    pub(crate) fn take_matching(&self, names: &[&str], message: &Value) -> Vec<Arc<dyn Listener>> {
        let mut regs = self
            .regs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut out = Vec::new();
        regs.retain(|r| {
            let hit = names.iter().any(|name| matches(&r.pattern, name))
                && r.shape.as_ref().map_or(true, |shape| shape.matches(message));
            if hit {
                out.push(r.listener.clone());
            }
            !(hit && r.once)
        });
        out
    }

    pub(crate) fn len(&self) -> usize {
        self.regs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exact_and_single_segment_wildcards() {
        assert!(matches("message.create", "message.create"));
        assert!(!matches("message.create", "message.create.contact"));
        assert!(matches("message.create.*.*", "message.create.contact.chat"));
        assert!(!matches(
            "message.create.*.*",
            "message.create.contact.chat.agent"
        ));
        assert!(!matches("message.create.*.*", "message.create.contact"));
    }

    #[test]
    fn multi_segment_wildcard_needs_at_least_one_segment() {
        assert!(matches("message.create.**", "message.create.contact.chat"));
        assert!(matches(
            "message.create.**",
            "message.create.contact.chat.agent"
        ));
        assert!(!matches("message.create.**", "message.create"));
        assert!(matches("message.**.agent", "message.create.contact.chat.agent"));
        assert!(!matches("message.**.agent", "message.create.contact.chat"));
    }

    #[test]
    fn shape_matches_regex_and_equality_fields() {
        let shape = Shape::text(r"^hello")
            .unwrap()
            .equals("role", "contact")
            .regex("meta.lang", "^en")
            .unwrap();

        assert!(shape.matches(&json!({
            "text": "hello there", "role": "contact", "meta": {"lang": "en-GB"}
        })));
        assert!(!shape.matches(&json!({
            "text": "bye", "role": "contact", "meta": {"lang": "en"}
        })));
        assert!(!shape.matches(&json!({"text": "hello", "role": "contact"})));
        assert!(!shape.matches(&json!({"text": 5, "role": "contact", "meta": {"lang": "en"}})));
    }

    #[test]
    fn bad_regex_is_a_config_error() {
        assert!(matches!(Shape::text("("), Err(Error::Config(_))));
    }

    struct Noop;

    #[async_trait]
    impl Listener for Noop {
        async fn handle(&self, _message: Message, _ctx: ConversationContext) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn once_registrations_are_consumed_and_off_removes() {
        let listeners = Listeners::default();
        let keep = listeners.add("message", None, Arc::new(Noop), false);
        listeners.add("message", None, Arc::new(Noop), true);
        listeners.add("notify", None, Arc::new(Noop), false);

        assert_eq!(listeners.take_matching(&["message"], &json!({})).len(), 2);
        assert_eq!(listeners.take_matching(&["message"], &json!({})).len(), 1);
        assert!(listeners.remove(keep));
        assert!(!listeners.remove(keep));
        assert_eq!(listeners.take_matching(&["message"], &json!({})).len(), 0);
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn listener_matching_either_alias_is_returned_once() {
        let listeners = Listeners::default();
        listeners.add("message.**", None, Arc::new(Noop), false);
        let hits = listeners.take_matching(&["message.create.contact", "message"], &json!({}));
        assert_eq!(hits.len(), 1);
    }
}
