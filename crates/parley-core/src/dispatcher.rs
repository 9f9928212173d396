//! Inbound event ingestion and listener dispatch.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    bot::Bot,
    context::{Answer, ConversationContext},
    envelope::{Envelope, EventKind, Message, MISSING_CONVERSATION},
    errors::Error,
    events::{ErrorKind, Listener},
    middleware::{Chain, Flow},
};

/// What `ingest` did with a payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Handed to this many listeners (possibly zero).
    Delivered(usize),
    /// Consumed by a pending `ask`.
    Answered,
    /// Dropped by the self/bot filters.
    Filtered,
    /// Stopped by receive middleware without an error.
    Halted,
    /// Not a recognized event.
    Ignored,
    /// Invalid payload or a receive middleware failure; reported on the error channel.
    Rejected,
}

impl Bot {
    /// Process one parsed, verified webhook payload.
    ///
    /// Never fails: problems are reported on the error channel and the
    /// dispatcher stays usable. Matching listeners run one after another in
    /// registration order; a failing or panicking listener does not stop the
    /// rest.
    pub async fn ingest(&self, raw: Value) -> Outcome {
        let envelope = match Envelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(Error::InvalidPayload(message)) => {
                self.report(ErrorKind::Ingest, None, message);
                return Outcome::Rejected;
            }
            Err(e) => {
                self.report(ErrorKind::Ingest, None, e.to_string());
                return Outcome::Rejected;
            }
        };

        if let Some(conversation) = &envelope.data.conversation {
            self.inner.snapshots.put(conversation.clone());
        }

        match envelope.kind() {
            EventKind::Message => self.dispatch_message(envelope).await,
            EventKind::Notify => {
                let ctx = ConversationContext::new(self.clone(), envelope.conversation_id());
                let message = envelope.data.message.unwrap_or_default();
                self.emit(&["notify", "channel.notify"], message, ctx).await
            }
            EventKind::Activity => {
                let ctx = ConversationContext::new(self.clone(), envelope.conversation_id());
                let activity = envelope.activity.unwrap_or(Value::Null);
                match Message::from_value(activity) {
                    Ok(message) => self.emit(&["activity"], message, ctx).await,
                    Err(e) => {
                        self.report(ErrorKind::Ingest, None, format!("invalid activity: {e}"));
                        Outcome::Rejected
                    }
                }
            }
            EventKind::Unrecognized => {
                warn!(event = %envelope.event, "unrecognized event, dropping");
                Outcome::Ignored
            }
        }
    }

    async fn dispatch_message(&self, mut envelope: Envelope) -> Outcome {
        if envelope.data.conversation.is_none() {
            self.report(ErrorKind::Ingest, None, MISSING_CONVERSATION);
            return Outcome::Rejected;
        }

        match self.inner.receive.run(self, &mut envelope).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Halt) => {
                debug!(event = %envelope.event, "event halted by receive middleware");
                return Outcome::Halted;
            }
            Err(e) => {
                self.report(ErrorKind::Middleware, Some(Chain::Receive), e.to_string());
                return Outcome::Rejected;
            }
        }

        let message = envelope.data.message.take().unwrap_or_default();
        if self.filtered(&message) {
            return Outcome::Filtered;
        }

        let id = envelope.conversation_id();
        let ctx = ConversationContext::new(self.clone(), id.clone());
        if let Some(answer) = id.as_ref().and_then(|id| self.take_ask(id)) {
            return self.answer(answer, message, ctx).await;
        }

        self.emit(&[envelope.event.as_str(), "message"], message, ctx)
            .await
    }

    fn filtered(&self, message: &Message) -> bool {
        let cfg = self.config();
        if cfg.ignore_self && message.user.as_deref() == Some(self.auth().user_id.0.as_str()) {
            debug!("ignoring own message");
            return true;
        }
        if cfg.ignore_bots && message.is_from_bot() {
            debug!(user = ?message.user, "ignoring bot message");
            return true;
        }
        false
    }

    async fn answer(&self, answer: Answer, message: Message, ctx: ConversationContext) -> Outcome {
        let listener = match answer {
            Answer::Once(listener) => listener,
            Answer::Named(name) => match self.callback(&name) {
                Some(listener) => listener,
                None => {
                    self.report(
                        ErrorKind::Ask,
                        None,
                        format!("no callback defined as `{name}`"),
                    );
                    return Outcome::Answered;
                }
            },
        };
        if let Err(message) = invoke(listener, message, ctx).await {
            self.report(ErrorKind::Ask, None, message);
        }
        Outcome::Answered
    }

    /// Run every listener matching any of `names`; the first name labels errors.
    async fn emit(&self, names: &[&str], message: Message, ctx: ConversationContext) -> Outcome {
        let listeners = self
            .inner
            .listeners
            .take_matching(names, &message.to_value());
        let event = names.first().copied().unwrap_or_default();
        if listeners.is_empty() {
            debug!(event, "no listeners");
        }

        let count = listeners.len();
        for listener in listeners {
            if let Err(e) = invoke(listener, message.clone(), ctx.clone()).await {
                self.report(
                    ErrorKind::Listener,
                    None,
                    format!("listener for `{event}` failed: {e}"),
                );
            }
        }
        Outcome::Delivered(count)
    }
}

async fn invoke(
    listener: Arc<dyn Listener>,
    message: Message,
    ctx: ConversationContext,
) -> Result<(), String> {
    match AssertUnwindSafe(listener.handle(message, ctx))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(panic_message(panic.as_ref())),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
