//! The `Bot` façade: REST client, middleware chains, listeners and the error
//! channel composed behind one cheaply clonable handle.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use crate::{
    auth::{AuthState, TokenStore},
    cache::SnapshotCache,
    config::Config,
    context::{Answer, ConversationContext},
    domain::ConversationId,
    envelope::{Conversation, Envelope, Message},
    errors::Error,
    events::{BotEvent, ErrorEvent, ErrorKind, FnListener, Listener, ListenerId, Listeners, Shape},
    middleware::{Chain, Middleware, MiddlewareChain},
    send::OutboundPayload,
    transport::{
        client::RestClient,
        pagination::{Cursor, Paged},
        HttpTransport, Method,
    },
    Result,
};

const EVENT_CAPACITY: usize = 256;

pub(crate) struct PendingAsk {
    pub(crate) seq: u64,
    pub(crate) answer: Answer,
}

pub(crate) struct BotInner {
    pub(crate) cfg: Arc<Config>,
    pub(crate) rest: Arc<RestClient>,
    pub(crate) receive: MiddlewareChain<Envelope>,
    pub(crate) send: MiddlewareChain<OutboundPayload>,
    pub(crate) listeners: Listeners,
    pub(crate) callbacks: RwLock<HashMap<String, Arc<dyn Listener>>>,
    pub(crate) asks: Mutex<HashMap<String, PendingAsk>>,
    pub(crate) ask_seq: AtomicU64,
    pub(crate) snapshots: SnapshotCache,
    pub(crate) events: broadcast::Sender<BotEvent>,
}

/// Handle to one bot instance. Clones share all state.
#[derive(Clone)]
pub struct Bot {
    pub(crate) inner: Arc<BotInner>,
}

pub struct BotBuilder {
    cfg: Config,
    transport: Option<Arc<dyn HttpTransport>>,
    store: Option<Arc<dyn TokenStore>>,
    receive: Vec<Arc<dyn Middleware<Envelope>>>,
    send: Vec<Arc<dyn Middleware<OutboundPayload>>>,
}

impl BotBuilder {
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// External token persistence; tokens stay in memory without one.
    pub fn token_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Initial receive chain. Runs in REVERSE order: the last handler first.
    pub fn receive_middleware(mut self, handlers: Vec<Arc<dyn Middleware<Envelope>>>) -> Self {
        self.receive = handlers;
        self
    }

    /// Initial send chain. Runs in REVERSE order: the last handler first.
    pub fn send_middleware(mut self, handlers: Vec<Arc<dyn Middleware<OutboundPayload>>>) -> Self {
        self.send = handlers;
        self
    }

    pub fn build(self) -> Result<Bot> {
        let transport = self
            .transport
            .ok_or_else(|| Error::Config("an HTTP transport is required".to_string()))?;
        let cfg = Arc::new(self.cfg);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let rest = RestClient::new(cfg.clone(), transport, self.store, events.clone())?;

        Ok(Bot {
            inner: Arc::new(BotInner {
                snapshots: SnapshotCache::new(cfg.snapshot_capacity),
                cfg,
                rest: Arc::new(rest),
                receive: MiddlewareChain::from_handlers(Chain::Receive, self.receive),
                send: MiddlewareChain::from_handlers(Chain::Send, self.send),
                listeners: Listeners::default(),
                callbacks: RwLock::new(HashMap::new()),
                asks: Mutex::new(HashMap::new()),
                ask_seq: AtomicU64::new(0),
                events,
            }),
        })
    }
}

impl Bot {
    pub fn builder(cfg: Config) -> BotBuilder {
        BotBuilder {
            cfg,
            transport: None,
            store: None,
            receive: Vec::new(),
            send: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.cfg
    }

    pub fn rest(&self) -> &Arc<RestClient> {
        &self.inner.rest
    }

    /// Current credentials.
    pub fn auth(&self) -> Arc<AuthState> {
        self.inner.rest.auth()
    }

    /// Receiver for the error channel and token events.
    pub fn subscribe(&self) -> broadcast::Receiver<BotEvent> {
        self.inner.events.subscribe()
    }

    /// Append a receive handler (runs after those already registered).
    pub fn use_receive(&self, handler: impl Middleware<Envelope> + 'static) {
        self.inner.receive.push(Arc::new(handler));
    }

    /// Append a send handler (runs after those already registered).
    pub fn use_send(&self, handler: impl Middleware<OutboundPayload> + 'static) {
        self.inner.send.push(Arc::new(handler));
    }

    /// Register `f` for events whose name matches `pattern`.
    pub fn on<F, Fut>(&self, pattern: &str, f: F) -> ListenerId
    where
        F: Fn(Message, ConversationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.add_listener(pattern, None, Arc::new(FnListener(f)), false)
    }

    /// Like [`Bot::on`], but only messages matching `shape` are delivered.
    pub fn on_shape<F, Fut>(&self, pattern: &str, shape: Shape, f: F) -> ListenerId
    where
        F: Fn(Message, ConversationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.add_listener(pattern, Some(shape), Arc::new(FnListener(f)), false)
    }

    /// Register `f` for the first matching event only.
    pub fn once<F, Fut>(&self, pattern: &str, f: F) -> ListenerId
    where
        F: Fn(Message, ConversationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.add_listener(pattern, None, Arc::new(FnListener(f)), true)
    }

    pub fn add_listener(
        &self,
        pattern: &str,
        shape: Option<Shape>,
        listener: Arc<dyn Listener>,
        once: bool,
    ) -> ListenerId {
        self.inner.listeners.add(pattern, shape, listener, once)
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Register a reusable callback that `ask` can name.
    pub fn define<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(Message, ConversationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner
            .callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string(), Arc::new(FnListener(f)));
    }

    pub(crate) fn callback(&self, name: &str) -> Option<Arc<dyn Listener>> {
        self.inner
            .callbacks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    /// Context for `id`, whether or not a snapshot has been seen.
    pub fn conversation(&self, id: impl Into<ConversationId>) -> ConversationContext {
        ConversationContext::new(self.clone(), Some(id.into()))
    }

    pub fn snapshot(&self, id: &str) -> Option<Arc<Conversation>> {
        self.inner.snapshots.get(id)
    }

    /// Raw REST call against the versioned API.
    pub async fn request(&self, method: Method, path: &str, payload: Value) -> Result<Value> {
        self.inner.rest.request(method, path, payload).await
    }

    /// Paginated GET; `cursor` defaults to the configured pagination settings.
    pub async fn paginate(&self, path: &str, query: Value, cursor: Option<Cursor>) -> Result<Paged> {
        let cursor = cursor.unwrap_or_else(|| self.inner.cfg.default_cursor());
        self.inner.rest.paginate(path, query, cursor).await
    }

    /// Broadcast a non-fatal failure on the error channel.
    pub(crate) fn report(&self, kind: ErrorKind, chain: Option<Chain>, message: impl Into<String>) {
        let message = message.into();
        warn!(kind = %kind, chain = ?chain, %message, "bot error");
        // No subscribers is fine.
        let _ = self.inner.events.send(BotEvent::Error(ErrorEvent {
            kind,
            chain,
            message,
        }));
    }

    pub(crate) fn arm_ask(&self, conversation: &ConversationId, answer: Answer) -> u64 {
        let seq = self.inner.ask_seq.fetch_add(1, Ordering::Relaxed);
        self.lock_asks()
            .insert(conversation.0.clone(), PendingAsk { seq, answer });
        seq
    }

    /// Drop the pending ask for `conversation` if it is still the one armed as `seq`.
    pub(crate) fn disarm_ask(&self, conversation: &ConversationId, seq: u64) {
        let mut asks = self.lock_asks();
        if asks.get(&conversation.0).is_some_and(|p| p.seq == seq) {
            asks.remove(&conversation.0);
        }
    }

    pub(crate) fn take_ask(&self, conversation: &ConversationId) -> Option<Answer> {
        self.lock_asks().remove(&conversation.0).map(|p| p.answer)
    }

    fn lock_asks(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingAsk>> {
        self.inner
            .asks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for Bot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bot")
            .field("user", &self.auth().user_id)
            .field("api_host", &self.inner.cfg.api_host)
            .field("listeners", &self.inner.listeners.len())
            .field("receive_middleware", &self.inner.receive.len())
            .field("send_middleware", &self.inner.send.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{bot_with, ok, test_config, FakeTransport, BOT_USER};
    use serde_json::json;

    #[test]
    fn build_requires_a_transport() {
        let err = Bot::builder(test_config()).build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn decodes_identity_from_the_access_token() {
        let bot = bot_with(FakeTransport::new(), |_| {});
        assert_eq!(bot.auth().user_id.0, BOT_USER);
        assert!(format!("{bot:?}").contains("bot-user"));
    }

    #[test]
    fn report_reaches_subscribers() {
        let bot = bot_with(FakeTransport::new(), |_| {});
        let mut rx = bot.subscribe();
        bot.report(ErrorKind::Listener, None, "boom");
        assert_eq!(
            rx.try_recv().unwrap(),
            BotEvent::Error(ErrorEvent {
                kind: ErrorKind::Listener,
                chain: None,
                message: "boom".to_string(),
            })
        );
    }

    #[test]
    fn newer_ask_replaces_older_and_stale_disarm_is_ignored() {
        let bot = bot_with(FakeTransport::new(), |_| {});
        let conv = ConversationId::from("c1");
        let first = bot.arm_ask(&conv, Answer::named("a"));
        bot.arm_ask(&conv, Answer::named("b"));
        bot.disarm_ask(&conv, first);

        match bot.take_ask(&conv) {
            Some(Answer::Named(name)) => assert_eq!(name, "b"),
            _ => panic!("expected the most recent ask"),
        }
        assert!(bot.take_ask(&conv).is_none());
    }

    #[tokio::test]
    async fn paginate_uses_configured_defaults() {
        let transport = FakeTransport::new();
        transport.push(ok(json!([{"id": 1}])));
        let bot = bot_with(transport.clone(), |cfg| cfg.page_limit = 7);

        match bot.paginate("contacts", Value::Null, None).await.unwrap() {
            Paged::All(items) => assert_eq!(items.len(), 1),
            Paged::Iter(_) => panic!("expected materialized list"),
        }
        assert!(transport.requests()[0].url.ends_with("?limit=7&offset=0"));
    }
}
