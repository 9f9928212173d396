use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    auth::{AuthCell, AuthState, MemoryTokenStore, TokenStore, Tokens},
    config::Config,
    errors::Error,
    events::BotEvent,
    query::QueryString,
    transport::{
        pagination::{Cursor, Paged, Paginator, Slice},
        spawn_with_callback, HttpRequest, HttpResponse, HttpTransport, Method,
    },
    Result,
};

const REFRESH_PATH: &str = "auth/token";

fn expired_token_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(jwt|token)\s+(has\s+)?expired|expired\s+token|invalid\s+signature")
            .expect("valid regex")
    })
}

/// REST client for the platform.
///
/// Injects auth headers, translates both failure channels (non-2xx and a
/// logical `error` field in the body) into `Error::Transport`, performs at most
/// one token refresh + retry per call, and drives cursor pagination.
pub struct RestClient {
    cfg: Arc<Config>,
    transport: Arc<dyn HttpTransport>,
    auth: AuthCell,
    store: Arc<dyn TokenStore>,
    refresh_lock: Mutex<()>,
    events: broadcast::Sender<BotEvent>,
}

impl RestClient {
    /// Decode credentials from `cfg` and wire the client.
    ///
    /// Without an external `store` tokens are cached in memory only.
    pub fn new(
        cfg: Arc<Config>,
        transport: Arc<dyn HttpTransport>,
        store: Option<Arc<dyn TokenStore>>,
        events: broadcast::Sender<BotEvent>,
    ) -> Result<Self> {
        let tokens = Tokens {
            token: cfg.access_token.clone(),
            refresh_token: cfg.refresh_token.clone(),
        };
        let auth = AuthState::from_tokens(tokens.clone())?;
        let store: Arc<dyn TokenStore> = match store {
            Some(store) => store,
            None => Arc::new(MemoryTokenStore::new(Some(tokens))),
        };

        Ok(Self {
            cfg,
            transport,
            auth: AuthCell::new(auth),
            store,
            refresh_lock: Mutex::new(()),
            events,
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Current credentials (read at call time, never cached by callers).
    pub fn auth(&self) -> Arc<AuthState> {
        self.auth.current()
    }

    /// Issue one call against `v2/<path>`.
    ///
    /// For GET/DELETE `payload` is a query (object, raw string or null); for
    /// mutating verbs it is the JSON body.
    pub async fn request(&self, method: Method, path: &str, payload: Value) -> Result<Value> {
        let (query, body) = if method.has_body() {
            (QueryString::new(), (!payload.is_null()).then_some(payload))
        } else {
            (QueryString::from_value(&payload)?, None)
        };
        self.call(method, path, &query, body.as_ref()).await
    }

    /// Callback flavour of [`RestClient::request`]. Returns `true` immediately;
    /// the outcome is delivered to `callback` on a later scheduler turn.
    /// Pagination is never applied here.
    pub fn request_with_callback<F>(
        self: &Arc<Self>,
        method: Method,
        path: impl Into<String>,
        payload: Value,
        callback: F,
    ) -> bool
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        let client = Arc::clone(self);
        let path = path.into();
        spawn_with_callback(
            async move { client.request(method, &path, payload).await },
            callback,
        );
        true
    }

    /// Paginated GET. `cursor.iterate` picks between a lazy [`Paginator`] and
    /// a fully materialized list.
    pub async fn paginate(
        self: &Arc<Self>,
        path: &str,
        query: Value,
        cursor: Cursor,
    ) -> Result<Paged> {
        let pages = self.iterate(path, query, cursor.clone())?;
        if cursor.iterate {
            Ok(Paged::Iter(pages))
        } else {
            pages.collect_all().await.map(Paged::All)
        }
    }

    /// Gather every slice (bounded by `cursor.count_limit`) into one ordered list.
    pub async fn get_all(
        self: &Arc<Self>,
        path: &str,
        query: Value,
        cursor: Cursor,
    ) -> Result<Vec<Value>> {
        self.iterate(path, query, cursor)?.collect_all().await
    }

    /// Lazy, pull-based item sequence; each call starts from `cursor.offset`.
    pub fn iterate(
        self: &Arc<Self>,
        path: &str,
        query: Value,
        cursor: Cursor,
    ) -> Result<Paginator> {
        if cursor.limit == 0 {
            return Err(Error::Config("pagination limit must be > 0".to_string()));
        }
        let query = QueryString::from_value(&query)?;
        Ok(Paginator::new(Arc::clone(self), path.to_string(), query, cursor))
    }

    pub(crate) async fn fetch_slice(
        &self,
        path: &str,
        query: &QueryString,
        limit: usize,
        offset: usize,
    ) -> Result<Slice> {
        let query = query.clone().with_page(limit, offset);
        let body = self.call(Method::Get, path, &query, None).await?;
        Slice::parse(body, offset, limit)
    }

    /// One logical call: a single attempt, plus at most one refresh-and-retry.
    async fn call(
        &self,
        method: Method,
        path: &str,
        query: &QueryString,
        body: Option<&Value>,
    ) -> Result<Value> {
        let used = self.auth.current();
        let first = self
            .execute(method, path, true, query, body, Some(&used.token))
            .await;

        let err = match first {
            Err(e) if self.should_refresh(&e, &used) => e,
            other => return other,
        };
        debug!(%path, error = %err, "access token rejected, refreshing");

        self.refresh(&used).await?;
        let fresh = self.auth.current();
        // A failure here is final: no second refresh for the same call.
        self.execute(method, path, true, query, body, Some(&fresh.token))
            .await
    }

    fn should_refresh(&self, err: &Error, used: &AuthState) -> bool {
        let Error::Transport {
            status: Some(401),
            message,
            ..
        } = err
        else {
            return false;
        };
        used.refresh_token.is_some() && expired_token_pattern().is_match(message)
    }

    async fn refresh(&self, stale: &AuthState) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;

        let current = self.auth.current();
        if current.token != stale.token {
            // Another call refreshed while we waited.
            return Ok(());
        }

        match self.store.get_tokens().await {
            Ok(Some(stored)) if stored.token != current.token => {
                info!("adopting newer tokens from token store");
                self.adopt(stored, &current)?;
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "token store lookup failed, exchanging refresh token"),
        }

        let refresh_token = current
            .refresh_token
            .clone()
            .ok_or_else(|| Error::Auth("no refresh token available".to_string()))?;
        let body = json!({
            "clientId": current.client_id(),
            "refreshToken": refresh_token,
        });

        let req = self.build(
            Method::Post,
            REFRESH_PATH,
            false,
            &QueryString::new(),
            Some(&body),
            None,
        );
        let resp = self.transport.execute(req).await?;
        let status = resp.status;
        let reply = translate(resp)?;

        // An unusable reply fails the original call like any other transport error.
        let malformed = |message: String| Error::Transport {
            status: Some(status),
            message: format!("token refresh failed: {message}"),
            body: Some(reply.clone()),
        };
        let tokens: Tokens =
            serde_json::from_value(reply.clone()).map_err(|e| malformed(e.to_string()))?;
        let tokens = self
            .adopt(tokens, &current)
            .map_err(|e| malformed(e.to_string()))?;

        if let Err(e) = self.store.set_tokens(&tokens).await {
            warn!(error = %e, "failed to persist refreshed tokens");
        }
        info!("access token refreshed");
        let _ = self.events.send(BotEvent::Token(tokens.token.clone()));
        Ok(())
    }

    /// Swap in `tokens`, keeping the previous refresh token if none was issued.
    fn adopt(&self, mut tokens: Tokens, previous: &AuthState) -> Result<Tokens> {
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = previous.refresh_token.clone();
        }
        let state = AuthState::from_tokens(tokens.clone())?;
        self.auth.replace(state);
        Ok(tokens)
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        versioned: bool,
        query: &QueryString,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> Result<Value> {
        let req = self.build(method, path, versioned, query, body, token);
        debug!(method = method.as_str(), url = %req.url, "request");
        let resp = self.transport.execute(req).await?;
        translate(resp)
    }

    fn build(
        &self,
        method: Method,
        path: &str,
        versioned: bool,
        query: &QueryString,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> HttpRequest {
        let url = format!("{}{}", self.cfg.url_for(path, versioned), query.render());
        let mut headers = vec![
            ("Accept".to_string(), "application/json".to_string()),
            ("Content-Type".to_string(), "application/json".to_string()),
            ("User-Agent".to_string(), self.cfg.user_agent.clone()),
        ];
        if let Some(token) = token {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }
        HttpRequest {
            method,
            url,
            headers,
            body: body.cloned(),
        }
    }
}

/// Fold both failure channels into `Error::Transport`.
fn translate(resp: HttpResponse) -> Result<Value> {
    let status = resp.status;
    if let Some(message) = resp.body.as_ref().and_then(body_error) {
        return Err(Error::Transport {
            status: Some(status),
            message,
            body: resp.body,
        });
    }
    if !(200..300).contains(&status) {
        let message = resp
            .body
            .as_ref()
            .and_then(|b| b.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {status}"));
        return Err(Error::Transport {
            status: Some(status),
            message,
            body: resp.body,
        });
    }
    Ok(resp.body.unwrap_or(Value::Null))
}

fn body_error(body: &Value) -> Option<String> {
    match body.get("error")? {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => Some(
            obj.get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
        ),
        other => Some(other.to_string()),
    }
}
