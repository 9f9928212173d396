//! Test doubles shared by the unit tests.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use jsonwebtoken::{EncodingKey, Header};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::{
    bot::Bot,
    config::Config,
    transport::{client::RestClient, HttpRequest, HttpResponse, HttpTransport},
    Result,
};

pub(crate) const BOT_USER: &str = "bot-user";

type Responder = Box<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

/// Records every request; replies from the queue first, then the responder,
/// then with `200 {"ok": true}`.
pub(crate) struct FakeTransport {
    queue: Mutex<VecDeque<HttpResponse>>,
    requests: Mutex<Vec<HttpRequest>>,
    responder: Option<Responder>,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            responder: None,
        })
    }

    pub(crate) fn with_responder(
        responder: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            responder: Some(Box::new(responder)),
        })
    }

    pub(crate) fn push(&self, resp: HttpResponse) {
        self.queue.lock().unwrap().push_back(resp);
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn execute(&self, req: HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(req.clone());
        if let Some(resp) = self.queue.lock().unwrap().pop_front() {
            return Ok(resp);
        }
        if let Some(responder) = &self.responder {
            return Ok(responder(&req));
        }
        Ok(ok(json!({"ok": true})))
    }
}

pub(crate) fn ok(body: Value) -> HttpResponse {
    respond(200, body)
}

pub(crate) fn respond(status: u16, body: Value) -> HttpResponse {
    HttpResponse {
        status,
        body: Some(body),
    }
}

/// Serves `{"n": i}` items for `0..total`, honouring `limit`/`offset`.
pub(crate) fn dataset_responder(total: usize) -> impl Fn(&HttpRequest) -> HttpResponse {
    move |req| {
        let limit = query_param(&req.url, "limit").unwrap_or(total);
        let offset = query_param(&req.url, "offset").unwrap_or(0);
        let items: Vec<Value> = (offset..total.min(offset + limit))
            .map(|n| json!({ "n": n }))
            .collect();
        ok(Value::Array(items))
    }
}

fn query_param(url: &str, key: &str) -> Option<usize> {
    let (_, query) = url.split_once('?')?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .and_then(|(_, v)| v.parse().ok())
}

/// HS256 token with the claims the platform issues; the signature is irrelevant.
pub(crate) fn mint_token(user: &str, issued_at: i64) -> String {
    let claims = json!({
        "user": user,
        "organization": "org1",
        "email": format!("{user}@example.test"),
        "iat": issued_at,
        "exp": issued_at + 3600,
    });
    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"test-secret"),
    )
    .unwrap()
}

pub(crate) fn test_config() -> Config {
    Config::new(mint_token(BOT_USER, 1_700_000_000)).with_api_host("https://api.test")
}

pub(crate) fn rest_client(transport: Arc<FakeTransport>, refresh: Option<&str>) -> RestClient {
    let mut cfg = test_config();
    cfg.refresh_token = refresh.map(str::to_string);
    let (tx, _) = broadcast::channel(16);
    RestClient::new(Arc::new(cfg), transport, None, tx).unwrap()
}

pub(crate) fn bot_with(transport: Arc<FakeTransport>, tweak: impl FnOnce(&mut Config)) -> Bot {
    let mut cfg = test_config();
    tweak(&mut cfg);
    Bot::builder(cfg).transport(transport).build().unwrap()
}
