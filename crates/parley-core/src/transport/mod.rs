//! Outbound REST plumbing.
//!
//! The HTTP stack itself lives behind [`HttpTransport`] so the core stays
//! framework-agnostic; `parley-http` provides the reqwest implementation.

pub mod client;
pub mod pagination;

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }

    /// Mutating verbs carry a JSON body; the rest encode their input as a query.
    pub fn has_body(self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }
}

/// Fully-built request handed to the transport.
#[derive(Clone, Debug, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Raw response; `body` is `None` when the server sent nothing (or non-JSON).
#[derive(Clone, Debug, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Option<Value>,
}

/// Hexagonal port for executing HTTP calls.
///
/// Implementations report network-level failures as `Error::Transport` with no
/// status; any response that arrived (whatever its status) is returned as `Ok`.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, req: HttpRequest) -> Result<HttpResponse>;
}

/// Run `fut` on the runtime and hand its output to `callback` on a later
/// scheduler turn than the one that completed it.
///
/// Callback-style APIs go through here so a callback never runs inside the
/// caller's stack frame, matching the ordering a caller awaiting the
/// equivalent future would observe. Must be called from within a tokio runtime.
pub fn spawn_with_callback<T, Fut, F>(fut: Fut, callback: F)
where
    T: Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
    F: FnOnce(T) + Send + 'static,
{
    tokio::spawn(async move {
        let out = fut.await;
        tokio::task::yield_now().await;
        callback(out);
    });
}
