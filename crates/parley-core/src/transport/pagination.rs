//! Cursor-based pagination over list endpoints.
//!
//! Slices are fetched with `limit`/`offset`. The server either returns a bare
//! array (a short slice means no more pages) or an object with the items under
//! `data`, optionally steering the next offset via `next.offset` and ending the
//! walk with `hasMore: false`.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use futures::Stream;
use serde_json::Value;
use tokio::time::sleep;
use tracing::debug;

use crate::{
    config::DEFAULT_COUNT_LIMIT, errors::Error, query::QueryString,
    transport::client::RestClient, Result,
};

/// Pagination cursor: slice size, pacing, and the ceiling on total work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cursor {
    pub limit: usize,
    pub offset: usize,
    /// Idle delay observed before every slice fetch after the first.
    pub backoff: Duration,
    /// Maximum items yielded; `None` is unbounded.
    pub count_limit: Option<usize>,
    /// Hand back a lazy [`Paginator`] instead of a materialized list.
    pub iterate: bool,
}

impl Cursor {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            offset: 0,
            backoff: Duration::ZERO,
            count_limit: Some(DEFAULT_COUNT_LIMIT),
            iterate: false,
        }
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn count_limit(mut self, count_limit: Option<usize>) -> Self {
        self.count_limit = count_limit;
        self
    }

    pub fn iterate(mut self) -> Self {
        self.iterate = true;
        self
    }

    /// Request ceiling implied by `count_limit`; unbounded when it is.
    pub fn max_requests(&self) -> Option<usize> {
        self.count_limit
            .map(|count| count.div_ceil(self.limit.max(1)))
    }
}

/// Result of a paginated GET.
pub enum Paged {
    All(Vec<Value>),
    Iter(Paginator),
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Slice {
    pub items: Vec<Value>,
    pub next_offset: Option<usize>,
}

impl Slice {
    pub(crate) fn parse(body: Value, offset: usize, limit: usize) -> Result<Self> {
        let by_length = |items: &Vec<Value>| {
            (!items.is_empty() && items.len() >= limit).then(|| offset + items.len())
        };

        match body {
            Value::Array(items) => {
                let next_offset = by_length(&items);
                Ok(Self { items, next_offset })
            }
            Value::Object(mut map) => {
                let items = match map.remove("data") {
                    Some(Value::Array(items)) => items,
                    Some(Value::Null) | None => Vec::new(),
                    Some(other) => {
                        return Err(Error::Transport {
                            status: None,
                            message: "page `data` is not an array".to_string(),
                            body: Some(other),
                        })
                    }
                };
                let next_offset = if map.get("hasMore") == Some(&Value::Bool(false)) {
                    None
                } else if let Some(next) = map
                    .get("next")
                    .and_then(|n| n.get("offset"))
                    .and_then(Value::as_u64)
                {
                    usize::try_from(next).ok().filter(|n| *n > offset)
                } else {
                    by_length(&items)
                };
                Ok(Self { items, next_offset })
            }
            other => Err(Error::Transport {
                status: None,
                message: "unexpected page shape".to_string(),
                body: Some(other),
            }),
        }
    }
}

/// Lazy, forward-only item sequence.
///
/// The next slice is only fetched once the buffered items are consumed, so a
/// slow consumer throttles the network work. Restart by asking the client for
/// a new paginator.
pub struct Paginator {
    client: Arc<RestClient>,
    path: String,
    query: QueryString,
    cursor: Cursor,
    offset: usize,
    buffer: VecDeque<Value>,
    yielded: usize,
    requests: usize,
    done: bool,
}

impl Paginator {
    pub(crate) fn new(
        client: Arc<RestClient>,
        path: String,
        query: QueryString,
        cursor: Cursor,
    ) -> Self {
        Self {
            client,
            path,
            query,
            offset: cursor.offset,
            cursor,
            buffer: VecDeque::new(),
            yielded: 0,
            requests: 0,
            done: false,
        }
    }

    /// Slice fetches issued so far.
    pub fn requests(&self) -> usize {
        self.requests
    }

    pub async fn next(&mut self) -> Option<Result<Value>> {
        loop {
            if self.remaining() == Some(0) {
                return None;
            }
            if let Some(item) = self.buffer.pop_front() {
                self.yielded += 1;
                return Some(Ok(item));
            }
            if self.done {
                return None;
            }
            if let Err(e) = self.fetch().await {
                self.done = true;
                return Some(Err(e));
            }
        }
    }

    /// Drain the remaining items into one ordered list.
    pub async fn collect_all(mut self) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.push(item?);
        }
        Ok(out)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Value>> + Send {
        futures::stream::unfold(self, |mut pages| async move {
            pages.next().await.map(|item| (item, pages))
        })
    }

    fn remaining(&self) -> Option<usize> {
        self.cursor
            .count_limit
            .map(|count| count.saturating_sub(self.yielded))
    }

    async fn fetch(&mut self) -> Result<()> {
        if let Some(max) = self.cursor.max_requests() {
            if self.requests >= max {
                self.done = true;
                return Ok(());
            }
        }
        if self.requests > 0 && !self.cursor.backoff.is_zero() {
            sleep(self.cursor.backoff).await;
        }

        let limit = match self.remaining() {
            Some(left) => self.cursor.limit.min(left),
            None => self.cursor.limit,
        };
        self.requests += 1;
        debug!(path = %self.path, offset = self.offset, limit, "fetching slice");

        let slice = self
            .client
            .fetch_slice(&self.path, &self.query, limit, self.offset)
            .await?;
        self.buffer.extend(slice.items);
        match slice.next_offset {
            Some(next) => self.offset = next,
            None => self.done = true,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{dataset_responder, rest_client, FakeTransport};
    use futures::StreamExt;
    use serde_json::json;
    use tokio::time::Instant;

    #[test]
    fn request_ceiling_follows_count_limit() {
        assert_eq!(Cursor::new(5).count_limit(Some(20)).max_requests(), Some(4));
        assert_eq!(Cursor::new(5).count_limit(Some(21)).max_requests(), Some(5));
        assert_eq!(Cursor::new(5).count_limit(None).max_requests(), None);
    }

    #[test]
    fn slice_parsing_handles_arrays_and_envelopes() {
        let s = Slice::parse(json!([1, 2]), 0, 2).unwrap();
        assert_eq!(s.next_offset, Some(2));
        let s = Slice::parse(json!([1]), 4, 2).unwrap();
        assert_eq!(s.next_offset, None);

        let s = Slice::parse(json!({"data": [1, 2], "next": {"offset": 10}}), 0, 2).unwrap();
        assert_eq!(s.items.len(), 2);
        assert_eq!(s.next_offset, Some(10));

        let s = Slice::parse(json!({"data": [1, 2], "hasMore": false}), 0, 2).unwrap();
        assert_eq!(s.next_offset, None);

        assert!(Slice::parse(json!("nope"), 0, 2).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn iterate_pulls_slices_lazily_with_backoff() {
        let transport = FakeTransport::with_responder(dataset_responder(17));
        let client = Arc::new(rest_client(transport.clone(), None));
        let backoff = Duration::from_millis(250);

        let mut pages = client
            .iterate(
                "contacts",
                Value::Null,
                Cursor::new(5)
                    .count_limit(Some(20))
                    .backoff(backoff)
                    .iterate(),
            )
            .unwrap();

        // Nothing is fetched until the consumer asks.
        assert_eq!(transport.requests().len(), 0);
        let first = pages.next().await.unwrap().unwrap();
        assert_eq!(first, json!({"n": 0}));
        assert_eq!(pages.requests(), 1);

        let started = Instant::now();
        let mut seen = vec![first];
        while let Some(item) = pages.next().await {
            seen.push(item.unwrap());
        }

        assert_eq!(seen.len(), 17);
        assert_eq!(seen[16], json!({"n": 16}));
        assert_eq!(pages.requests(), 4);
        assert!(started.elapsed() >= backoff * 3);

        let offsets: Vec<String> = transport
            .requests()
            .iter()
            .map(|r| r.url.split('?').nth(1).unwrap_or_default().to_string())
            .collect();
        assert_eq!(
            offsets,
            vec![
                "limit=5&offset=0",
                "limit=5&offset=5",
                "limit=5&offset=10",
                "limit=5&offset=15",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn materialize_stops_at_count_limit() {
        let transport = FakeTransport::with_responder(dataset_responder(100));
        let client = Arc::new(rest_client(transport.clone(), None));

        let all = client
            .get_all("contacts", Value::Null, Cursor::new(10).count_limit(Some(25)))
            .await
            .unwrap();

        assert_eq!(all.len(), 25);
        assert_eq!(all[24], json!({"n": 24}));
        assert_eq!(transport.requests().len(), 3);
        assert!(transport.requests()[2].url.ends_with("limit=5&offset=20"));
    }

    #[tokio::test(start_paused = true)]
    async fn paginate_dispatches_on_iterate_flag() {
        let transport = FakeTransport::with_responder(dataset_responder(3));
        let client = Arc::new(rest_client(transport, None));

        match client
            .paginate("contacts", Value::Null, Cursor::new(2))
            .await
            .unwrap()
        {
            Paged::All(items) => assert_eq!(items.len(), 3),
            Paged::Iter(_) => panic!("expected materialized list"),
        }

        match client
            .paginate("contacts", Value::Null, Cursor::new(2).iterate())
            .await
            .unwrap()
        {
            Paged::Iter(pages) => {
                let items: Vec<_> = pages.into_stream().collect().await;
                assert_eq!(items.len(), 3);
            }
            Paged::All(_) => panic!("expected lazy paginator"),
        }
    }

    #[tokio::test]
    async fn zero_limit_is_rejected() {
        let client = Arc::new(rest_client(FakeTransport::new(), None));
        assert!(matches!(
            client.iterate("contacts", Value::Null, Cursor::new(0)),
            Err(Error::Config(_))
        ));
    }
}
