//! Uniform CRUD handles over the platform's resource kinds.

use std::sync::Arc;

use serde_json::Value;

use crate::{
    bot::Bot,
    errors::Error,
    transport::{
        client::RestClient,
        pagination::{Cursor, Paginator},
        Method,
    },
    Result,
};

/// Resource kinds exposed under `v2/<name>`.
pub const RESOURCES: &[&str] = &[
    "bots",
    "channels",
    "contacts",
    "conversations",
    "integrations",
    "organizations",
    "users",
    "webhooks",
];

/// CRUD surface for one resource kind.
#[derive(Clone)]
pub struct Resource {
    rest: Arc<RestClient>,
    name: &'static str,
    cursor: Cursor,
}

impl Resource {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Replace the default pagination cursor used by `list` and `iterate`.
    pub fn with_cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = cursor;
        self
    }

    /// Every item (up to the cursor's count limit), in server order.
    pub async fn list(&self, query: Value) -> Result<Vec<Value>> {
        self.rest.get_all(self.name, query, self.cursor.clone()).await
    }

    pub fn iterate(&self, query: Value) -> Result<Paginator> {
        self.rest.iterate(self.name, query, self.cursor.clone())
    }

    pub async fn get(&self, id: &str) -> Result<Value> {
        self.rest.request(Method::Get, &self.path(id), Value::Null).await
    }

    pub async fn create(&self, body: Value) -> Result<Value> {
        self.rest.request(Method::Post, self.name, body).await
    }

    pub async fn update(&self, id: &str, body: Value) -> Result<Value> {
        self.rest.request(Method::Put, &self.path(id), body).await
    }

    pub async fn delete(&self, id: &str) -> Result<Value> {
        self.rest
            .request(Method::Delete, &self.path(id), Value::Null)
            .await
    }

    fn path(&self, id: &str) -> String {
        format!("{}/{}", self.name, urlencoding::encode(id))
    }
}

impl Bot {
    /// Handle for a resource listed in [`RESOURCES`].
    pub fn resource(&self, name: &str) -> Result<Resource> {
        let name = RESOURCES
            .iter()
            .copied()
            .find(|r| *r == name)
            .ok_or_else(|| Error::Config(format!("unknown resource `{name}`")))?;
        Ok(Resource {
            rest: self.rest().clone(),
            name,
            cursor: self.config().default_cursor(),
        })
    }
}
