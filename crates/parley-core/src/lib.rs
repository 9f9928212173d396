//! Core of the Parley bot framework.
//!
//! This crate is framework-agnostic. The HTTP stack and token persistence live
//! behind ports (traits) implemented in adapter crates; inbound webhook payloads
//! arrive already parsed and verified.

pub mod auth;
pub mod bot;
pub mod cache;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod domain;
pub mod envelope;
pub mod errors;
pub mod events;
pub mod logging;
pub mod middleware;
pub mod query;
pub mod resources;
pub mod send;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use bot::{Bot, BotBuilder};
pub use context::{Answer, ConversationContext};
pub use errors::{Error, Result};
pub use events::{BotEvent, ErrorEvent, ErrorKind, Listener, ListenerId, Shape};
pub use middleware::{Chain, Flow, Middleware, Next};
pub use send::{OutboundMessage, Payload};
