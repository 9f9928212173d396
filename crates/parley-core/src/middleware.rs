//! Receive/send interceptor chains.
//!
//! A handler gets the payload and a [`Next`] continuation. It proceeds by
//! awaiting `next.run(..)` or by returning `Ok(Flow::Continue)` without touching
//! `next`, aborts with `Ok(Flow::Halt)`, or fails with `Err`. Either way every
//! later handler still runs. Handlers run strictly one after another; nothing
//! fans out.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};

use async_trait::async_trait;

use crate::{bot::Bot, errors::Error, Result};

/// Which pipeline a chain belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Chain {
    Receive,
    Send,
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Chain::Receive => "receive",
            Chain::Send => "send",
        })
    }
}

/// Outcome of a chain run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// A handler stopped the payload; the in-flight operation is abandoned quietly.
    Halt,
}

#[async_trait]
pub trait Middleware<T: Send + 'static>: Send + Sync {
    async fn handle(&self, bot: &Bot, payload: &mut T, next: Next<'_, T>) -> Result<Flow>;
}

/// Continuation over the handlers that have not run yet.
pub struct Next<'a, T: Send + 'static> {
    rest: &'a [Arc<dyn Middleware<T>>],
    used: &'a AtomicBool,
}

impl<'a, T: Send + 'static> Next<'a, T> {
    pub async fn run(self, bot: &Bot, payload: &mut T) -> Result<Flow> {
        self.used.store(true, Ordering::Release);
        drive(self.rest, bot, payload).await
    }
}

/// Run `handlers` in order. A handler that continues without awaiting its
/// `Next` hands over to the following one here.
async fn drive<T: Send + 'static>(
    mut handlers: &[Arc<dyn Middleware<T>>],
    bot: &Bot,
    payload: &mut T,
) -> Result<Flow> {
    while let Some((head, rest)) = handlers.split_first() {
        let used = AtomicBool::new(false);
        let flow = head.handle(bot, payload, Next { rest, used: &used }).await?;
        if flow == Flow::Halt || used.load(Ordering::Acquire) {
            return Ok(flow);
        }
        handlers = rest;
    }
    Ok(Flow::Continue)
}

pub struct MiddlewareChain<T: Send + 'static> {
    chain: Chain,
    handlers: RwLock<Vec<Arc<dyn Middleware<T>>>>,
}

impl<T: Send + 'static> MiddlewareChain<T> {
    pub fn new(chain: Chain) -> Self {
        Self {
            chain,
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Build a chain from a list of handlers.
    ///
    /// NOTE: execution order is the REVERSE of `handlers`: the last element
    /// runs first. Handlers added later with [`MiddlewareChain::push`] run after
    /// all of these.
    pub fn from_handlers(chain: Chain, mut handlers: Vec<Arc<dyn Middleware<T>>>) -> Self {
        handlers.reverse();
        Self {
            chain,
            handlers: RwLock::new(handlers),
        }
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    /// Append a handler; it runs after every handler already registered.
    pub fn push(&self, handler: Arc<dyn Middleware<T>>) {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every handler over `payload`. An empty chain passes straight through.
    ///
    /// Handler failures come back as `Error::Middleware` tagged with this chain.
    pub async fn run(&self, bot: &Bot, payload: &mut T) -> Result<Flow> {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if handlers.is_empty() {
            return Ok(Flow::Continue);
        }

        drive(&handlers, bot, payload)
            .await
            .map_err(|e| match e {
                Error::Middleware { .. } => e,
                other => Error::Middleware {
                    chain: self.chain,
                    message: other.to_string(),
                },
            })
    }
}
