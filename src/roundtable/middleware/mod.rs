//! Message middleware pipeline.
//!
//! Every agent reply passes through a [`MiddlewareChain`] before it is committed to
//! history. The chain is a chain of responsibility: each [`Middleware`] receives the
//! message together with a [`Next`] handle for the rest of the chain, and decides whether
//! to pass it on unchanged, rewrite it, enrich the per-turn [`MiddlewareContext`], or stop
//! the chain by returning an error. A rejected message is dropped; the conversation moves
//! on to the next turn.
//!
//! Middleware runs in registration order: the first one added sees the message first and
//! wraps everything added after it.
//!
//! # Example
//!
//! ```rust
//! use roundtable::message::{Message, Role};
//! use roundtable::middleware::{middleware_fn, MiddlewareChain, MiddlewareContext};
//! use roundtable::middleware::builtin::EmptyContentFilter;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut chain = MiddlewareChain::new();
//! chain.add(EmptyContentFilter);
//! chain.add(middleware_fn("shout", |_ctx, mut msg: Message| {
//!     msg.content = msg.content.to_uppercase();
//!     Ok(msg)
//! }));
//!
//! let mut ctx = MiddlewareContext::new("a1", "Alice", 1);
//! let msg = Message::new("a1", "Alice", "mock", Role::Agent, "hello");
//! let out = chain.process(&mut ctx, msg).await.unwrap();
//! assert_eq!(out.content, "HELLO");
//! # }
//! ```

pub mod builtin;

use crate::roundtable::message::Message;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Per-turn state shared by every middleware in one chain invocation.
///
/// A fresh context is built for each agent turn and discarded afterwards; metadata set by
/// an earlier middleware is visible to later ones in the same invocation only.
#[derive(Debug, Clone, Default)]
pub struct MiddlewareContext {
    pub agent_id: String,
    pub agent_name: String,
    pub turn_number: usize,
    pub metadata: HashMap<String, Value>,
}

impl MiddlewareContext {
    pub fn new(agent_id: impl Into<String>, agent_name: impl Into<String>, turn_number: usize) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            turn_number,
            metadata: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Append `value` to the JSON array stored under `key`, creating it if needed.
    ///
    /// A non-array value already stored under `key` is replaced.
    pub fn push(&mut self, key: &str, value: impl Into<Value>) {
        let entry = self
            .metadata
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if !entry.is_array() {
            *entry = Value::Array(Vec::new());
        }
        if let Value::Array(items) = entry {
            items.push(value.into());
        }
    }
}

/// Why a middleware stopped the chain.
#[derive(Debug, Clone, PartialEq)]
pub enum MiddlewareError {
    /// The message failed a validation or filter rule.
    Rejected { middleware: String, reason: String },
    /// The agent exceeded a message quota for the named window.
    RateLimited { agent_id: String, window: String },
    /// A downstream middleware panicked; caught by
    /// [`RecoveryMiddleware`](builtin::RecoveryMiddleware).
    Panicked { message: String },
}

impl MiddlewareError {
    pub fn rejected(middleware: impl Into<String>, reason: impl Into<String>) -> Self {
        MiddlewareError::Rejected {
            middleware: middleware.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for MiddlewareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MiddlewareError::Rejected { middleware, reason } => {
                write!(f, "rejected by {}: {}", middleware, reason)
            }
            MiddlewareError::RateLimited { agent_id, window } => {
                write!(f, "agent '{}' exceeded its per-{} message limit", agent_id, window)
            }
            MiddlewareError::Panicked { message } => {
                write!(f, "middleware panicked: {}", message)
            }
        }
    }
}

impl Error for MiddlewareError {}

/// One link in the chain.
///
/// Implementations return errors rather than panicking; a
/// [`RecoveryMiddleware`](builtin::RecoveryMiddleware) placed early in the chain turns any
/// panic that does escape into [`MiddlewareError::Panicked`].
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    /// Handle `message`, calling `next.run(ctx, message)` to continue the chain.
    async fn process(
        &self,
        ctx: &mut MiddlewareContext,
        message: Message,
        next: Next<'_>,
    ) -> Result<Message, MiddlewareError>;
}

/// The remainder of the chain after the current middleware.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    /// Run the rest of the chain. At the end of the chain the message is returned as is.
    pub async fn run(
        self,
        ctx: &mut MiddlewareContext,
        message: Message,
    ) -> Result<Message, MiddlewareError> {
        match self.remaining.split_first() {
            Some((current, rest)) => current.process(ctx, message, Next { remaining: rest }).await,
            None => Ok(message),
        }
    }
}

/// Ordered middleware chain.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recovery, logging, sanitisation and empty-content rejection, in that order.
    ///
    /// Sanitising first means content that cleans down to nothing is rejected.
    pub fn standard() -> Self {
        let mut chain = Self::new();
        chain.add(builtin::RecoveryMiddleware);
        chain.add(builtin::LoggingMiddleware);
        chain.add(builtin::SanitizeMiddleware::default());
        chain.add(builtin::EmptyContentFilter);
        chain
    }

    pub fn add<M>(&mut self, middleware: M)
    where
        M: Middleware + 'static,
    {
        self.middlewares.push(Arc::new(middleware));
    }

    pub fn add_shared(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    /// Builder-style [`add`](MiddlewareChain::add).
    pub fn with<M>(mut self, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        self.add(middleware);
        self
    }

    pub fn names(&self) -> Vec<String> {
        self.middlewares.iter().map(|m| m.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Run `message` through every middleware in order.
    pub async fn process(
        &self,
        ctx: &mut MiddlewareContext,
        message: Message,
    ) -> Result<Message, MiddlewareError> {
        Next {
            remaining: &self.middlewares,
        }
        .run(ctx, message)
        .await
    }
}

/// Middleware built from a plain function; see [`middleware_fn`].
pub struct FnMiddleware<F> {
    name: String,
    f: F,
}

/// Wrap a synchronous function as a named middleware.
///
/// The function runs before the rest of the chain and may rewrite the message, record
/// metadata, or reject the message by returning an error.
pub fn middleware_fn<F>(name: impl Into<String>, f: F) -> FnMiddleware<F>
where
    F: Fn(&mut MiddlewareContext, Message) -> Result<Message, MiddlewareError> + Send + Sync,
{
    FnMiddleware {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(&mut MiddlewareContext, Message) -> Result<Message, MiddlewareError>
        + Send
        + Sync
        + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(
        &self,
        ctx: &mut MiddlewareContext,
        message: Message,
        next: Next<'_>,
    ) -> Result<Message, MiddlewareError> {
        let message = (self.f)(ctx, message)?;
        next.run(ctx, message).await
    }
}
