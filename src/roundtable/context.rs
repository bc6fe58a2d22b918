//! Cancellation scope for conversation runs.
//!
//! A [`RunContext`] bundles a [`CancellationToken`] with an optional deadline. Every
//! blocking primitive in the crate (rate-limiter waits, retry backoff, inter-turn pacing,
//! agent invocations) races against it, so cancelling the context or letting its deadline
//! pass unblocks the whole run promptly.
//!
//! ```rust
//! use roundtable::context::{ContextError, RunContext};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let ctx = RunContext::new();
//! let handle = ctx.clone();
//! handle.cancel();
//!
//! let result = ctx.sleep(Duration::from_secs(60)).await;
//! assert_eq!(result, Err(ContextError::Cancelled));
//! # }
//! ```

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Stand-in for "never" when an instant would overflow; roughly 30 years out.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + duration`, saturating at a far-future instant instead of panicking.
pub(crate) fn instant_after(now: Instant, duration: Duration) -> Instant {
    now.checked_add(duration).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Why a [`RunContext`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    /// [`RunContext::cancel`] was called on this context or one of its parents.
    Cancelled,
    /// The context's deadline passed.
    DeadlineExceeded,
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextError::Cancelled => write!(f, "context cancelled"),
            ContextError::DeadlineExceeded => write!(f, "context deadline exceeded"),
        }
    }
}

impl Error for ContextError {}

/// Cancellation token plus optional deadline, shared by everything a run touches.
///
/// Cloning is cheap and every clone observes the same cancellation.
#[derive(Debug, Clone)]
pub struct RunContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    /// A context that ends only when cancelled.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A context that ends when cancelled or after `timeout`, whichever comes first.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(instant_after(Instant::now(), timeout)),
        }
    }

    /// Derive a child context with a tighter deadline.
    ///
    /// Cancelling the parent cancels the child; cancelling the child leaves the parent
    /// untouched. The child's deadline never extends past the parent's.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = instant_after(Instant::now(), timeout);
        let deadline = match self.deadline {
            Some(parent) if parent < candidate => parent,
            _ => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Cancel this context and all of its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The deadline, if one was set.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Non-blocking check; `Some` once the context has ended.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolve once the context ends, yielding the reason.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => ContextError::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                ContextError::Cancelled
            }
        }
    }

    /// Sleep for `duration` unless the context ends first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), ContextError> {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            err = self.done() => Err(err),
        }
    }

    /// Drive `future` to completion unless the context ends first, in which case the
    /// future is dropped.
    pub async fn run<F>(&self, future: F) -> Result<F::Output, ContextError>
    where
        F: Future,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            output = future => Ok(output),
            err = self.done() => Err(err),
        }
    }
}
