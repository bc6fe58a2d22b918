//! Ready-made middleware.
//!
//! | Middleware | Effect |
//! |---|---|
//! | [`RecoveryMiddleware`] | Turns a panic anywhere downstream into [`MiddlewareError::Panicked`] |
//! | [`LoggingMiddleware`] | Debug-logs each message and warns on rejection |
//! | [`TimingMiddleware`] | Records downstream processing time in metadata |
//! | [`EmptyContentFilter`] | Rejects blank messages |
//! | [`ContentFilterMiddleware`] | Length bounds, required and blocked substrings |
//! | [`SanitizeMiddleware`] | Trims, strips control characters, collapses blank lines |
//! | [`RoleFilterMiddleware`] | Only lets allow-listed roles through |
//! | [`HistoryMiddleware`] | Keeps a ring buffer of recent messages and exposes it in metadata |
//! | [`AgentRateLimitMiddleware`] | Fixed per-minute / per-hour message quotas per agent |

use crate::roundtable::message::{Message, Role};
use crate::roundtable::middleware::{Middleware, MiddlewareContext, MiddlewareError, Next};
use async_trait::async_trait;
use futures_util::FutureExt;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Metadata key under which [`HistoryMiddleware`] stores its snapshot.
pub const HISTORY_METADATA_KEY: &str = "message_history";
/// Metadata key under which [`TimingMiddleware`] stores downstream latency.
pub const PROCESSING_TIME_KEY: &str = "processing_time_ms";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Catches panics raised by any middleware registered after it.
///
/// Register it first so it wraps the whole chain.
pub struct RecoveryMiddleware;

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[async_trait]
impl Middleware for RecoveryMiddleware {
    fn name(&self) -> &str {
        "recovery"
    }

    async fn process(
        &self,
        ctx: &mut MiddlewareContext,
        message: Message,
        next: Next<'_>,
    ) -> Result<Message, MiddlewareError> {
        let agent_id = ctx.agent_id.clone();
        match AssertUnwindSafe(next.run(ctx, message)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!(
                    "middleware panicked while processing message from '{}': {}",
                    agent_id,
                    message
                );
                Err(MiddlewareError::Panicked { message })
            }
        }
    }
}

pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn process(
        &self,
        ctx: &mut MiddlewareContext,
        message: Message,
        next: Next<'_>,
    ) -> Result<Message, MiddlewareError> {
        log::debug!(
            "turn {}: processing {} chars from '{}' ({})",
            ctx.turn_number,
            message.content.chars().count(),
            ctx.agent_name,
            ctx.agent_id
        );
        let agent_name = ctx.agent_name.clone();
        let turn = ctx.turn_number;
        let result = next.run(ctx, message).await;
        if let Err(e) = &result {
            log::warn!("turn {}: message from '{}' dropped: {}", turn, agent_name, e);
        }
        result
    }
}

pub struct TimingMiddleware;

#[async_trait]
impl Middleware for TimingMiddleware {
    fn name(&self) -> &str {
        "timing"
    }

    async fn process(
        &self,
        ctx: &mut MiddlewareContext,
        message: Message,
        next: Next<'_>,
    ) -> Result<Message, MiddlewareError> {
        let started = Instant::now();
        let result = next.run(ctx, message).await;
        ctx.set(
            PROCESSING_TIME_KEY,
            started.elapsed().as_secs_f64() * 1000.0,
        );
        result
    }
}

pub struct EmptyContentFilter;

#[async_trait]
impl Middleware for EmptyContentFilter {
    fn name(&self) -> &str {
        "empty_content"
    }

    async fn process(
        &self,
        ctx: &mut MiddlewareContext,
        message: Message,
        next: Next<'_>,
    ) -> Result<Message, MiddlewareError> {
        if message.content.trim().is_empty() {
            return Err(MiddlewareError::rejected(self.name(), "message content is empty"));
        }
        next.run(ctx, message).await
    }
}

/// Length and substring rules.
///
/// ```
/// use roundtable::middleware::builtin::ContentFilterMiddleware;
///
/// let filter = ContentFilterMiddleware::new()
///     .min_length(2)
///     .max_length(500)
///     .block("password")
///     .case_sensitive(false);
/// assert!(filter.check("my PASSWORD is hunter2").is_err());
/// assert!(filter.check("hello there").is_ok());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ContentFilterMiddleware {
    min_length: Option<usize>,
    max_length: Option<usize>,
    required: Vec<String>,
    blocked: Vec<String>,
    case_sensitive: bool,
}

impl ContentFilterMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Minimum length in characters.
    pub fn min_length(mut self, min: usize) -> Self {
        self.min_length = Some(min);
        self
    }

    /// Maximum length in characters.
    pub fn max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Every required substring must appear.
    pub fn require(mut self, needle: impl Into<String>) -> Self {
        self.required.push(needle.into());
        self
    }

    /// No blocked substring may appear.
    pub fn block(mut self, needle: impl Into<String>) -> Self {
        self.blocked.push(needle.into());
        self
    }

    pub fn case_sensitive(mut self, yes: bool) -> Self {
        self.case_sensitive = yes;
        self
    }

    fn contains(&self, haystack: &str, needle: &str) -> bool {
        if self.case_sensitive {
            haystack.contains(needle)
        } else {
            haystack.to_lowercase().contains(&needle.to_lowercase())
        }
    }

    /// Apply the rules to `content`, returning the reason for rejection.
    pub fn check(&self, content: &str) -> Result<(), String> {
        let length = content.chars().count();
        if let Some(min) = self.min_length {
            if length < min {
                return Err(format!("content too short ({} < {} chars)", length, min));
            }
        }
        if let Some(max) = self.max_length {
            if length > max {
                return Err(format!("content too long ({} > {} chars)", length, max));
            }
        }
        if let Some(missing) = self.required.iter().find(|r| !self.contains(content, r)) {
            return Err(format!("required content missing: {:?}", missing));
        }
        if let Some(found) = self.blocked.iter().find(|b| self.contains(content, b)) {
            return Err(format!("blocked content found: {:?}", found));
        }
        Ok(())
    }
}

#[async_trait]
impl Middleware for ContentFilterMiddleware {
    fn name(&self) -> &str {
        "content_filter"
    }

    async fn process(
        &self,
        ctx: &mut MiddlewareContext,
        message: Message,
        next: Next<'_>,
    ) -> Result<Message, MiddlewareError> {
        self.check(&message.content)
            .map_err(|reason| MiddlewareError::rejected(self.name(), reason))?;
        next.run(ctx, message).await
    }
}

/// Whitespace and character clean-up.
#[derive(Debug, Clone)]
pub struct SanitizeMiddleware {
    pub trim: bool,
    /// Drop control characters other than `\n` and `\t`.
    pub strip_control: bool,
    /// Collapse runs of blank lines down to a single blank line.
    pub collapse_blank_lines: bool,
}

impl Default for SanitizeMiddleware {
    fn default() -> Self {
        Self {
            trim: true,
            strip_control: true,
            collapse_blank_lines: true,
        }
    }
}

impl SanitizeMiddleware {
    pub fn sanitize(&self, content: &str) -> String {
        let mut out: String = if self.strip_control {
            content
                .chars()
                .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
                .collect()
        } else {
            content.to_string()
        };

        if self.collapse_blank_lines {
            let mut collapsed = Vec::new();
            let mut blank_run = 0;
            for line in out.lines() {
                if line.trim().is_empty() {
                    blank_run += 1;
                    if blank_run > 1 {
                        continue;
                    }
                } else {
                    blank_run = 0;
                }
                collapsed.push(line);
            }
            out = collapsed.join("\n");
        }

        if self.trim {
            out = out.trim().to_string();
        }
        out
    }
}

#[async_trait]
impl Middleware for SanitizeMiddleware {
    fn name(&self) -> &str {
        "sanitize"
    }

    async fn process(
        &self,
        ctx: &mut MiddlewareContext,
        mut message: Message,
        next: Next<'_>,
    ) -> Result<Message, MiddlewareError> {
        message.content = self.sanitize(&message.content);
        next.run(ctx, message).await
    }
}

pub struct RoleFilterMiddleware {
    allowed: Vec<Role>,
}

impl RoleFilterMiddleware {
    pub fn new(allowed: impl IntoIterator<Item = Role>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Middleware for RoleFilterMiddleware {
    fn name(&self) -> &str {
        "role_filter"
    }

    async fn process(
        &self,
        ctx: &mut MiddlewareContext,
        message: Message,
        next: Next<'_>,
    ) -> Result<Message, MiddlewareError> {
        if !self.allowed.contains(&message.role) {
            return Err(MiddlewareError::rejected(
                self.name(),
                format!("role '{}' is not allowed", message.role),
            ));
        }
        next.run(ctx, message).await
    }
}

/// Rolling window of the last `capacity` messages seen by this middleware.
///
/// The buffer lives as long as the middleware (across turns); each invocation stores a
/// JSON snapshot of it, current message included, under [`HISTORY_METADATA_KEY`].
pub struct HistoryMiddleware {
    capacity: usize,
    buffer: Mutex<VecDeque<Message>>,
}

impl HistoryMiddleware {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Copy of the buffered messages, oldest first.
    pub fn recent(&self) -> Vec<Message> {
        lock(&self.buffer).iter().cloned().collect()
    }

    fn record(&self, message: &Message) -> Vec<Message> {
        let mut buffer = lock(&self.buffer);
        if buffer.len() == self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(message.clone());
        buffer.iter().cloned().collect()
    }
}

#[async_trait]
impl Middleware for HistoryMiddleware {
    fn name(&self) -> &str {
        "history"
    }

    async fn process(
        &self,
        ctx: &mut MiddlewareContext,
        message: Message,
        next: Next<'_>,
    ) -> Result<Message, MiddlewareError> {
        let recent = self.record(&message);
        match serde_json::to_value(&recent) {
            Ok(value) => ctx.set(HISTORY_METADATA_KEY, value),
            Err(e) => log::warn!("could not snapshot message history: {}", e),
        }
        next.run(ctx, message).await
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: usize,
}

impl Window {
    fn new(now: Instant) -> Self {
        Self { started: now, count: 0 }
    }

    fn roll(&mut self, now: Instant, period: Duration) {
        if now.duration_since(self.started) >= period {
            *self = Window::new(now);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct AgentWindows {
    minute: Window,
    hour: Window,
}

/// Per-agent message quotas over fixed one-minute and one-hour windows.
///
/// Independent of the token-bucket limiter that paces agent calls: this one counts
/// messages that reach the pipeline. A limit of `0` disables that window.
pub struct AgentRateLimitMiddleware {
    per_minute: usize,
    per_hour: usize,
    windows: Mutex<HashMap<String, AgentWindows>>,
}

impl AgentRateLimitMiddleware {
    pub fn new(per_minute: usize, per_hour: usize) -> Self {
        Self {
            per_minute,
            per_hour,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one message for `agent_id` at `now`, or say which window is full.
    fn admit(&self, agent_id: &str, now: Instant) -> Result<(), &'static str> {
        let mut windows = lock(&self.windows);
        let entry = windows.entry(agent_id.to_string()).or_insert(AgentWindows {
            minute: Window::new(now),
            hour: Window::new(now),
        });
        entry.minute.roll(now, Duration::from_secs(60));
        entry.hour.roll(now, Duration::from_secs(3600));

        if self.per_minute > 0 && entry.minute.count >= self.per_minute {
            return Err("minute");
        }
        if self.per_hour > 0 && entry.hour.count >= self.per_hour {
            return Err("hour");
        }
        entry.minute.count += 1;
        entry.hour.count += 1;
        Ok(())
    }
}

#[async_trait]
impl Middleware for AgentRateLimitMiddleware {
    fn name(&self) -> &str {
        "agent_rate_limit"
    }

    async fn process(
        &self,
        ctx: &mut MiddlewareContext,
        message: Message,
        next: Next<'_>,
    ) -> Result<Message, MiddlewareError> {
        if let Err(window) = self.admit(&ctx.agent_id, Instant::now()) {
            return Err(MiddlewareError::RateLimited {
                agent_id: ctx.agent_id.clone(),
                window: window.to_string(),
            });
        }
        next.run(ctx, message).await
    }
}
