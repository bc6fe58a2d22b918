//! Token-bucket rate limiting.
//!
//! Each agent gets its own [`RateLimiter`]. Tokens refill continuously at
//! `rate_per_second` up to `burst`; every request consumes one. A limiter can also be put
//! into a cooldown window with [`RateLimiter::pause`] when an upstream service signals
//! "retry later", during which all requests are refused regardless of available tokens.
//!
//! Limiters are owned by a [`RateLimiterRegistry`] keyed by agent id or endpoint. The
//! registry is an ordinary value held by the application root and passed to whatever
//! needs it, so tests can build isolated registries.
//!
//! # Example
//!
//! ```rust
//! use roundtable::rate_limit::RateLimiter;
//!
//! let limiter = RateLimiter::new(1.0, 2);
//! assert!(limiter.allow());
//! assert!(limiter.allow());
//! assert!(!limiter.allow()); // bucket drained
//! ```

use crate::roundtable::context::{instant_after, ContextError, RunContext};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

const MIN_WAIT: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct Bucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
    cooldown_until: Option<Instant>,
}

impl Bucket {
    fn disabled(&self) -> bool {
        self.rate <= 0.0
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        if self.disabled() {
            return;
        }
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
    }

    fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        match self.cooldown_until {
            Some(until) if until > now => Some(until - now),
            _ => None,
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        if self.disabled() {
            return true;
        }
        if self.cooldown_remaining(now).is_some() {
            return false;
        }
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_to_next_token(&self) -> Duration {
        let seconds = (1.0 - self.tokens) / self.rate;
        if !seconds.is_finite() || seconds <= 0.0 {
            return MIN_WAIT;
        }
        // a tiny rate can put the next token beyond what a Duration holds
        Duration::try_from_secs_f64(seconds)
            .unwrap_or(Duration::MAX)
            .max(MIN_WAIT)
    }
}

/// What `wait` should do after inspecting the bucket.
enum Admission {
    Granted,
    Sleep(Duration),
}

/// A token bucket guarding one agent (or endpoint).
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    /// Wakes sleeping waiters when the rate or burst changes.
    reconfigured: Notify,
}

impl RateLimiter {
    /// Create a full bucket. `rate_per_second <= 0` disables limiting; `burst` below 1
    /// is raised to 1.
    pub fn new(rate_per_second: f64, burst: usize) -> Self {
        let burst = burst.max(1) as f64;
        Self {
            bucket: Mutex::new(Bucket {
                rate: sanitize_rate(rate_per_second),
                burst,
                tokens: burst,
                last_refill: Instant::now(),
                cooldown_until: None,
            }),
            reconfigured: Notify::new(),
        }
    }

    /// A limiter that admits everything.
    pub fn unlimited() -> Self {
        Self::new(0.0, 1)
    }

    fn lock(&self) -> MutexGuard<'_, Bucket> {
        // A poisoned bucket still holds consistent numbers; keep using it.
        self.bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take a token if one is available right now.
    pub fn allow(&self) -> bool {
        self.lock().try_take(Instant::now())
    }

    /// Block until a token is available, honouring cooldowns and `ctx`.
    ///
    /// The lock is only held while inspecting the bucket, never while sleeping. A
    /// [`set_rate`](Self::set_rate) or [`set_burst`](Self::set_burst) call wakes the
    /// waiter early so it re-reads the new settings.
    pub async fn wait(&self, ctx: &RunContext) -> Result<(), ContextError> {
        loop {
            if let Some(err) = ctx.err() {
                return Err(err);
            }

            // registered before the bucket is read so a concurrent change is not missed
            let reconfigured = self.reconfigured.notified();

            let admission = {
                let mut bucket = self.lock();
                let now = Instant::now();
                if bucket.disabled() {
                    Admission::Granted
                } else if let Some(remaining) = bucket.cooldown_remaining(now) {
                    Admission::Sleep(remaining)
                } else if bucket.try_take(now) {
                    Admission::Granted
                } else {
                    Admission::Sleep(bucket.time_to_next_token())
                }
            };

            match admission {
                Admission::Granted => return Ok(()),
                Admission::Sleep(duration) => {
                    tokio::select! {
                        slept = ctx.sleep(duration) => slept?,
                        _ = reconfigured => {}
                    }
                }
            }
        }
    }

    /// Refuse all requests for at least `duration` from now.
    ///
    /// An existing longer cooldown is kept.
    pub fn pause(&self, duration: Duration) {
        let mut bucket = self.lock();
        let until = instant_after(Instant::now(), duration);
        match bucket.cooldown_until {
            Some(current) if current >= until => {}
            _ => bucket.cooldown_until = Some(until),
        }
    }

    /// Change the refill rate. `rate_per_second <= 0` disables the limiter.
    pub fn set_rate(&self, rate_per_second: f64) {
        let mut bucket = self.lock();
        bucket.refill(Instant::now());
        bucket.rate = sanitize_rate(rate_per_second);
        drop(bucket);
        self.reconfigured.notify_waiters();
    }

    /// Change the bucket capacity (minimum 1). Current tokens are clamped to it.
    pub fn set_burst(&self, burst: usize) {
        let mut bucket = self.lock();
        bucket.refill(Instant::now());
        bucket.burst = burst.max(1) as f64;
        bucket.tokens = bucket.tokens.min(bucket.burst);
        drop(bucket);
        self.reconfigured.notify_waiters();
    }

    /// Tokens currently available, after refilling.
    pub fn tokens(&self) -> f64 {
        let mut bucket = self.lock();
        bucket.refill(Instant::now());
        bucket.tokens
    }

    pub fn rate(&self) -> f64 {
        self.lock().rate
    }

    pub fn burst(&self) -> usize {
        self.lock().burst as usize
    }

    pub fn is_disabled(&self) -> bool {
        self.lock().disabled()
    }

    /// Time left in the current cooldown window, if any.
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        self.lock().cooldown_remaining(Instant::now())
    }
}

fn sanitize_rate(rate: f64) -> f64 {
    if rate.is_finite() && rate > 0.0 {
        rate
    } else {
        0.0
    }
}

/// Explicit registry of limiters keyed by agent id or endpoint.
///
/// ```rust
/// use roundtable::rate_limit::RateLimiterRegistry;
///
/// let registry = RateLimiterRegistry::new();
/// let a = registry.get_or_create("https://api.example.com", 2.0, 4);
/// let b = registry.get_or_create("https://api.example.com", 9.0, 9);
/// assert!(std::sync::Arc::ptr_eq(&a, &b)); // first registration wins
/// assert_eq!(registry.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<RateLimiter>>> {
        self.limiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return the limiter for `key`, creating it with the given settings if absent.
    pub fn get_or_create(&self, key: &str, rate_per_second: f64, burst: usize) -> Arc<RateLimiter> {
        Arc::clone(
            self.lock()
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(RateLimiter::new(rate_per_second, burst))),
        )
    }

    pub fn get(&self, key: &str) -> Option<Arc<RateLimiter>> {
        self.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Arc<RateLimiter>> {
        self.lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
