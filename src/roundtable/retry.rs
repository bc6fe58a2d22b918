//! Retry policy, backoff calculation and error classification.
//!
//! The orchestrator retries failed agent calls according to a [`RetryPolicy`]. Delays
//! grow exponentially and are capped; no jitter is applied at this layer, so the same
//! inputs always produce the same delay.

use crate::roundtable::agent::AgentError;
use crate::roundtable::message::duration_millis;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// How often and how patiently a failed agent call is retried.
///
/// Zero-valued fields mean "unset"; see [`RetryPolicy::resolved`]. When deserialized,
/// missing fields are unset and delays are given in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default, with = "duration_millis")]
    pub initial_delay: Duration,
    #[serde(default, with = "duration_millis")]
    pub max_delay: Duration,
    #[serde(default)]
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// A policy with every field unset.
    pub fn unset() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 0.0,
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    fn is_unset(&self) -> bool {
        self.max_retries == 0
            && self.initial_delay.is_zero()
            && self.max_delay.is_zero()
            && self.multiplier == 0.0
    }

    /// Fill in defaults.
    ///
    /// A completely unset policy becomes [`RetryPolicy::default`]. If any field was set,
    /// only the unset delay and multiplier fields are defaulted and `max_retries` is kept
    /// as given, so an explicit `0` disables retries.
    ///
    /// ```
    /// use roundtable::retry::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// assert_eq!(RetryPolicy::unset().resolved(), RetryPolicy::default());
    ///
    /// let custom = RetryPolicy { initial_delay: Duration::from_millis(10), ..RetryPolicy::unset() };
    /// let resolved = custom.resolved();
    /// assert_eq!(resolved.max_retries, 0);
    /// assert_eq!(resolved.initial_delay, Duration::from_millis(10));
    /// assert_eq!(resolved.max_delay, Duration::from_secs(30));
    /// ```
    pub fn resolved(self) -> Self {
        if self.is_unset() {
            return Self::default();
        }
        Self {
            max_retries: self.max_retries,
            initial_delay: if self.initial_delay.is_zero() {
                DEFAULT_INITIAL_DELAY
            } else {
                self.initial_delay
            },
            max_delay: if self.max_delay.is_zero() {
                DEFAULT_MAX_DELAY
            } else {
                self.max_delay
            },
            multiplier: if self.multiplier == 0.0 {
                DEFAULT_MULTIPLIER
            } else {
                self.multiplier
            },
        }
    }

    /// Total attempts this policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Delay before retry number `attempt`.
///
/// `min(initial_delay * multiplier^attempt, max_delay)`, with `attempt = 0` (the first
/// try) mapping to zero. Multipliers below `1.0` are treated as `1.0`.
///
/// ```
/// use roundtable::retry::{backoff_delay, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default();
/// assert_eq!(backoff_delay(1, &policy), Duration::from_secs(2));
/// assert_eq!(backoff_delay(2, &policy), Duration::from_secs(4));
/// assert_eq!(backoff_delay(5, &policy), Duration::from_secs(30));
/// ```
pub fn backoff_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let multiplier = if policy.multiplier.is_finite() {
        policy.multiplier.max(1.0)
    } else {
        1.0
    };
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let seconds = policy.initial_delay.as_secs_f64() * multiplier.powi(exponent);
    let cap = policy.max_delay.as_secs_f64();
    if !seconds.is_finite() || seconds >= cap {
        return policy.max_delay;
    }
    Duration::from_secs_f64(seconds)
}

/// Coarse failure category used for logging, metrics and cooldowns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    RateLimit,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::RateLimit => write!(f, "rate_limit"),
            ErrorKind::Unknown => write!(f, "unknown"),
        }
    }
}

const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "rate_limit", "ratelimit", "429", "too many requests", "quota"];
const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out", "deadline exceeded", "elapsed"];

/// Classify an agent error by type first, then by message.
pub fn classify_error(err: &AgentError) -> ErrorKind {
    if err.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
        return ErrorKind::Timeout;
    }
    classify_message(&err.to_string())
}

/// Classify a free-form error message.
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorKind::RateLimit
    } else if TIMEOUT_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorKind::Timeout
    } else {
        ErrorKind::Unknown
    }
}
