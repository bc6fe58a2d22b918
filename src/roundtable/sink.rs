//! Metrics and chat-log sinks.
//!
//! The orchestrator reports to two optional collaborators: a [`MetricsSink`] for counters
//! and gauges, and a [`ChatLogger`] that records the transcript. Both traits have no-op
//! defaults for every method. [`InMemoryMetrics`] and [`LogChatLogger`] are simple
//! implementations suitable for tests and local runs.

use crate::roundtable::config::ConversationMode;
use crate::roundtable::message::Message;
use crate::roundtable::retry::ErrorKind;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Outcome of a single agent invocation, as seen by the metrics sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestOutcome {
    Success,
    Failure,
}

/// Counters and gauges emitted while a conversation runs.
///
/// Called synchronously from the conversation loop; implementations must not block.
pub trait MetricsSink: Send + Sync {
    /// One agent call (one attempt) finished.
    fn record_request(&self, _agent_id: &str, _outcome: RequestOutcome, _duration: Duration) {}
    fn record_tokens(&self, _agent_id: &str, _input: usize, _output: usize) {}
    fn record_cost(&self, _agent_id: &str, _cost: f64) {}
    /// A retry is about to be attempted (`attempt` counts from 1).
    fn record_retry(&self, _agent_id: &str, _attempt: u32) {}
    /// The agent's limiter made the turn wait.
    fn record_rate_limit_hit(&self, _agent_id: &str) {}
    /// `delta` is +1 when a conversation starts and -1 when it ends.
    fn adjust_active_conversations(&self, _delta: i64) {}
    fn record_turn(&self, _mode: ConversationMode) {}
    fn record_error(&self, _agent_id: &str, _kind: ErrorKind) {}
}

/// Atomic in-process counters.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    requests_ok: AtomicUsize,
    requests_failed: AtomicUsize,
    input_tokens: AtomicUsize,
    output_tokens: AtomicUsize,
    /// Cost in micro-dollars.
    cost_micros: AtomicU64,
    retries: AtomicUsize,
    rate_limit_hits: AtomicUsize,
    active: AtomicUsize,
    turns: Mutex<HashMap<ConversationMode, usize>>,
    errors: Mutex<HashMap<ErrorKind, usize>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn successful_requests(&self) -> usize {
        self.requests_ok.load(Ordering::Relaxed)
    }

    pub fn failed_requests(&self) -> usize {
        self.requests_failed.load(Ordering::Relaxed)
    }

    pub fn total_tokens(&self) -> usize {
        self.input_tokens.load(Ordering::Relaxed) + self.output_tokens.load(Ordering::Relaxed)
    }

    pub fn total_cost(&self) -> f64 {
        self.cost_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    pub fn retries(&self) -> usize {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn rate_limit_hits(&self) -> usize {
        self.rate_limit_hits.load(Ordering::Relaxed)
    }

    pub fn active_conversations(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn turns(&self, mode: ConversationMode) -> usize {
        lock(&self.turns).get(&mode).copied().unwrap_or(0)
    }

    pub fn errors(&self, kind: ErrorKind) -> usize {
        lock(&self.errors).get(&kind).copied().unwrap_or(0)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record_request(&self, _agent_id: &str, outcome: RequestOutcome, _duration: Duration) {
        match outcome {
            RequestOutcome::Success => self.requests_ok.fetch_add(1, Ordering::Relaxed),
            RequestOutcome::Failure => self.requests_failed.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn record_tokens(&self, _agent_id: &str, input: usize, output: usize) {
        self.input_tokens.fetch_add(input, Ordering::Relaxed);
        self.output_tokens.fetch_add(output, Ordering::Relaxed);
    }

    fn record_cost(&self, _agent_id: &str, cost: f64) {
        if cost.is_finite() && cost > 0.0 {
            self.cost_micros
                .fetch_add((cost * 1_000_000.0).round() as u64, Ordering::Relaxed);
        }
    }

    fn record_retry(&self, _agent_id: &str, _attempt: u32) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rate_limit_hit(&self, _agent_id: &str) {
        self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn adjust_active_conversations(&self, delta: i64) {
        if delta >= 0 {
            self.active.fetch_add(delta as usize, Ordering::Relaxed);
        } else {
            let dec = delta.unsigned_abs() as usize;
            let _ = self
                .active
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                    Some(v.saturating_sub(dec))
                });
        }
    }

    fn record_turn(&self, mode: ConversationMode) {
        *lock(&self.turns).entry(mode).or_insert(0) += 1;
    }

    fn record_error(&self, _agent_id: &str, kind: ErrorKind) {
        *lock(&self.errors).entry(kind).or_insert(0) += 1;
    }
}

/// Records the conversation transcript.
pub trait ChatLogger: Send + Sync {
    fn log_message(&self, _message: &Message) {}
    fn log_error(&self, _agent_name: &str, _error: &str) {}
    fn log_system(&self, _text: &str) {}
}

/// Writes the transcript to the `log` facade under the `roundtable::chat` target.
pub struct LogChatLogger;

impl ChatLogger for LogChatLogger {
    fn log_message(&self, message: &Message) {
        log::info!(
            target: "roundtable::chat",
            "[{}] {} ({}): {}",
            message.timestamp.format("%H:%M:%S"),
            message.agent_name,
            message.role,
            message.content
        );
    }

    fn log_error(&self, agent_name: &str, error: &str) {
        log::warn!(target: "roundtable::chat", "{}: {}", agent_name, error);
    }

    fn log_system(&self, text: &str) {
        log::info!(target: "roundtable::chat", "-- {}", text);
    }
}
