//! Conversation lifecycle events.
//!
//! Implement [`EventHandler`] to be told when a conversation starts, when each message is
//! committed, when a turn fails, and when the run ends. Both methods default to no-ops,
//! so a handler only overrides what it needs. Register it with
//! [`Orchestrator::with_event_handler`](crate::orchestrator::Orchestrator::with_event_handler).
//!
//! # Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use roundtable::event::{ConversationEvent, EventHandler};
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventHandler for Printer {
//!     async fn on_event(&self, event: &ConversationEvent) {
//!         if let ConversationEvent::MessageCreated { agent_name, content, .. } = event {
//!             println!("{}: {}", agent_name, content);
//!         }
//!     }
//! }
//! ```

use crate::roundtable::config::ConversationMode;
use crate::roundtable::message::Role;
use crate::roundtable::orchestrator::ConversationStatus;
use crate::roundtable::retry::ErrorKind;
use async_trait::async_trait;
use std::time::Duration;

/// Events emitted by an [`Orchestrator`](crate::orchestrator::Orchestrator).
///
/// Every variant carries the conversation id so one handler can follow several runs.
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    ConversationStarted {
        conversation_id: String,
        mode: ConversationMode,
        initial_prompt: String,
        max_turns: usize,
        /// Agent ids in registration order.
        participants: Vec<String>,
    },
    /// A message was appended to history.
    MessageCreated {
        conversation_id: String,
        agent_id: String,
        agent_name: String,
        agent_type: String,
        role: Role,
        content: String,
        turn_number: usize,
        total_tokens: usize,
        cost: f64,
        duration: Duration,
    },
    /// A turn failed; the conversation continues.
    ConversationError {
        conversation_id: String,
        agent_id: String,
        agent_type: String,
        kind: ErrorKind,
        message: String,
    },
    ConversationCompleted {
        conversation_id: String,
        status: ConversationStatus,
        total_messages: usize,
        total_turns: usize,
        total_tokens: usize,
        total_cost: f64,
        duration: Duration,
        summary: String,
        /// Set when the run was interrupted.
        error: Option<String>,
    },
}

impl ConversationEvent {
    pub fn conversation_id(&self) -> &str {
        match self {
            ConversationEvent::ConversationStarted { conversation_id, .. }
            | ConversationEvent::MessageCreated { conversation_id, .. }
            | ConversationEvent::ConversationError { conversation_id, .. }
            | ConversationEvent::ConversationCompleted { conversation_id, .. } => conversation_id,
        }
    }
}

/// Receives [`ConversationEvent`]s.
///
/// Handlers are awaited inline by the conversation loop; keep them quick or hand the work
/// off to a channel.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, _event: &ConversationEvent) {}

    /// Flush and release resources. Called by
    /// [`Orchestrator::shutdown`](crate::orchestrator::Orchestrator::shutdown).
    async fn close(&self) {}
}

/// Logs every event through the `log` facade.
pub struct LogEventHandler;

#[async_trait]
impl EventHandler for LogEventHandler {
    async fn on_event(&self, event: &ConversationEvent) {
        match event {
            ConversationEvent::ConversationStarted {
                conversation_id,
                mode,
                participants,
                ..
            } => log::info!(
                "[{}] conversation started ({}) with {}",
                conversation_id,
                mode,
                participants.join(", ")
            ),
            ConversationEvent::MessageCreated {
                conversation_id,
                agent_name,
                turn_number,
                ..
            } => log::debug!(
                "[{}] turn {}: message from {}",
                conversation_id,
                turn_number,
                agent_name
            ),
            ConversationEvent::ConversationError {
                conversation_id,
                agent_id,
                kind,
                message,
                ..
            } => log::warn!("[{}] {} failed ({}): {}", conversation_id, agent_id, kind, message),
            ConversationEvent::ConversationCompleted {
                conversation_id,
                summary,
                ..
            } => log::info!("[{}] {}", conversation_id, summary),
        }
    }
}
