//! The agent capability interface.
//!
//! An [`Agent`] is anything that can take the conversation so far and produce the next
//! line: a CLI wrapper, an HTTP client for a hosted model, or a scripted mock in tests.
//! The orchestrator never looks inside an agent; it only relies on the methods below.
//!
//! Cancellation follows the usual async Rust convention: the orchestrator drops the
//! future returned by [`Agent::send_message`] when the run is cancelled or the per-turn
//! timeout fires, so implementations should release resources on drop.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use roundtable::agent::{Agent, AgentError};
//! use roundtable::message::Message;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Agent for Echo {
//!     fn id(&self) -> &str { "echo" }
//!     fn name(&self) -> &str { "Echo" }
//!     fn agent_type(&self) -> &str { "mock" }
//!     fn model(&self) -> &str { "echo-1" }
//!
//!     async fn send_message(&self, history: &[Message]) -> Result<String, AgentError> {
//!         Ok(history.last().map(|m| m.content.clone()).unwrap_or_default())
//!     }
//! }
//! ```

use crate::roundtable::message::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;
use tokio::sync::mpsc::UnboundedSender;

/// Error type returned by agent implementations.
pub type AgentError = Box<dyn Error + Send + Sync>;

/// A conversation participant.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable identifier, unique within an orchestrator.
    fn id(&self) -> &str;

    /// Display name used in messages and logs.
    fn name(&self) -> &str;

    /// Backend family (e.g. `"claude"`, `"gemini"`, `"mock"`).
    fn agent_type(&self) -> &str;

    /// Model identifier reported in message metrics.
    fn model(&self) -> &str {
        ""
    }

    /// Requests per second admitted by this agent's token bucket. `0.0` disables limiting.
    fn rate_limit(&self) -> f64 {
        0.0
    }

    /// Token bucket capacity.
    fn rate_limit_burst(&self) -> usize {
        1
    }

    /// Cheap, synchronous availability probe (binary installed, key configured, ...).
    fn is_available(&self) -> bool {
        true
    }

    /// Deeper readiness check, e.g. a round-trip to the backend.
    async fn health_check(&self) -> Result<(), AgentError> {
        Ok(())
    }

    /// Line appended to the conversation when the agent joins.
    fn announce(&self) -> String {
        format!("{} has joined the conversation.", self.name())
    }

    /// Produce the next reply given the full conversation history.
    async fn send_message(&self, history: &[Message]) -> Result<String, AgentError>;

    /// Streaming variant of [`send_message`](Agent::send_message).
    ///
    /// Chunks are pushed into `sink` as they arrive. The default implementation sends the
    /// whole reply as a single chunk.
    async fn stream_message(
        &self,
        history: &[Message],
        sink: UnboundedSender<String>,
    ) -> Result<(), AgentError> {
        let reply = self.send_message(history).await?;
        sink.send(reply)
            .map_err(|_| -> AgentError { "stream sink closed".into() })?;
        Ok(())
    }
}

/// Declarative description of an agent, for implementations that are built from config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    pub name: String,
    /// Persona / system prompt handed to the backend.
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub rate_limit: f64,
    #[serde(default)]
    pub rate_limit_burst: usize,
}

impl AgentConfig {
    /// Check the fields every agent needs.
    ///
    /// ```
    /// use roundtable::agent::AgentConfig;
    ///
    /// let cfg = AgentConfig { id: "a1".into(), agent_type: "claude".into(), ..Default::default() };
    /// assert!(cfg.validate().is_err()); // name missing
    /// ```
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("agent id is required".to_string());
        }
        if self.agent_type.trim().is_empty() {
            return Err(format!("agent '{}' has no type", self.id));
        }
        if self.name.trim().is_empty() {
            return Err(format!("agent '{}' has no name", self.id));
        }
        if self.rate_limit < 0.0 || !self.rate_limit.is_finite() {
            return Err(format!("agent '{}' has an invalid rate limit", self.id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roundtable::message::Role;

    struct Fixed;

    #[async_trait]
    impl Agent for Fixed {
        fn id(&self) -> &str {
            "fixed"
        }
        fn name(&self) -> &str {
            "Fixed"
        }
        fn agent_type(&self) -> &str {
            "mock"
        }
        async fn send_message(&self, _history: &[Message]) -> Result<String, AgentError> {
            Ok("fixed reply".to_string())
        }
    }

    #[tokio::test]
    async fn test_default_stream_sends_single_chunk() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let history = vec![Message::new("u", "User", "host", Role::User, "hi")];
        Fixed.stream_message(&history, tx).await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("fixed reply"));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_default_announce_uses_name() {
        assert_eq!(Fixed.announce(), "Fixed has joined the conversation.");
    }

    #[test]
    fn test_config_validation() {
        let mut cfg = AgentConfig {
            id: "a1".into(),
            agent_type: "claude".into(),
            name: "Alice".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
        cfg.rate_limit = -1.0;
        assert!(cfg.validate().is_err());
    }
}
