//! Conversation messages.
//!
//! Every announcement, prompt, agent reply and externally injected line that enters a
//! conversation is captured as a [`Message`]. Messages are plain values: the middleware
//! pipeline takes one by value and hands back a (possibly rewritten) one, and once a
//! message is appended to history it is never edited again.
//!
//! # Examples
//!
//! ```
//! use roundtable::message::{Message, Role};
//!
//! let prompt = Message::new("host", "Host", "system", Role::User, "Discuss tabs vs spaces.");
//! assert_eq!(prompt.role, Role::User);
//! assert!(prompt.metrics.is_none());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Who a message speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Announcements and orchestrator notices.
    System,
    /// Input from a human or the host application (initial prompt, injected lines).
    User,
    /// A reply produced by a registered agent.
    Agent,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Agent => write!(f, "agent"),
        }
    }
}

/// Cost and latency accounting attached to agent replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMetrics {
    /// Wall-clock time of the successful agent call (excluding retries and waits).
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
    /// Estimated cost in US dollars.
    pub cost: f64,
    /// Model identifier the agent reported.
    pub model: String,
}

/// A single line of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub agent_id: String,
    pub agent_name: String,
    pub agent_type: String,
    pub content: String,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MessageMetrics>,
}

impl Message {
    /// Create a message stamped with the current time and no metrics.
    pub fn new(
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        agent_type: impl Into<String>,
        role: Role,
        content: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            agent_type: agent_type.into(),
            content: content.into(),
            role,
            timestamp: Utc::now(),
            metrics: None,
        }
    }

    /// Orchestrator notice with no agent identity.
    ///
    /// ```
    /// use roundtable::message::{Message, Role};
    ///
    /// let notice = Message::system("Alice has joined the conversation");
    /// assert_eq!(notice.role, Role::System);
    /// assert_eq!(notice.agent_id, "system");
    /// ```
    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", "System", "system", Role::System, content)
    }

    /// Attach metrics (builder pattern).
    pub fn with_metrics(mut self, metrics: MessageMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Whether this message was authored by the given agent id.
    pub fn is_from(&self, agent_id: &str) -> bool {
        self.agent_id == agent_id
    }
}

/// Serde adapter storing a [`Duration`] as whole milliseconds.
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
