//! Orchestrator configuration.
//!
//! [`OrchestratorConfig`] is a plain struct: build it with `Default` plus the `with_*`
//! methods, or deserialize it from whatever file format the host application prefers.
//! No parsing dependencies are pulled in here.
//!
//! ```rust
//! use roundtable::config::{ConversationMode, OrchestratorConfig};
//! use std::time::Duration;
//!
//! let config = OrchestratorConfig::default()
//!     .with_mode(ConversationMode::Reactive)
//!     .with_max_turns(12)
//!     .with_response_delay(Duration::from_millis(250))
//!     .with_initial_prompt("Is Rust a good first language?");
//!
//! assert_eq!(config.turn_timeout, Duration::from_secs(30));
//! assert_eq!("free-form".parse::<ConversationMode>().unwrap(), ConversationMode::FreeForm);
//! ```

use crate::roundtable::message::duration_millis;
use crate::roundtable::orchestrator::OrchestratorError;
use crate::roundtable::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Turn-taking policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConversationMode {
    /// Agents speak in registration order; a full pass is one turn.
    RoundRobin,
    /// A random available agent speaks, never the same one twice in a row.
    Reactive,
    /// Every agent is invited each cycle unless it authored the latest message.
    FreeForm,
}

impl fmt::Display for ConversationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationMode::RoundRobin => write!(f, "round-robin"),
            ConversationMode::Reactive => write!(f, "reactive"),
            ConversationMode::FreeForm => write!(f, "free-form"),
        }
    }
}

impl FromStr for ConversationMode {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "round-robin" | "roundrobin" => Ok(ConversationMode::RoundRobin),
            "reactive" => Ok(ConversationMode::Reactive),
            "free-form" | "freeform" => Ok(ConversationMode::FreeForm),
            _ => Err(OrchestratorError::UnknownMode(s.to_string())),
        }
    }
}

/// Settings for one [`Orchestrator`](crate::orchestrator::Orchestrator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub mode: ConversationMode,
    /// Upper bound on a single agent attempt, in milliseconds when serialized. Zero
    /// disables it.
    #[serde(with = "duration_millis")]
    pub turn_timeout: Duration,
    /// Pause between turns, in milliseconds when serialized.
    #[serde(with = "duration_millis")]
    pub response_delay: Duration,
    /// `0` means no limit.
    pub max_turns: usize,
    pub retry: RetryPolicy,
    /// Posted as a user message before the first turn; empty means none.
    pub initial_prompt: String,
    /// Post each agent's [`announce`](crate::agent::Agent::announce) line on start.
    pub announce_agents: bool,
    /// Invoke agents through [`stream_message`](crate::agent::Agent::stream_message).
    pub streaming: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mode: ConversationMode::RoundRobin,
            turn_timeout: Duration::from_secs(30),
            response_delay: Duration::from_secs(1),
            max_turns: 0,
            retry: RetryPolicy::default(),
            initial_prompt: String::new(),
            announce_agents: true,
            streaming: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_mode(mut self, mode: ConversationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = timeout;
        self
    }

    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_initial_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.initial_prompt = prompt.into();
        self
    }

    pub fn with_announce_agents(mut self, announce: bool) -> Self {
        self.announce_agents = announce;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.mode, ConversationMode::RoundRobin);
        assert_eq!(config.response_delay, Duration::from_secs(1));
        assert_eq!(config.max_turns, 0);
        assert_eq!(config.retry, RetryPolicy::default());
        assert!(config.announce_agents);
        assert!(!config.streaming);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("Round_Robin".parse::<ConversationMode>().unwrap(), ConversationMode::RoundRobin);
        assert_eq!(" reactive ".parse::<ConversationMode>().unwrap(), ConversationMode::Reactive);
        match "debate".parse::<ConversationMode>() {
            Err(OrchestratorError::UnknownMode(mode)) => assert_eq!(mode, "debate"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_mode_display_round_trips() {
        for mode in [
            ConversationMode::RoundRobin,
            ConversationMode::Reactive,
            ConversationMode::FreeForm,
        ] {
            assert_eq!(mode.to_string().parse::<ConversationMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"mode":"free-form","max_turns":4}"#).unwrap();
        assert_eq!(config.mode, ConversationMode::FreeForm);
        assert_eq!(config.max_turns, 4);
        assert_eq!(config.turn_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_partial_retry_block_loads() {
        let config: OrchestratorConfig = serde_json::from_str(
            r#"{"turn_timeout":1500,"retry":{"max_retries":0,"multiplier":3.0}}"#,
        )
        .unwrap();
        assert_eq!(config.turn_timeout, Duration::from_millis(1500));
        assert_eq!(config.response_delay, Duration::from_secs(1));

        let retry = config.retry.resolved();
        assert_eq!(retry.max_retries, 0);
        assert_eq!(retry.multiplier, 3.0);
        assert_eq!(retry.initial_delay, crate::retry::DEFAULT_INITIAL_DELAY);
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = OrchestratorConfig::default().with_max_turns(6);
        let json = serde_json::to_string(&config).unwrap();
        let back: OrchestratorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
