//! # roundtable
//!
//! roundtable coordinates a conversation between several autonomous agents, typically
//! LLM-backed participants. It decides who speaks next, paces each agent against its own
//! rate limit, retries transient failures with exponential backoff, and runs every reply
//! through a middleware pipeline before committing it to a shared history.
//!
//! The crate provides:
//!
//! * **Orchestration**: [`Orchestrator`] runs the conversation loop in one of three
//!   [`ConversationMode`]s: round-robin, reactive (random speaker, never twice in a row),
//!   or free-form (everyone may answer anyone else).
//! * **Rate limiting**: [`rate_limit::RateLimiter`] token buckets with cancellable waits and
//!   cooldowns, held in an explicit [`rate_limit::RateLimiterRegistry`].
//! * **Retries**: [`retry::RetryPolicy`] and the deterministic [`retry::backoff_delay`].
//! * **Middleware**: [`middleware::MiddlewareChain`] plus ready-made filters, sanitisers,
//!   recorders and a panic-recovery wrapper in [`middleware::builtin`].
//! * **Observability seams**: [`event::EventHandler`], [`sink::MetricsSink`] and
//!   [`sink::ChatLogger`], each with a simple built-in implementation.
//!
//! Concrete agents (CLI wrappers, HTTP clients) live outside this crate; implement
//! [`Agent`] to plug one in.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use roundtable::{Agent, AgentError, ConversationMode, Message, Orchestrator, OrchestratorConfig, RunContext};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct Critic;
//!
//! #[async_trait]
//! impl Agent for Critic {
//!     fn id(&self) -> &str { "critic" }
//!     fn name(&self) -> &str { "Critic" }
//!     fn agent_type(&self) -> &str { "mock" }
//!     async fn send_message(&self, history: &[Message]) -> Result<String, AgentError> {
//!         Ok(format!("I disagree with message #{}", history.len()))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     roundtable::init_logger();
//!
//!     let orchestrator = Arc::new(Orchestrator::new(
//!         OrchestratorConfig::default()
//!             .with_mode(ConversationMode::RoundRobin)
//!             .with_max_turns(5)
//!             .with_response_delay(Duration::from_millis(200)),
//!     ));
//!     orchestrator.add_agent(Arc::new(Critic))?;
//!
//!     let ctx = RunContext::with_timeout(Duration::from_secs(60));
//!     let summary = orchestrator.start(&ctx).await?;
//!     println!("{}", summary.describe());
//!     Ok(())
//! }
//! ```

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// Applications that already installed a logger keep theirs.
///
/// ```rust
/// roundtable::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::try_init();
    });
}

pub mod roundtable;

pub use roundtable::agent;
pub use roundtable::agent::{Agent, AgentConfig, AgentError};
pub use roundtable::config;
pub use roundtable::config::{ConversationMode, OrchestratorConfig};
pub use roundtable::context;
pub use roundtable::context::{ContextError, RunContext};
pub use roundtable::event;
pub use roundtable::history;
pub use roundtable::message;
pub use roundtable::message::{Message, MessageMetrics, Role};
pub use roundtable::middleware;
pub use roundtable::orchestrator;
pub use roundtable::orchestrator::{
    ConversationStatus, ConversationSummary, Orchestrator, OrchestratorError, TurnError,
};
pub use roundtable::rate_limit;
pub use roundtable::retry;
pub use roundtable::sink;
pub use roundtable::usage;
