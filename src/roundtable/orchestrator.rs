//! The conversation loop.
//!
//! An [`Orchestrator`] owns a set of agents, the shared [`ConversationHistory`], one
//! [`RateLimiter`](crate::rate_limit::RateLimiter) per agent and a [`MiddlewareChain`].
//! [`Orchestrator::start`] runs the conversation until `max_turns` is reached or the
//! [`RunContext`] ends.
//!
//! Each turn:
//!
//! 1. the scheduler picks an agent according to the [`ConversationMode`];
//! 2. the agent's limiter is awaited;
//! 3. the agent is called with the full history, with a per-attempt timeout and
//!    exponential backoff between attempts;
//! 4. the reply is wrapped in a [`Message`] with estimated usage, run through the
//!    middleware chain and appended to history;
//! 5. message hooks, the chat logger, lifecycle events and metrics are notified.
//!
//! A failed or rejected turn is logged and reported; the conversation carries on with
//! the next agent. Only the end of the context stops a run early.
//!
//! All methods take `&self`, so an orchestrator is usually shared behind an `Arc` and
//! [`start`](Orchestrator::start) is spawned while other tasks inject messages or poll
//! [`status`](Orchestrator::status).
//!
//! # Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use roundtable::agent::{Agent, AgentError};
//! use roundtable::config::{ConversationMode, OrchestratorConfig};
//! use roundtable::context::RunContext;
//! use roundtable::message::Message;
//! use roundtable::orchestrator::Orchestrator;
//! use std::sync::Arc;
//!
//! struct Parrot(&'static str);
//!
//! #[async_trait]
//! impl Agent for Parrot {
//!     fn id(&self) -> &str { self.0 }
//!     fn name(&self) -> &str { self.0 }
//!     fn agent_type(&self) -> &str { "mock" }
//!     async fn send_message(&self, history: &[Message]) -> Result<String, AgentError> {
//!         Ok(format!("{} heard {} messages", self.0, history.len()))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = OrchestratorConfig::default()
//!         .with_mode(ConversationMode::RoundRobin)
//!         .with_max_turns(3)
//!         .with_initial_prompt("Introduce yourselves.");
//!     let orchestrator = Orchestrator::new(config);
//!     orchestrator.add_agent(Arc::new(Parrot("alice")))?;
//!     orchestrator.add_agent(Arc::new(Parrot("bob")))?;
//!
//!     let summary = orchestrator.start(&RunContext::new()).await?;
//!     println!("{}", summary.describe());
//!     Ok(())
//! }
//! ```

use crate::roundtable::agent::{Agent, AgentError};
use crate::roundtable::config::{ConversationMode, OrchestratorConfig};
use crate::roundtable::context::{ContextError, RunContext};
use crate::roundtable::event::{ConversationEvent, EventHandler};
use crate::roundtable::history::ConversationHistory;
use crate::roundtable::message::{Message, Role};
use crate::roundtable::middleware::{Middleware, MiddlewareChain, MiddlewareContext, MiddlewareError};
use crate::roundtable::rate_limit::{RateLimiter, RateLimiterRegistry};
use crate::roundtable::retry::{backoff_delay, classify_error, ErrorKind};
use crate::roundtable::sink::{ChatLogger, MetricsSink, RequestOutcome};
use crate::roundtable::usage::UsageEstimator;
use rand::seq::SliceRandom;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// Author id used for the initial prompt.
pub const HOST_ID: &str = "host";

const MIN_IDLE: Duration = Duration::from_millis(10);

/// Observer called for every message appended to history.
pub type MessageHook = Arc<dyn Fn(&Message) + Send + Sync>;

/// Errors that stop [`Orchestrator::start`] or reject a registration.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    /// [`Orchestrator::start`] was called before any agent was added.
    NoAgents,
    /// A conversation mode name did not match any known mode.
    UnknownMode(String),
    /// An agent with this id is already registered.
    DuplicateAgent(String),
    /// The conversation has already been started.
    AlreadyRunning,
    /// The run context ended before the conversation finished.
    Interrupted(ContextError),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::NoAgents => write!(f, "No agents in conversation"),
            OrchestratorError::UnknownMode(mode) => write!(f, "Unknown conversation mode: {}", mode),
            OrchestratorError::DuplicateAgent(id) => {
                write!(f, "Agent with id '{}' already exists", id)
            }
            OrchestratorError::AlreadyRunning => write!(f, "Conversation already started"),
            OrchestratorError::Interrupted(e) => write!(f, "Conversation interrupted: {}", e),
        }
    }
}

impl Error for OrchestratorError {}

/// Why a single turn produced no message.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnError {
    /// The context ended while waiting on the agent's rate limiter.
    RateLimiterWait(ContextError),
    /// Every attempt failed.
    AgentFailed {
        agent_id: String,
        agent_name: String,
        attempts: u32,
        kind: ErrorKind,
        message: String,
    },
    /// The middleware chain dropped the message.
    Rejected(MiddlewareError),
    /// The context ended during an agent call or backoff.
    Cancelled(ContextError),
}

impl TurnError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TurnError::AgentFailed { kind, .. } => *kind,
            TurnError::Rejected(MiddlewareError::RateLimited { .. }) => ErrorKind::RateLimit,
            TurnError::RateLimiterWait(ContextError::DeadlineExceeded)
            | TurnError::Cancelled(ContextError::DeadlineExceeded) => ErrorKind::Timeout,
            _ => ErrorKind::Unknown,
        }
    }

    /// The context error behind this failure, if the run itself is ending.
    pub fn context_error(&self) -> Option<ContextError> {
        match self {
            TurnError::RateLimiterWait(e) | TurnError::Cancelled(e) => Some(*e),
            _ => None,
        }
    }
}

impl fmt::Display for TurnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnError::RateLimiterWait(e) => write!(f, "rate limiter wait aborted: {}", e),
            TurnError::AgentFailed {
                agent_id,
                agent_name,
                attempts,
                kind,
                message,
            } => write!(
                f,
                "agent {} ({}) failed after {} attempt(s) [{}]: {}",
                agent_name, agent_id, attempts, kind, message
            ),
            TurnError::Rejected(e) => write!(f, "message rejected: {}", e),
            TurnError::Cancelled(e) => write!(f, "turn cancelled: {}", e),
        }
    }
}

impl Error for TurnError {}

/// Lifecycle of one orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationStatus {
    NotStarted,
    Running,
    Completed,
    Interrupted,
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationStatus::NotStarted => write!(f, "not started"),
            ConversationStatus::Running => write!(f, "running"),
            ConversationStatus::Completed => write!(f, "completed"),
            ConversationStatus::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Totals reported when a run ends.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub status: ConversationStatus,
    pub total_messages: usize,
    pub total_turns: usize,
    pub total_tokens: usize,
    pub total_cost: f64,
    pub duration: Duration,
}

impl ConversationSummary {
    pub fn describe(&self) -> String {
        format!(
            "conversation {} after {} turn(s): {} message(s), {} token(s), ${:.4} in {:.1}s",
            self.status,
            self.total_turns,
            self.total_messages,
            self.total_tokens,
            self.total_cost,
            self.duration.as_secs_f64()
        )
    }
}

struct State {
    agents: Vec<Arc<dyn Agent>>,
    hooks: Vec<MessageHook>,
    middleware: MiddlewareChain,
    turn: usize,
    status: ConversationStatus,
    last_speaker: Option<String>,
}

/// Coordinates a conversation between registered agents.
pub struct Orchestrator {
    conversation_id: String,
    config: OrchestratorConfig,
    state: RwLock<State>,
    history: ConversationHistory,
    limiters: Arc<RateLimiterRegistry>,
    usage: UsageEstimator,
    event_handler: Option<Arc<dyn EventHandler>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    chat_logger: Option<Arc<dyn ChatLogger>>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            conversation_id: uuid::Uuid::new_v4().to_string(),
            config,
            state: RwLock::new(State {
                agents: Vec::new(),
                hooks: Vec::new(),
                middleware: MiddlewareChain::new(),
                turn: 0,
                status: ConversationStatus::NotStarted,
                last_speaker: None,
            }),
            history: ConversationHistory::new(),
            limiters: Arc::new(RateLimiterRegistry::new()),
            usage: UsageEstimator::new(),
            event_handler: None,
            metrics: None,
            chat_logger: None,
        }
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_chat_logger(mut self, logger: Arc<dyn ChatLogger>) -> Self {
        self.chat_logger = Some(logger);
        self
    }

    pub fn with_usage_estimator(mut self, usage: UsageEstimator) -> Self {
        self.usage = usage;
        self
    }

    /// Share a limiter registry with other orchestrators. Agents with the same id then
    /// draw from the same bucket.
    pub fn with_rate_limiters(mut self, registry: Arc<RateLimiterRegistry>) -> Self {
        self.limiters = registry;
        self
    }

    pub fn with_middleware(self, chain: MiddlewareChain) -> Self {
        self.write().middleware = chain;
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Register an agent and create its rate limiter.
    pub fn add_agent(&self, agent: Arc<dyn Agent>) -> Result<(), OrchestratorError> {
        let mut state = self.write();
        if state.agents.iter().any(|a| a.id() == agent.id()) {
            return Err(OrchestratorError::DuplicateAgent(agent.id().to_string()));
        }
        self.limiters
            .get_or_create(agent.id(), agent.rate_limit(), agent.rate_limit_burst());
        log::debug!("registered agent {} ({})", agent.name(), agent.id());
        state.agents.push(agent);
        Ok(())
    }

    /// Agent ids in registration order.
    pub fn agent_ids(&self) -> Vec<String> {
        self.read().agents.iter().map(|a| a.id().to_string()).collect()
    }

    /// The limiter guarding `agent_id`, if the agent is registered.
    pub fn rate_limiter(&self, agent_id: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(agent_id)
    }

    /// Append a middleware to the end of the chain.
    pub fn add_middleware<M>(&self, middleware: M)
    where
        M: Middleware + 'static,
    {
        self.write().middleware.add(middleware);
    }

    /// Register an observer for every appended message.
    ///
    /// Hooks run in registration order with no lock held, so they may call
    /// [`inject_message`](Orchestrator::inject_message).
    pub fn add_message_hook<F>(&self, hook: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.write().hooks.push(Arc::new(hook));
    }

    /// Append a message from outside the agent set (a human, a bridge). It skips the
    /// middleware chain but is seen by hooks and the chat logger.
    pub fn inject_message(&self, message: Message) {
        self.append_and_notify(message);
    }

    /// Copy of the full history.
    pub fn get_messages(&self) -> Vec<Message> {
        self.history.snapshot()
    }

    pub fn status(&self) -> ConversationStatus {
        self.read().status
    }

    pub fn turn_count(&self) -> usize {
        self.read().turn
    }

    /// Run every agent's health check under the turn timeout and return the failures.
    ///
    /// A zero `turn_timeout` leaves the checks unbounded, as it does for turns.
    pub async fn health_check_agents(&self, ctx: &RunContext) -> Vec<(String, AgentError)> {
        let mut failures = Vec::new();
        for agent in self.agents() {
            let outcome = if self.config.turn_timeout.is_zero() {
                ctx.run(agent.health_check()).await
            } else {
                ctx.run(tokio::time::timeout(self.config.turn_timeout, agent.health_check()))
                    .await
                    .map(|timed| timed.unwrap_or_else(|elapsed| Err(Box::new(elapsed) as AgentError)))
            };
            let err: AgentError = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(ctx_err) => Box::new(ctx_err),
            };
            log::warn!("health check failed for {}: {}", agent.id(), err);
            failures.push((agent.id().to_string(), err));
        }
        failures
    }

    /// Close the event handler.
    pub async fn shutdown(&self) {
        if let Some(handler) = &self.event_handler {
            handler.close().await;
        }
    }

    /// Run the conversation.
    ///
    /// Configuration problems are reported before anything happens. When the context
    /// ends first the status becomes [`ConversationStatus::Interrupted`] and
    /// [`OrchestratorError::Interrupted`] is returned.
    pub async fn start(&self, ctx: &RunContext) -> Result<ConversationSummary, OrchestratorError> {
        let participants = {
            let mut state = self.write();
            if state.agents.is_empty() {
                return Err(OrchestratorError::NoAgents);
            }
            if state.status != ConversationStatus::NotStarted {
                return Err(OrchestratorError::AlreadyRunning);
            }
            state.status = ConversationStatus::Running;
            state
                .agents
                .iter()
                .map(|a| a.id().to_string())
                .collect::<Vec<_>>()
        };

        let started = Instant::now();
        log::info!(
            "conversation {} starting: mode={}, agents={}, max_turns={}",
            self.conversation_id,
            self.config.mode,
            participants.len(),
            self.config.max_turns
        );
        if let Some(metrics) = &self.metrics {
            metrics.adjust_active_conversations(1);
        }
        self.emit(ConversationEvent::ConversationStarted {
            conversation_id: self.conversation_id.clone(),
            mode: self.config.mode,
            initial_prompt: self.config.initial_prompt.clone(),
            max_turns: self.config.max_turns,
            participants,
        })
        .await;

        self.post_preamble();

        let result = match self.config.mode {
            ConversationMode::RoundRobin => self.run_round_robin(ctx).await,
            ConversationMode::Reactive => self.run_reactive(ctx).await,
            ConversationMode::FreeForm => self.run_free_form(ctx).await,
        };

        let status = match result {
            Ok(()) => ConversationStatus::Completed,
            Err(_) => ConversationStatus::Interrupted,
        };
        self.write().status = status;
        if let Some(metrics) = &self.metrics {
            metrics.adjust_active_conversations(-1);
        }

        let summary = self.summarize(status, started.elapsed());
        log::info!("conversation {} {}", self.conversation_id, summary.describe());
        self.emit(ConversationEvent::ConversationCompleted {
            conversation_id: self.conversation_id.clone(),
            status,
            total_messages: summary.total_messages,
            total_turns: summary.total_turns,
            total_tokens: summary.total_tokens,
            total_cost: summary.total_cost,
            duration: summary.duration,
            summary: summary.describe(),
            error: result.err().map(|e| e.to_string()),
        })
        .await;

        match result {
            Ok(()) => Ok(summary),
            Err(e) => Err(OrchestratorError::Interrupted(e)),
        }
    }

    fn post_preamble(&self) {
        if self.config.announce_agents {
            for agent in self.agents() {
                let announcement = agent.announce();
                if let Some(logger) = &self.chat_logger {
                    logger.log_system(&announcement);
                }
                self.append_and_notify(Message::system(announcement));
            }
        }
        if !self.config.initial_prompt.is_empty() {
            self.append_and_notify(Message::new(
                HOST_ID,
                "Host",
                HOST_ID,
                Role::User,
                self.config.initial_prompt.clone(),
            ));
        }
    }

    async fn run_round_robin(&self, ctx: &RunContext) -> Result<(), ContextError> {
        loop {
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            let turn = self.turn_count();
            if self.max_turns_reached(turn) {
                return Ok(());
            }

            for agent in self.agents() {
                if let Some(err) = ctx.err() {
                    return Err(err);
                }
                if !agent.is_available() {
                    log::debug!("skipping unavailable agent {}", agent.id());
                    continue;
                }
                if let Err(err) = self.get_agent_response(ctx, &agent, turn + 1).await {
                    self.handle_turn_error(&agent, err).await?;
                }
                self.pace(ctx).await?;
            }

            self.write().turn += 1;
            self.record_turn();
        }
    }

    async fn run_reactive(&self, ctx: &RunContext) -> Result<(), ContextError> {
        loop {
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            let turn = self.turn_count();
            if self.max_turns_reached(turn) {
                return Ok(());
            }

            let agents = self.agents();
            let last_speaker = self.read().last_speaker.clone();
            let Some(agent) = pick_reactive(&agents, last_speaker.as_deref()) else {
                log::debug!("no eligible speaker, idling");
                ctx.sleep(self.config.response_delay.max(MIN_IDLE)).await?;
                continue;
            };

            match self.get_agent_response(ctx, &agent, turn + 1).await {
                Ok(_) => {
                    {
                        let mut state = self.write();
                        state.turn += 1;
                        state.last_speaker = Some(agent.id().to_string());
                    }
                    self.record_turn();
                }
                Err(err) => self.handle_turn_error(&agent, err).await?,
            }
            self.pace(ctx).await?;
        }
    }

    async fn run_free_form(&self, ctx: &RunContext) -> Result<(), ContextError> {
        loop {
            if let Some(err) = ctx.err() {
                return Err(err);
            }

            let mut invited = false;
            for agent in self.agents() {
                if let Some(err) = ctx.err() {
                    return Err(err);
                }
                let turn = self.turn_count();
                if self.max_turns_reached(turn) {
                    return Ok(());
                }
                if !agent.is_available() {
                    continue;
                }
                if self.history.last_author().as_deref() == Some(agent.id()) {
                    continue;
                }

                invited = true;
                match self.get_agent_response(ctx, &agent, turn + 1).await {
                    Ok(_) => {
                        self.write().turn += 1;
                        self.record_turn();
                    }
                    Err(err) => self.handle_turn_error(&agent, err).await?,
                }
                self.pace(ctx).await?;
            }

            if !invited {
                ctx.sleep(self.config.response_delay.max(MIN_IDLE)).await?;
            }
        }
    }

    /// One agent turn: limiter, attempts with backoff, middleware, commit.
    async fn get_agent_response(
        &self,
        ctx: &RunContext,
        agent: &Arc<dyn Agent>,
        turn_number: usize,
    ) -> Result<Message, TurnError> {
        let limiter =
            self.limiters
                .get_or_create(agent.id(), agent.rate_limit(), agent.rate_limit_burst());
        if !limiter.allow() {
            if let Some(metrics) = &self.metrics {
                metrics.record_rate_limit_hit(agent.id());
            }
            log::debug!("{} is rate limited, waiting for a token", agent.id());
            limiter.wait(ctx).await.map_err(TurnError::RateLimiterWait)?;
        }

        let history = self.history.snapshot();
        let policy = self.config.retry.resolved();
        let attempts = policy.max_attempts();
        let mut last_error: AgentError = "no attempt made".into();
        let mut reply = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = backoff_delay(attempt, &policy);
                if let Some(metrics) = &self.metrics {
                    metrics.record_retry(agent.id(), attempt);
                }
                log::debug!(
                    "retrying {} in {:?} (attempt {}/{})",
                    agent.id(),
                    delay,
                    attempt + 1,
                    attempts
                );
                ctx.sleep(delay).await.map_err(TurnError::Cancelled)?;
            }

            let started = Instant::now();
            let outcome = self
                .invoke(ctx, agent.as_ref(), &history)
                .await
                .map_err(TurnError::Cancelled)?;
            let elapsed = started.elapsed();

            match outcome {
                Ok(content) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_request(agent.id(), RequestOutcome::Success, elapsed);
                    }
                    reply = Some((content, elapsed));
                    break;
                }
                Err(e) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_request(agent.id(), RequestOutcome::Failure, elapsed);
                    }
                    let kind = classify_error(&e);
                    if kind == ErrorKind::RateLimit {
                        limiter.pause(backoff_delay(attempt + 1, &policy));
                    }
                    log::warn!(
                        "{} ({}) attempt {}/{} failed [{}]: {}",
                        agent.name(),
                        agent.id(),
                        attempt + 1,
                        attempts,
                        kind,
                        e
                    );
                    last_error = e;
                }
            }
        }

        let Some((content, elapsed)) = reply else {
            let kind = classify_error(&last_error);
            log::error!(
                "{} ({}) gave up after {} attempt(s) [{}]: {}",
                agent.name(),
                agent.id(),
                attempts,
                kind,
                last_error
            );
            return Err(TurnError::AgentFailed {
                agent_id: agent.id().to_string(),
                agent_name: agent.name().to_string(),
                attempts,
                kind,
                message: last_error.to_string(),
            });
        };

        let usage = self.usage.estimate(&history, &content, agent.model(), elapsed);
        let message = Message::new(agent.id(), agent.name(), agent.agent_type(), Role::Agent, content)
            .with_metrics(usage.clone());

        let chain = self.read().middleware.clone();
        let mut mw_ctx = MiddlewareContext::new(agent.id(), agent.name(), turn_number);
        let message = chain
            .process(&mut mw_ctx, message)
            .await
            .map_err(TurnError::Rejected)?;

        self.append_and_notify(message.clone());
        if let Some(metrics) = &self.metrics {
            metrics.record_tokens(agent.id(), usage.input_tokens, usage.output_tokens);
            metrics.record_cost(agent.id(), usage.cost);
        }
        log::debug!(
            "turn {}: {} replied ({} chars, {:?})",
            turn_number,
            agent.id(),
            message.content.len(),
            elapsed
        );
        self.emit(ConversationEvent::MessageCreated {
            conversation_id: self.conversation_id.clone(),
            agent_id: message.agent_id.clone(),
            agent_name: message.agent_name.clone(),
            agent_type: message.agent_type.clone(),
            role: message.role,
            content: message.content.clone(),
            turn_number,
            total_tokens: usage.total_tokens,
            cost: usage.cost,
            duration: elapsed,
        })
        .await;

        Ok(message)
    }

    /// Single attempt under the turn timeout. The outer error means the context ended.
    async fn invoke(
        &self,
        ctx: &RunContext,
        agent: &dyn Agent,
        history: &[Message],
    ) -> Result<Result<String, AgentError>, ContextError> {
        let call = async {
            if self.config.streaming {
                collect_stream(agent, history).await
            } else {
                agent.send_message(history).await
            }
        };
        if self.config.turn_timeout.is_zero() {
            return ctx.run(call).await;
        }
        match ctx.run(tokio::time::timeout(self.config.turn_timeout, call)).await? {
            Ok(result) => Ok(result),
            Err(elapsed) => Ok(Err(Box::new(elapsed) as AgentError)),
        }
    }

    /// Report a failed turn. Returns the context error when the run has to stop.
    async fn handle_turn_error(
        &self,
        agent: &Arc<dyn Agent>,
        err: TurnError,
    ) -> Result<(), ContextError> {
        if let Some(ctx_err) = err.context_error() {
            if matches!(err, TurnError::RateLimiterWait(_)) {
                log::warn!("{}: {}", agent.id(), err);
            }
            return Err(ctx_err);
        }

        let kind = err.kind();
        match &err {
            TurnError::Rejected(e) => log::warn!("{} ({}): {}", agent.name(), agent.id(), e),
            _ => log::warn!("{}", err),
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_error(agent.id(), kind);
        }
        if let Some(logger) = &self.chat_logger {
            logger.log_error(agent.name(), &err.to_string());
        }
        self.emit(ConversationEvent::ConversationError {
            conversation_id: self.conversation_id.clone(),
            agent_id: agent.id().to_string(),
            agent_type: agent.agent_type().to_string(),
            kind,
            message: err.to_string(),
        })
        .await;
        Ok(())
    }

    fn append_and_notify(&self, message: Message) {
        self.history.append(message.clone());
        let hooks = self.read().hooks.clone();
        for hook in hooks {
            hook(&message);
        }
        if let Some(logger) = &self.chat_logger {
            logger.log_message(&message);
        }
    }

    async fn pace(&self, ctx: &RunContext) -> Result<(), ContextError> {
        if self.config.response_delay.is_zero() {
            return match ctx.err() {
                Some(err) => Err(err),
                None => Ok(()),
            };
        }
        ctx.sleep(self.config.response_delay).await
    }

    async fn emit(&self, event: ConversationEvent) {
        if let Some(handler) = &self.event_handler {
            handler.on_event(&event).await;
        }
    }

    fn agents(&self) -> Vec<Arc<dyn Agent>> {
        self.read().agents.clone()
    }

    fn max_turns_reached(&self, turn: usize) -> bool {
        self.config.max_turns > 0 && turn >= self.config.max_turns
    }

    fn record_turn(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_turn(self.config.mode);
        }
    }

    fn summarize(&self, status: ConversationStatus, duration: Duration) -> ConversationSummary {
        let messages = self.history.snapshot();
        let (total_tokens, total_cost) = messages
            .iter()
            .filter_map(|m| m.metrics.as_ref())
            .fold((0, 0.0), |(tokens, cost), m| (tokens + m.total_tokens, cost + m.cost));
        ConversationSummary {
            conversation_id: self.conversation_id.clone(),
            status,
            total_messages: messages.len(),
            total_turns: self.turn_count(),
            total_tokens,
            total_cost,
            duration,
        }
    }
}

/// Random available agent, excluding the previous speaker when there is a choice of
/// registered agents.
fn pick_reactive(agents: &[Arc<dyn Agent>], last_speaker: Option<&str>) -> Option<Arc<dyn Agent>> {
    let candidates: Vec<&Arc<dyn Agent>> = agents
        .iter()
        .filter(|a| a.is_available())
        .filter(|a| agents.len() < 2 || Some(a.id()) != last_speaker)
        .collect();
    candidates.choose(&mut rand::thread_rng()).map(|a| Arc::clone(a))
}

async fn collect_stream(agent: &dyn Agent, history: &[Message]) -> Result<String, AgentError> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    agent.stream_message(history, tx).await?;
    let mut content = String::new();
    while let Some(chunk) = rx.recv().await {
        content.push_str(&chunk);
    }
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Named {
        id: String,
        available: bool,
    }

    fn named(id: &str, available: bool) -> Arc<dyn Agent> {
        Arc::new(Named {
            id: id.to_string(),
            available,
        })
    }

    #[async_trait]
    impl Agent for Named {
        fn id(&self) -> &str {
            &self.id
        }
        fn name(&self) -> &str {
            &self.id
        }
        fn agent_type(&self) -> &str {
            "mock"
        }
        fn is_available(&self) -> bool {
            self.available
        }
        async fn send_message(&self, _history: &[Message]) -> Result<String, AgentError> {
            Ok(format!("hi from {}", self.id))
        }
    }

    fn quick_config() -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_response_delay(Duration::ZERO)
            .with_announce_agents(false)
    }

    #[tokio::test]
    async fn test_start_without_agents() {
        let orchestrator = Orchestrator::new(quick_config());
        let err = orchestrator.start(&RunContext::new()).await.unwrap_err();
        assert_eq!(err, OrchestratorError::NoAgents);
        assert_eq!(orchestrator.status(), ConversationStatus::NotStarted);
        assert!(orchestrator.get_messages().is_empty());
    }

    #[test]
    fn test_duplicate_agent_rejected() {
        let orchestrator = Orchestrator::new(quick_config());
        orchestrator.add_agent(named("a", true)).unwrap();
        let err = orchestrator.add_agent(named("a", true)).unwrap_err();
        assert_eq!(err, OrchestratorError::DuplicateAgent("a".to_string()));
        assert_eq!(orchestrator.agent_ids(), vec!["a"]);
        assert!(orchestrator.rate_limiter("a").is_some());
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let orchestrator = Orchestrator::new(quick_config().with_max_turns(1));
        orchestrator.add_agent(named("a", true)).unwrap();
        orchestrator.start(&RunContext::new()).await.unwrap();
        let err = orchestrator.start(&RunContext::new()).await.unwrap_err();
        assert_eq!(err, OrchestratorError::AlreadyRunning);
        assert_eq!(orchestrator.status(), ConversationStatus::Completed);
    }

    #[tokio::test]
    async fn test_preamble_order() {
        let config = quick_config()
            .with_announce_agents(true)
            .with_initial_prompt("topic")
            .with_max_turns(1);
        let orchestrator = Orchestrator::new(config);
        orchestrator.add_agent(named("a", true)).unwrap();
        orchestrator.add_agent(named("b", true)).unwrap();
        orchestrator.start(&RunContext::new()).await.unwrap();

        let messages = orchestrator.get_messages();
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "a has joined the conversation.");
        assert_eq!(messages[1].role, Role::System);
        assert_eq!(messages[2].role, Role::User);
        assert_eq!(messages[2].agent_id, HOST_ID);
        assert_eq!(messages[3].agent_id, "a");
        assert_eq!(messages[4].agent_id, "b");
    }

    #[test]
    fn test_pick_reactive_skips_last_and_unavailable() {
        let agents = vec![named("a", true), named("b", true), named("c", false)];
        for _ in 0..50 {
            let picked = pick_reactive(&agents, Some("a")).unwrap();
            assert_eq!(picked.id(), "b");
        }
        let solo = vec![named("a", true)];
        assert_eq!(pick_reactive(&solo, Some("a")).unwrap().id(), "a");
        let none = vec![named("a", true), named("b", false)];
        assert!(pick_reactive(&none, Some("a")).is_none());
    }

    #[tokio::test]
    async fn test_free_form_skips_latest_author() {
        let orchestrator = Orchestrator::new(quick_config().with_mode(ConversationMode::FreeForm).with_max_turns(4));
        orchestrator.add_agent(named("a", true)).unwrap();
        orchestrator.add_agent(named("b", true)).unwrap();
        orchestrator.start(&RunContext::new()).await.unwrap();

        let authors: Vec<_> = orchestrator
            .get_messages()
            .into_iter()
            .map(|m| m.agent_id)
            .collect();
        assert_eq!(authors, vec!["a", "b", "a", "b"]);
        assert_eq!(orchestrator.turn_count(), 4);
    }

    #[test]
    fn test_turn_error_kind() {
        let rejected = TurnError::Rejected(MiddlewareError::RateLimited {
            agent_id: "a".into(),
            window: "minute".into(),
        });
        assert_eq!(rejected.kind(), ErrorKind::RateLimit);
        assert_eq!(rejected.context_error(), None);
        let cancelled = TurnError::Cancelled(ContextError::Cancelled);
        assert_eq!(cancelled.context_error(), Some(ContextError::Cancelled));
    }
}
