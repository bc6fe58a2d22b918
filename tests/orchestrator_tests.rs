use async_trait::async_trait;
use roundtable::agent::{Agent, AgentError};
use roundtable::config::{ConversationMode, OrchestratorConfig};
use roundtable::context::{ContextError, RunContext};
use roundtable::event::{ConversationEvent, EventHandler};
use roundtable::message::{Message, Role};
use roundtable::middleware::{middleware_fn, MiddlewareError};
use roundtable::orchestrator::{ConversationStatus, Orchestrator, OrchestratorError};
use roundtable::retry::{ErrorKind, RetryPolicy};
use roundtable::sink::InMemoryMetrics;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

struct MockAgent {
    id: String,
    calls: AtomicUsize,
    /// Number of leading calls that fail.
    fail_first: usize,
    always_fail: bool,
    error: String,
    latency: Duration,
    chunks: Vec<String>,
}

impl MockAgent {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            calls: AtomicUsize::new(0),
            fail_first: 0,
            always_fail: false,
            error: "backend exploded".to_string(),
            latency: Duration::ZERO,
            chunks: Vec::new(),
        }
    }

    fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    fn always_failing(mut self, error: &str) -> Self {
        self.always_fail = true;
        self.error = error.to_string();
        self
    }

    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn streaming(mut self, chunks: &[&str]) -> Self {
        self.chunks = chunks.iter().map(|c| c.to_string()).collect();
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for MockAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.id
    }

    fn agent_type(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-1"
    }

    async fn send_message(&self, history: &[Message]) -> Result<String, AgentError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.always_fail || call < self.fail_first {
            return Err(self.error.clone().into());
        }
        Ok(format!("{} reply #{} (saw {})", self.id, call + 1, history.len()))
    }

    async fn stream_message(
        &self,
        _history: &[Message],
        sink: UnboundedSender<String>,
    ) -> Result<(), AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for chunk in &self.chunks {
            sink.send(chunk.clone())
                .map_err(|_| -> AgentError { "sink closed".into() })?;
        }
        Ok(())
    }
}

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_delay: Duration::from_millis(2),
        max_delay: Duration::from_millis(10),
        multiplier: 2.0,
    }
}

fn base_config() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_response_delay(Duration::from_millis(1))
        .with_turn_timeout(Duration::from_secs(5))
        .with_announce_agents(false)
        .with_retry(fast_retry(3))
}

fn agent_messages(orchestrator: &Orchestrator) -> Vec<Message> {
    orchestrator
        .get_messages()
        .into_iter()
        .filter(|m| m.role == Role::Agent)
        .collect()
}

#[tokio::test]
async fn test_round_robin_alternates() {
    let a = Arc::new(MockAgent::new("a"));
    let b = Arc::new(MockAgent::new("b"));
    let orchestrator = Orchestrator::new(base_config().with_max_turns(2));
    orchestrator.add_agent(a.clone()).unwrap();
    orchestrator.add_agent(b.clone()).unwrap();

    let summary = orchestrator.start(&RunContext::new()).await.unwrap();

    assert_eq!(a.calls(), 2);
    assert_eq!(b.calls(), 2);
    let authors: Vec<_> = agent_messages(&orchestrator)
        .into_iter()
        .map(|m| m.agent_id)
        .collect();
    assert_eq!(authors, vec!["a", "b", "a", "b"]);
    assert_eq!(orchestrator.turn_count(), 2);
    assert_eq!(orchestrator.status(), ConversationStatus::Completed);
    assert_eq!(summary.status, ConversationStatus::Completed);
    assert_eq!(summary.total_messages, 4);
}

#[tokio::test]
async fn test_agent_messages_carry_metrics() {
    let orchestrator = Orchestrator::new(
        base_config()
            .with_max_turns(1)
            .with_initial_prompt("What is ownership?"),
    );
    orchestrator.add_agent(Arc::new(MockAgent::new("a"))).unwrap();
    orchestrator.start(&RunContext::new()).await.unwrap();

    let reply = agent_messages(&orchestrator).remove(0);
    let metrics = reply.metrics.expect("agent reply has metrics");
    assert_eq!(metrics.model, "mock-1");
    assert!(metrics.input_tokens > 0);
    assert!(metrics.output_tokens > 0);
    assert_eq!(metrics.total_tokens, metrics.input_tokens + metrics.output_tokens);
}

#[tokio::test]
async fn test_reactive_never_repeats_speaker() {
    let agents: Vec<Arc<MockAgent>> = ["a", "b", "c"]
        .iter()
        .map(|id| Arc::new(MockAgent::new(id)))
        .collect();
    let orchestrator = Orchestrator::new(
        base_config()
            .with_mode(ConversationMode::Reactive)
            .with_max_turns(30),
    );
    for agent in &agents {
        orchestrator.add_agent(agent.clone()).unwrap();
    }

    orchestrator.start(&RunContext::new()).await.unwrap();

    let messages = agent_messages(&orchestrator);
    assert_eq!(messages.len(), 30);
    for pair in messages.windows(2) {
        assert_ne!(pair[0].agent_id, pair[1].agent_id);
    }
    let total_calls: usize = agents.iter().map(|a| a.calls()).sum();
    assert_eq!(total_calls, 30);
}

#[tokio::test(start_paused = true)]
async fn test_reactive_failed_turn_keeps_last_speaker() {
    let steady = Arc::new(MockAgent::new("steady"));
    let broken = Arc::new(MockAgent::new("broken").always_failing("backend exploded"));
    let metrics = Arc::new(InMemoryMetrics::new());
    let orchestrator = Orchestrator::new(
        base_config()
            .with_mode(ConversationMode::Reactive)
            .with_max_turns(3)
            .with_retry(RetryPolicy::no_retries()),
    )
    .with_metrics(metrics.clone());
    orchestrator.add_agent(steady.clone()).unwrap();
    orchestrator.add_agent(broken.clone()).unwrap();

    // Once "steady" has spoken it stays the last speaker, because "broken" never
    // completes a turn. Only "broken" is ever eligible after that, so the run can
    // only end at the deadline.
    let ctx = RunContext::with_timeout(Duration::from_millis(500));
    let err = orchestrator.start(&ctx).await.unwrap_err();
    assert_eq!(err, OrchestratorError::Interrupted(ContextError::DeadlineExceeded));

    assert_eq!(steady.calls(), 1);
    assert_eq!(orchestrator.turn_count(), 1);
    assert_eq!(metrics.turns(ConversationMode::Reactive), 1);
    assert!(broken.calls() >= 2, "broken called {} times", broken.calls());
    assert_eq!(metrics.errors(ErrorKind::Unknown), broken.calls());

    let messages = agent_messages(&orchestrator);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].agent_id, "steady");
}

#[tokio::test]
async fn test_retry_then_success() {
    let flaky = Arc::new(MockAgent::new("flaky").failing_first(2));
    let metrics = Arc::new(InMemoryMetrics::new());
    let orchestrator = Orchestrator::new(base_config().with_max_turns(1).with_retry(fast_retry(3)))
        .with_metrics(metrics.clone());
    orchestrator.add_agent(flaky.clone()).unwrap();

    orchestrator.start(&RunContext::new()).await.unwrap();

    assert_eq!(flaky.calls(), 3);
    assert_eq!(agent_messages(&orchestrator).len(), 1);
    assert_eq!(metrics.retries(), 2);
    assert_eq!(metrics.failed_requests(), 2);
    assert_eq!(metrics.successful_requests(), 1);
}

#[tokio::test]
async fn test_retry_exhaustion_drops_turn() {
    let broken = Arc::new(MockAgent::new("broken").always_failing("model exploded"));
    let metrics = Arc::new(InMemoryMetrics::new());
    let orchestrator = Orchestrator::new(base_config().with_max_turns(1).with_retry(fast_retry(2)))
        .with_metrics(metrics.clone());
    orchestrator.add_agent(broken.clone()).unwrap();

    let summary = orchestrator.start(&RunContext::new()).await.unwrap();

    assert_eq!(broken.calls(), 3);
    assert!(agent_messages(&orchestrator).is_empty());
    assert_eq!(summary.status, ConversationStatus::Completed);
    assert_eq!(metrics.errors(ErrorKind::Unknown), 1);
}

#[tokio::test]
async fn test_explicit_zero_retries_makes_one_attempt() {
    let broken = Arc::new(MockAgent::new("broken").always_failing("nope"));
    let policy = RetryPolicy {
        max_retries: 0,
        initial_delay: Duration::from_millis(1),
        ..RetryPolicy::unset()
    };
    let orchestrator = Orchestrator::new(base_config().with_max_turns(1).with_retry(policy));
    orchestrator.add_agent(broken.clone()).unwrap();
    orchestrator.start(&RunContext::new()).await.unwrap();
    assert_eq!(broken.calls(), 1);
}

#[tokio::test]
async fn test_rate_limit_error_pauses_limiter() {
    let limited = Arc::new(MockAgent::new("limited").always_failing("HTTP 429 Too Many Requests"));
    let metrics = Arc::new(InMemoryMetrics::new());
    let orchestrator = Orchestrator::new(
        base_config().with_max_turns(1).with_retry(RetryPolicy {
            max_retries: 0,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_secs(10),
            multiplier: 1000.0,
        }),
    )
    .with_metrics(metrics.clone());
    orchestrator.add_agent(limited.clone()).unwrap();
    orchestrator.start(&RunContext::new()).await.unwrap();

    let limiter = orchestrator.rate_limiter("limited").unwrap();
    assert!(limiter.cooldown_remaining().is_some());
    assert_eq!(metrics.errors(ErrorKind::RateLimit), 1);
}

#[tokio::test]
async fn test_turn_timeout_counts_as_failure() {
    let slow = Arc::new(MockAgent::new("slow").with_latency(Duration::from_millis(200)));
    let metrics = Arc::new(InMemoryMetrics::new());
    let orchestrator = Orchestrator::new(
        base_config()
            .with_max_turns(1)
            .with_turn_timeout(Duration::from_millis(20))
            .with_retry(fast_retry(1)),
    )
    .with_metrics(metrics.clone());
    orchestrator.add_agent(slow.clone()).unwrap();
    orchestrator.start(&RunContext::new()).await.unwrap();

    assert_eq!(slow.calls(), 2);
    assert!(agent_messages(&orchestrator).is_empty());
    assert_eq!(metrics.errors(ErrorKind::Timeout), 1);
}

#[tokio::test]
async fn test_cancellation_interrupts_run() {
    let a = Arc::new(MockAgent::new("a").with_latency(Duration::from_millis(5)));
    let b = Arc::new(MockAgent::new("b").with_latency(Duration::from_millis(5)));
    let orchestrator = Arc::new(Orchestrator::new(
        base_config()
            .with_max_turns(100)
            .with_response_delay(Duration::from_millis(20)),
    ));
    orchestrator.add_agent(a.clone()).unwrap();
    orchestrator.add_agent(b.clone()).unwrap();

    let ctx = RunContext::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let err = orchestrator.start(&ctx).await.unwrap_err();
    assert_eq!(err, OrchestratorError::Interrupted(ContextError::Cancelled));
    assert_eq!(orchestrator.status(), ConversationStatus::Interrupted);
    assert!(a.calls() + b.calls() >= 1);
    assert!(orchestrator.turn_count() < 100);
}

#[tokio::test]
async fn test_deadline_interrupts_run() {
    let orchestrator = Orchestrator::new(base_config().with_response_delay(Duration::from_millis(10)));
    orchestrator.add_agent(Arc::new(MockAgent::new("a"))).unwrap();

    let ctx = RunContext::with_timeout(Duration::from_millis(50));
    let err = orchestrator.start(&ctx).await.unwrap_err();
    assert_eq!(err, OrchestratorError::Interrupted(ContextError::DeadlineExceeded));
}

#[tokio::test]
async fn test_spawned_run_and_status() {
    let orchestrator = Arc::new(Orchestrator::new(
        base_config().with_response_delay(Duration::from_millis(5)),
    ));
    orchestrator.add_agent(Arc::new(MockAgent::new("a"))).unwrap();

    let ctx = RunContext::new();
    let runner = {
        let orchestrator = orchestrator.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { orchestrator.start(&ctx).await })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(orchestrator.status(), ConversationStatus::Running);
    assert_eq!(
        orchestrator.start(&ctx).await.unwrap_err(),
        OrchestratorError::AlreadyRunning
    );

    ctx.cancel();
    let result = runner.await.unwrap();
    assert!(matches!(result, Err(OrchestratorError::Interrupted(_))));
}

#[tokio::test]
async fn test_history_snapshot_is_isolated() {
    let orchestrator = Orchestrator::new(base_config().with_max_turns(1));
    orchestrator.add_agent(Arc::new(MockAgent::new("a"))).unwrap();
    orchestrator.start(&RunContext::new()).await.unwrap();

    let mut copy = orchestrator.get_messages();
    let original_len = copy.len();
    copy[0].content = "rewritten".to_string();
    copy.push(Message::system("forged"));

    let fresh = orchestrator.get_messages();
    assert_eq!(fresh.len(), original_len);
    assert_ne!(fresh[0].content, "rewritten");
}

#[tokio::test]
async fn test_hook_can_inject_without_deadlock() {
    let orchestrator = Arc::new(Orchestrator::new(base_config().with_max_turns(2)));
    orchestrator.add_agent(Arc::new(MockAgent::new("a"))).unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let weak: Weak<Orchestrator> = Arc::downgrade(&orchestrator);
    let counter = seen.clone();
    orchestrator.add_message_hook(move |message| {
        counter.fetch_add(1, Ordering::SeqCst);
        if message.role == Role::Agent {
            if let Some(orchestrator) = weak.upgrade() {
                orchestrator.inject_message(Message::new(
                    "human",
                    "Human",
                    "human",
                    Role::User,
                    format!("ack {}", message.content),
                ));
            }
        }
    });

    tokio::time::timeout(Duration::from_secs(5), orchestrator.start(&RunContext::new()))
        .await
        .expect("run finished without deadlocking")
        .unwrap();

    let messages = orchestrator.get_messages();
    let injected = messages.iter().filter(|m| m.agent_id == "human").count();
    assert_eq!(injected, 2);
    assert_eq!(seen.load(Ordering::SeqCst), messages.len());
}

#[tokio::test]
async fn test_middleware_rejection_skips_message() {
    let a = Arc::new(MockAgent::new("a"));
    let b = Arc::new(MockAgent::new("b"));
    let orchestrator = Orchestrator::new(base_config().with_max_turns(2));
    orchestrator.add_agent(a.clone()).unwrap();
    orchestrator.add_agent(b.clone()).unwrap();
    orchestrator.add_middleware(middleware_fn("no-b", |_ctx, msg: Message| {
        if msg.agent_id == "b" {
            Err(MiddlewareError::rejected("no-b", "b is muted"))
        } else {
            Ok(msg)
        }
    }));

    let summary = orchestrator.start(&RunContext::new()).await.unwrap();

    assert_eq!(b.calls(), 2);
    let authors: Vec<_> = agent_messages(&orchestrator)
        .into_iter()
        .map(|m| m.agent_id)
        .collect();
    assert_eq!(authors, vec!["a", "a"]);
    assert_eq!(summary.status, ConversationStatus::Completed);
}

#[tokio::test]
async fn test_middleware_sees_turn_number() {
    let turns = Arc::new(Mutex::new(Vec::new()));
    let recorded = turns.clone();
    let orchestrator = Orchestrator::new(base_config().with_max_turns(3));
    orchestrator.add_agent(Arc::new(MockAgent::new("a"))).unwrap();
    orchestrator.add_middleware(middleware_fn("turns", move |ctx, msg: Message| {
        recorded.lock().unwrap().push(ctx.turn_number);
        Ok(msg)
    }));

    orchestrator.start(&RunContext::new()).await.unwrap();
    assert_eq!(*turns.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_free_form_alternates() {
    let a = Arc::new(MockAgent::new("a"));
    let b = Arc::new(MockAgent::new("b"));
    let c = Arc::new(MockAgent::new("c"));
    let orchestrator = Orchestrator::new(
        base_config()
            .with_mode(ConversationMode::FreeForm)
            .with_max_turns(7),
    );
    orchestrator.add_agent(a.clone()).unwrap();
    orchestrator.add_agent(b.clone()).unwrap();
    orchestrator.add_agent(c.clone()).unwrap();

    orchestrator.start(&RunContext::new()).await.unwrap();

    let messages = agent_messages(&orchestrator);
    assert_eq!(messages.len(), 7);
    for pair in messages.windows(2) {
        assert_ne!(pair[0].agent_id, pair[1].agent_id);
    }
    assert_eq!(orchestrator.turn_count(), 7);
}

#[tokio::test]
async fn test_streaming_concatenates_chunks() {
    let agent = Arc::new(MockAgent::new("s").streaming(&["Hel", "lo", " world"]));
    let orchestrator = Orchestrator::new(base_config().with_max_turns(1).with_streaming(true));
    orchestrator.add_agent(agent.clone()).unwrap();
    orchestrator.start(&RunContext::new()).await.unwrap();

    let messages = agent_messages(&orchestrator);
    assert_eq!(messages[0].content, "Hello world");
    assert_eq!(agent.calls(), 1);
}

#[derive(Default)]
struct RecordingHandler {
    events: Mutex<Vec<String>>,
    closed: AtomicUsize,
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn on_event(&self, event: &ConversationEvent) {
        let label = match event {
            ConversationEvent::ConversationStarted { .. } => "started",
            ConversationEvent::MessageCreated { .. } => "message",
            ConversationEvent::ConversationError { .. } => "error",
            ConversationEvent::ConversationCompleted { .. } => "completed",
        };
        self.events.lock().unwrap().push(label.to_string());
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_lifecycle_events() {
    let handler = Arc::new(RecordingHandler::default());
    let orchestrator = Orchestrator::new(base_config().with_max_turns(1).with_retry(fast_retry(0)))
        .with_event_handler(handler.clone());
    orchestrator.add_agent(Arc::new(MockAgent::new("good"))).unwrap();
    orchestrator
        .add_agent(Arc::new(MockAgent::new("bad").always_failing("boom")))
        .unwrap();

    orchestrator.start(&RunContext::new()).await.unwrap();
    orchestrator.shutdown().await;

    let events = handler.events.lock().unwrap().clone();
    assert_eq!(events, vec!["started", "message", "error", "completed"]);
    assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_announcements_and_prompt() {
    let orchestrator = Orchestrator::new(
        base_config()
            .with_announce_agents(true)
            .with_initial_prompt("Debate: tabs or spaces?")
            .with_max_turns(1),
    );
    orchestrator.add_agent(Arc::new(MockAgent::new("a"))).unwrap();
    orchestrator.start(&RunContext::new()).await.unwrap();

    let messages = orchestrator.get_messages();
    assert_eq!(messages[0].role, Role::System);
    assert_eq!(messages[1].role, Role::User);
    assert_eq!(messages[1].content, "Debate: tabs or spaces?");
    // the agent saw both lines before replying
    assert!(messages[2].content.ends_with("(saw 2)"));
}

#[tokio::test]
async fn test_health_check_reports_failures() {
    struct Sick;

    #[async_trait]
    impl Agent for Sick {
        fn id(&self) -> &str {
            "sick"
        }
        fn name(&self) -> &str {
            "Sick"
        }
        fn agent_type(&self) -> &str {
            "mock"
        }
        async fn health_check(&self) -> Result<(), AgentError> {
            Err("binary not found".into())
        }
        async fn send_message(&self, _history: &[Message]) -> Result<String, AgentError> {
            Ok(String::new())
        }
    }

    let orchestrator = Orchestrator::new(base_config());
    orchestrator.add_agent(Arc::new(MockAgent::new("ok"))).unwrap();
    orchestrator.add_agent(Arc::new(Sick)).unwrap();

    let failures = orchestrator.health_check_agents(&RunContext::new()).await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "sick");
    assert_eq!(failures[0].1.to_string(), "binary not found");
}

#[tokio::test]
async fn test_health_check_without_turn_timeout() {
    struct Sluggish;

    #[async_trait]
    impl Agent for Sluggish {
        fn id(&self) -> &str {
            "sluggish"
        }
        fn name(&self) -> &str {
            "Sluggish"
        }
        fn agent_type(&self) -> &str {
            "mock"
        }
        async fn health_check(&self) -> Result<(), AgentError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(())
        }
        async fn send_message(&self, _history: &[Message]) -> Result<String, AgentError> {
            Ok(String::new())
        }
    }

    let orchestrator = Orchestrator::new(base_config().with_turn_timeout(Duration::ZERO));
    orchestrator.add_agent(Arc::new(Sluggish)).unwrap();

    let failures = orchestrator.health_check_agents(&RunContext::new()).await;
    assert!(failures.is_empty(), "unexpected failures: {:?}", failures);
}

#[test]
fn test_unknown_mode() {
    let err = "debate".parse::<ConversationMode>().unwrap_err();
    assert_eq!(err, OrchestratorError::UnknownMode("debate".to_string()));
}
