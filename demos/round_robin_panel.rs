//! Round-robin panel demo
//!
//! Three scripted panelists discuss a topic. One of them is flaky and fails its first
//! call, which shows the retry path, and a heckle from another is dropped by a content
//! filter. Every committed message is printed by a message hook, and the run is cut
//! short by Ctrl-C or a 20 second deadline.
//!
//! Run with: RUST_LOG=info cargo run --example round_robin_panel

use async_trait::async_trait;
use roundtable::event::LogEventHandler;
use roundtable::middleware::builtin::{ContentFilterMiddleware, TimingMiddleware};
use roundtable::middleware::MiddlewareChain;
use roundtable::retry::RetryPolicy;
use roundtable::sink::{InMemoryMetrics, LogChatLogger};
use roundtable::{
    Agent, AgentError, ConversationMode, Message, Orchestrator, OrchestratorConfig, Role,
    RunContext,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Panelist {
    id: &'static str,
    name: &'static str,
    lines: &'static [&'static str],
    fail_first: usize,
    calls: AtomicUsize,
}

impl Panelist {
    fn new(id: &'static str, name: &'static str, lines: &'static [&'static str]) -> Self {
        Self {
            id,
            name,
            lines,
            fail_first: 0,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Agent for Panelist {
    fn id(&self) -> &str {
        self.id
    }

    fn name(&self) -> &str {
        self.name
    }

    fn agent_type(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "claude-haiku-4-5"
    }

    fn rate_limit(&self) -> f64 {
        2.0
    }

    fn rate_limit_burst(&self) -> usize {
        2
    }

    async fn send_message(&self, history: &[Message]) -> Result<String, AgentError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        if call < self.fail_first {
            return Err("upstream timed out".into());
        }
        let line = self.lines[call % self.lines.len()];
        let previous = history
            .iter()
            .rev()
            .find(|m| m.role == Role::Agent && m.agent_id != self.id)
            .map(|m| m.agent_name.as_str())
            .unwrap_or("everyone");
        Ok(format!("Replying to {}: {}", previous, line))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    roundtable::init_logger();
    println!("=== roundtable round-robin panel ===\n");

    let metrics = Arc::new(InMemoryMetrics::new());
    let config = OrchestratorConfig::default()
        .with_mode(ConversationMode::RoundRobin)
        .with_max_turns(3)
        .with_response_delay(Duration::from_millis(300))
        .with_turn_timeout(Duration::from_secs(5))
        .with_retry(RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        })
        .with_initial_prompt("Should a first programming course teach Rust?");

    let chain = MiddlewareChain::standard()
        .with(TimingMiddleware)
        .with(ContentFilterMiddleware::new().block("heckle"));

    let orchestrator = Arc::new(
        Orchestrator::new(config)
            .with_middleware(chain)
            .with_metrics(metrics.clone())
            .with_chat_logger(Arc::new(LogChatLogger))
            .with_event_handler(Arc::new(LogEventHandler)),
    );

    orchestrator.add_agent(Arc::new(Panelist::new(
        "ada",
        "Ada",
        &[
            "ownership rules teach memory discipline early.",
            "the compiler is a patient tutor.",
        ],
    )))?;
    orchestrator.add_agent(Arc::new(Panelist {
        fail_first: 1,
        ..Panelist::new(
            "grace",
            "Grace",
            &[
                "beginners need quick wins before borrow checking.",
                "start with Python, then graduate.",
            ],
        )
    }))?;
    orchestrator.add_agent(Arc::new(Panelist::new(
        "linus",
        "Linus",
        &["teach C first so they appreciate Rust.", "heckle heckle"],
    )))?;

    orchestrator.add_message_hook(|message| {
        println!("[{}] {}: {}", message.role, message.agent_name, message.content);
    });

    let failures = orchestrator
        .health_check_agents(&RunContext::new())
        .await;
    for (agent_id, err) in &failures {
        println!("health check failed for {}: {}", agent_id, err);
    }

    let ctx = RunContext::with_timeout(Duration::from_secs(20));
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    match orchestrator.start(&ctx).await {
        Ok(summary) => println!("\n{}", summary.describe()),
        Err(e) => println!("\nstopped early: {}", e),
    }
    orchestrator.shutdown().await;

    println!(
        "requests ok={} failed={} retries={} tokens={} cost=${:.5}",
        metrics.successful_requests(),
        metrics.failed_requests(),
        metrics.retries(),
        metrics.total_tokens(),
        metrics.total_cost()
    );
    Ok(())
}
