pub mod agent;
pub mod config;
pub mod context;
pub mod event;
pub mod history;
pub mod message;
pub mod middleware;
pub mod orchestrator;
pub mod rate_limit;
pub mod retry;
pub mod sink;
pub mod usage;

pub use orchestrator::Orchestrator;
