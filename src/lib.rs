//! Judgeloop - closed-loop LLM evaluation and prompt improvement
//!
//! Judgeloop watches production traffic of LLM-backed endpoints, judges
//! sampled executions with an LLM evaluator, turns failures into insights,
//! rewrites prompts into challenger endpoints and compares them against the
//! base on replayed traffic.
//!
//! # Architecture
//!
//! - **Types**: endpoints, execution records, batch jobs, insights, versions
//! - **Storage**: `EvaluationStore` trait with an in-memory snapshot store
//! - **Services**: judge client (Anthropic), endpoint invoker, metrics cache
//! - **Evaluation**: sampling, rubric plans, sync and batch evaluation,
//!   correctness classification
//! - **Improvement**: insight generation, prompt optimization and release
//! - **A/B testing**: challenger replays and traffic routing
//! - **Scheduler**: periodic evaluation cycles and batch sweeps
//!
//! # Example
//!
//! ```ignore
//! use judgeloop_core::{EngineConfig, ImprovementLoop, MemoryStore, AnthropicJudge};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::load(None)?;
//!     let judge = Arc::new(AnthropicJudge::new(config.judge.clone())?);
//!     let store = Arc::new(MemoryStore::load("state.json".as_ref()).await?);
//!     let (events, worker) = EventBus::channel(256, Arc::new(NoopMetricsCache));
//!     tokio::spawn(worker.run());
//!
//!     let pipeline = ImprovementLoop::new(&config, store, judge.clone(),
//!         Arc::new(ChatEndpointInvoker::new(judge)), events);
//!     let report = pipeline.run_once(evaluator_id).await?;
//!     Ok(())
//! }
//! ```

pub mod ab_testing;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod events;
pub mod improvement;
pub mod pipeline;
pub mod scheduler;
pub mod services;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use ab_testing::{AbComparisonExecutor, AbComparisonReport, RouteDecision, TrafficRouter};
pub use config::EngineConfig;
pub use error::{JudgeloopError, Result};
pub use evaluation::{BatchReconciler, EvaluationExecutor, ExecutorConfig};
pub use events::{EventBus, EventWorker, PipelineEvent};
pub use improvement::{InsightGenerator, PromptOptimizer};
pub use pipeline::{ImprovementLoop, LoopReport};
pub use scheduler::BackgroundScheduler;
pub use services::{AnthropicJudge, ChatEndpointInvoker, JudgeClient, NoopMetricsCache};
pub use storage::{EvaluationStore, MemoryStore};
pub use types::{
    ActivationPolicy, BatchJob, EndpointId, ExecutionRecord, Insight, MonitoredEndpoint,
    ProblemType, RecordId,
};
