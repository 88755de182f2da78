//! Services layer for the judgeloop engine
//!
//! Provides the external judge client, endpoint invocation, and the metrics
//! cache boundary.

pub mod cache;
pub mod invoker;
pub mod judge;

pub use cache::{InMemoryMetricsCache, MetricsCache, NoopMetricsCache};
pub use invoker::{ChatEndpointInvoker, EndpointInvoker};
pub use judge::{AnthropicJudge, JudgeClient, JudgeCompletion, JudgeRequest};
