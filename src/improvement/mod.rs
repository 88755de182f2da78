//! Closed-loop prompt improvement: insights from incorrect records, prompt
//! rewrites into challengers, and version release.

pub mod insights;
pub mod optimizer;

pub use insights::InsightGenerator;
pub use optimizer::{OptimizationResult, PromptOptimizer};
