//! Automated evaluation of captured execution records
//!
//! # Architecture
//!
//! - **ActivationController** (`sampler`): picks which backlog records an
//!   evaluator judges this cycle
//! - **EvaluationPlan** (`rubric`): rubric pipeline or generic prompt per
//!   problem type
//! - **EvaluationExecutor** (`executor`): synchronous evaluation with retries
//!   and batch submission
//! - **BatchReconciler** (`batch`): applies provider batch results
//! - **classify** (`classifier`): pure mapping from evaluator output to a
//!   `correct` verdict
//!
//! A record's `actual` is written exactly once per evaluation and only
//! together with `processed = true`.

pub mod batch;
pub mod classifier;
pub mod executor;
pub mod parsing;
pub mod rubric;
pub mod sampler;

pub use batch::{BatchReconciler, JobPollReport, SweepReport};
pub use classifier::{classify, EvaluatorOutput, RubricScore, Verdict};
pub use executor::{CycleReport, EvaluationExecutor, EvaluationOutcome, ExecutorConfig};
pub use rubric::{EvaluationPlan, EvaluationRubric, OutputShape, PASSING_SCORE};
pub use sampler::ActivationController;
