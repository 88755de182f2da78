//! Wiring of the evaluation and improvement components
//!
//! [`ImprovementLoop`] owns one instance of every component, built from an
//! [`EngineConfig`], and runs the closed loop for one evaluator:
//! evaluate, derive insights, optimize, compare.

use crate::ab_testing::{AbComparisonExecutor, AbComparisonReport, TrafficRouter};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::evaluation::batch::BatchReconciler;
use crate::evaluation::classifier::has_parse_errors;
use crate::evaluation::executor::{CycleReport, EvaluationExecutor, ExecutorConfig};
use crate::evaluation::sampler::evaluator_target;
use crate::events::EventBus;
use crate::improvement::{InsightGenerator, OptimizationResult, PromptOptimizer};
use crate::services::invoker::EndpointInvoker;
use crate::services::judge::JudgeClient;
use crate::storage::EvaluationStore;
use crate::types::{EndpointId, Insight};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What one pass of the loop did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopReport {
    pub cycle: CycleReport,
    pub insights_generated: usize,
    pub insight_failures: usize,
    /// Incorrect records skipped because their verdict rests on unusable judge replies
    pub insight_sources_skipped: usize,
    pub optimization: Option<OptimizationResult>,
    pub comparison: Option<AbComparisonReport>,
}

/// All pipeline components sharing one store, judge and event bus
#[derive(Clone)]
pub struct ImprovementLoop {
    store: Arc<dyn EvaluationStore>,
    executor: EvaluationExecutor,
    reconciler: BatchReconciler,
    insights: InsightGenerator,
    optimizer: PromptOptimizer,
    comparison: AbComparisonExecutor,
    router: Arc<TrafficRouter>,
}

impl ImprovementLoop {
    pub fn new(
        config: &EngineConfig,
        store: Arc<dyn EvaluationStore>,
        judge: Arc<dyn JudgeClient>,
        invoker: Arc<dyn EndpointInvoker>,
        events: EventBus,
    ) -> Self {
        let executor = EvaluationExecutor::new(
            Arc::clone(&store),
            Arc::clone(&judge),
            events.clone(),
            ExecutorConfig::from_engine(config),
        );
        let reconciler = BatchReconciler::new(
            Arc::clone(&store),
            Arc::clone(&judge),
            events.clone(),
            config.batch.clone(),
            &config.judge,
        );
        let insights = InsightGenerator::new(
            Arc::clone(&store),
            Arc::clone(&judge),
            config.insights.clone(),
            &config.judge,
        );
        let optimizer = PromptOptimizer::new(
            Arc::clone(&store),
            judge,
            events,
            insights.clone(),
            config.optimizer.clone(),
            &config.judge,
        );
        let comparison = AbComparisonExecutor::new(
            Arc::clone(&store),
            invoker,
            executor.clone(),
            config.ab_test.sample_size,
        );
        let router = Arc::new(TrafficRouter::new(Arc::clone(&store)));

        Self {
            store,
            executor,
            reconciler,
            insights,
            optimizer,
            comparison,
            router,
        }
    }

    pub fn executor(&self) -> &EvaluationExecutor {
        &self.executor
    }

    pub fn reconciler(&self) -> &BatchReconciler {
        &self.reconciler
    }

    pub fn insights(&self) -> &InsightGenerator {
        &self.insights
    }

    pub fn optimizer(&self) -> &PromptOptimizer {
        &self.optimizer
    }

    pub fn comparison(&self) -> &AbComparisonExecutor {
        &self.comparison
    }

    pub fn router(&self) -> &TrafficRouter {
        &self.router
    }

    /// One pass of the closed loop for an evaluator
    ///
    /// Insight failures are counted; the rewrite runs only when at least one
    /// new insight exists; the comparison runs when the base has a principal
    /// challenger.
    pub async fn run_once(&self, evaluator_id: EndpointId) -> Result<LoopReport> {
        let evaluator = self.store.get_endpoint(evaluator_id).await?;
        let (base_id, _) = evaluator_target(&evaluator)?;

        let cycle = self.executor.run_cycle(evaluator_id).await?;

        let mut new_insights: Vec<Insight> = Vec::new();
        let mut insight_failures = 0;
        let mut insight_sources_skipped = 0;
        for record_id in &cycle.incorrect_records {
            let record = self.store.get_record(*record_id).await?;
            if record.actual.as_ref().is_some_and(has_parse_errors) {
                debug!(record = %record_id, "Verdict has rubric parse errors, not an insight source");
                insight_sources_skipped += 1;
                continue;
            }
            match self.insights.generate_for_record(*record_id).await {
                Ok(insights) => new_insights.extend(insights),
                Err(e) => {
                    warn!(record = %record_id, "Insight generation failed: {}", e);
                    insight_failures += 1;
                }
            }
        }

        let optimization = if new_insights.is_empty() {
            None
        } else {
            Some(self.optimizer.optimize_with(base_id, &new_insights).await?)
        };

        let comparison = match self.store.principal_assignment(base_id).await? {
            Some(_) => Some(self.comparison.run(base_id).await?),
            None => None,
        };

        let report = LoopReport {
            cycle,
            insights_generated: new_insights.len(),
            insight_failures,
            insight_sources_skipped,
            optimization,
            comparison,
        };
        info!(
            evaluator = %evaluator_id,
            evaluated = report.cycle.evaluated,
            insights = report.insights_generated,
            optimized = report.optimization.is_some(),
            "Improvement loop pass finished"
        );
        Ok(report)
    }
}
