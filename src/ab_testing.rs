//! A/B comparison between a base endpoint and its challenger
//!
//! [`AbComparisonExecutor`] replays base records through the challenger and
//! judges the replays through the same synchronous path as live traffic.
//! [`TrafficRouter`] splits live traffic using the principal assignment.

use crate::error::{JudgeloopError, Result};
use crate::evaluation::executor::{EvaluationExecutor, EvaluationOutcome};
use crate::services::invoker::EndpointInvoker;
use crate::storage::EvaluationStore;
use crate::types::{EndpointId, ExecutionRecord, MonitoredEndpoint, AB_TEST_ENV};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Counters of one comparison run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AbComparisonReport {
    pub base_id: EndpointId,
    pub challenger_id: EndpointId,

    /// Base records selected for replay
    pub selected: usize,

    /// Challenger records created
    pub replayed: usize,
    pub evaluated: usize,
    pub correct: usize,
    pub incorrect: usize,

    /// Invocation, persistence or evaluation failures
    pub failed: usize,
}

impl AbComparisonReport {
    /// Share of evaluated replays judged correct
    pub fn challenger_accuracy(&self) -> Option<f64> {
        if self.evaluated == 0 {
            None
        } else {
            Some(self.correct as f64 / self.evaluated as f64)
        }
    }
}

enum ReplayOutcome {
    Correct,
    Incorrect,
    /// Replay stored but not judged
    Unjudged,
}

/// Replays base records through a challenger and evaluates the results
#[derive(Clone)]
pub struct AbComparisonExecutor {
    store: Arc<dyn EvaluationStore>,
    invoker: Arc<dyn EndpointInvoker>,
    executor: EvaluationExecutor,
    sample_size: usize,
}

impl AbComparisonExecutor {
    pub fn new(
        store: Arc<dyn EvaluationStore>,
        invoker: Arc<dyn EndpointInvoker>,
        executor: EvaluationExecutor,
        sample_size: usize,
    ) -> Self {
        Self {
            store,
            invoker,
            executor,
            sample_size,
        }
    }

    /// Compare a base endpoint against its principal challenger
    pub async fn run(&self, base_id: EndpointId) -> Result<AbComparisonReport> {
        let assignment = self
            .store
            .principal_assignment(base_id)
            .await?
            .ok_or_else(|| JudgeloopError::NotFound(format!("principal challenger of {}", base_id)))?;
        self.run_pair(base_id, assignment.challenger_id).await
    }

    /// Replay up to `sample_size` unreplayed base records through the challenger
    pub async fn run_pair(
        &self,
        base_id: EndpointId,
        challenger_id: EndpointId,
    ) -> Result<AbComparisonReport> {
        let challenger = self.store.get_endpoint(challenger_id).await?;
        let evaluator = self
            .store
            .evaluator_for(base_id)
            .await?
            .ok_or_else(|| JudgeloopError::NotFound(format!("evaluator of {}", base_id)))?;

        let records = self
            .store
            .unreplayed_records(base_id, challenger_id, self.sample_size)
            .await?;

        let mut report = AbComparisonReport {
            base_id,
            challenger_id,
            selected: records.len(),
            ..Default::default()
        };
        if records.is_empty() {
            debug!(base = %base_id, challenger = %challenger_id, "Nothing to replay");
            return Ok(report);
        }

        let challenger = Arc::new(challenger);
        let evaluator = Arc::new(evaluator);
        let mut tasks = JoinSet::new();
        for origin in records {
            let this = self.clone();
            let challenger = Arc::clone(&challenger);
            let evaluator = Arc::clone(&evaluator);
            tasks.spawn(async move {
                let origin_id = origin.id;
                (origin_id, this.replay(&challenger, &evaluator, origin).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => {
                    report.replayed += 1;
                    match outcome {
                        ReplayOutcome::Correct => {
                            report.evaluated += 1;
                            report.correct += 1;
                        }
                        ReplayOutcome::Incorrect => {
                            report.evaluated += 1;
                            report.incorrect += 1;
                        }
                        ReplayOutcome::Unjudged => report.failed += 1,
                    }
                }
                Ok((origin_id, Err(e))) => {
                    warn!(origin = %origin_id, "Challenger replay failed: {}", e);
                    report.failed += 1;
                }
                Err(e) => {
                    warn!("Replay task panicked: {}", e);
                    report.failed += 1;
                }
            }
        }

        info!(
            base = %base_id,
            challenger = %challenger_id,
            replayed = report.replayed,
            correct = report.correct,
            failed = report.failed,
            "A/B comparison finished"
        );
        Ok(report)
    }

    async fn replay(
        &self,
        challenger: &MonitoredEndpoint,
        evaluator: &MonitoredEndpoint,
        origin: ExecutionRecord,
    ) -> Result<ReplayOutcome> {
        let output = self
            .invoker
            .invoke(challenger, &origin.input, &origin.attachments)
            .await?;

        let mut record = ExecutionRecord::new(challenger.id, origin.input, output);
        record.attachments = origin.attachments;
        record.environment = AB_TEST_ENV.to_string();
        record.origin_record_id = Some(origin.id);
        self.store.insert_record(&record).await?;

        Ok(match self.executor.single_evaluate(evaluator, &record).await? {
            EvaluationOutcome::Verdicted(verdict) if verdict.correct => ReplayOutcome::Correct,
            EvaluationOutcome::Verdicted(_) => ReplayOutcome::Incorrect,
            EvaluationOutcome::Exhausted { last_error, .. } => {
                warn!(record = %record.id, "Replay left unjudged: {}", last_error);
                ReplayOutcome::Unjudged
            }
        })
    }
}

/// Endpoint picked for one live request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub endpoint_id: EndpointId,
    pub is_challenger: bool,
}

/// Splits base traffic between the base and its principal challenger
pub struct TrafficRouter {
    store: Arc<dyn EvaluationStore>,
    rng: Mutex<StdRng>,
}

impl TrafficRouter {
    pub fn new(store: Arc<dyn EvaluationStore>) -> Self {
        Self {
            store,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic router for tests
    pub fn with_seed(store: Arc<dyn EvaluationStore>, seed: u64) -> Self {
        Self {
            store,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Route to the challenger with probability `percentage / 100`
    pub async fn route(&self, base_id: EndpointId) -> Result<RouteDecision> {
        let base = RouteDecision {
            endpoint_id: base_id,
            is_challenger: false,
        };

        let assignment = match self.store.principal_assignment(base_id).await? {
            Some(a) if a.percentage > 0 => a,
            _ => return Ok(base),
        };

        match self.store.get_endpoint(assignment.challenger_id).await {
            Ok(_) => {}
            Err(JudgeloopError::NotFound(_)) => {
                debug!(challenger = %assignment.challenger_id, "Challenger gone, routing to base");
                return Ok(base);
            }
            Err(e) => return Err(e),
        }

        let draw: f64 = self.rng.lock().await.gen();
        if draw < f64::from(assignment.percentage) / 100.0 {
            Ok(RouteDecision {
                endpoint_id: assignment.challenger_id,
                is_challenger: true,
            })
        } else {
            Ok(base)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::{ChallengerAssignment, ProblemType};

    async fn pair(percentage: u8) -> (Arc<MemoryStore>, MonitoredEndpoint, MonitoredEndpoint) {
        let store = Arc::new(MemoryStore::new());
        let base = MonitoredEndpoint::new("summaries", "Summarize", ProblemType::Generation);
        let challenger = base.clone_as_challenger("Summarize in one sentence");
        store.insert_endpoint(&base).await.unwrap();
        store.insert_endpoint(&challenger).await.unwrap();
        store
            .insert_assignment(&ChallengerAssignment::principal(base.id, challenger.id, percentage))
            .await
            .unwrap();
        (store, base, challenger)
    }

    #[tokio::test]
    async fn test_route_without_challenger_uses_base() {
        let store = Arc::new(MemoryStore::new());
        let base = MonitoredEndpoint::new("summaries", "Summarize", ProblemType::Generation);
        store.insert_endpoint(&base).await.unwrap();

        let router = TrafficRouter::with_seed(store, 1);
        let decision = router.route(base.id).await.unwrap();
        assert_eq!(decision.endpoint_id, base.id);
        assert!(!decision.is_challenger);
    }

    #[tokio::test]
    async fn test_route_full_share_always_challenger() {
        let (store, base, challenger) = pair(100).await;
        let router = TrafficRouter::with_seed(store, 7);
        for _ in 0..20 {
            let decision = router.route(base.id).await.unwrap();
            assert_eq!(decision.endpoint_id, challenger.id);
        }
    }

    #[tokio::test]
    async fn test_route_split_is_roughly_proportional() {
        let (store, base, _) = pair(30).await;
        let router = TrafficRouter::with_seed(store, 42);

        let mut challenger_hits = 0;
        for _ in 0..1000 {
            if router.route(base.id).await.unwrap().is_challenger {
                challenger_hits += 1;
            }
        }
        assert!((200..400).contains(&challenger_hits), "hits = {}", challenger_hits);
    }

    #[test]
    fn test_challenger_accuracy() {
        let report = AbComparisonReport {
            evaluated: 4,
            correct: 3,
            ..Default::default()
        };
        assert_eq!(report.challenger_accuracy(), Some(0.75));
        assert_eq!(AbComparisonReport::default().challenger_accuracy(), None);
    }
}
