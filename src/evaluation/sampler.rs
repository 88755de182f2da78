//! Activation controller
//!
//! Decides which unprocessed production records an evaluator judges this
//! cycle. Below the backlog threshold the result is empty; that is a normal
//! outcome, not an error.

use crate::error::{JudgeloopError, Result};
use crate::storage::EvaluationStore;
use crate::types::{ActivationPolicy, ExecutionRecord, MonitoredEndpoint};
use chrono::{Duration, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info};

/// Number of records to draw from a backlog of `backlog` records
///
/// `min(floor(backlog * pct / 100), per_cycle_limit)`, or 0 under threshold.
pub fn sample_size(backlog: usize, policy: &ActivationPolicy) -> usize {
    if backlog == 0 || backlog < policy.backlog_threshold {
        return 0;
    }
    let pct = policy.sampling_percentage_per_cycle.clamp(0.0, 100.0);
    let proportional = ((backlog as f64) * pct / 100.0).floor() as usize;
    proportional.min(policy.per_cycle_limit).min(backlog)
}

/// Draw a random sample without replacement
pub fn select<R: Rng + ?Sized>(
    mut backlog: Vec<ExecutionRecord>,
    policy: &ActivationPolicy,
    rng: &mut R,
) -> Vec<ExecutionRecord> {
    let size = sample_size(backlog.len(), policy);
    if size == 0 {
        return Vec::new();
    }
    backlog.shuffle(rng);
    backlog.truncate(size);
    backlog
}

/// Samples an evaluator's backlog within a lookback window
#[derive(Clone)]
pub struct ActivationController {
    store: Arc<dyn EvaluationStore>,
    lookback: Duration,
}

impl ActivationController {
    pub fn new(store: Arc<dyn EvaluationStore>, lookback_days: i64) -> Self {
        Self {
            store,
            lookback: Duration::days(lookback_days),
        }
    }

    /// Records the evaluator should judge this cycle
    pub async fn sample(&self, evaluator: &MonitoredEndpoint) -> Result<Vec<ExecutionRecord>> {
        let (base_id, policy) = evaluator_target(evaluator)?;

        let now = Utc::now();
        let backlog = self.store.backlog(base_id, now - self.lookback, now).await?;
        let backlog_len = backlog.len();

        if backlog_len < policy.backlog_threshold {
            debug!(
                evaluator = %evaluator.id,
                backlog = backlog_len,
                threshold = policy.backlog_threshold,
                "Backlog below threshold, skipping cycle"
            );
            return Ok(Vec::new());
        }

        let sampled = select(backlog, &policy, &mut rand::thread_rng());
        info!(
            evaluator = %evaluator.id,
            backlog = backlog_len,
            sampled = sampled.len(),
            "Sampled records for evaluation"
        );
        Ok(sampled)
    }
}

/// Base endpoint and validated policy of an evaluator
pub(crate) fn evaluator_target(
    evaluator: &MonitoredEndpoint,
) -> Result<(crate::types::EndpointId, ActivationPolicy)> {
    if !evaluator.is_reviewer {
        return Err(JudgeloopError::StateConflict(format!(
            "endpoint {} is not an evaluator",
            evaluator.id
        )));
    }

    let base_id = evaluator.reviews.ok_or_else(|| {
        JudgeloopError::NotFound(format!("base endpoint of evaluator {}", evaluator.id))
    })?;

    let policy = evaluator.activation_policy.ok_or_else(|| {
        JudgeloopError::NotFound(format!("activation policy of evaluator {}", evaluator.id))
    })?;
    policy.validate().map_err(JudgeloopError::InvalidConfig)?;

    Ok((base_id, policy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::{EndpointId, ProblemType};
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn records(n: usize) -> Vec<ExecutionRecord> {
        let endpoint = EndpointId::new();
        (0..n)
            .map(|i| ExecutionRecord::new(endpoint, json!(i), json!(i)))
            .collect()
    }

    #[test]
    fn test_sample_size_capped_by_limit() {
        let policy = ActivationPolicy::new(10, 50.0, 3);
        assert_eq!(sample_size(10, &policy), 3);
        assert_eq!(sample_size(8, &policy), 0);
    }

    #[test]
    fn test_sample_size_proportional() {
        let policy = ActivationPolicy::new(1, 25.0, 100);
        assert_eq!(sample_size(10, &policy), 2);
        assert_eq!(sample_size(3, &policy), 0);
    }

    #[test]
    fn test_select_without_replacement() {
        let policy = ActivationPolicy::new(10, 50.0, 3);
        let mut rng = StdRng::seed_from_u64(7);
        let chosen = select(records(10), &policy, &mut rng);
        assert_eq!(chosen.len(), 3);

        let mut ids: Vec<_> = chosen.iter().map(|r| r.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    proptest! {
        #[test]
        fn prop_sample_size_bounds(
            backlog in 0usize..500,
            threshold in 0usize..100,
            pct in 0.0f64..=100.0,
            limit in 0usize..50,
        ) {
            let policy = ActivationPolicy::new(threshold, pct, limit);
            let size = sample_size(backlog, &policy);
            prop_assert!(size <= limit);
            prop_assert!(size <= backlog);
            if backlog < threshold {
                prop_assert_eq!(size, 0);
            }
        }
    }

    #[tokio::test]
    async fn test_controller_respects_threshold() {
        let store = Arc::new(MemoryStore::new());
        let base = MonitoredEndpoint::new("tickets", "Classify", ProblemType::Classification);
        let evaluator = MonitoredEndpoint::evaluator("judge", &base, ActivationPolicy::new(10, 50.0, 3));
        store.insert_endpoint(&base).await.unwrap();
        store.insert_endpoint(&evaluator).await.unwrap();

        for i in 0..8 {
            store
                .insert_record(&ExecutionRecord::new(base.id, json!(i), json!(i)))
                .await
                .unwrap();
        }

        let controller = ActivationController::new(store.clone(), 3);
        assert!(controller.sample(&evaluator).await.unwrap().is_empty());

        for i in 8..10 {
            store
                .insert_record(&ExecutionRecord::new(base.id, json!(i), json!(i)))
                .await
                .unwrap();
        }
        assert_eq!(controller.sample(&evaluator).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_non_evaluator_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let base = MonitoredEndpoint::new("tickets", "Classify", ProblemType::Classification);
        let controller = ActivationController::new(store, 3);
        assert!(matches!(
            controller.sample(&base).await,
            Err(JudgeloopError::StateConflict(_))
        ));
    }
}
