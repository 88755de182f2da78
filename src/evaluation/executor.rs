//! Evaluation executor
//!
//! Runs an evaluator's rubric plan against execution records, either inline
//! (`single_evaluate`, `run_cycle`) or staged into one provider batch
//! (`batch_evaluate`). Judge calls share a semaphore so one cycle's fan-out
//! never exceeds `max_concurrency` in-flight requests; a cycle returns only
//! after every dispatched record finished or exhausted its attempts.

use crate::config::EngineConfig;
use crate::error::{JudgeloopError, Result};
use crate::evaluation::classifier::{classify, synthesize_accuracy, EvaluatorOutput, RubricScore, Verdict};
use crate::evaluation::parsing::{parse_expected_output, parse_judgment, parse_rubric_score};
use crate::evaluation::rubric::{EvaluationPlan, OutputShape};
use crate::evaluation::sampler::ActivationController;
use crate::events::{EventBus, PipelineEvent};
use crate::services::judge::{BatchRequest, JudgeClient, JudgeCompletion, JudgeRequest};
use crate::storage::EvaluationStore;
use crate::types::{BatchJob, BatchJobStatus, EndpointId, ExecutionRecord, MonitoredEndpoint, RecordId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Separator between record id and prompt name in batch custom ids
const CUSTOM_ID_SEPARATOR: &str = "__";

/// Executor settings, derived from [`EngineConfig`]
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Attempts of the whole rubric set per record per cycle
    pub max_attempts: u32,

    /// Deadline of one judge call; expiry counts as a failed attempt
    pub judge_timeout: Duration,

    /// In-flight judge calls allowed across the cycle
    pub max_concurrency: usize,

    /// Lease taken on sampled records
    pub claim_lease: chrono::Duration,

    /// Sampling lookback window in days
    pub lookback_days: i64,
}

impl ExecutorConfig {
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.evaluation.max_attempts,
            judge_timeout: config.judge.timeout(),
            max_concurrency: config.evaluation.max_concurrent_judge_calls,
            claim_lease: chrono::Duration::seconds(config.evaluation.claim_lease_secs),
            lookback_days: config.evaluation.lookback_days,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from_engine(&EngineConfig::default())
    }
}

/// Result of evaluating one record
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationOutcome {
    /// Verdict computed and persisted
    Verdicted(Verdict),

    /// Every attempt failed; the record stays unprocessed for the next cycle
    Exhausted { attempts: u32, last_error: String },
}

/// Counters of one synchronous evaluation cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub sampled: usize,
    pub claimed: usize,
    pub evaluated: usize,
    pub correct: usize,
    pub incorrect: usize,
    pub exhausted: usize,
    pub failed: usize,

    /// Records judged incorrect this cycle
    pub incorrect_records: Vec<RecordId>,
}

/// Batch custom id for one (record, prompt) pair
pub fn custom_id(record_id: RecordId, prompt: &str) -> String {
    format!("{}{}{}", record_id.0.simple(), CUSTOM_ID_SEPARATOR, prompt)
}

/// Split a batch custom id back into record id and prompt name
pub fn parse_custom_id(custom_id: &str) -> Option<(RecordId, String)> {
    let (record, prompt) = custom_id.split_once(CUSTOM_ID_SEPARATOR)?;
    let record_id = RecordId::from_string(record).ok()?;
    Some((record_id, prompt.to_string()))
}

/// Runs rubric plans against records
#[derive(Clone)]
pub struct EvaluationExecutor {
    store: Arc<dyn EvaluationStore>,
    judge: Arc<dyn JudgeClient>,
    events: EventBus,
    config: ExecutorConfig,
    limiter: Arc<Semaphore>,
}

impl EvaluationExecutor {
    pub fn new(
        store: Arc<dyn EvaluationStore>,
        judge: Arc<dyn JudgeClient>,
        events: EventBus,
        config: ExecutorConfig,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            store,
            judge,
            events,
            config,
            limiter,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// One judge call under the concurrency limiter and the call deadline
    pub async fn judge_call(&self, request: &JudgeRequest) -> Result<JudgeCompletion> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| JudgeloopError::Other("judge limiter closed".to_string()))?;

        tokio::time::timeout(self.config.judge_timeout, self.judge.complete(request))
            .await
            .map_err(|_| JudgeloopError::Timeout(self.config.judge_timeout))?
    }

    /// One attempt: run every prompt of the plan in declared order
    ///
    /// Provider errors abort the attempt. A malformed rubric response only
    /// fails that rubric (score 0 with the parse error recorded).
    async fn judge_record(
        &self,
        evaluator: &MonitoredEndpoint,
        record: &ExecutionRecord,
        plan: &EvaluationPlan,
    ) -> Result<EvaluatorOutput> {
        match plan.shape {
            OutputShape::Rubrics => {
                let mut rubrics = Vec::with_capacity(plan.prompts.len() + 1);
                for prompt in &plan.prompts {
                    let completion = self.judge_call(&prompt.request_for(evaluator, record)).await?;
                    match parse_rubric_score(&prompt.name, &completion.text) {
                        Ok(score) => rubrics.push(score),
                        Err(e) => {
                            warn!(record = %record.id, rubric = %prompt.name, "Malformed rubric output: {}", e);
                            rubrics.push(RubricScore {
                                evaluator: prompt.name.clone(),
                                score: 0.0,
                                analysis: String::new(),
                                errors: vec![e.to_string()],
                            });
                        }
                    }
                }
                if plan.derives_accuracy {
                    synthesize_accuracy(&mut rubrics);
                }
                Ok(EvaluatorOutput::Rubrics { rubrics })
            }
            OutputShape::Classification => {
                let prompt = first_prompt(plan)?;
                let completion = self.judge_call(&prompt.request_for(evaluator, record)).await?;
                Ok(EvaluatorOutput::Classification {
                    model_output: record.output.clone(),
                    expected_output: parse_expected_output(&completion.text)?,
                })
            }
            OutputShape::Judgment => {
                let prompt = first_prompt(plan)?;
                let completion = self.judge_call(&prompt.request_for(evaluator, record)).await?;
                let (relevance, coherence, correctness) = parse_judgment(&completion.text)?;
                Ok(EvaluatorOutput::Judgment {
                    relevance,
                    coherence,
                    correctness,
                })
            }
        }
    }

    /// Evaluate one record synchronously, retrying the whole rubric set
    ///
    /// Attempt failures are logged, not surfaced: after `max_attempts` the
    /// record's claim is released and it stays unprocessed. Only persistence
    /// failures are returned as errors.
    pub async fn single_evaluate(
        &self,
        evaluator: &MonitoredEndpoint,
        record: &ExecutionRecord,
    ) -> Result<EvaluationOutcome> {
        let plan = EvaluationPlan::for_problem_type(evaluator.problem_type);
        let mut last_error = String::new();

        for attempt in 1..=self.config.max_attempts {
            match self.judge_record(evaluator, record, &plan).await {
                Ok(output) => {
                    let verdict = classify(&output);

                    let mut updated = record.clone();
                    updated.apply_verdict(verdict.payload.clone(), verdict.correct);
                    self.store.update_record(&updated).await?;

                    self.events.publish(PipelineEvent::record_evaluated(
                        record.endpoint_id,
                        record.id,
                        verdict.correct,
                    ));
                    debug!(record = %record.id, attempt, correct = verdict.correct, "Record evaluated");
                    return Ok(EvaluationOutcome::Verdicted(verdict));
                }
                Err(e) => {
                    warn!(
                        record = %record.id,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        "Evaluation attempt failed: {}",
                        e
                    );
                    last_error = e.to_string();
                }
            }
        }

        self.store.release_claim(record.id).await?;
        Ok(EvaluationOutcome::Exhausted {
            attempts: self.config.max_attempts,
            last_error,
        })
    }

    /// Sample, claim and evaluate one cycle of an evaluator's backlog
    pub async fn run_cycle(&self, evaluator_id: EndpointId) -> Result<CycleReport> {
        let evaluator = self.store.get_endpoint(evaluator_id).await?;
        let records = self.sample(&evaluator).await?;

        let mut report = CycleReport {
            sampled: records.len(),
            ..Default::default()
        };
        if records.is_empty() {
            return Ok(report);
        }

        let records = self.claim(records).await?;
        report.claimed = records.len();

        let evaluator = Arc::new(evaluator);
        let mut tasks = JoinSet::new();
        for record in records {
            let executor = self.clone();
            let evaluator = Arc::clone(&evaluator);
            tasks.spawn(async move {
                let outcome = executor.single_evaluate(&evaluator, &record).await;
                (record.id, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((record_id, Ok(EvaluationOutcome::Verdicted(verdict)))) => {
                    report.evaluated += 1;
                    if verdict.correct {
                        report.correct += 1;
                    } else {
                        report.incorrect += 1;
                        report.incorrect_records.push(record_id);
                    }
                }
                Ok((_, Ok(EvaluationOutcome::Exhausted { .. }))) => report.exhausted += 1,
                Ok((record_id, Err(e))) => {
                    error!(record = %record_id, "Failed to persist evaluation: {}", e);
                    report.failed += 1;
                    if let Err(e) = self.store.release_claim(record_id).await {
                        warn!(record = %record_id, "Failed to release claim: {}", e);
                    }
                }
                Err(e) => {
                    error!("Evaluation task panicked: {}", e);
                    report.failed += 1;
                }
            }
        }

        info!(
            evaluator = %evaluator_id,
            sampled = report.sampled,
            evaluated = report.evaluated,
            incorrect = report.incorrect,
            exhausted = report.exhausted,
            "Evaluation cycle finished"
        );
        Ok(report)
    }

    /// Stage one cycle's sample into a single provider batch
    ///
    /// All-or-nothing: when the provider rejects the submission no record
    /// changes state (claims are released). Returns `None` when nothing was
    /// sampled.
    pub async fn batch_evaluate(&self, evaluator_id: EndpointId) -> Result<Option<BatchJob>> {
        let evaluator = self.store.get_endpoint(evaluator_id).await?;
        let records = self.sample(&evaluator).await?;
        if records.is_empty() {
            return Ok(None);
        }

        let records = self.claim(records).await?;
        if records.is_empty() {
            return Ok(None);
        }

        let plan = EvaluationPlan::for_problem_type(evaluator.problem_type);
        let requests: Vec<BatchRequest> = records
            .iter()
            .flat_map(|record| {
                plan.prompts.iter().map(|prompt| BatchRequest {
                    custom_id: custom_id(record.id, &prompt.name),
                    request: prompt.request_for(&evaluator, record),
                })
            })
            .collect();

        let job_id = match self.judge.create_batch(&requests).await {
            Ok(id) => id,
            Err(e) => {
                self.release_all(&records).await;
                return Err(e);
            }
        };

        let now = Utc::now();
        let job = BatchJob {
            id: job_id,
            evaluator_id: evaluator.id,
            problem_type: evaluator.problem_type,
            status: BatchJobStatus::Submitted,
            record_ids: records.iter().map(|r| r.id).collect(),
            request_count: requests.len(),
            processed_count: 0,
            failed_count: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        if let Err(e) = self.store.record_batch_submission(&job).await {
            error!(job = %job.id, "Provider accepted batch but recording it failed: {}", e);
            self.release_all(&records).await;
            return Err(e);
        }

        info!(
            job = %job.id,
            records = job.record_ids.len(),
            requests = job.request_count,
            "Submitted evaluation batch"
        );
        Ok(Some(job))
    }

    async fn sample(&self, evaluator: &MonitoredEndpoint) -> Result<Vec<ExecutionRecord>> {
        ActivationController::new(Arc::clone(&self.store), self.config.lookback_days)
            .sample(evaluator)
            .await
    }

    /// Keep only the records this cycle managed to claim
    async fn claim(&self, records: Vec<ExecutionRecord>) -> Result<Vec<ExecutionRecord>> {
        let now = Utc::now();
        let ids: Vec<RecordId> = records.iter().map(|r| r.id).collect();
        let claimed = self
            .store
            .claim_records(&ids, now + self.config.claim_lease, now)
            .await?;

        if claimed.len() < records.len() {
            debug!(
                skipped = records.len() - claimed.len(),
                "Records already claimed by another cycle"
            );
        }
        Ok(records.into_iter().filter(|r| claimed.contains(&r.id)).collect())
    }

    async fn release_all(&self, records: &[ExecutionRecord]) {
        for record in records {
            if let Err(e) = self.store.release_claim(record.id).await {
                warn!(record = %record.id, "Failed to release claim: {}", e);
            }
        }
    }
}

fn first_prompt(plan: &EvaluationPlan) -> Result<&crate::evaluation::rubric::EvaluationRubric> {
    plan.prompts
        .first()
        .ok_or_else(|| JudgeloopError::StateConflict("evaluation plan has no prompt".to_string()))
}
