//! Batch reconciliation
//!
//! Polls provider jobs submitted by [`super::EvaluationExecutor::batch_evaluate`]
//! and turns finished results into persisted verdicts. Reconciliation is
//! idempotent: terminal jobs are skipped and records that already carry a
//! verdict are never overwritten.

use crate::config::{BatchConfig, JudgeConfig};
use crate::error::{JudgeloopError, Result};
use crate::evaluation::classifier::{classify, synthesize_accuracy, EvaluatorOutput, RubricScore, Verdict};
use crate::evaluation::executor::parse_custom_id;
use crate::evaluation::parsing::{parse_expected_output, parse_judgment, parse_rubric_score, truncate};
use crate::evaluation::rubric::{EvaluationPlan, OutputShape};
use crate::events::{EventBus, PipelineEvent};
use crate::services::judge::{BatchResultLine, ChatMessage, JudgeClient, JudgeRequest, ProviderBatchStatus};
use crate::storage::EvaluationStore;
use crate::types::{BatchJob, BatchJobStatus, EvaluationStatus, ExecutionRecord, RecordId};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Provider outcome per prompt name, for one record
type PromptResults = HashMap<String, std::result::Result<String, String>>;

/// Result of polling one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPollReport {
    pub job_id: String,
    pub status: BatchJobStatus,
    pub entries: usize,
    pub processed: usize,
    pub failed: usize,
}

/// Counters of one sweep over pending jobs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub total_batches: usize,
    pub completed_batches: usize,
    pub pending_batches: usize,
    pub total_entries: usize,
    pub processed_entries: usize,
    pub failed_entries: usize,
}

/// Clears the sweep flag when the sweep ends, including on early return
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Reconciles provider batch jobs with stored records
#[derive(Clone)]
pub struct BatchReconciler {
    store: Arc<dyn EvaluationStore>,
    judge: Arc<dyn JudgeClient>,
    events: EventBus,
    config: BatchConfig,
    judge_timeout: std::time::Duration,
    sweeping: Arc<AtomicBool>,
}

impl BatchReconciler {
    pub fn new(
        store: Arc<dyn EvaluationStore>,
        judge: Arc<dyn JudgeClient>,
        events: EventBus,
        config: BatchConfig,
        judge_config: &JudgeConfig,
    ) -> Self {
        Self {
            store,
            judge,
            events,
            config,
            judge_timeout: judge_config.timeout(),
            sweeping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Poll every pending job inside the lookback window
    ///
    /// Only one sweep runs at a time; a concurrent call gets `StateConflict`.
    pub async fn check_all_pending_batches(&self) -> Result<SweepReport> {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(JudgeloopError::StateConflict(
                "a batch sweep is already running".to_string(),
            ));
        }
        let _guard = SweepGuard(&self.sweeping);

        let since = Utc::now() - Duration::days(self.config.lookback_days);
        let jobs = self
            .store
            .pending_batch_jobs(since, self.config.max_jobs_per_sweep)
            .await?;

        let mut report = SweepReport {
            total_batches: jobs.len(),
            ..Default::default()
        };

        for job in jobs {
            match self.poll_job(&job.id).await {
                Ok(poll) => {
                    report.total_entries += poll.entries;
                    report.processed_entries += poll.processed;
                    report.failed_entries += poll.failed;
                    if poll.status.is_terminal() {
                        report.completed_batches += 1;
                    } else {
                        report.pending_batches += 1;
                    }
                }
                Err(e) => {
                    warn!(job = %job.id, "Failed to poll batch job: {}", e);
                    report.pending_batches += 1;
                }
            }
        }

        info!(
            total = report.total_batches,
            completed = report.completed_batches,
            pending = report.pending_batches,
            processed = report.processed_entries,
            failed = report.failed_entries,
            "Batch sweep finished"
        );
        Ok(report)
    }

    /// Poll one job and reconcile its results if the provider finished
    pub async fn poll_job(&self, job_id: &str) -> Result<JobPollReport> {
        let mut job = self.store.get_batch_job(job_id).await?;
        let mut report = JobPollReport {
            job_id: job.id.clone(),
            status: job.status,
            entries: job.record_ids.len(),
            processed: 0,
            failed: 0,
        };

        if job.status.is_terminal() {
            debug!(job = %job.id, "Batch job already terminal");
            return Ok(report);
        }

        let state = self.judge.batch_status(&job.id).await?;
        match state.status {
            ProviderBatchStatus::InProgress => {
                if job.status != BatchJobStatus::Processing {
                    job.status = BatchJobStatus::Processing;
                    job.updated_at = Utc::now();
                    self.store.update_batch_job(&job).await?;
                }
                report.status = job.status;
                Ok(report)
            }
            ProviderBatchStatus::Failed => {
                warn!(job = %job.id, "Provider reports batch canceled or expired");
                for mut record in self.store.records_for_batch(&job.id).await? {
                    if record.processed {
                        continue;
                    }
                    self.mark_failed(&job.id, &mut record).await;
                    report.failed += 1;
                }
                self.finish(&mut job, BatchJobStatus::Failed, 0, report.failed).await?;
                report.status = job.status;
                Ok(report)
            }
            ProviderBatchStatus::Ended => {
                let lines = self.judge.batch_results(&job.id).await?;
                let (processed, failed) = self.reconcile(&job, lines).await?;
                self.finish(&mut job, BatchJobStatus::Completed, processed, failed)
                    .await?;
                report.status = job.status;
                report.processed = processed;
                report.failed = failed;
                Ok(report)
            }
        }
    }

    async fn finish(
        &self,
        job: &mut BatchJob,
        status: BatchJobStatus,
        processed: usize,
        failed: usize,
    ) -> Result<()> {
        let now = Utc::now();
        job.status = status;
        job.processed_count = processed;
        job.failed_count = failed;
        job.updated_at = now;
        job.completed_at = Some(now);
        self.store.update_batch_job(job).await
    }

    /// Apply result lines to the job's records; returns (processed, failed)
    async fn reconcile(&self, job: &BatchJob, lines: Vec<BatchResultLine>) -> Result<(usize, usize)> {
        let mut grouped: HashMap<RecordId, PromptResults> = HashMap::new();
        for line in lines {
            match parse_custom_id(&line.custom_id) {
                Some((record_id, prompt)) => {
                    grouped.entry(record_id).or_default().insert(prompt, line.outcome);
                }
                None => warn!(job = %job.id, custom_id = %line.custom_id, "Unrecognized custom id"),
            }
        }

        let evaluator = self.store.get_endpoint(job.evaluator_id).await?;
        let plan = EvaluationPlan::for_problem_type(job.problem_type);
        let (mut processed, mut failed) = (0, 0);

        for mut record in self.store.records_for_batch(&job.id).await? {
            if record.processed {
                debug!(record = %record.id, "Record already has a verdict, skipping");
                continue;
            }

            let results = grouped.remove(&record.id).unwrap_or_default();
            match assemble(&plan, &record, &results) {
                Ok(output) => {
                    let verdict = classify(&output);
                    let payload = self.with_summary(&evaluator.name, &record, &verdict).await;

                    let mut pending = record.clone();
                    record.apply_verdict(payload, verdict.correct);
                    record.evaluation_status = Some(EvaluationStatus::Completed);
                    if let Err(e) = self.store.update_record(&record).await {
                        warn!(job = %job.id, record = %record.id, "Failed to persist verdict: {}", e);
                        self.mark_failed(&job.id, &mut pending).await;
                        failed += 1;
                        continue;
                    }
                    self.events.publish(PipelineEvent::record_evaluated(
                        record.endpoint_id,
                        record.id,
                        verdict.correct,
                    ));
                    processed += 1;
                }
                Err(e) => {
                    warn!(job = %job.id, record = %record.id, "Batch result unusable: {}", e);
                    self.mark_failed(&job.id, &mut record).await;
                    failed += 1;
                }
            }
        }

        info!(job = %job.id, processed, failed, "Reconciled batch job");
        Ok((processed, failed))
    }

    /// Best-effort move of one record to `failed`; a write error is only logged
    async fn mark_failed(&self, job_id: &str, record: &mut ExecutionRecord) {
        record.evaluation_status = Some(EvaluationStatus::Failed);
        record.updated_at = Utc::now();
        if let Err(e) = self.store.update_record(record).await {
            warn!(job = %job_id, record = %record.id, "Failed to mark record failed: {}", e);
        }
    }

    /// Attach a short natural-language summary; a failed summary is skipped
    async fn with_summary(&self, evaluator: &str, record: &ExecutionRecord, verdict: &Verdict) -> serde_json::Value {
        let mut payload = verdict.payload.clone();
        if !self.config.generate_summaries {
            return payload;
        }

        let request = JudgeRequest::new(vec![
            ChatMessage::system(
                "Summarize in at most two sentences why the evaluation below judged the output \
                 correct or incorrect. Reply with plain text.",
            ),
            ChatMessage::user(format!(
                "EVALUATOR: {}\nOUTPUT:\n{}\n\nEVALUATION:\n{}",
                evaluator,
                truncate(&record.output.to_string(), 2000),
                verdict.payload
            )),
        ]);

        let summary = tokio::time::timeout(self.judge_timeout, self.judge.complete(&request)).await;
        match summary {
            Ok(Ok(completion)) => {
                if let Some(map) = payload.as_object_mut() {
                    map.insert(
                        "summary".to_string(),
                        serde_json::Value::String(completion.text.trim().to_string()),
                    );
                }
            }
            Ok(Err(e)) => warn!(record = %record.id, "Summary generation failed: {}", e),
            Err(_) => warn!(record = %record.id, "Summary generation timed out"),
        }
        payload
    }
}

/// Build the evaluator output of one record from its per-prompt results
///
/// For rubric plans a missing or malformed rubric scores 0 with the error
/// recorded; the record fails only when no rubric produced any text.
fn assemble(plan: &EvaluationPlan, record: &ExecutionRecord, results: &PromptResults) -> Result<EvaluatorOutput> {
    if results.is_empty() {
        return Err(JudgeloopError::NotFound(format!("results for record {}", record.id)));
    }

    match plan.shape {
        OutputShape::Rubrics => {
            if results.values().all(|r| r.is_err()) {
                let reason = results
                    .values()
                    .filter_map(|r| r.as_ref().err())
                    .next()
                    .cloned()
                    .unwrap_or_default();
                return Err(JudgeloopError::Provider(reason));
            }

            let mut rubrics = Vec::with_capacity(plan.prompts.len() + 1);
            for prompt in &plan.prompts {
                let scored = match results.get(&prompt.name) {
                    Some(Ok(text)) => parse_rubric_score(&prompt.name, text).map_err(|e| e.to_string()),
                    Some(Err(e)) => Err(e.clone()),
                    None => Err("no result returned".to_string()),
                };
                rubrics.push(scored.unwrap_or_else(|error| RubricScore {
                    evaluator: prompt.name.clone(),
                    score: 0.0,
                    analysis: String::new(),
                    errors: vec![error],
                }));
            }
            if plan.derives_accuracy {
                synthesize_accuracy(&mut rubrics);
            }
            Ok(EvaluatorOutput::Rubrics { rubrics })
        }
        OutputShape::Classification => {
            let text = single_text(plan, results)?;
            Ok(EvaluatorOutput::Classification {
                model_output: record.output.clone(),
                expected_output: parse_expected_output(text)?,
            })
        }
        OutputShape::Judgment => {
            let (relevance, coherence, correctness) = parse_judgment(single_text(plan, results)?)?;
            Ok(EvaluatorOutput::Judgment {
                relevance,
                coherence,
                correctness,
            })
        }
    }
}

fn single_text<'a>(plan: &EvaluationPlan, results: &'a PromptResults) -> Result<&'a str> {
    let name = plan
        .prompts
        .first()
        .map(|p| p.name.as_str())
        .ok_or_else(|| JudgeloopError::StateConflict("evaluation plan has no prompt".to_string()))?;

    match results.get(name) {
        Some(Ok(text)) => Ok(text),
        Some(Err(e)) => Err(JudgeloopError::Provider(e.clone())),
        None => Err(JudgeloopError::NotFound(format!("result for prompt {}", name))),
    }
}
