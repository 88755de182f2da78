// Background Job Scheduler
//
// Runs evaluation cycles and batch sweeps on fixed intervals, each under a
// per-job timeout, and keeps a bounded in-memory run history.

use crate::config::SchedulerConfig;
use crate::error::JudgeloopError;
use crate::evaluation::batch::BatchReconciler;
use crate::evaluation::executor::EvaluationExecutor;
use crate::types::EndpointId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep, timeout};

/// Runs kept in the history
const HISTORY_LIMIT: usize = 100;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("Job execution failed: {0}")]
    ExecutionError(String),

    #[error("Engine error: {0}")]
    Engine(#[from] JudgeloopError),
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler has no jobs")]
    NoJobs,

    #[error("Job error: {0}")]
    JobError(#[from] JobError),
}

/// Report generated after job execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    /// Records (or batch entries) looked at
    pub records_processed: usize,

    /// Verdicts or job transitions written
    pub changes_made: usize,

    #[serde(with = "serde_duration_millis")]
    pub duration: Duration,

    pub errors: usize,

    pub error_message: Option<String>,
}

impl JobReport {
    fn failed(duration: Duration, message: String) -> Self {
        Self {
            records_processed: 0,
            changes_made: 0,
            duration,
            errors: 1,
            error_message: Some(message),
        }
    }
}

// Duration as milliseconds
mod serde_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// A periodic pipeline job
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    fn name(&self) -> &str;

    /// Time between two runs
    fn interval(&self) -> Duration;

    async fn run(&self) -> Result<JobReport, JobError>;
}

/// One execution in the history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: String,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub report: Option<JobReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Running,
    Success,
    Failed,
    Timeout,
}

/// Synchronous evaluation cycle for a set of evaluators
pub struct EvaluationCycleJob {
    executor: EvaluationExecutor,
    evaluators: Vec<EndpointId>,
    interval: Duration,
}

impl EvaluationCycleJob {
    pub fn new(executor: EvaluationExecutor, evaluators: Vec<EndpointId>, interval: Duration) -> Self {
        Self {
            executor,
            evaluators,
            interval,
        }
    }
}

#[async_trait]
impl ScheduledJob for EvaluationCycleJob {
    fn name(&self) -> &str {
        "evaluation_cycle"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<JobReport, JobError> {
        let started = Instant::now();
        let mut report = JobReport {
            records_processed: 0,
            changes_made: 0,
            duration: Duration::ZERO,
            errors: 0,
            error_message: None,
        };

        for evaluator in &self.evaluators {
            match self.executor.run_cycle(*evaluator).await {
                Ok(cycle) => {
                    report.records_processed += cycle.claimed;
                    report.changes_made += cycle.evaluated;
                    report.errors += cycle.failed;
                }
                Err(e) => {
                    tracing::warn!("Evaluation cycle for {} failed: {}", evaluator, e);
                    report.errors += 1;
                    report.error_message = Some(e.to_string());
                }
            }
        }

        report.duration = started.elapsed();
        Ok(report)
    }
}

/// Sweep of pending provider batch jobs
pub struct BatchSweepJob {
    reconciler: BatchReconciler,
    interval: Duration,
}

impl BatchSweepJob {
    pub fn new(reconciler: BatchReconciler, interval: Duration) -> Self {
        Self { reconciler, interval }
    }
}

#[async_trait]
impl ScheduledJob for BatchSweepJob {
    fn name(&self) -> &str {
        "batch_sweep"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<JobReport, JobError> {
        let started = Instant::now();
        let sweep = self.reconciler.check_all_pending_batches().await?;
        Ok(JobReport {
            records_processed: sweep.total_entries,
            changes_made: sweep.processed_entries,
            duration: started.elapsed(),
            errors: sweep.failed_entries,
            error_message: None,
        })
    }
}

/// Background job scheduler
pub struct BackgroundScheduler {
    config: SchedulerConfig,
    jobs: Vec<Arc<dyn ScheduledJob>>,
    running: Arc<AtomicBool>,
    stop_signal: Notify,
    last_runs: Mutex<HashMap<String, Instant>>,
    history: Mutex<VecDeque<JobRun>>,
}

impl BackgroundScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            jobs: Vec::new(),
            running: Arc::new(AtomicBool::new(false)),
            stop_signal: Notify::new(),
            last_runs: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Register a job with the scheduler
    pub fn register_job(&mut self, job: Arc<dyn ScheduledJob>) {
        self.jobs.push(job);
    }

    /// Start the scheduler (runs until stopped)
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.jobs.is_empty() {
            return Err(SchedulerError::NoJobs);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        tracing::info!("Starting background scheduler with {} jobs", self.jobs.len());
        let tick = self.tick();

        loop {
            if !self.running.load(Ordering::SeqCst) {
                tracing::info!("Stopping background scheduler");
                break;
            }

            for job in &self.jobs {
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }

                if self.is_due(job.as_ref()).await {
                    tracing::info!("Running scheduled job: {}", job.name());
                    if let Err(e) = self.run_job(job.as_ref()).await {
                        tracing::error!("Job {} failed: {}", job.name(), e);
                    }
                } else {
                    tracing::debug!("Job {} not due yet", job.name());
                }
            }

            tokio::select! {
                _ = sleep(tick) => {}
                _ = self.stop_signal.notified() => {}
            }
        }

        Ok(())
    }

    /// Stop the scheduler
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop_signal.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Shortest job interval, at least one second
    fn tick(&self) -> Duration {
        self.jobs
            .iter()
            .map(|j| j.interval())
            .min()
            .unwrap_or(Duration::from_secs(self.config.evaluation_interval_secs))
            .max(Duration::from_secs(1))
    }

    async fn is_due(&self, job: &dyn ScheduledJob) -> bool {
        let last_runs = self.last_runs.lock().await;
        match last_runs.get(job.name()) {
            Some(last) => last.elapsed() >= job.interval(),
            None => true,
        }
    }

    /// Run a specific job with timeout
    async fn run_job(&self, job: &dyn ScheduledJob) -> Result<JobReport, SchedulerError> {
        let job_name = job.name();
        let max_duration = Duration::from_secs(self.config.max_job_duration_secs);
        let started_at = Utc::now();
        let started = Instant::now();
        let job_id = uuid::Uuid::new_v4().to_string();

        self.last_runs
            .lock()
            .await
            .insert(job_name.to_string(), started);

        tracing::info!("Starting job {} (id: {})", job_name, job_id);

        let (status, report) = match timeout(max_duration, job.run()).await {
            Ok(Ok(report)) => {
                tracing::info!(
                    "Job {} completed: {} changes in {:?}",
                    job_name,
                    report.changes_made,
                    report.duration
                );
                (JobStatus::Success, report)
            }
            Ok(Err(e)) => {
                tracing::error!("Job {} failed: {}", job_name, e);
                (JobStatus::Failed, JobReport::failed(started.elapsed(), e.to_string()))
            }
            Err(_) => {
                tracing::error!("Job {} timed out after {:?}", job_name, max_duration);
                (
                    JobStatus::Timeout,
                    JobReport::failed(max_duration, JobError::Timeout(max_duration).to_string()),
                )
            }
        };

        self.record_job_run(JobRun {
            id: job_id,
            job_name: job_name.to_string(),
            started_at,
            completed_at: Some(Utc::now()),
            status,
            report: Some(report.clone()),
        })
        .await;

        Ok(report)
    }

    async fn record_job_run(&self, job_run: JobRun) {
        tracing::debug!("Job run recorded: {} - {:?}", job_run.job_name, job_run.status);
        let mut history = self.history.lock().await;
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(job_run);
    }

    /// Most recent runs first, optionally filtered by job name
    pub async fn get_job_history(&self, job_name: Option<&str>, limit: usize) -> Vec<JobRun> {
        let history = self.history.lock().await;
        history
            .iter()
            .rev()
            .filter(|run| job_name.map(|name| run.job_name == name).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestJob {
        name: String,
        will_fail: bool,
        delay: Duration,
    }

    impl TestJob {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                will_fail: false,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl ScheduledJob for TestJob {
        fn name(&self) -> &str {
            &self.name
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(60)
        }

        async fn run(&self) -> Result<JobReport, JobError> {
            sleep(self.delay).await;
            if self.will_fail {
                return Err(JobError::ExecutionError("Test failure".to_string()));
            }

            Ok(JobReport {
                records_processed: 12,
                changes_made: 3,
                duration: Duration::from_millis(5),
                errors: 0,
                error_message: None,
            })
        }
    }

    #[test]
    fn test_job_report_serialization() {
        let report = JobReport {
            records_processed: 12,
            changes_made: 3,
            duration: Duration::from_millis(500),
            errors: 0,
            error_message: None,
        };

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"duration\":500"));
        let deserialized: JobReport = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.duration, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_run_successful_job() {
        let scheduler = BackgroundScheduler::new(SchedulerConfig::default());
        let job = TestJob::new("sweep");

        let report = tokio_test::assert_ok!(scheduler.run_job(&job).await);
        assert_eq!(report.changes_made, 3);
        assert_eq!(report.errors, 0);

        let history = scheduler.get_job_history(Some("sweep"), 10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, JobStatus::Success);
    }

    #[tokio::test]
    async fn test_run_failing_job_returns_report() {
        let scheduler = BackgroundScheduler::new(SchedulerConfig::default());
        let mut job = TestJob::new("cycle");
        job.will_fail = true;

        let report = scheduler.run_job(&job).await.unwrap();
        assert_eq!(report.errors, 1);
        assert!(report.error_message.is_some());
    }

    #[tokio::test]
    async fn test_job_timeout() {
        let config = SchedulerConfig {
            max_job_duration_secs: 0,
            ..Default::default()
        };
        let scheduler = BackgroundScheduler::new(config);
        let mut job = TestJob::new("slow");
        job.delay = Duration::from_secs(5);

        let report = scheduler.run_job(&job).await.unwrap();
        assert_eq!(report.errors, 1);
        let history = scheduler.get_job_history(None, 10).await;
        assert_eq!(history[0].status, JobStatus::Timeout);
    }

    #[tokio::test]
    async fn test_job_not_due_twice() {
        let scheduler = BackgroundScheduler::new(SchedulerConfig::default());
        let job = TestJob::new("cycle");

        assert!(scheduler.is_due(&job).await);
        scheduler.run_job(&job).await.unwrap();
        assert!(!scheduler.is_due(&job).await);
    }

    #[tokio::test]
    async fn test_start_without_jobs_fails() {
        let scheduler = BackgroundScheduler::new(SchedulerConfig::default());
        assert!(matches!(scheduler.start().await, Err(SchedulerError::NoJobs)));
    }

    #[tokio::test]
    async fn test_stop_ends_loop() {
        let mut scheduler = BackgroundScheduler::new(SchedulerConfig::default());
        scheduler.register_job(Arc::new(TestJob::new("quick")));
        let scheduler = Arc::new(scheduler);

        let runner = Arc::clone(&scheduler);
        let handle = tokio::spawn(async move { runner.start().await });

        sleep(Duration::from_millis(50)).await;
        scheduler.stop();
        let result = tokio::time::timeout(Duration::from_secs(3), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
        assert_eq!(scheduler.get_job_history(None, 10).await.len(), 1);
    }
}
