//! Common test utilities and helpers

#![allow(dead_code)]

use async_trait::async_trait;
use judgeloop_core::{
    error::{JudgeloopError, Result},
    services::{
        invoker::EndpointInvoker,
        judge::{
            BatchCounts, BatchRequest, BatchResultLine, JudgeCompletion, JudgeRequest,
            ProviderBatchState, ProviderBatchStatus, Usage,
        },
        InMemoryMetricsCache,
    },
    types::{
        Attachment, BatchJob, ChallengerAssignment, DeployHistoryEntry, EndpointId, Insight,
        PromptVersion, RecordId,
    },
    ActivationPolicy, EngineConfig, EvaluationStore, EventBus, EventWorker, ExecutionRecord,
    ImprovementLoop, JudgeClient, MemoryStore, MonitoredEndpoint, ProblemType,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Responder = Box<dyn Fn(&JudgeRequest) -> Option<std::result::Result<String, String>> + Send + Sync>;

/// Judge double: queued replies first, then the responder, else a provider error
#[derive(Default)]
pub struct ScriptedJudge {
    queue: Mutex<VecDeque<std::result::Result<String, String>>>,
    responder: Mutex<Option<Responder>>,
    requests: Mutex<Vec<JudgeRequest>>,
    batches: Mutex<Vec<Vec<BatchRequest>>>,
    batch_error: Mutex<Option<String>>,
    batch_status: Mutex<Option<ProviderBatchStatus>>,
    batch_lines: Mutex<Vec<BatchResultLine>>,
}

impl ScriptedJudge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_ok(&self, text: impl Into<String>) {
        self.queue.lock().unwrap().push_back(Ok(text.into()));
    }

    pub fn push_err(&self, message: impl Into<String>) {
        self.queue.lock().unwrap().push_back(Err(message.into()));
    }

    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&JudgeRequest) -> Option<std::result::Result<String, String>> + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(responder));
    }

    /// Number of synchronous completions served or refused
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<JudgeRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn submitted_batches(&self) -> Vec<Vec<BatchRequest>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn fail_batch_creation(&self, message: &str) {
        *self.batch_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn set_batch_status(&self, status: ProviderBatchStatus) {
        *self.batch_status.lock().unwrap() = Some(status);
    }

    pub fn set_batch_lines(&self, lines: Vec<BatchResultLine>) {
        *self.batch_lines.lock().unwrap() = lines;
    }
}

#[async_trait]
impl JudgeClient for ScriptedJudge {
    async fn complete(&self, request: &JudgeRequest) -> Result<JudgeCompletion> {
        self.requests.lock().unwrap().push(request.clone());

        let reply = self.queue.lock().unwrap().pop_front().or_else(|| {
            self.responder
                .lock()
                .unwrap()
                .as_ref()
                .and_then(|respond| respond(request))
        });

        match reply {
            Some(Ok(text)) => Ok(JudgeCompletion {
                text,
                usage: Usage::default(),
            }),
            Some(Err(message)) => Err(JudgeloopError::Provider(message)),
            None => Err(JudgeloopError::Provider("no scripted reply".to_string())),
        }
    }

    async fn create_batch(&self, requests: &[BatchRequest]) -> Result<String> {
        if let Some(message) = self.batch_error.lock().unwrap().clone() {
            return Err(JudgeloopError::Provider(message));
        }
        let mut batches = self.batches.lock().unwrap();
        batches.push(requests.to_vec());
        Ok(format!("msgbatch_test_{}", batches.len()))
    }

    async fn batch_status(&self, _batch_id: &str) -> Result<ProviderBatchState> {
        let status = self
            .batch_status
            .lock()
            .unwrap()
            .unwrap_or(ProviderBatchStatus::InProgress);
        Ok(ProviderBatchState {
            status,
            counts: BatchCounts::default(),
        })
    }

    async fn batch_results(&self, _batch_id: &str) -> Result<Vec<BatchResultLine>> {
        Ok(self.batch_lines.lock().unwrap().clone())
    }
}

/// Invoker double: echoes a fixed output, or fails for selected inputs
#[derive(Default)]
pub struct ScriptedInvoker {
    output: Mutex<Value>,
    failing_inputs: Mutex<Vec<Value>>,
    calls: Mutex<usize>,
}

impl ScriptedInvoker {
    pub fn new(output: Value) -> Arc<Self> {
        Arc::new(Self {
            output: Mutex::new(output),
            ..Default::default()
        })
    }

    pub fn fail_on(&self, input: Value) {
        self.failing_inputs.lock().unwrap().push(input);
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl EndpointInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        _endpoint: &MonitoredEndpoint,
        input: &Value,
        _attachments: &[Attachment],
    ) -> Result<Value> {
        *self.calls.lock().unwrap() += 1;
        if self.failing_inputs.lock().unwrap().contains(input) {
            return Err(JudgeloopError::Provider("endpoint unavailable".to_string()));
        }
        Ok(self.output.lock().unwrap().clone())
    }
}

/// Test configuration: short timeouts, no batch summaries
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.judge.api_key = "test-key".to_string();
    config.judge.timeout_secs = 5;
    config.batch.generate_summaries = false;
    config
}

/// Everything wired against in-memory doubles
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub judge: Arc<ScriptedJudge>,
    pub invoker: Arc<ScriptedInvoker>,
    pub cache: Arc<InMemoryMetricsCache>,
    pub events: EventBus,
    pub worker: EventWorker,
    pub pipeline: ImprovementLoop,
}

pub fn harness(config: &EngineConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    harness_over(config, store.clone(), store)
}

/// Harness whose pipeline writes through `FailingWrites`; seeding still uses the inner store
pub fn harness_with_failing_writes(config: &EngineConfig) -> (Harness, Arc<FailingWrites>) {
    let store = Arc::new(MemoryStore::new());
    let failing = Arc::new(FailingWrites::new(store.clone()));
    (harness_over(config, store, failing.clone()), failing)
}

fn harness_over(config: &EngineConfig, store: Arc<MemoryStore>, backend: Arc<dyn EvaluationStore>) -> Harness {
    let judge = ScriptedJudge::new();
    let invoker = ScriptedInvoker::new(json!("challenger answer"));
    let cache = Arc::new(InMemoryMetricsCache::new(Duration::from_secs(60)));
    let (events, worker) = EventBus::channel(1024, cache.clone());

    let pipeline = ImprovementLoop::new(
        config,
        backend,
        judge.clone(),
        invoker.clone(),
        events.clone(),
    );

    Harness {
        store,
        judge,
        invoker,
        cache,
        events,
        worker,
        pipeline,
    }
}

/// Insert a base endpoint and an evaluator reviewing it
pub async fn seed_endpoints(
    store: &MemoryStore,
    problem_type: ProblemType,
    policy: ActivationPolicy,
) -> (MonitoredEndpoint, MonitoredEndpoint) {
    let mut base = MonitoredEndpoint::new("support-answers", "Answer the customer question", problem_type);
    let evaluator = MonitoredEndpoint::evaluator("support-judge", &base, policy);
    base.reviewer_ids.push(evaluator.id);

    store.insert_endpoint(&base).await.unwrap();
    store.insert_endpoint(&evaluator).await.unwrap();
    (base, evaluator)
}

/// Insert `n` unprocessed production records for the endpoint
pub async fn seed_records(store: &MemoryStore, endpoint: &MonitoredEndpoint, n: usize) -> Vec<ExecutionRecord> {
    let mut records = Vec::with_capacity(n);
    for i in 0..n {
        let record = ExecutionRecord::new(
            endpoint.id,
            json!({ "question": format!("question {}", i) }),
            json!(format!("answer {}", i)),
        );
        store.insert_record(&record).await.unwrap();
        records.push(record);
    }
    records
}

/// Judgment reply with the given correctness score
pub fn judgment(correctness: u8) -> String {
    format!(
        r#"{{"relevance": 9, "coherence": 9, "correctness": {}}}"#,
        correctness
    )
}

/// Whether the request's system prompt contains `needle`
pub fn system_contains(request: &JudgeRequest, needle: &str) -> bool {
    request
        .messages
        .first()
        .map(|m| m.content.text().contains(needle))
        .unwrap_or(false)
}

/// Store double that refuses to persist verdicts for selected records
pub struct FailingWrites {
    inner: Arc<MemoryStore>,
    failing: Mutex<Vec<RecordId>>,
}

impl FailingWrites {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            failing: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_verdicts_for(&self, id: RecordId) {
        self.failing.lock().unwrap().push(id);
    }
}

#[async_trait]
impl EvaluationStore for FailingWrites {
    async fn get_endpoint(&self, id: EndpointId) -> Result<MonitoredEndpoint> {
        self.inner.get_endpoint(id).await
    }

    async fn insert_endpoint(&self, endpoint: &MonitoredEndpoint) -> Result<()> {
        self.inner.insert_endpoint(endpoint).await
    }

    async fn update_endpoint(&self, endpoint: &MonitoredEndpoint) -> Result<()> {
        self.inner.update_endpoint(endpoint).await
    }

    async fn evaluator_for(&self, endpoint_id: EndpointId) -> Result<Option<MonitoredEndpoint>> {
        self.inner.evaluator_for(endpoint_id).await
    }

    async fn get_record(&self, id: RecordId) -> Result<ExecutionRecord> {
        self.inner.get_record(id).await
    }

    async fn insert_record(&self, record: &ExecutionRecord) -> Result<()> {
        self.inner.insert_record(record).await
    }

    async fn update_record(&self, record: &ExecutionRecord) -> Result<()> {
        if record.processed && self.failing.lock().unwrap().contains(&record.id) {
            return Err(JudgeloopError::Other("db write failed".to_string()));
        }
        self.inner.update_record(record).await
    }

    async fn backlog(
        &self,
        endpoint_id: EndpointId,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>> {
        self.inner.backlog(endpoint_id, since, now).await
    }

    async fn claim_records(
        &self,
        ids: &[RecordId],
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecordId>> {
        self.inner.claim_records(ids, lease_until, now).await
    }

    async fn release_claim(&self, id: RecordId) -> Result<()> {
        self.inner.release_claim(id).await
    }

    async fn record_batch_submission(&self, job: &BatchJob) -> Result<()> {
        self.inner.record_batch_submission(job).await
    }

    async fn get_batch_job(&self, id: &str) -> Result<BatchJob> {
        self.inner.get_batch_job(id).await
    }

    async fn update_batch_job(&self, job: &BatchJob) -> Result<()> {
        self.inner.update_batch_job(job).await
    }

    async fn pending_batch_jobs(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<BatchJob>> {
        self.inner.pending_batch_jobs(since, limit).await
    }

    async fn records_for_batch(&self, job_id: &str) -> Result<Vec<ExecutionRecord>> {
        self.inner.records_for_batch(job_id).await
    }

    async fn insert_insight(&self, insight: &Insight) -> Result<()> {
        self.inner.insert_insight(insight).await
    }

    async fn recent_insights(&self, endpoint_id: EndpointId, limit: usize) -> Result<Vec<Insight>> {
        self.inner.recent_insights(endpoint_id, limit).await
    }

    async fn prompt_versions(&self, endpoint_id: EndpointId) -> Result<Vec<PromptVersion>> {
        self.inner.prompt_versions(endpoint_id).await
    }

    async fn insert_prompt_version(&self, endpoint_id: EndpointId, prompt: &str) -> Result<PromptVersion> {
        self.inner.insert_prompt_version(endpoint_id, prompt).await
    }

    async fn release_prompt_version(
        &self,
        endpoint_id: EndpointId,
        version: u32,
        scope: &[EndpointId],
    ) -> Result<DeployHistoryEntry> {
        self.inner.release_prompt_version(endpoint_id, version, scope).await
    }

    async fn deploy_history(&self, endpoint_id: EndpointId) -> Result<Vec<DeployHistoryEntry>> {
        self.inner.deploy_history(endpoint_id).await
    }

    async fn principal_assignment(&self, base_id: EndpointId) -> Result<Option<ChallengerAssignment>> {
        self.inner.principal_assignment(base_id).await
    }

    async fn insert_assignment(&self, assignment: &ChallengerAssignment) -> Result<()> {
        self.inner.insert_assignment(assignment).await
    }

    async fn unreplayed_records(
        &self,
        base_id: EndpointId,
        challenger_id: EndpointId,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        self.inner.unreplayed_records(base_id, challenger_id, limit).await
    }
}
