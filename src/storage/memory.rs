//! In-memory storage backend
//!
//! Keeps every table in one `RwLock`-guarded state so multi-row operations
//! (claims, batch submission, prompt release) apply atomically. State can be
//! saved to and loaded from a JSON snapshot file.

use crate::error::{JudgeloopError, Result};
use crate::storage::EvaluationStore;
use crate::types::{
    BatchJob, ChallengerAssignment, DeployHistoryEntry, EndpointId, EvaluationStatus,
    ExecutionRecord, Insight, MonitoredEndpoint, PromptVersion, RecordId, AB_TEST_ENV,
    PRODUCTION_ENV,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct StoreState {
    endpoints: HashMap<EndpointId, MonitoredEndpoint>,
    records: HashMap<RecordId, ExecutionRecord>,
    batch_jobs: HashMap<String, BatchJob>,
    insights: Vec<Insight>,
    prompt_versions: HashMap<EndpointId, Vec<PromptVersion>>,
    deploy_history: Vec<DeployHistoryEntry>,
    assignments: Vec<ChallengerAssignment>,
}

/// Serialized form of the whole store
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub endpoints: Vec<MonitoredEndpoint>,
    #[serde(default)]
    pub records: Vec<ExecutionRecord>,
    #[serde(default)]
    pub batch_jobs: Vec<BatchJob>,
    #[serde(default)]
    pub insights: Vec<Insight>,
    #[serde(default)]
    pub prompt_versions: Vec<PromptVersion>,
    #[serde(default)]
    pub deploy_history: Vec<DeployHistoryEntry>,
    #[serde(default)]
    pub assignments: Vec<ChallengerAssignment>,
}

/// In-memory [`EvaluationStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a snapshot
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut state = StoreState {
            endpoints: snapshot.endpoints.into_iter().map(|e| (e.id, e)).collect(),
            records: snapshot.records.into_iter().map(|r| (r.id, r)).collect(),
            batch_jobs: snapshot
                .batch_jobs
                .into_iter()
                .map(|j| (j.id.clone(), j))
                .collect(),
            insights: snapshot.insights,
            prompt_versions: HashMap::new(),
            deploy_history: snapshot.deploy_history,
            assignments: snapshot.assignments,
        };

        for version in snapshot.prompt_versions {
            state
                .prompt_versions
                .entry(version.endpoint_id)
                .or_default()
                .push(version);
        }
        for versions in state.prompt_versions.values_mut() {
            versions.sort_by_key(|v| v.version);
        }

        Self {
            state: RwLock::new(state),
        }
    }

    /// Load a snapshot file; a missing file yields an empty store
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No state snapshot at {}, starting empty", path.display());
            return Ok(Self::new());
        }

        let raw = tokio::fs::read_to_string(path).await?;
        let snapshot: Snapshot = serde_json::from_str(&raw)?;
        debug!(
            "Loaded snapshot with {} endpoints and {} records",
            snapshot.endpoints.len(),
            snapshot.records.len()
        );
        Ok(Self::from_snapshot(snapshot))
    }

    /// Export the current state
    pub async fn snapshot(&self) -> Snapshot {
        let state = self.state.read().await;

        let mut endpoints: Vec<_> = state.endpoints.values().cloned().collect();
        endpoints.sort_by_key(|e| e.created_at);
        let mut records: Vec<_> = state.records.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        let mut batch_jobs: Vec<_> = state.batch_jobs.values().cloned().collect();
        batch_jobs.sort_by_key(|j| j.created_at);

        Snapshot {
            endpoints,
            records,
            batch_jobs,
            insights: state.insights.clone(),
            prompt_versions: state.prompt_versions.values().flatten().cloned().collect(),
            deploy_history: state.deploy_history.clone(),
            assignments: state.assignments.clone(),
        }
    }

    /// Write the current state to a snapshot file
    pub async fn save(&self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot().await;
        let raw = serde_json::to_string_pretty(&snapshot)?;
        tokio::fs::write(path, raw).await?;
        debug!("Saved state snapshot to {}", path.display());
        Ok(())
    }
}

fn live_endpoint(state: &StoreState, id: EndpointId) -> Result<&MonitoredEndpoint> {
    state
        .endpoints
        .get(&id)
        .filter(|e| !e.is_deleted())
        .ok_or_else(|| JudgeloopError::NotFound(format!("endpoint {}", id)))
}

#[async_trait]
impl EvaluationStore for MemoryStore {
    async fn get_endpoint(&self, id: EndpointId) -> Result<MonitoredEndpoint> {
        let state = self.state.read().await;
        live_endpoint(&state, id).cloned()
    }

    async fn insert_endpoint(&self, endpoint: &MonitoredEndpoint) -> Result<()> {
        let mut state = self.state.write().await;
        if state.endpoints.contains_key(&endpoint.id) {
            return Err(JudgeloopError::StateConflict(format!(
                "endpoint {} already exists",
                endpoint.id
            )));
        }
        state.endpoints.insert(endpoint.id, endpoint.clone());
        Ok(())
    }

    async fn update_endpoint(&self, endpoint: &MonitoredEndpoint) -> Result<()> {
        let mut state = self.state.write().await;
        let slot = state
            .endpoints
            .get_mut(&endpoint.id)
            .ok_or_else(|| JudgeloopError::NotFound(format!("endpoint {}", endpoint.id)))?;
        *slot = endpoint.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn evaluator_for(&self, endpoint_id: EndpointId) -> Result<Option<MonitoredEndpoint>> {
        let state = self.state.read().await;
        let mut evaluators: Vec<_> = state
            .endpoints
            .values()
            .filter(|e| e.is_reviewer && !e.is_deleted() && e.reviews == Some(endpoint_id))
            .collect();
        evaluators.sort_by_key(|e| e.created_at);
        Ok(evaluators.first().map(|e| (*e).clone()))
    }

    async fn get_record(&self, id: RecordId) -> Result<ExecutionRecord> {
        let state = self.state.read().await;
        state
            .records
            .get(&id)
            .filter(|r| r.deleted_at.is_none())
            .cloned()
            .ok_or_else(|| JudgeloopError::NotFound(format!("record {}", id)))
    }

    async fn insert_record(&self, record: &ExecutionRecord) -> Result<()> {
        let mut state = self.state.write().await;
        if state.records.contains_key(&record.id) {
            return Err(JudgeloopError::StateConflict(format!(
                "record {} already exists",
                record.id
            )));
        }
        state.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn update_record(&self, record: &ExecutionRecord) -> Result<()> {
        let mut state = self.state.write().await;
        let slot = state
            .records
            .get_mut(&record.id)
            .ok_or_else(|| JudgeloopError::NotFound(format!("record {}", record.id)))?;
        *slot = record.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn backlog(
        &self,
        endpoint_id: EndpointId,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>> {
        let state = self.state.read().await;
        let mut records: Vec<_> = state
            .records
            .values()
            .filter(|r| {
                r.endpoint_id == endpoint_id
                    && r.actual.is_none()
                    && r.environment == PRODUCTION_ENV
                    && r.created_at >= since
                    && r.is_claimable(now)
            })
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn claim_records(
        &self,
        ids: &[RecordId],
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecordId>> {
        let mut state = self.state.write().await;
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = state.records.get_mut(id) {
                if record.is_claimable(now) {
                    record.claimed_until = Some(lease_until);
                    claimed.push(*id);
                }
            }
        }
        Ok(claimed)
    }

    async fn release_claim(&self, id: RecordId) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(record) = state.records.get_mut(&id) {
            record.claimed_until = None;
        }
        Ok(())
    }

    async fn record_batch_submission(&self, job: &BatchJob) -> Result<()> {
        let mut state = self.state.write().await;
        if state.batch_jobs.contains_key(&job.id) {
            return Err(JudgeloopError::StateConflict(format!(
                "batch job {} already recorded",
                job.id
            )));
        }
        if let Some(missing) = job.record_ids.iter().find(|id| !state.records.contains_key(id)) {
            return Err(JudgeloopError::NotFound(format!("record {}", missing)));
        }

        let now = Utc::now();
        for id in &job.record_ids {
            if let Some(record) = state.records.get_mut(id) {
                record.evaluation_status = Some(EvaluationStatus::Processing);
                record.batch_job_id = Some(job.id.clone());
                record.claimed_until = None;
                record.updated_at = now;
            }
        }
        state.batch_jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_batch_job(&self, id: &str) -> Result<BatchJob> {
        let state = self.state.read().await;
        state
            .batch_jobs
            .get(id)
            .cloned()
            .ok_or_else(|| JudgeloopError::NotFound(format!("batch job {}", id)))
    }

    async fn update_batch_job(&self, job: &BatchJob) -> Result<()> {
        let mut state = self.state.write().await;
        let slot = state
            .batch_jobs
            .get_mut(&job.id)
            .ok_or_else(|| JudgeloopError::NotFound(format!("batch job {}", job.id)))?;
        *slot = job.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn pending_batch_jobs(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<BatchJob>> {
        let state = self.state.read().await;
        let mut jobs: Vec<_> = state
            .batch_jobs
            .values()
            .filter(|j| !j.status.is_terminal() && j.created_at >= since)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn records_for_batch(&self, job_id: &str) -> Result<Vec<ExecutionRecord>> {
        let state = self.state.read().await;
        let mut records: Vec<_> = state
            .records
            .values()
            .filter(|r| r.batch_job_id.as_deref() == Some(job_id))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn insert_insight(&self, insight: &Insight) -> Result<()> {
        let mut state = self.state.write().await;
        state.insights.push(insight.clone());
        Ok(())
    }

    async fn recent_insights(&self, endpoint_id: EndpointId, limit: usize) -> Result<Vec<Insight>> {
        let state = self.state.read().await;
        let mut insights: Vec<_> = state
            .insights
            .iter()
            .filter(|i| i.endpoint_id == endpoint_id)
            .cloned()
            .collect();
        insights.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        insights.truncate(limit);
        Ok(insights)
    }

    async fn prompt_versions(&self, endpoint_id: EndpointId) -> Result<Vec<PromptVersion>> {
        let state = self.state.read().await;
        Ok(state
            .prompt_versions
            .get(&endpoint_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_prompt_version(&self, endpoint_id: EndpointId, prompt: &str) -> Result<PromptVersion> {
        let mut state = self.state.write().await;
        live_endpoint(&state, endpoint_id)?;

        let versions = state.prompt_versions.entry(endpoint_id).or_default();
        let next = versions.iter().map(|v| v.version).max().unwrap_or(0) + 1;
        let version = PromptVersion {
            endpoint_id,
            version: next,
            prompt: prompt.to_string(),
            active_version: false,
            created_at: Utc::now(),
        };
        versions.push(version.clone());
        Ok(version)
    }

    async fn release_prompt_version(
        &self,
        endpoint_id: EndpointId,
        version: u32,
        scope: &[EndpointId],
    ) -> Result<DeployHistoryEntry> {
        let mut state = self.state.write().await;
        live_endpoint(&state, endpoint_id)?;

        let prompt = state
            .prompt_versions
            .get(&endpoint_id)
            .and_then(|versions| versions.iter().find(|v| v.version == version))
            .map(|v| v.prompt.clone())
            .ok_or_else(|| {
                JudgeloopError::NotFound(format!("version {} of endpoint {}", version, endpoint_id))
            })?;

        for id in scope.iter().chain(std::iter::once(&endpoint_id)) {
            if let Some(versions) = state.prompt_versions.get_mut(id) {
                for v in versions.iter_mut() {
                    v.active_version = false;
                }
            }
        }

        if let Some(target) = state
            .prompt_versions
            .get_mut(&endpoint_id)
            .and_then(|versions| versions.iter_mut().find(|v| v.version == version))
        {
            target.active_version = true;
        }

        let now = Utc::now();
        if let Some(endpoint) = state.endpoints.get_mut(&endpoint_id) {
            endpoint.parameters.prompt = prompt.clone();
            endpoint.updated_at = now;
        }

        let entry = DeployHistoryEntry {
            endpoint_id,
            version,
            prompt,
            released_at: now,
        };
        state.deploy_history.push(entry.clone());
        Ok(entry)
    }

    async fn deploy_history(&self, endpoint_id: EndpointId) -> Result<Vec<DeployHistoryEntry>> {
        let state = self.state.read().await;
        Ok(state
            .deploy_history
            .iter()
            .filter(|e| e.endpoint_id == endpoint_id)
            .cloned()
            .collect())
    }

    async fn principal_assignment(&self, base_id: EndpointId) -> Result<Option<ChallengerAssignment>> {
        let state = self.state.read().await;
        Ok(state
            .assignments
            .iter()
            .find(|a| a.base_id == base_id && a.principal && a.deleted_at.is_none())
            .cloned())
    }

    async fn insert_assignment(&self, assignment: &ChallengerAssignment) -> Result<()> {
        let mut state = self.state.write().await;
        live_endpoint(&state, assignment.base_id)?;
        live_endpoint(&state, assignment.challenger_id)?;

        if assignment.principal {
            // At most one principal per base
            for existing in state
                .assignments
                .iter_mut()
                .filter(|a| a.base_id == assignment.base_id)
            {
                existing.principal = false;
            }
        }
        state.assignments.push(assignment.clone());
        Ok(())
    }

    async fn unreplayed_records(
        &self,
        base_id: EndpointId,
        challenger_id: EndpointId,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        let state = self.state.read().await;
        let replayed: std::collections::HashSet<RecordId> = state
            .records
            .values()
            .filter(|r| r.endpoint_id == challenger_id && r.deleted_at.is_none())
            .filter_map(|r| r.origin_record_id)
            .collect();

        let mut records: Vec<_> = state
            .records
            .values()
            .filter(|r| {
                r.endpoint_id == base_id
                    && r.deleted_at.is_none()
                    && r.environment != AB_TEST_ENV
                    && !replayed.contains(&r.id)
            })
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        records.truncate(limit);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BatchJobStatus, ProblemType};
    use serde_json::json;

    async fn store_with_endpoint() -> (MemoryStore, MonitoredEndpoint) {
        let store = MemoryStore::new();
        let endpoint = MonitoredEndpoint::new("invoices", "v0", ProblemType::DataExtraction);
        store.insert_endpoint(&endpoint).await.unwrap();
        (store, endpoint)
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let (store, endpoint) = store_with_endpoint().await;
        let record = ExecutionRecord::new(endpoint.id, json!({}), json!({}));
        store.insert_record(&record).await.unwrap();

        let now = Utc::now();
        let lease = now + chrono::Duration::minutes(10);
        let first = store.claim_records(&[record.id], lease, now).await.unwrap();
        let second = store.claim_records(&[record.id], lease, now).await.unwrap();

        assert_eq!(first, vec![record.id]);
        assert!(second.is_empty());

        // Expired leases can be reclaimed
        let later = lease + chrono::Duration::seconds(1);
        let third = store.claim_records(&[record.id], later + chrono::Duration::minutes(10), later).await.unwrap();
        assert_eq!(third, vec![record.id]);
    }

    #[tokio::test]
    async fn test_backlog_filters() {
        let (store, endpoint) = store_with_endpoint().await;
        let now = Utc::now();

        let fresh = ExecutionRecord::new(endpoint.id, json!(1), json!(1));
        let mut old = ExecutionRecord::new(endpoint.id, json!(2), json!(2));
        old.created_at = now - chrono::Duration::days(10);
        let mut staging = ExecutionRecord::new(endpoint.id, json!(3), json!(3));
        staging.environment = "staging".to_string();
        let mut judged = ExecutionRecord::new(endpoint.id, json!(4), json!(4));
        judged.apply_verdict(json!({"correct": true}), true);

        for r in [&fresh, &old, &staging, &judged] {
            store.insert_record(r).await.unwrap();
        }

        let backlog = store
            .backlog(endpoint.id, now - chrono::Duration::days(3), now)
            .await
            .unwrap();
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].id, fresh.id);
    }

    #[tokio::test]
    async fn test_release_activates_exactly_one() {
        let (store, endpoint) = store_with_endpoint().await;
        for prompt in ["p1", "p2", "p3"] {
            store.insert_prompt_version(endpoint.id, prompt).await.unwrap();
        }
        store.release_prompt_version(endpoint.id, 1, &[]).await.unwrap();
        store.release_prompt_version(endpoint.id, 3, &[]).await.unwrap();

        let versions = store.prompt_versions(endpoint.id).await.unwrap();
        let active: Vec<_> = versions.iter().filter(|v| v.active_version).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].version, 3);
        assert_eq!(store.get_endpoint(endpoint.id).await.unwrap().parameters.prompt, "p3");
        assert_eq!(store.deploy_history(endpoint.id).await.unwrap().len(), 2);

        let missing = store.release_prompt_version(endpoint.id, 9, &[]).await;
        assert!(matches!(missing, Err(JudgeloopError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_batch_submission_marks_records() {
        let (store, endpoint) = store_with_endpoint().await;
        let record = ExecutionRecord::new(endpoint.id, json!({}), json!({}));
        store.insert_record(&record).await.unwrap();

        let now = Utc::now();
        let job = BatchJob {
            id: "batch-1".to_string(),
            evaluator_id: EndpointId::new(),
            problem_type: ProblemType::DataExtraction,
            status: BatchJobStatus::Submitted,
            record_ids: vec![record.id],
            request_count: 3,
            processed_count: 0,
            failed_count: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        store.record_batch_submission(&job).await.unwrap();

        let stored = store.get_record(record.id).await.unwrap();
        assert_eq!(stored.evaluation_status, Some(EvaluationStatus::Processing));
        assert_eq!(stored.batch_job_id.as_deref(), Some("batch-1"));
        assert_eq!(store.records_for_batch("batch-1").await.unwrap().len(), 1);
        assert!(store.record_batch_submission(&job).await.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let (store, endpoint) = store_with_endpoint().await;
        store
            .insert_record(&ExecutionRecord::new(endpoint.id, json!({"q": "a"}), json!("b")))
            .await
            .unwrap();
        store.insert_prompt_version(endpoint.id, "p1").await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        store.save(&path).await.unwrap();

        let restored = MemoryStore::load(&path).await.unwrap();
        assert_eq!(restored.get_endpoint(endpoint.id).await.unwrap().name, "invoices");
        assert_eq!(restored.prompt_versions(endpoint.id).await.unwrap().len(), 1);
        assert_eq!(restored.snapshot().await.records.len(), 1);
    }

    #[tokio::test]
    async fn test_single_principal_per_base() {
        let (store, base) = store_with_endpoint().await;
        let first = base.clone_as_challenger("c1");
        let second = base.clone_as_challenger("c2");
        store.insert_endpoint(&first).await.unwrap();
        store.insert_endpoint(&second).await.unwrap();

        store
            .insert_assignment(&ChallengerAssignment::principal(base.id, first.id, 30))
            .await
            .unwrap();
        store
            .insert_assignment(&ChallengerAssignment::principal(base.id, second.id, 30))
            .await
            .unwrap();

        let principal = store.principal_assignment(base.id).await.unwrap().unwrap();
        assert_eq!(principal.challenger_id, second.id);
    }
}
