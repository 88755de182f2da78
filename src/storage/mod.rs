//! Storage layer for the judgeloop engine
//!
//! The relational store is an external collaborator; the engine only talks to
//! it through [`EvaluationStore`]. Rows are soft-deleted (`deleted_at`) and
//! stamped with `created_at`/`updated_at` by the implementation.
//! [`memory::MemoryStore`] is the in-process implementation used by tests and
//! the CLI.

pub mod memory;

use crate::error::Result;
use crate::types::{
    BatchJob, ChallengerAssignment, DeployHistoryEntry, EndpointId, ExecutionRecord, Insight,
    MonitoredEndpoint, PromptVersion, RecordId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::MemoryStore;

/// Storage backend trait defining all required operations
#[async_trait]
pub trait EvaluationStore: Send + Sync {
    /// Fetch a live (not soft-deleted) endpoint
    async fn get_endpoint(&self, id: EndpointId) -> Result<MonitoredEndpoint>;

    async fn insert_endpoint(&self, endpoint: &MonitoredEndpoint) -> Result<()>;

    async fn update_endpoint(&self, endpoint: &MonitoredEndpoint) -> Result<()>;

    /// First live evaluator whose `reviews` link points at the endpoint
    async fn evaluator_for(&self, endpoint_id: EndpointId) -> Result<Option<MonitoredEndpoint>>;

    async fn get_record(&self, id: RecordId) -> Result<ExecutionRecord>;

    async fn insert_record(&self, record: &ExecutionRecord) -> Result<()>;

    async fn update_record(&self, record: &ExecutionRecord) -> Result<()>;

    /// Unprocessed, unjudged, claimable production records created since `since`
    async fn backlog(
        &self,
        endpoint_id: EndpointId,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>>;

    /// Conditionally claim records; returns the ids actually claimed
    ///
    /// A record is claimed only if it is still claimable at `now`, so two
    /// concurrent cycles never both receive the same record.
    async fn claim_records(
        &self,
        ids: &[RecordId],
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecordId>>;

    async fn release_claim(&self, id: RecordId) -> Result<()>;

    /// Insert the job and move every linked record to `processing` in one step
    async fn record_batch_submission(&self, job: &BatchJob) -> Result<()>;

    async fn get_batch_job(&self, id: &str) -> Result<BatchJob>;

    async fn update_batch_job(&self, job: &BatchJob) -> Result<()>;

    /// Non-terminal jobs created since `since`, oldest first, at most `limit`
    async fn pending_batch_jobs(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<BatchJob>>;

    async fn records_for_batch(&self, job_id: &str) -> Result<Vec<ExecutionRecord>>;

    async fn insert_insight(&self, insight: &Insight) -> Result<()>;

    /// Most recent insights for the endpoint, newest first
    async fn recent_insights(&self, endpoint_id: EndpointId, limit: usize) -> Result<Vec<Insight>>;

    /// All versions of an endpoint, ascending by version number
    async fn prompt_versions(&self, endpoint_id: EndpointId) -> Result<Vec<PromptVersion>>;

    /// Append the next numbered (inactive) version
    async fn insert_prompt_version(&self, endpoint_id: EndpointId, prompt: &str) -> Result<PromptVersion>;

    /// Deactivate every version of `scope`, activate `version` of `endpoint_id`,
    /// make it the endpoint's prompt and append a deploy-history entry
    async fn release_prompt_version(
        &self,
        endpoint_id: EndpointId,
        version: u32,
        scope: &[EndpointId],
    ) -> Result<DeployHistoryEntry>;

    async fn deploy_history(&self, endpoint_id: EndpointId) -> Result<Vec<DeployHistoryEntry>>;

    async fn principal_assignment(&self, base_id: EndpointId) -> Result<Option<ChallengerAssignment>>;

    async fn insert_assignment(&self, assignment: &ChallengerAssignment) -> Result<()>;

    /// Base records with no challenger replay yet, oldest first, at most `limit`
    async fn unreplayed_records(
        &self,
        base_id: EndpointId,
        challenger_id: EndpointId,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>>;
}
