//! Core data types for the judgeloop evaluation engine
//!
//! This module defines the records that flow through the evaluation loop:
//! monitored endpoints, execution records, batch jobs, insights, prompt
//! versions and challenger assignments. Persistence lives behind
//! [`crate::storage::EvaluationStore`]; these types are what it stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Environment tag carried by records captured from live traffic
pub const PRODUCTION_ENV: &str = "production";

/// Environment tag for records produced by an A/B replay
pub const AB_TEST_ENV: &str = "ab_test";

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parse an identifier from a string (hyphenated or simple form)
            pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(
    /// Identifier of a monitored endpoint (base, challenger or evaluator)
    EndpointId
);
define_id!(
    /// Identifier of a captured execution record
    RecordId
);
define_id!(
    /// Identifier of a stored insight
    InsightId
);
define_id!(
    /// Identifier of a metric definition
    MetricId
);
define_id!(
    /// Identifier of a challenger assignment
    AssignmentId
);

/// Problem family an endpoint solves; selects the rubric pipeline and output shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemType {
    DataExtraction,
    Generation,
    Mapping,
    Classification,
}

impl std::fmt::Display for ProblemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProblemType::DataExtraction => "data_extraction",
            ProblemType::Generation => "generation",
            ProblemType::Mapping => "mapping",
            ProblemType::Classification => "classification",
        };
        write!(f, "{}", name)
    }
}

/// Model parameters of an endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointParameters {
    /// System prompt sent with every invocation
    pub prompt: String,

    /// Model override for this endpoint (falls back to the judge default)
    #[serde(default)]
    pub model: Option<String>,

    /// Sampling temperature override
    #[serde(default)]
    pub temperature: Option<f32>,
}

/// Named metric tracked for an endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub id: MetricId,
    pub name: String,
    pub threshold: f64,
}

impl MetricDefinition {
    pub fn new(name: impl Into<String>, threshold: f64) -> Self {
        Self {
            id: MetricId::new(),
            name: name.into(),
            threshold,
        }
    }
}

/// Per-evaluator activation settings
///
/// `sampling_percentage_per_cycle` is in [0, 100].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActivationPolicy {
    /// Minimum unprocessed backlog before a cycle does anything
    pub backlog_threshold: usize,

    /// Share of the backlog sampled per cycle, in percent
    pub sampling_percentage_per_cycle: f64,

    /// Hard cap on records sampled per cycle
    pub per_cycle_limit: usize,
}

impl ActivationPolicy {
    pub fn new(backlog_threshold: usize, sampling_percentage: f64, per_cycle_limit: usize) -> Self {
        Self {
            backlog_threshold,
            sampling_percentage_per_cycle: sampling_percentage,
            per_cycle_limit,
        }
    }

    /// Reject percentages outside [0, 100] (and NaN)
    pub fn validate(&self) -> std::result::Result<(), String> {
        let pct = self.sampling_percentage_per_cycle;
        if !(0.0..=100.0).contains(&pct) {
            return Err(format!(
                "sampling_percentage_per_cycle must be within [0, 100], got {}",
                pct
            ));
        }
        Ok(())
    }
}

impl Default for ActivationPolicy {
    fn default() -> Self {
        Self::new(10, 20.0, 25)
    }
}

/// A versioned prompt/model configuration under observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredEndpoint {
    pub id: EndpointId,
    pub name: String,
    pub parameters: EndpointParameters,
    pub problem_type: ProblemType,
    pub is_active: bool,

    /// Endpoint acts as an evaluator (judge) for another endpoint
    #[serde(default)]
    pub is_reviewer: bool,

    /// Endpoint was produced by the prompt optimizer
    #[serde(default)]
    pub is_optimized: bool,

    /// Provider override for judge calls made on behalf of this endpoint
    #[serde(default)]
    pub provider_override: Option<String>,

    /// Activation policy, present on evaluators
    #[serde(default)]
    pub activation_policy: Option<ActivationPolicy>,

    /// Base endpoint this evaluator judges
    #[serde(default)]
    pub reviews: Option<EndpointId>,

    /// Evaluators attached to this endpoint
    #[serde(default)]
    pub reviewer_ids: Vec<EndpointId>,

    /// Endpoint this one was cloned from
    #[serde(default)]
    pub original_endpoint_id: Option<EndpointId>,

    #[serde(default)]
    pub metrics: Vec<MetricDefinition>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl MonitoredEndpoint {
    /// Create an active endpoint with the given prompt
    pub fn new(name: impl Into<String>, prompt: impl Into<String>, problem_type: ProblemType) -> Self {
        let now = Utc::now();
        Self {
            id: EndpointId::new(),
            name: name.into(),
            parameters: EndpointParameters {
                prompt: prompt.into(),
                ..Default::default()
            },
            problem_type,
            is_active: true,
            is_reviewer: false,
            is_optimized: false,
            provider_override: None,
            activation_policy: None,
            reviews: None,
            reviewer_ids: Vec::new(),
            original_endpoint_id: None,
            metrics: Vec::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Create an evaluator that judges `base`
    pub fn evaluator(
        name: impl Into<String>,
        base: &MonitoredEndpoint,
        policy: ActivationPolicy,
    ) -> Self {
        let mut evaluator = Self::new(name, "", base.problem_type);
        evaluator.is_reviewer = true;
        evaluator.activation_policy = Some(policy);
        evaluator.reviews = Some(base.id);
        evaluator
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Clone this endpoint as an optimized challenger with a new prompt
    ///
    /// Identifiers are fresh, metric definitions keep name and threshold but
    /// get new ids, reviewer links are carried over.
    pub fn clone_as_challenger(&self, prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        let mut parameters = self.parameters.clone();
        parameters.prompt = prompt.into();

        Self {
            id: EndpointId::new(),
            name: format!("{} (optimized)", self.name),
            parameters,
            problem_type: self.problem_type,
            is_active: true,
            is_reviewer: false,
            is_optimized: true,
            provider_override: self.provider_override.clone(),
            activation_policy: None,
            reviews: None,
            reviewer_ids: self.reviewer_ids.clone(),
            original_endpoint_id: Some(self.original_endpoint_id.unwrap_or(self.id)),
            metrics: self
                .metrics
                .iter()
                .map(|m| MetricDefinition::new(m.name.clone(), m.threshold))
                .collect(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// Outcome status of an execution record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Success,
    Error,
    Crash,
}

/// Asynchronous evaluation state of a record submitted in a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Processing,
    Completed,
    Failed,
}

/// File or image attached to a record's input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    #[serde(default)]
    pub media_type: Option<String>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.media_type
            .as_deref()
            .map(|m| m.starts_with("image/"))
            .unwrap_or(false)
    }
}

/// One captured input/output pair produced by an endpoint
///
/// `actual` is `Some` exactly when `processed` is true; mutate verdicts via
/// [`ExecutionRecord::apply_verdict`] to keep that invariant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: RecordId,
    pub endpoint_id: EndpointId,
    pub input: serde_json::Value,
    pub output: serde_json::Value,

    #[serde(default)]
    pub attachments: Vec<Attachment>,

    /// Evaluator's structured verdict
    #[serde(default)]
    pub actual: Option<serde_json::Value>,

    #[serde(default)]
    pub processed: bool,

    #[serde(default)]
    pub auto_evaluation_processed: bool,

    pub status: RecordStatus,
    pub environment: String,

    #[serde(default)]
    pub batch_job_id: Option<String>,

    #[serde(default)]
    pub evaluation_status: Option<EvaluationStatus>,

    /// Base record this one replays (A/B comparison)
    #[serde(default)]
    pub origin_record_id: Option<RecordId>,

    /// Lease held by an in-flight evaluation
    #[serde(default)]
    pub claimed_until: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    /// Create a pending production record
    pub fn new(endpoint_id: EndpointId, input: serde_json::Value, output: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::new(),
            endpoint_id,
            input,
            output,
            attachments: Vec::new(),
            actual: None,
            processed: false,
            auto_evaluation_processed: false,
            status: RecordStatus::Pending,
            environment: PRODUCTION_ENV.to_string(),
            batch_job_id: None,
            evaluation_status: None,
            origin_record_id: None,
            claimed_until: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Record a verdict: sets `actual`, `processed` and the status together
    pub fn apply_verdict(&mut self, actual: serde_json::Value, correct: bool) {
        self.actual = Some(actual);
        self.processed = true;
        self.auto_evaluation_processed = true;
        self.status = if correct {
            RecordStatus::Success
        } else {
            RecordStatus::Error
        };
        self.claimed_until = None;
        self.updated_at = Utc::now();
    }

    /// Whether the record is free to be claimed at `now`
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        !self.processed
            && self.deleted_at.is_none()
            && self.evaluation_status != Some(EvaluationStatus::Processing)
            && self.claimed_until.map(|until| until <= now).unwrap_or(true)
    }

    /// Correctness flag of the stored verdict, if any
    pub fn verdict(&self) -> Option<bool> {
        self.actual
            .as_ref()
            .and_then(|a| a.get("correct"))
            .and_then(|c| c.as_bool())
    }
}

/// Lifecycle of an asynchronous judge-provider job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchJobStatus {
    Submitted,
    Processing,
    Completed,
    Failed,
}

impl BatchJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchJobStatus::Completed | BatchJobStatus::Failed)
    }
}

/// A provider-hosted group of (record, rubric) judge requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    /// Provider job identifier
    pub id: String,

    /// Evaluator every record in this job was submitted under
    pub evaluator_id: EndpointId,
    pub problem_type: ProblemType,
    pub status: BatchJobStatus,
    pub record_ids: Vec<RecordId>,
    pub request_count: usize,

    #[serde(default)]
    pub processed_count: usize,

    #[serde(default)]
    pub failed_count: usize,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// A structured root-cause finding derived from one incorrect record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub id: InsightId,
    pub endpoint_id: EndpointId,
    pub problem: String,
    pub solution: String,
    pub description: String,

    /// `<endpoint_id>-<version>` of the prompt the finding refers to
    pub version_tag: String,

    /// Snapshot of the record the finding was derived from
    pub source_record: ExecutionRecord,
    pub created_at: DateTime<Utc>,
}

/// Immutable numbered snapshot of an endpoint's prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptVersion {
    pub endpoint_id: EndpointId,
    pub version: u32,
    pub prompt: String,
    pub active_version: bool,
    pub created_at: DateTime<Utc>,
}

/// Append-only entry written when a prompt version is released
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployHistoryEntry {
    pub endpoint_id: EndpointId,
    pub version: u32,
    pub prompt: String,
    pub released_at: DateTime<Utc>,
}

/// Traffic-split link between a base endpoint and a challenger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengerAssignment {
    pub id: AssignmentId,
    pub base_id: EndpointId,
    pub challenger_id: EndpointId,

    /// Share of base traffic routed to the challenger, in percent
    pub percentage: u8,

    /// Officially promoted challenger (at most one per base)
    pub principal: bool,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ChallengerAssignment {
    pub fn principal(base_id: EndpointId, challenger_id: EndpointId, percentage: u8) -> Self {
        Self {
            id: AssignmentId::new(),
            base_id,
            challenger_id,
            percentage: percentage.min(100),
            principal: true,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_id_roundtrip_simple_form() {
        let id = RecordId::new();
        let simple = id.0.simple().to_string();
        assert_eq!(RecordId::from_string(&simple).unwrap(), id);
    }

    #[test]
    fn test_policy_validation() {
        assert!(ActivationPolicy::new(10, 50.0, 3).validate().is_ok());
        assert!(ActivationPolicy::new(10, 120.0, 3).validate().is_err());
        assert!(ActivationPolicy::new(10, -1.0, 3).validate().is_err());
        assert!(ActivationPolicy::new(10, f64::NAN, 3).validate().is_err());
    }

    #[test]
    fn test_apply_verdict_keeps_invariant() {
        let mut record = ExecutionRecord::new(EndpointId::new(), json!({"q": 1}), json!("a"));
        assert!(record.actual.is_none() && !record.processed);

        record.apply_verdict(json!({"correct": false}), false);
        assert!(record.processed);
        assert!(record.actual.is_some());
        assert_eq!(record.status, RecordStatus::Error);
        assert_eq!(record.verdict(), Some(false));
    }

    #[test]
    fn test_claimable() {
        let now = Utc::now();
        let mut record = ExecutionRecord::new(EndpointId::new(), json!({}), json!({}));
        assert!(record.is_claimable(now));

        record.claimed_until = Some(now + chrono::Duration::minutes(5));
        assert!(!record.is_claimable(now));
        assert!(record.is_claimable(now + chrono::Duration::minutes(6)));

        record.claimed_until = None;
        record.evaluation_status = Some(EvaluationStatus::Processing);
        assert!(!record.is_claimable(now));
    }

    #[test]
    fn test_clone_as_challenger_rescopes_metrics() {
        let mut base = MonitoredEndpoint::new("invoices", "Extract fields", ProblemType::DataExtraction);
        base.metrics.push(MetricDefinition::new("accuracy", 0.9));
        base.metrics.push(MetricDefinition::new("latency_p95", 1200.0));
        base.reviewer_ids.push(EndpointId::new());

        let challenger = base.clone_as_challenger("Extract fields carefully");

        assert_ne!(challenger.id, base.id);
        assert!(challenger.is_optimized);
        assert_eq!(challenger.original_endpoint_id, Some(base.id));
        assert_eq!(challenger.reviewer_ids, base.reviewer_ids);
        assert_eq!(challenger.metrics.len(), 2);
        for (cloned, original) in challenger.metrics.iter().zip(&base.metrics) {
            assert_eq!(cloned.name, original.name);
            assert_eq!(cloned.threshold, original.threshold);
            assert_ne!(cloned.id, original.id);
        }
    }
}
