//! Prompt optimizer and release
//!
//! Rewrites an endpoint's prompt from accumulated insights into a challenger
//! endpoint, and releases prompt versions.

use crate::config::{JudgeConfig, OptimizerConfig};
use crate::error::{JudgeloopError, Result};
use crate::evaluation::parsing::strip_code_fences;
use crate::events::{EventBus, PipelineEvent};
use crate::improvement::insights::InsightGenerator;
use crate::services::judge::{ChatMessage, JudgeClient, JudgeRequest};
use crate::storage::EvaluationStore;
use crate::types::{
    ChallengerAssignment, DeployHistoryEntry, EndpointId, Insight, MonitoredEndpoint, PromptVersion,
    RecordId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Outcome of one optimization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub base_id: EndpointId,
    pub challenger_id: EndpointId,

    /// Version appended to the challenger
    pub version: PromptVersion,

    /// A new challenger was cloned from the base
    pub created_challenger: bool,
    pub insights_used: usize,
}

/// Rewrites prompts into challengers and releases versions
#[derive(Clone)]
pub struct PromptOptimizer {
    store: Arc<dyn EvaluationStore>,
    judge: Arc<dyn JudgeClient>,
    events: EventBus,
    insights: InsightGenerator,
    config: OptimizerConfig,
    judge_timeout: Duration,
}

impl PromptOptimizer {
    pub fn new(
        store: Arc<dyn EvaluationStore>,
        judge: Arc<dyn JudgeClient>,
        events: EventBus,
        insights: InsightGenerator,
        config: OptimizerConfig,
        judge_config: &JudgeConfig,
    ) -> Self {
        Self {
            store,
            judge,
            events,
            insights,
            config,
            judge_timeout: judge_config.timeout(),
        }
    }

    /// Optimize from the endpoint's most recent insights
    pub async fn optimize(&self, endpoint_id: EndpointId) -> Result<OptimizationResult> {
        let insights = self
            .store
            .recent_insights(endpoint_id, self.config.max_insights)
            .await?;
        self.optimize_with(endpoint_id, &insights).await
    }

    /// Generate insights for one incorrect record, then optimize from them
    pub async fn optimize_from_record(&self, record_id: RecordId) -> Result<OptimizationResult> {
        let insights = self.insights.generate_for_record(record_id).await?;
        let endpoint_id = insights
            .first()
            .map(|i| i.endpoint_id)
            .ok_or_else(|| JudgeloopError::Parse("no insight generated".to_string()))?;
        self.optimize_with(endpoint_id, &insights).await
    }

    /// Rewrite the prompt with the given insights
    ///
    /// An existing principal challenger gets a new version and its prompt is
    /// updated; otherwise the base is cloned into a new principal challenger.
    pub async fn optimize_with(
        &self,
        endpoint_id: EndpointId,
        insights: &[Insight],
    ) -> Result<OptimizationResult> {
        if insights.is_empty() {
            return Err(JudgeloopError::StateConflict(format!(
                "no insights available for endpoint {}",
                endpoint_id
            )));
        }
        let insights = &insights[..insights.len().min(self.config.max_insights)];

        let base = self.store.get_endpoint(endpoint_id).await?;
        let challenger = match self.store.principal_assignment(base.id).await? {
            Some(assignment) => Some(self.store.get_endpoint(assignment.challenger_id).await?),
            None => None,
        };

        let current_prompt = challenger
            .as_ref()
            .map(|c| c.parameters.prompt.as_str())
            .unwrap_or(base.parameters.prompt.as_str());
        let rewritten = self.rewrite(current_prompt, insights).await?;

        let result = match challenger {
            Some(mut challenger) => {
                let version = self
                    .store
                    .insert_prompt_version(challenger.id, &rewritten)
                    .await?;
                challenger.parameters.prompt = rewritten;
                challenger.updated_at = chrono::Utc::now();
                self.store.update_endpoint(&challenger).await?;

                OptimizationResult {
                    base_id: base.id,
                    challenger_id: challenger.id,
                    version,
                    created_challenger: false,
                    insights_used: insights.len(),
                }
            }
            None => {
                let challenger = self.provision_challenger(&base, &rewritten).await?;
                let version = self
                    .store
                    .insert_prompt_version(challenger.id, &rewritten)
                    .await?;

                OptimizationResult {
                    base_id: base.id,
                    challenger_id: challenger.id,
                    version,
                    created_challenger: true,
                    insights_used: insights.len(),
                }
            }
        };

        info!(
            base = %result.base_id,
            challenger = %result.challenger_id,
            version = result.version.version,
            created = result.created_challenger,
            "Optimized prompt"
        );
        Ok(result)
    }

    async fn provision_challenger(&self, base: &MonitoredEndpoint, prompt: &str) -> Result<MonitoredEndpoint> {
        let challenger = base.clone_as_challenger(prompt);
        self.store.insert_endpoint(&challenger).await?;

        let assignment = ChallengerAssignment::principal(
            base.id,
            challenger.id,
            self.config.default_challenger_percentage,
        );
        self.store.insert_assignment(&assignment).await?;

        self.events
            .publish(PipelineEvent::challenger_provisioned(base.id, challenger.id));
        Ok(challenger)
    }

    async fn rewrite(&self, prompt: &str, insights: &[Insight]) -> Result<String> {
        let findings = insights
            .iter()
            .enumerate()
            .map(|(i, insight)| {
                format!(
                    "{}. Problem: {}\n   Solution: {}\n   Evidence: {}",
                    i + 1,
                    insight.problem,
                    insight.solution,
                    insight.description
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let request = JudgeRequest::new(vec![
            ChatMessage::system(
                "You improve prompts. Rewrite the prompt so that it applies every listed solution \
                 while keeping its task, inputs and output format unchanged. Preserve the original \
                 examples and notes of the prompt verbatim. Reply with the new prompt only.",
            ),
            ChatMessage::user(format!(
                "CURRENT PROMPT:\n{}\n\nKNOWN PROBLEMS:\n{}",
                prompt, findings
            )),
        ]);

        let completion = tokio::time::timeout(self.judge_timeout, self.judge.complete(&request))
            .await
            .map_err(|_| JudgeloopError::Timeout(self.judge_timeout))??;

        let rewritten = strip_code_fences(&completion.text);
        if rewritten.is_empty() {
            return Err(JudgeloopError::Parse("judge returned an empty prompt".to_string()));
        }
        Ok(rewritten)
    }

    /// Release a version of an endpoint's prompt
    ///
    /// Deactivates the versions of the endpoint, its original endpoint and the
    /// base's principal challenger, then activates exactly `version`.
    pub async fn release(&self, endpoint_id: EndpointId, version: u32) -> Result<DeployHistoryEntry> {
        let endpoint = self.store.get_endpoint(endpoint_id).await?;
        let base_id = endpoint.original_endpoint_id.unwrap_or(endpoint.id);

        let mut scope = vec![endpoint.id];
        if base_id != endpoint.id {
            scope.push(base_id);
        }
        if let Some(assignment) = self.store.principal_assignment(base_id).await? {
            if !scope.contains(&assignment.challenger_id) {
                scope.push(assignment.challenger_id);
            }
        }

        let entry = self
            .store
            .release_prompt_version(endpoint.id, version, &scope)
            .await?;
        self.events
            .publish(PipelineEvent::prompt_released(endpoint.id, version));

        info!(endpoint = %endpoint.id, version, "Released prompt version");
        Ok(entry)
    }
}
