//! Insight generation
//!
//! Derives structured root-cause findings from one incorrectly judged record.
//! A single judge call per record, no retry: provider failures go back to the
//! caller.

use crate::config::{InsightConfig, JudgeConfig};
use crate::error::{JudgeloopError, Result};
use crate::evaluation::parsing::{extract_json, truncate};
use crate::services::judge::{ChatMessage, ContentPart, JudgeClient, JudgeRequest};
use crate::storage::EvaluationStore;
use crate::types::{Attachment, ExecutionRecord, Insight, InsightId, MonitoredEndpoint, RecordId};
use chrono::Utc;
use rand::seq::SliceRandom;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Finding fields before they are attached to a record
#[derive(Debug, Clone, PartialEq)]
struct Finding {
    problem: String,
    solution: String,
    description: String,
}

/// Generates and stores insights for incorrect records
#[derive(Clone)]
pub struct InsightGenerator {
    store: Arc<dyn EvaluationStore>,
    judge: Arc<dyn JudgeClient>,
    config: InsightConfig,
    judge_timeout: Duration,
}

impl InsightGenerator {
    pub fn new(
        store: Arc<dyn EvaluationStore>,
        judge: Arc<dyn JudgeClient>,
        config: InsightConfig,
        judge_config: &JudgeConfig,
    ) -> Self {
        Self {
            store,
            judge,
            config,
            judge_timeout: judge_config.timeout(),
        }
    }

    /// Generate insights for one record judged incorrect
    ///
    /// The record must carry a verdict and that verdict must be incorrect,
    /// otherwise `StateConflict`.
    pub async fn generate_for_record(&self, record_id: RecordId) -> Result<Vec<Insight>> {
        let record = self.store.get_record(record_id).await?;
        match record.verdict() {
            None => {
                return Err(JudgeloopError::StateConflict(format!(
                    "record {} has not been evaluated",
                    record_id
                )))
            }
            Some(true) => {
                return Err(JudgeloopError::StateConflict(format!(
                    "record {} was judged correct",
                    record_id
                )))
            }
            Some(false) => {}
        }

        let endpoint = self.store.get_endpoint(record.endpoint_id).await?;
        let version_tag = self.version_tag(&endpoint).await?;
        let prior = self
            .store
            .recent_insights(endpoint.id, self.config.max_prior_insights)
            .await?;

        let attachments: Vec<Attachment> = {
            let mut rng = rand::thread_rng();
            record
                .attachments
                .choose_multiple(&mut rng, self.config.max_attachments)
                .cloned()
                .collect()
        };

        let request = build_request(&endpoint, &record, &attachments, &prior);
        let completion = tokio::time::timeout(self.judge_timeout, self.judge.complete(&request))
            .await
            .map_err(|_| JudgeloopError::Timeout(self.judge_timeout))??;

        let findings = parse_findings(&completion.text, self.config.max_field_chars)?;

        let mut insights = Vec::with_capacity(findings.len());
        for finding in findings {
            if prior
                .iter()
                .any(|p| p.problem.eq_ignore_ascii_case(&finding.problem))
            {
                debug!(endpoint = %endpoint.id, "Insight repeats a prior problem: {}", finding.problem);
            }

            let insight = Insight {
                id: InsightId::new(),
                endpoint_id: endpoint.id,
                problem: finding.problem,
                solution: finding.solution,
                description: finding.description,
                version_tag: version_tag.clone(),
                source_record: record.clone(),
                created_at: Utc::now(),
            };
            self.store.insert_insight(&insight).await?;
            insights.push(insight);
        }

        info!(
            endpoint = %endpoint.id,
            record = %record_id,
            count = insights.len(),
            "Generated insights"
        );
        Ok(insights)
    }

    /// `<endpoint_id>-<version>` of the active version, else the latest, else 0
    async fn version_tag(&self, endpoint: &MonitoredEndpoint) -> Result<String> {
        let versions = self.store.prompt_versions(endpoint.id).await?;
        let version = versions
            .iter()
            .find(|v| v.active_version)
            .or_else(|| versions.last())
            .map(|v| v.version)
            .unwrap_or(0);
        Ok(format!("{}-{}", endpoint.id, version))
    }
}

fn build_request(
    endpoint: &MonitoredEndpoint,
    record: &ExecutionRecord,
    attachments: &[Attachment],
    prior: &[Insight],
) -> JudgeRequest {
    let prior_list = if prior.is_empty() {
        "(none)".to_string()
    } else {
        prior
            .iter()
            .map(|i| format!("- {}", i.problem))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let system = format!(
        r#"You analyze why a prompt produced an incorrect output.

The prompt under review:
{}

Identify the root causes in the prompt that led to the error and how to fix
them. Do not repeat these already known problems:
{}

Respond with a JSON list only:
[{{"problem": "<what went wrong>", "solution": "<prompt change that fixes it>", "description": "<evidence from this record>"}}]
Keep every field under 300 characters."#,
        endpoint.parameters.prompt, prior_list
    );

    let evaluation = record
        .actual
        .as_ref()
        .map(describe_verdict)
        .unwrap_or_default();

    let mut parts = vec![ContentPart::Text {
        text: format!(
            "INPUT:\n{}\n\nOUTPUT:\n{}\n\nEVALUATION:\n{}",
            record.input, record.output, evaluation
        ),
    }];
    for attachment in attachments {
        if attachment.is_image() {
            parts.push(ContentPart::Image {
                url: attachment.url.clone(),
            });
        } else {
            parts.push(ContentPart::Text {
                text: format!("ATTACHMENT: {}", attachment.url),
            });
        }
    }

    JudgeRequest::new(vec![ChatMessage::system(system), ChatMessage::user_parts(parts)])
}

/// Human-readable summary of a stored verdict payload
fn describe_verdict(actual: &Value) -> String {
    match actual.get("kind").and_then(Value::as_str) {
        Some("classification") => format!(
            "Expected: {}\nPredicted: {}",
            actual.get("expectedOutput").unwrap_or(&Value::Null),
            actual.get("modelOutput").unwrap_or(&Value::Null)
        ),
        Some("rubrics") => actual
            .get("rubrics")
            .and_then(Value::as_array)
            .map(|rubrics| {
                rubrics
                    .iter()
                    .map(|r| {
                        format!(
                            "{}: {} ({}) errors: {}",
                            r.get("evaluator").and_then(Value::as_str).unwrap_or("?"),
                            r.get("score").unwrap_or(&Value::Null),
                            r.get("analysis").and_then(Value::as_str).unwrap_or(""),
                            r.get("errors").unwrap_or(&Value::Null)
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default(),
        _ => actual.to_string(),
    }
}

/// Parse the judge's findings list, bounding every field
fn parse_findings(text: &str, max_chars: usize) -> Result<Vec<Finding>> {
    let value = extract_json(text)?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("insights") {
            Some(Value::Array(items)) => items,
            _ => vec![Value::Object(map)],
        },
        other => {
            return Err(JudgeloopError::Parse(format!(
                "expected a list of insights, got {}",
                other
            )))
        }
    };

    let field = |item: &Value, name: &str| {
        item.get(name)
            .and_then(Value::as_str)
            .map(|s| truncate(s.trim(), max_chars))
    };

    let findings: Vec<Finding> = items
        .iter()
        .filter_map(|item| {
            let problem = field(item, "problem").filter(|p| !p.is_empty());
            let solution = field(item, "solution").filter(|s| !s.is_empty());
            match (problem, solution) {
                (Some(problem), Some(solution)) => Some(Finding {
                    problem,
                    solution,
                    description: field(item, "description").unwrap_or_default(),
                }),
                _ => {
                    warn!("Skipping insight without problem or solution: {}", item);
                    None
                }
            }
        })
        .collect();

    if findings.is_empty() {
        return Err(JudgeloopError::Parse("judge returned no usable insight".to_string()));
    }
    Ok(findings)
}
