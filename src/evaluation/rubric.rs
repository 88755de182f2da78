//! Rubric pipelines and judge prompt construction
//!
//! Each problem type maps to an [`EvaluationPlan`]: either a pipeline of
//! scored rubrics (extraction, mapping) or a single generic prompt whose
//! output is a classification pair or an LLM triad.

use crate::services::judge::{ChatMessage, ContentPart, JudgeRequest};
use crate::types::{ExecutionRecord, MonitoredEndpoint, ProblemType};
use serde::{Deserialize, Serialize};

/// Minimum score (0-10) for a rubric or triad correctness to pass
pub const PASSING_SCORE: f64 = 8.0;

/// Rubric derived from the others when the provider does not return it
pub const ACCURACY_RUBRIC: &str = "accuracy";

/// Prompt name used for the single classification prompt
pub const CLASSIFICATION_PROMPT: &str = "classification";

/// Prompt name used for the single relevance/coherence/correctness prompt
pub const JUDGMENT_PROMPT: &str = "judgment";

const RUBRIC_SCHEMA: &str = r#"{"score": <integer 0-10>, "analysis": "<short reasoning>", "errors": ["<concrete error>", ...]}"#;
const CLASSIFICATION_SCHEMA: &str = r#"{"expectedOutput": <the output the task should have produced>}"#;
const JUDGMENT_SCHEMA: &str = r#"{"relevance": <0-10>, "coherence": <0-10>, "correctness": <0-10>}"#;

/// Structured shape an evaluator returns for a problem type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputShape {
    Rubrics,
    Classification,
    Judgment,
}

impl OutputShape {
    pub fn for_problem_type(problem_type: ProblemType) -> Self {
        match problem_type {
            ProblemType::DataExtraction | ProblemType::Mapping => OutputShape::Rubrics,
            ProblemType::Classification => OutputShape::Classification,
            ProblemType::Generation => OutputShape::Judgment,
        }
    }
}

/// A named judge prompt plus its expected output structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRubric {
    pub name: String,
    pub system_prompt: String,
    pub output_schema: String,
}

impl EvaluationRubric {
    fn new(name: &str, system_prompt: &str, output_schema: &str) -> Self {
        Self {
            name: name.to_string(),
            system_prompt: system_prompt.to_string(),
            output_schema: output_schema.to_string(),
        }
    }

    /// Build the judge request for one record
    ///
    /// The evaluator's own prompt, when set, is sent as extra guidance after
    /// the rubric instructions. Image attachments become image parts.
    pub fn request_for(&self, evaluator: &MonitoredEndpoint, record: &ExecutionRecord) -> JudgeRequest {
        let mut messages = vec![ChatMessage::system(self.system_prompt.clone())];
        if !evaluator.parameters.prompt.trim().is_empty() {
            messages.push(ChatMessage::system(format!(
                "Evaluator guidance:\n{}",
                evaluator.parameters.prompt
            )));
        }

        let mut parts = vec![ContentPart::Text {
            text: format!(
                "INPUT:\n{}\n\nOUTPUT:\n{}",
                render(&record.input),
                render(&record.output)
            ),
        }];
        for attachment in &record.attachments {
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
        messages.push(ChatMessage::user_parts(parts));

        JudgeRequest::new(messages)
            .with_schema(self.output_schema.clone())
            .with_model(evaluator.parameters.model.clone())
    }
}

/// The prompts run for one record and how their outputs are combined
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationPlan {
    pub shape: OutputShape,
    pub prompts: Vec<EvaluationRubric>,

    /// Synthesize an `accuracy` rubric from the others when it is missing
    pub derives_accuracy: bool,
}

impl EvaluationPlan {
    pub fn for_problem_type(problem_type: ProblemType) -> Self {
        let shape = OutputShape::for_problem_type(problem_type);
        match pipeline_for(problem_type) {
            Some(prompts) => Self {
                shape,
                prompts,
                derives_accuracy: true,
            },
            None => Self {
                shape,
                prompts: vec![generic_prompt(shape)],
                derives_accuracy: false,
            },
        }
    }

    pub fn prompt(&self, name: &str) -> Option<&EvaluationRubric> {
        self.prompts.iter().find(|p| p.name == name)
    }
}

/// Rubric pipeline of a problem type, if it has one
pub fn pipeline_for(problem_type: ProblemType) -> Option<Vec<EvaluationRubric>> {
    match problem_type {
        ProblemType::DataExtraction => Some(vec![
            EvaluationRubric::new(
                "correctness",
                "You are a strict reviewer of data extraction results. Score from 0 to 10 how \
                 correct every extracted value is with respect to the input. Any invented or \
                 wrong value caps the score at 5.",
                RUBRIC_SCHEMA,
            ),
            EvaluationRubric::new(
                "completeness",
                "You are a strict reviewer of data extraction results. Score from 0 to 10 how \
                 complete the extraction is: every field present in the input must be captured.",
                RUBRIC_SCHEMA,
            ),
            EvaluationRubric::new(
                "format_adherence",
                "You are a strict reviewer of data extraction results. Score from 0 to 10 how \
                 well the output follows the requested structure, field names and value formats.",
                RUBRIC_SCHEMA,
            ),
        ]),
        ProblemType::Mapping => Some(vec![
            EvaluationRubric::new(
                "correctness",
                "You review mappings between a source and a target schema. Score from 0 to 10 \
                 how correct each mapped value is.",
                RUBRIC_SCHEMA,
            ),
            EvaluationRubric::new(
                "consistency",
                "You review mappings between a source and a target schema. Score from 0 to 10 \
                 how consistently equivalent source values are mapped to the same target.",
                RUBRIC_SCHEMA,
            ),
        ]),
        ProblemType::Generation | ProblemType::Classification => None,
    }
}

fn generic_prompt(shape: OutputShape) -> EvaluationRubric {
    match shape {
        OutputShape::Classification => EvaluationRubric::new(
            CLASSIFICATION_PROMPT,
            "You are an expert labeler. Read the INPUT and decide the correct classification \
             independently of the OUTPUT shown. Return the label structure the task expects.",
            CLASSIFICATION_SCHEMA,
        ),
        OutputShape::Judgment | OutputShape::Rubrics => EvaluationRubric::new(
            JUDGMENT_PROMPT,
            "You are a strict reviewer of generated answers. Score from 0 to 10 the relevance \
             of the OUTPUT to the INPUT, its coherence, and its factual correctness.",
            JUDGMENT_SCHEMA,
        ),
    }
}

fn render(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::judge::{MessageContent, Role};
    use crate::types::{ActivationPolicy, Attachment};
    use serde_json::json;

    #[test]
    fn test_extraction_pipeline() {
        let plan = EvaluationPlan::for_problem_type(ProblemType::DataExtraction);
        assert_eq!(plan.shape, OutputShape::Rubrics);
        let names: Vec<_> = plan.prompts.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["correctness", "completeness", "format_adherence"]);
        assert!(plan.derives_accuracy);
    }

    #[test]
    fn test_generic_plans() {
        let plan = EvaluationPlan::for_problem_type(ProblemType::Classification);
        assert_eq!(plan.shape, OutputShape::Classification);
        assert_eq!(plan.prompts.len(), 1);
        assert!(plan.prompt(CLASSIFICATION_PROMPT).is_some());

        let plan = EvaluationPlan::for_problem_type(ProblemType::Generation);
        assert_eq!(plan.shape, OutputShape::Judgment);
        assert!(!plan.derives_accuracy);
    }

    #[test]
    fn test_request_includes_record_and_images() {
        let base = MonitoredEndpoint::new("invoices", "Extract", ProblemType::DataExtraction);
        let mut evaluator = MonitoredEndpoint::evaluator("judge", &base, ActivationPolicy::default());
        evaluator.parameters.prompt = "Dates must be ISO-8601".to_string();

        let mut record = ExecutionRecord::new(base.id, json!({"doc": "INV-1"}), json!({"total": 10}));
        record.attachments.push(Attachment {
            url: "https://example.com/scan.png".to_string(),
            media_type: Some("image/png".to_string()),
        });

        let plan = EvaluationPlan::for_problem_type(ProblemType::DataExtraction);
        let request = plan.prompts[0].request_for(&evaluator, &record);

        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.messages[1].role, Role::System);
        assert!(request.messages[1].content.text().contains("ISO-8601"));
        match &request.messages[2].content {
            MessageContent::Parts(parts) => {
                assert_eq!(parts.len(), 2);
                assert!(matches!(parts[1], ContentPart::Image { .. }));
            }
            other => panic!("expected parts, got {:?}", other),
        }
        assert!(request.output_schema.unwrap().contains("score"));
    }
}
