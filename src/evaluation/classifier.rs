//! Correctness classifier
//!
//! Maps one of three evaluator output shapes to a canonical payload carrying a
//! `correct` flag. Pure and total: it never touches storage and never fails;
//! callers persist the returned [`Verdict`].

use crate::evaluation::rubric::{ACCURACY_RUBRIC, PASSING_SCORE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// One scored rubric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricScore {
    pub evaluator: String,
    pub score: f64,
    #[serde(default)]
    pub analysis: String,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Structured evaluator output, tagged by shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvaluatorOutput {
    /// Rubric list: correct when every score passes
    Rubrics { rubrics: Vec<RubricScore> },

    /// Expected/predicted pair: correct when both sides match after cleanup
    Classification {
        model_output: Value,
        expected_output: Value,
    },

    /// LLM triad: correct when `correctness` passes
    Judgment {
        relevance: f64,
        coherence: f64,
        correctness: f64,
    },
}

/// Classifier result
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub correct: bool,
    pub payload: Value,
}

/// Payload flag set when a rubric score stands in for an unusable judge reply
pub const PARSE_ERRORS_KEY: &str = "parse_errors";

/// Whether a stored verdict payload rests on at least one unusable rubric reply
pub fn has_parse_errors(payload: &Value) -> bool {
    payload
        .get(PARSE_ERRORS_KEY)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Classify an evaluator output
pub fn classify(output: &EvaluatorOutput) -> Verdict {
    match output {
        EvaluatorOutput::Rubrics { rubrics } => {
            // An empty rubric list carries no evidence of correctness
            let correct = !rubrics.is_empty() && rubrics.iter().all(|r| r.score >= PASSING_SCORE);

            let mut payload = Map::new();
            payload.insert("kind".to_string(), json!("rubrics"));
            payload.insert("rubrics".to_string(), json!(rubrics));
            for rubric in rubrics {
                payload.insert(rubric.evaluator.clone(), json!(rubric.score));
            }
            payload.insert("correct".to_string(), json!(correct));
            payload.insert(
                PARSE_ERRORS_KEY.to_string(),
                json!(rubrics.iter().any(|r| !r.errors.is_empty())),
            );

            Verdict {
                correct,
                payload: Value::Object(payload),
            }
        }
        EvaluatorOutput::Classification {
            model_output,
            expected_output,
        } => {
            let correct = classification_matches(model_output, expected_output);
            Verdict {
                correct,
                payload: json!({
                    "kind": "classification",
                    "modelOutput": model_output,
                    "expectedOutput": expected_output,
                    "correct": correct,
                }),
            }
        }
        EvaluatorOutput::Judgment {
            relevance,
            coherence,
            correctness,
        } => {
            let correct = *correctness >= PASSING_SCORE;
            Verdict {
                correct,
                payload: json!({
                    "kind": "judgment",
                    "relevance": relevance,
                    "coherence": coherence,
                    "correctness": correctness,
                    "correct": correct,
                }),
            }
        }
    }
}

/// Append an `accuracy` rubric equal to the mean of the others, if missing
pub fn synthesize_accuracy(rubrics: &mut Vec<RubricScore>) {
    if rubrics.is_empty() || rubrics.iter().any(|r| r.evaluator == ACCURACY_RUBRIC) {
        return;
    }

    let mean = rubrics.iter().map(|r| r.score).sum::<f64>() / rubrics.len() as f64;
    rubrics.push(RubricScore {
        evaluator: ACCURACY_RUBRIC.to_string(),
        score: mean,
        analysis: "Mean of the other rubric scores".to_string(),
        errors: Vec::new(),
    });
}

/// Deep equality after dropping sentinel fields, then raw and JSON equality
fn classification_matches(model_output: &Value, expected_output: &Value) -> bool {
    let model = parse_if_json(model_output);
    let expected = parse_if_json(expected_output);

    if strip_sentinels(model.clone()) == strip_sentinels(expected.clone()) {
        return true;
    }

    if model_output == expected_output {
        return true;
    }

    serde_json::to_string(&model).ok() == serde_json::to_string(&expected).ok()
}

/// Strings holding JSON documents are parsed; anything else is kept
fn parse_if_json(value: &Value) -> Value {
    match value {
        Value::String(s) => serde_json::from_str(s.trim()).unwrap_or_else(|_| value.clone()),
        other => other.clone(),
    }
}

/// Values treated as absent: null, "", "none", "null", "undefined" (any case)
fn is_sentinel(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => {
            let s = s.trim().to_ascii_lowercase();
            s.is_empty() || s == "none" || s == "null" || s == "undefined"
        }
        _ => false,
    }
}

/// Recursively drop sentinel fields; containers left empty are dropped too
fn strip_sentinels(value: Value) -> Option<Value> {
    match value {
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| strip_sentinels(v).map(|v| (k, v)))
                .collect();
            if cleaned.is_empty() {
                None
            } else {
                Some(Value::Object(cleaned))
            }
        }
        Value::Array(items) => {
            let cleaned: Vec<Value> = items.into_iter().filter_map(strip_sentinels).collect();
            if cleaned.is_empty() {
                None
            } else {
                Some(Value::Array(cleaned))
            }
        }
        other if is_sentinel(&other) => None,
        other => Some(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rubric(name: &str, score: f64) -> RubricScore {
        RubricScore {
            evaluator: name.to_string(),
            score,
            analysis: String::new(),
            errors: Vec::new(),
        }
    }

    #[test]
    fn test_rubrics_all_passing() {
        let verdict = classify(&EvaluatorOutput::Rubrics {
            rubrics: vec![rubric("correctness", 8.0), rubric("completeness", 10.0)],
        });
        assert!(verdict.correct);
        assert_eq!(verdict.payload["correctness"], 8.0);
        assert_eq!(verdict.payload["completeness"], 10.0);
        assert_eq!(verdict.payload["correct"], true);
    }

    #[test]
    fn test_rubrics_one_failing() {
        let verdict = classify(&EvaluatorOutput::Rubrics {
            rubrics: vec![rubric("correctness", 9.0), rubric("format_adherence", 7.9)],
        });
        assert!(!verdict.correct);
    }

    #[test]
    fn test_rubric_errors_are_flagged() {
        let mut broken = rubric("consistency", 0.0);
        broken.errors.push("no JSON object in reply".to_string());

        let verdict = classify(&EvaluatorOutput::Rubrics {
            rubrics: vec![rubric("correctness", 9.0), broken],
        });
        assert!(!verdict.correct);
        assert!(has_parse_errors(&verdict.payload));

        let clean = classify(&EvaluatorOutput::Rubrics {
            rubrics: vec![rubric("correctness", 9.0)],
        });
        assert!(!has_parse_errors(&clean.payload));
    }

    #[test]
    fn test_empty_rubrics_are_incorrect() {
        assert!(!classify(&EvaluatorOutput::Rubrics { rubrics: vec![] }).correct);
    }

    #[test]
    fn test_classification_ignores_null_fields() {
        let verdict = classify(&EvaluatorOutput::Classification {
            model_output: json!({"a": "1", "b": null}),
            expected_output: json!({"a": "1"}),
        });
        assert!(verdict.correct);
        assert_eq!(verdict.payload["expectedOutput"], json!({"a": "1"}));
    }

    #[test]
    fn test_classification_sentinels_nested_and_case_insensitive() {
        let verdict = classify(&EvaluatorOutput::Classification {
            model_output: json!("{\"label\": \"spam\", \"meta\": {\"reason\": \"None\", \"x\": \"\"}}"),
            expected_output: json!({"label": "spam", "meta": {"reason": "NULL"}}),
        });
        assert!(verdict.correct);
    }

    #[test]
    fn test_classification_mismatch() {
        let verdict = classify(&EvaluatorOutput::Classification {
            model_output: json!({"label": "ham"}),
            expected_output: json!({"label": "spam"}),
        });
        assert!(!verdict.correct);
    }

    #[test]
    fn test_classification_plain_strings() {
        assert!(classify(&EvaluatorOutput::Classification {
            model_output: json!("spam"),
            expected_output: json!("spam"),
        })
        .correct);
    }

    #[test]
    fn test_judgment_threshold() {
        let pass = classify(&EvaluatorOutput::Judgment {
            relevance: 3.0,
            coherence: 4.0,
            correctness: 8.0,
        });
        assert!(pass.correct);
        assert_eq!(pass.payload["relevance"], 3.0);

        let fail = classify(&EvaluatorOutput::Judgment {
            relevance: 10.0,
            coherence: 10.0,
            correctness: 7.0,
        });
        assert!(!fail.correct);
    }

    #[test]
    fn test_synthesize_accuracy() {
        let mut rubrics = vec![rubric("correctness", 9.0), rubric("completeness", 7.0)];
        synthesize_accuracy(&mut rubrics);
        assert_eq!(rubrics.len(), 3);
        assert_eq!(rubrics[2].evaluator, ACCURACY_RUBRIC);
        assert_eq!(rubrics[2].score, 8.0);

        // Present accuracy is left alone
        synthesize_accuracy(&mut rubrics);
        assert_eq!(rubrics.len(), 3);
    }
}
