//! Parsing of raw judge text into structured evaluator output

use crate::error::{JudgeloopError, Result};
use crate::evaluation::classifier::RubricScore;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[a-zA-Z0-9_-]*\s*\n?(.*?)```").expect("valid fence regex"));

/// Remove markdown code fences, keeping the fenced body
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    match CODE_FENCE.captures(trimmed) {
        Some(caps) => caps
            .get(1)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default(),
        None => trimmed.to_string(),
    }
}

/// Extract the first JSON document from judge text
///
/// Accepts fenced blocks and prose around a single object or array.
pub fn extract_json(text: &str) -> Result<Value> {
    let body = strip_code_fences(text);
    if let Ok(value) = serde_json::from_str::<Value>(&body) {
        return Ok(value);
    }

    let start = body.find(|c: char| c == '{' || c == '[');
    let end = body.rfind(|c: char| c == '}' || c == ']');
    if let (Some(start), Some(end)) = (start, end) {
        if end > start {
            if let Ok(value) = serde_json::from_str::<Value>(&body[start..=end]) {
                return Ok(value);
            }
        }
    }

    Err(JudgeloopError::Parse(format!(
        "no JSON document in judge output: {}",
        truncate(text, 120)
    )))
}

/// Read a 0-10 score that may arrive as a number or a numeric string
fn score_field(value: &Value, field: &str) -> Result<f64> {
    let raw = value
        .get(field)
        .ok_or_else(|| JudgeloopError::Parse(format!("missing field `{}`", field)))?;

    let score = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| JudgeloopError::Parse(format!("field `{}` is not numeric: {}", field, raw)))?;

    if !score.is_finite() {
        return Err(JudgeloopError::Parse(format!("field `{}` is not finite", field)));
    }
    Ok(score.clamp(0.0, 10.0))
}

/// Parse one rubric response
pub fn parse_rubric_score(rubric: &str, text: &str) -> Result<RubricScore> {
    let value = extract_json(text)?;
    let score = score_field(&value, "score")?;

    let analysis = value
        .get("analysis")
        .and_then(|a| a.as_str())
        .unwrap_or_default()
        .to_string();

    let errors = match value.get("errors") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|e| e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()))
            .collect(),
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    };

    Ok(RubricScore {
        evaluator: rubric.to_string(),
        score,
        analysis,
        errors,
    })
}

/// Parse a relevance/coherence/correctness triad
pub fn parse_judgment(text: &str) -> Result<(f64, f64, f64)> {
    let value = extract_json(text)?;
    Ok((
        score_field(&value, "relevance")?,
        score_field(&value, "coherence")?,
        score_field(&value, "correctness")?,
    ))
}

/// Parse the judge's expected output for a classification
pub fn parse_expected_output(text: &str) -> Result<Value> {
    let value = extract_json(text).unwrap_or_else(|_| Value::String(text.trim().to_string()));
    match value {
        Value::Object(mut map) => Ok(map
            .remove("expectedOutput")
            .or_else(|| map.remove("expected_output"))
            .unwrap_or(Value::Object(map))),
        other => Ok(other),
    }
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}
