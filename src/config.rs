//! Engine configuration
//!
//! Settings are layered with the `config` crate: built-in defaults, then an
//! optional TOML file, then `JUDGELOOP__*` environment variables
//! (e.g. `JUDGELOOP__JUDGE__MODEL`). The judge API key falls back to
//! `ANTHROPIC_API_KEY`.

use crate::error::{JudgeloopError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Environment prefix for configuration overrides
const ENV_PREFIX: &str = "JUDGELOOP";

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub judge: JudgeConfig,
    pub evaluation: EvaluationConfig,
    pub batch: BatchConfig,
    pub insights: InsightConfig,
    pub optimizer: OptimizerConfig,
    pub ab_test: AbTestConfig,
    pub scheduler: SchedulerConfig,
}

/// Judge provider settings, passed explicitly to every client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    /// Provider name (only "anthropic" ships)
    pub provider: String,

    /// API key; empty means "read ANTHROPIC_API_KEY"
    #[serde(skip_serializing)]
    pub api_key: String,

    /// Default judge model
    pub model: String,

    /// API base URL
    pub base_url: String,

    /// Max tokens for responses
    pub max_tokens: usize,

    /// Temperature for sampling
    pub temperature: f32,

    /// Per-call deadline in seconds
    pub timeout_secs: u64,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            api_key: String::new(),
            model: "claude-haiku-4-5-20251001".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 2048,
            temperature: 0.0,
            timeout_secs: 60,
        }
    }
}

impl JudgeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Configured key, or the ANTHROPIC_API_KEY environment variable
    pub fn resolved_api_key(&self) -> String {
        if !self.api_key.is_empty() {
            return self.api_key.clone();
        }
        env::var("ANTHROPIC_API_KEY").unwrap_or_default()
    }
}

/// Synchronous evaluation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Attempts per record per cycle (whole rubric set)
    pub max_attempts: u32,

    /// Concurrent judge calls allowed within one cycle
    pub max_concurrent_judge_calls: usize,

    /// Only records newer than this are sampled
    pub lookback_days: i64,

    /// Lease taken on a record before dispatching its evaluation
    pub claim_lease_secs: i64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            max_concurrent_judge_calls: 8,
            lookback_days: 3,
            claim_lease_secs: 600,
        }
    }
}

/// Batch reconciliation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Jobs older than this are no longer swept
    pub lookback_days: i64,

    /// Jobs reconciled per sweep
    pub max_jobs_per_sweep: usize,

    /// Generate a natural-language summary for each reconciled record
    pub generate_summaries: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            lookback_days: 2,
            max_jobs_per_sweep: 50,
            generate_summaries: true,
        }
    }
}

/// Insight generation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InsightConfig {
    /// Attachments sent with an insight request (randomly chosen)
    pub max_attachments: usize,

    /// Prior insights listed as "do not repeat"
    pub max_prior_insights: usize,

    /// Longest accepted problem/solution/description text
    pub max_field_chars: usize,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            max_attachments: 5,
            max_prior_insights: 20,
            max_field_chars: 300,
        }
    }
}

/// Prompt optimizer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Most recent insights folded into a rewrite
    pub max_insights: usize,

    /// Traffic share given to a newly provisioned challenger
    pub default_challenger_percentage: u8,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_insights: 20,
            default_challenger_percentage: 30,
        }
    }
}

/// A/B comparison settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbTestConfig {
    /// Base records replayed per comparison run
    pub sample_size: usize,
}

impl Default for AbTestConfig {
    fn default() -> Self {
        Self { sample_size: 30 }
    }
}

/// Background scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between evaluation cycles
    pub evaluation_interval_secs: u64,

    /// Seconds between batch sweeps
    pub batch_sweep_interval_secs: u64,

    /// Maximum duration of one job run in seconds
    pub max_job_duration_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_secs: 300,
            batch_sweep_interval_secs: 120,
            max_job_duration_secs: 600,
        }
    }
}

impl EngineConfig {
    /// Load defaults, an optional TOML file and environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            debug!("Loading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML (API key omitted)
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| JudgeloopError::InvalidConfig(format!("Failed to render config: {}", e)))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.evaluation.max_attempts == 0 {
            return Err(JudgeloopError::InvalidConfig(
                "evaluation.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.evaluation.max_concurrent_judge_calls == 0 {
            return Err(JudgeloopError::InvalidConfig(
                "evaluation.max_concurrent_judge_calls must be at least 1".to_string(),
            ));
        }

        if self.evaluation.lookback_days <= 0 || self.batch.lookback_days <= 0 {
            return Err(JudgeloopError::InvalidConfig(
                "lookback windows must be positive".to_string(),
            ));
        }

        if self.optimizer.default_challenger_percentage > 100 {
            return Err(JudgeloopError::InvalidConfig(
                "optimizer.default_challenger_percentage must be within [0, 100]".to_string(),
            ));
        }

        if self.judge.timeout_secs == 0 {
            return Err(JudgeloopError::InvalidConfig(
                "judge.timeout_secs must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
