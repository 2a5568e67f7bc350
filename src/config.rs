//! Environment-driven configuration, following the teacher's
//! `Default` + `validate()` shape but sourced from the env keys spec §6 names.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Logical model tags a stage requests instead of naming a concrete model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelTag {
    Map,
    Synthesis,
    Analysis,
    CommentGroups,
    MediumScoring,
    Drift,
}

impl ModelTag {
    fn env_key(self) -> &'static str {
        match self {
            ModelTag::Map => "MODEL_MAP",
            ModelTag::Synthesis => "MODEL_SYNTHESIS",
            ModelTag::Analysis => "MODEL_ANALYSIS",
            ModelTag::CommentGroups => "MODEL_COMMENT_GROUPS",
            ModelTag::MediumScoring => "MODEL_MEDIUM_SCORING",
            ModelTag::Drift => "MODEL_DRIFT",
        }
    }
}

/// Which LLM API surface a provider/model string targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiProvider {
    OpenAi,
    Anthropic,
    Google,
    OpenRouter,
    /// Any OpenAI-compatible endpoint (self-hosted, proxy, etc).
    Custom,
}

/// A resolved `(provider, model)` pair plus credentials for key rotation.
#[derive(Debug, Clone)]
pub struct ModelBinding {
    pub provider: ApiProvider,
    pub model: String,
    /// Comma-separated credentials in the env become one entry per key.
    pub api_keys: Vec<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapConfig {
    pub chunk_size: usize,
    pub concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediumRescueConfig {
    pub threshold: f32,
    pub top_k: usize,
    pub max_candidates: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReduceConfig {
    pub max_context_posts: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentGroupConfig {
    pub drift_chunk_size: usize,
    pub drift_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub client_max_attempts: u32,
    pub client_backoff_multiplier: f64,
    pub client_backoff_cap_secs: f64,
    pub stage_max_attempts: u32,
    pub stage_backoff_min_secs: f64,
    pub stage_backoff_max_secs: f64,
    pub pipeline_cooldown_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            client_max_attempts: 5,
            client_backoff_multiplier: 1.5,
            client_backoff_cap_secs: 15.0,
            stage_max_attempts: 3,
            stage_backoff_min_secs: 4.0,
            stage_backoff_max_secs: 60.0,
            pipeline_cooldown_secs: 45,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub map: MapConfig,
    pub medium_rescue: MediumRescueConfig,
    pub reduce: ReduceConfig,
    pub comment_group: CommentGroupConfig,
    pub retry: RetryConfig,
    /// Per-expert wall-clock ceiling (spec §4.11).
    pub expert_ceiling_secs: u64,
    /// Bound on concurrently-running Orchestrators per request (spec §5).
    pub max_concurrent_experts: usize,
    /// Date-filter window length in months (spec §6, default 3).
    pub recent_window_months: u32,
    /// Max gap between streaming events before a keepalive is injected.
    pub keepalive_interval_secs: u64,

    #[serde(skip)]
    model_keys: HashMap<String, String>,
}

impl AppConfig {
    /// Resolve a logical model tag into a concrete provider binding by
    /// reading `MODEL_<TAG>` (format `provider:model`) and
    /// `<PROVIDER>_API_KEY` (comma-separated for rotation) from the
    /// environment.
    pub fn resolve_model(&self, tag: ModelTag) -> Result<ModelBinding, String> {
        let raw = std::env::var(tag.env_key())
            .map_err(|_| format!("missing env var {}", tag.env_key()))?;
        let (provider_str, model) = raw
            .split_once(':')
            .ok_or_else(|| format!("{} must be 'provider:model'", tag.env_key()))?;

        let provider = match provider_str {
            "openai" => ApiProvider::OpenAi,
            "anthropic" => ApiProvider::Anthropic,
            "google" => ApiProvider::Google,
            "openrouter" => ApiProvider::OpenRouter,
            other => {
                if self.model_keys.contains_key(other) {
                    ApiProvider::Custom
                } else {
                    return Err(format!("unknown provider '{other}'"));
                }
            }
        };

        let key_env = format!("{}_API_KEY", provider_str.to_uppercase());
        let api_keys = std::env::var(&key_env)
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();

        let base_url = std::env::var(format!("{}_BASE_URL", provider_str.to_uppercase())).ok();

        Ok(ModelBinding {
            provider,
            model: model.to_string(),
            api_keys,
            base_url,
        })
    }

    /// Validate config values, returning errors for clearly broken settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.map.chunk_size == 0 {
            return Err("map.chunk_size must be > 0".into());
        }
        if self.map.concurrency == 0 {
            return Err("map.concurrency must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.medium_rescue.threshold) {
            return Err("medium_rescue.threshold must be in [0.0, 1.0]".into());
        }
        if self.medium_rescue.top_k == 0 {
            return Err("medium_rescue.top_k must be > 0".into());
        }
        if self.reduce.max_context_posts == 0 {
            return Err("reduce.max_context_posts must be > 0".into());
        }
        if self.expert_ceiling_secs == 0 {
            return Err("expert_ceiling_secs must be > 0".into());
        }
        if self.max_concurrent_experts == 0 {
            return Err("max_concurrent_experts must be > 0".into());
        }
        Ok(())
    }

    /// Load config from a JSON file, falling back to defaults for missing fields.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file: {e}"))?;
        let config: Self =
            serde_json::from_str(&content).map_err(|e| format!("failed to parse config: {e}"))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("expert-panel");

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite:{}", data_dir.join("panel.db").display()));

        Self {
            database_url,
            map: MapConfig {
                chunk_size: 100,
                concurrency: 25,
            },
            medium_rescue: MediumRescueConfig {
                threshold: 0.7,
                top_k: 5,
                max_candidates: 50,
            },
            reduce: ReduceConfig {
                max_context_posts: 50,
            },
            comment_group: CommentGroupConfig {
                drift_chunk_size: 20,
                drift_concurrency: 5,
            },
            retry: RetryConfig::default(),
            expert_ceiling_secs: 180,
            max_concurrent_experts: 10,
            recent_window_months: 3,
            keepalive_interval_secs: 5,
            model_keys: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let mut cfg = AppConfig::default();
        cfg.map.chunk_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_threshold_out_of_range() {
        let mut cfg = AppConfig::default();
        cfg.medium_rescue.threshold = 1.5;
        assert!(cfg.validate().is_err());
    }
}
