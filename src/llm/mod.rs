//! Single entry point to one or more LLM providers: prompt assembly,
//! JSON-mode enforcement, the three-layer retry regime, and key rotation.

pub mod json_mode;
pub mod provider;
pub mod retry;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::config::{AppConfig, ModelTag};
use crate::error::GatewayError;

pub use provider::{HttpProvider, ProviderRequest};

/// Generation parameters shared across all stages.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.3,
        }
    }
}

/// The Gateway's public surface. Stages never name a concrete model —
/// they request a logical `ModelTag` and the Gateway resolves it.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    /// Request a JSON value matching `schema_hint`. Guarantees the result
    /// parses as JSON or returns a typed error distinguishing rate-limit,
    /// transient, permanent, parse, and safety-block failures.
    async fn complete_json(
        &self,
        model_tag: ModelTag,
        system_prompt: &str,
        user_prompt: &str,
        schema_hint: &str,
        max_tokens: u32,
    ) -> Result<JsonValue, GatewayError>;

    /// Request free-form text (Comment-Synthesis, translation).
    async fn complete_text(
        &self,
        model_tag: ModelTag,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
    ) -> Result<String, GatewayError>;
}

/// The production Gateway: dispatches through [`HttpProvider`], applies
/// the client-layer retry loop, and injects JSON-mode instructions.
pub struct Gateway {
    config: AppConfig,
    http: reqwest::Client,
}

impl Gateway {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn provider_for(&self, tag: ModelTag) -> Result<HttpProvider, GatewayError> {
        let binding = self
            .config
            .resolve_model(tag)
            .map_err(|_| GatewayError::NotConfigured(format!("{tag:?}")))?;
        Ok(HttpProvider::new(self.http.clone(), binding))
    }
}

#[async_trait]
impl LlmGateway for Gateway {
    async fn complete_json(
        &self,
        model_tag: ModelTag,
        system_prompt: &str,
        user_prompt: &str,
        schema_hint: &str,
        max_tokens: u32,
    ) -> Result<JsonValue, GatewayError> {
        let provider = self.provider_for(model_tag)?;
        let framed_system = json_mode::frame_system_prompt(system_prompt, schema_hint);

        let raw = retry::with_client_retry(&self.config.retry, || {
            provider.complete(&framed_system, user_prompt, max_tokens)
        })
        .await?;

        json_mode::parse_json_response(&raw).map_err(GatewayError::Parse)
    }

    async fn complete_text(
        &self,
        model_tag: ModelTag,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
    ) -> Result<String, GatewayError> {
        let provider = self.provider_for(model_tag)?;

        retry::with_client_retry(&self.config.retry, || {
            provider.complete(system_prompt, user_prompt, max_tokens)
        })
        .await
    }
}
