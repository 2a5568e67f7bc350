//! Per-provider HTTP dispatch. Endpoint selection is grounded on
//! `shodh-rag::llm::external`'s `get_endpoint()` match; the request/response
//! shapes and error mapping for the concrete Anthropic and OpenAI-compatible
//! cases are grounded on `tuitbot-core::llm::anthropic`.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::config::{ApiProvider, ModelBinding};
use crate::error::GatewayError;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// A provider-agnostic request the Gateway hands to [`HttpProvider`].
pub struct ProviderRequest<'a> {
    pub system: &'a str,
    pub user: &'a str,
    pub max_tokens: u32,
}

/// Dispatches completions to whichever API surface `binding.provider` names,
/// rotating through `binding.api_keys` on rate-limit class errors.
pub struct HttpProvider {
    client: reqwest::Client,
    binding: ModelBinding,
    key_cursor: AtomicUsize,
}

impl HttpProvider {
    pub fn new(client: reqwest::Client, binding: ModelBinding) -> Self {
        Self {
            client,
            binding,
            key_cursor: AtomicUsize::new(0),
        }
    }

    fn current_key(&self) -> Option<&str> {
        if self.binding.api_keys.is_empty() {
            return None;
        }
        let idx = self.key_cursor.load(Ordering::Relaxed) % self.binding.api_keys.len();
        Some(&self.binding.api_keys[idx])
    }

    /// Rotate to the next credential. Called by the caller on any
    /// rate-limit class error, per spec §4.1's key rotation rule.
    fn rotate_key(&self) {
        if self.binding.api_keys.len() > 1 {
            self.key_cursor.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn endpoint(&self) -> String {
        if let Some(base) = &self.binding.base_url {
            return base.clone();
        }
        match self.binding.provider {
            ApiProvider::OpenAi => "https://api.openai.com/v1/chat/completions".to_string(),
            ApiProvider::Anthropic => "https://api.anthropic.com/v1/messages".to_string(),
            // Google's OpenAI-compatible surface, not the native
            // `generateContent` endpoint: the latter wants a `contents`
            // array shape this Gateway never builds, since every other
            // provider here already speaks the OpenAI chat-completions
            // shape `complete_openai_compatible` sends.
            ApiProvider::Google => {
                "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions"
                    .to_string()
            }
            ApiProvider::OpenRouter => {
                "https://openrouter.ai/api/v1/chat/completions".to_string()
            }
            ApiProvider::Custom => "http://localhost:8080/v1/chat/completions".to_string(),
        }
    }

    pub async fn complete(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<String, GatewayError> {
        let result = match self.binding.provider {
            ApiProvider::Anthropic => self.complete_anthropic(system, user, max_tokens).await,
            _ => self.complete_openai_compatible(system, user, max_tokens).await,
        };

        if matches!(result, Err(GatewayError::RateLimited { .. })) {
            self.rotate_key();
        }
        result
    }

    async fn complete_anthropic(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<String, GatewayError> {
        let key = self.current_key().unwrap_or_default();

        let request = AnthropicRequest {
            model: &self.binding.model,
            max_tokens,
            system: if system.is_empty() { None } else { Some(system) },
            messages: vec![AnthropicMessage {
                role: "user",
                content: user,
            }],
        };

        let response = self
            .client
            .post(self.endpoint())
            .header("x-api-key", key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(classify_error_status(
                response.status().as_u16(),
                response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok()),
                response.text().await.unwrap_or_default(),
            ));
        }

        let body: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Parse(format!("invalid Anthropic response body: {e}")))?;

        if body.stop_reason.as_deref() == Some("refusal") {
            return Err(GatewayError::SafetyBlocked);
        }

        let text = body
            .content
            .into_iter()
            .filter(|b| b.block_type == "text")
            .map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");

        if text.is_empty() {
            return Err(GatewayError::SafetyBlocked);
        }
        Ok(text)
    }

    async fn complete_openai_compatible(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<String, GatewayError> {
        let key = self.current_key().unwrap_or_default();

        let mut messages = Vec::new();
        if !system.is_empty() {
            messages.push(OpenAiMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(OpenAiMessage {
            role: "user",
            content: user,
        });

        let request = OpenAiRequest {
            model: &self.binding.model,
            max_tokens,
            messages,
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(classify_error_status(
                response.status().as_u16(),
                response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok()),
                response.text().await.unwrap_or_default(),
            ));
        }

        let body: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Parse(format!("invalid OpenAI-compatible response body: {e}")))?;

        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Parse("response had no choices".to_string()))?;

        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(GatewayError::SafetyBlocked);
        }
        Ok(choice.message.content)
    }
}

fn classify_error_status(status: u16, retry_after: Option<u64>, body: String) -> GatewayError {
    match status {
        429 | 529 => GatewayError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(if status == 529 { 30 } else { 60 }),
        },
        401 | 400 | 403 => GatewayError::Permanent {
            status,
            message: error_message(&body),
        },
        500..=599 => GatewayError::Transient {
            status,
            message: error_message(&body),
        },
        _ => GatewayError::Permanent {
            status,
            message: error_message(&body),
        },
    }
}

fn error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct Wrapped {
        error: Inner,
    }
    #[derive(Deserialize)]
    struct Inner {
        #[serde(default)]
        message: String,
    }
    serde_json::from_str::<Wrapped>(body)
        .map(|w| w.error.message)
        .unwrap_or_else(|_| body.chars().take(500).collect())
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type", default)]
    block_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<OpenAiMessage<'a>>,
}

#[derive(Serialize)]
struct OpenAiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiResponseMessage {
    #[serde(default)]
    content: String,
}
