// src/llm/openai_compat.rs
// Completion client for OpenAI-compatible chat-completions endpoints
// (OpenAI, DeepSeek)

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, instrument};

use super::http_client::LlmHttpClient;
use super::{Completion, CompletionOptions, ResponseShape};
use crate::error::{MemoriaError, Result};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEEPSEEK_API_URL: &str = "https://api.deepseek.com/chat/completions";

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

/// Chat-completions client for any OpenAI-compatible endpoint.
pub struct OpenAiCompatClient {
    url: String,
    api_key: String,
    model: String,
    provider_name: &'static str,
    http: LlmHttpClient,
}

impl OpenAiCompatClient {
    pub fn openai(api_key: String) -> Self {
        Self::custom(OPENAI_API_URL.into(), api_key, "gpt-4o-mini".into(), "OpenAI")
    }

    pub fn deepseek(api_key: String) -> Self {
        Self::custom(
            DEEPSEEK_API_URL.into(),
            api_key,
            "deepseek-chat".into(),
            "DeepSeek",
        )
    }

    pub fn custom(
        url: String,
        api_key: String,
        model: String,
        provider_name: &'static str,
    ) -> Self {
        let http = LlmHttpClient::new(Duration::from_secs(120), Duration::from_secs(15));
        Self {
            url,
            api_key,
            model,
            provider_name,
            http,
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider_name
    }
}

#[async_trait]
impl Completion for OpenAiCompatClient {
    #[instrument(skip(self, system_prompt, user_prompt), fields(provider = self.provider_name, model = %self.model))]
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String> {
        let response_format = match options.response_shape {
            ResponseShape::Json => Some(serde_json::json!({"type": "json_object"})),
            ResponseShape::Text => None,
        };

        let request = WireRequest {
            model: &self.model,
            messages: vec![
                WireMessage {
                    role: "system",
                    content: system_prompt,
                },
                WireMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            response_format,
        };

        let body = serde_json::to_string(&request)?;
        let request_id = uuid::Uuid::new_v4().to_string();

        let raw = self
            .http
            .execute_with_retry(&request_id, &self.url, &self.api_key, body)
            .await?;

        let json: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| MemoriaError::Transient(format!("malformed completion response: {e}")))?;

        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                MemoriaError::Transient("completion response missing content".into())
            })?;

        if let Some(usage) = json.get("usage") {
            debug!(
                request_id = %request_id,
                prompt_tokens = usage["prompt_tokens"].as_u64().unwrap_or(0),
                completion_tokens = usage["completion_tokens"].as_u64().unwrap_or(0),
                "completion usage"
            );
        }

        Ok(content.to_string())
    }
}
