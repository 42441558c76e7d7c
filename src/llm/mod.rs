// src/llm/mod.rs
// Completion capability and provider bindings

mod http_client;
mod openai_compat;

pub use http_client::LlmHttpClient;
pub use openai_compat::OpenAiCompatClient;

use async_trait::async_trait;

use crate::config::ApiKeys;
use crate::error::Result;

/// Advisory output shape. `Json` asks the provider for a JSON object and
/// selects strict parsing at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    Text,
    Json,
}

/// Options for a single completion call.
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub response_shape: ResponseShape,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.4,
            response_shape: ResponseShape::Text,
        }
    }
}

impl CompletionOptions {
    /// Extraction: deterministic JSON output
    pub fn extraction() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.0,
            response_shape: ResponseShape::Json,
        }
    }

    /// Summarization: near-deterministic JSON output
    pub fn summarization() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.2,
            response_shape: ResponseShape::Json,
        }
    }

    /// Insight mining: same profile as summarization
    pub fn insights() -> Self {
        Self::summarization()
    }

    /// Responder: free text with a little variety
    pub fn responder() -> Self {
        Self {
            max_tokens: 2048,
            temperature: 0.4,
            response_shape: ResponseShape::Text,
        }
    }
}

/// Completion capability consumed by the Writer, Summarizer, Insight miner,
/// and Responder. Callers never feed untrusted text into a prompt without
/// the Validator and sanitizer having run first.
#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String>;
}

/// Pick the completion provider from configured keys.
/// Priority: DeepSeek (cheap) > OpenAI.
pub fn completion_from_config(api_keys: &ApiKeys) -> Option<OpenAiCompatClient> {
    if let Some(key) = api_keys.deepseek.as_ref() {
        return Some(OpenAiCompatClient::deepseek(key.clone()));
    }
    if let Some(key) = api_keys.openai.as_ref() {
        return Some(OpenAiCompatClient::openai(key.clone()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temperature_profiles() {
        assert_eq!(CompletionOptions::extraction().temperature, 0.0);
        assert_eq!(CompletionOptions::summarization().temperature, 0.2);
        assert_eq!(CompletionOptions::responder().temperature, 0.4);
        assert_eq!(
            CompletionOptions::extraction().response_shape,
            ResponseShape::Json
        );
        assert_eq!(
            CompletionOptions::responder().response_shape,
            ResponseShape::Text
        );
    }

    #[test]
    fn test_no_completion_provider() {
        assert!(completion_from_config(&ApiKeys::default()).is_none());
    }
}
