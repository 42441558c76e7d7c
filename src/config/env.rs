// src/config/env.rs
// Environment-based configuration - single source of truth for all env vars

use tracing::{debug, warn};

/// API keys loaded from environment variables
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// OpenAI API key (OPENAI_API_KEY) — embeddings and completion
    pub openai: Option<String>,
    /// DeepSeek API key (DEEPSEEK_API_KEY) — completion
    pub deepseek: Option<String>,
    /// Ollama host (OLLAMA_HOST) — local embeddings, no key needed
    pub ollama: Option<String>,
}

impl ApiKeys {
    /// Load API keys from environment variables (single source of truth)
    pub fn from_env() -> Self {
        let keys = Self {
            openai: Self::read_key("OPENAI_API_KEY"),
            deepseek: Self::read_key("DEEPSEEK_API_KEY"),
            ollama: Self::read_key("OLLAMA_HOST"),
        };
        keys.log_status();
        keys
    }

    /// Read a single env var, filtering empty values
    fn read_key(name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|k| !k.trim().is_empty())
    }

    /// Check if any completion provider is available
    pub fn has_completion(&self) -> bool {
        self.deepseek.is_some() || self.openai.is_some()
    }

    /// Check if embeddings are available
    pub fn has_embeddings(&self) -> bool {
        self.openai.is_some() || self.ollama.is_some()
    }

    /// Log which providers are available (without exposing values)
    fn log_status(&self) {
        let mut available = Vec::new();
        if self.openai.is_some() {
            available.push("OpenAI");
        }
        if self.deepseek.is_some() {
            available.push("DeepSeek");
        }
        if self.ollama.is_some() {
            available.push("Ollama");
        }

        if available.is_empty() {
            warn!("No API keys configured - embedding and completion capabilities unavailable");
        } else {
            debug!(providers = ?available, "API keys loaded");
        }
    }
}

/// Embeddings configuration from environment variables
#[derive(Debug, Clone)]
pub struct EmbeddingsConfig {
    /// Embedding dimensions (MEMORIA_EMBEDDING_DIMENSIONS, default 1536).
    /// Process-wide constant; changing it invalidates the vector index.
    pub dimensions: usize,
    /// Max texts per embedding request (MEMORIA_EMBEDDING_BATCH_SIZE)
    pub batch_size: usize,
    /// Ollama embedding model (MEMORIA_OLLAMA_EMBEDDING_MODEL)
    pub ollama_model: String,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            dimensions: 1536,
            batch_size: 64,
            ollama_model: "nomic-embed-text".to_string(),
        }
    }
}

impl EmbeddingsConfig {
    /// Load embeddings configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let dimensions = std::env::var("MEMORIA_EMBEDDING_DIMENSIONS")
            .ok()
            .and_then(|d| d.parse().ok())
            .unwrap_or(defaults.dimensions);

        let batch_size = std::env::var("MEMORIA_EMBEDDING_BATCH_SIZE")
            .ok()
            .and_then(|d| d.parse().ok())
            .unwrap_or(defaults.batch_size);

        let ollama_model = std::env::var("MEMORIA_OLLAMA_EMBEDDING_MODEL")
            .ok()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(defaults.ollama_model);

        if dimensions != 1536 {
            debug!(dimensions, "Custom embedding dimensions configured");
        }

        Self {
            dimensions,
            batch_size,
            ollama_model,
        }
    }
}
