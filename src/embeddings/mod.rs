// src/embeddings/mod.rs
// Embedding capability and provider bindings

mod ollama;
mod openai;

pub use self::ollama::OllamaEmbeddings;
pub use self::openai::OpenAiEmbeddings;

use async_trait::async_trait;
use tracing::info;

use crate::config::{ApiKeys, EmbeddingsConfig};
use crate::error::{MemoriaError, Result};

/// Embedding capability consumed by the engine.
///
/// `embed_batch` is order-preserving and reports failure per input: the
/// returned vector always has the same length as `texts`, so callers can
/// zip results back onto their sources.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Fixed output dimensionality. Process-wide constant; a vector of a
    /// different length in the store is a `Fatal`.
    fn dimensions(&self) -> usize;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed multiple texts. Order-preserving, per-item results.
    async fn embed_batch(&self, texts: &[String]) -> Vec<Result<Vec<f32>>>;
}

/// Verify a returned vector has the expected dimensionality.
pub fn check_dimensions(embedding: &[f32], expected: usize) -> Result<()> {
    if embedding.len() != expected {
        return Err(MemoriaError::Fatal(format!(
            "embedding dimension mismatch: got {}, expected {}",
            embedding.len(),
            expected
        )));
    }
    Ok(())
}

/// Backend-specific embedding implementation
enum EmbeddingBackend {
    OpenAi(OpenAiEmbeddings),
    Ollama(OllamaEmbeddings),
}

/// Embedding client with automatic provider selection.
///
/// Priority: OpenAI (hosted) > Ollama (local, no key needed).
pub struct EmbeddingClient {
    backend: EmbeddingBackend,
}

impl EmbeddingClient {
    /// Create a client from pre-loaded configuration. Returns None when no
    /// provider is configured; the engine then runs without embeddings and
    /// retrieval degrades to lexical + recency.
    pub fn from_config(api_keys: &ApiKeys, config: &EmbeddingsConfig) -> Option<Self> {
        if let Some(api_key) = api_keys.openai.as_ref() {
            info!(dimensions = config.dimensions, "Using OpenAI embeddings");
            return Some(Self {
                backend: EmbeddingBackend::OpenAi(OpenAiEmbeddings::new(
                    api_key.clone(),
                    config.dimensions,
                    config.batch_size,
                )),
            });
        }

        if let Some(host) = api_keys.ollama.as_ref() {
            let client =
                OllamaEmbeddings::new(host.clone(), config.ollama_model.clone(), config.dimensions);
            info!(
                model = %config.ollama_model,
                dimensions = config.dimensions,
                "Using Ollama embeddings"
            );
            return Some(Self {
                backend: EmbeddingBackend::Ollama(client),
            });
        }

        None
    }

    /// Provider identifier for logging and change detection
    pub fn provider_id(&self) -> &'static str {
        match &self.backend {
            EmbeddingBackend::OpenAi(_) => "openai",
            EmbeddingBackend::Ollama(_) => "ollama",
        }
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    fn dimensions(&self) -> usize {
        match &self.backend {
            EmbeddingBackend::OpenAi(c) => c.dimensions(),
            EmbeddingBackend::Ollama(c) => c.dimensions(),
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        match &self.backend {
            EmbeddingBackend::OpenAi(c) => c.embed(text).await,
            EmbeddingBackend::Ollama(c) => c.embed(text).await,
        }
    }

    async fn embed_batch(&self, texts: &[String]) -> Vec<Result<Vec<f32>>> {
        match &self.backend {
            EmbeddingBackend::OpenAi(c) => c.embed_batch(texts).await,
            EmbeddingBackend::Ollama(c) => c.embed_batch(texts).await,
        }
    }
}
