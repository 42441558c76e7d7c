// src/embeddings/ollama.rs
// Ollama local embeddings client

use std::time::Duration;

use crate::error::{MemoriaError, Result};

/// Local models are slower per request; allow more headroom.
const TIMEOUT_SECS: u64 = 120;

/// Ollama embeddings client (no API key; talks to a local daemon).
pub struct OllamaEmbeddings {
    host: String,
    model: String,
    dimensions: usize,
    http_client: reqwest::Client,
}

impl OllamaEmbeddings {
    pub fn new(host: String, model: String, dimensions: usize) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            host: host.trim_end_matches('/').to_string(),
            model,
            dimensions,
            http_client,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    /// Embed a single text.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.host);
        let body = serde_json::json!({
            "model": self.model,
            "prompt": text,
        });

        let response = self.http_client.post(&url).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(MemoriaError::Transient(format!(
                "ollama embeddings {status}: {text}"
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| MemoriaError::Transient(e.to_string()))?;

        let embedding: Vec<f32> = json["embedding"]
            .as_array()
            .ok_or_else(|| MemoriaError::Transient("invalid ollama response".into()))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();

        if embedding.len() != self.dimensions {
            return Err(MemoriaError::Fatal(format!(
                "embedding dimension mismatch: got {}, expected {} (check MEMORIA_EMBEDDING_DIMENSIONS against the model)",
                embedding.len(),
                self.dimensions
            )));
        }

        Ok(embedding)
    }

    /// The embeddings endpoint is single-text; batch sequentially and
    /// report per-item outcomes.
    pub async fn embed_batch(&self, texts: &[String]) -> Vec<Result<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_trailing_slash_stripped() {
        let client = OllamaEmbeddings::new("http://localhost:11434/".into(), "m".into(), 8);
        assert_eq!(client.host, "http://localhost:11434");
    }
}
