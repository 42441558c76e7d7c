// src/embeddings/openai.rs
// OpenAI embeddings API client

use std::time::Duration;

use tracing::debug;

use crate::error::{MemoriaError, Result};

/// Max characters to embed (longer text is truncated)
const MAX_TEXT_CHARS: usize = 8000;

/// HTTP timeout
const TIMEOUT_SECS: u64 = 30;

/// Retry attempts per request
const RETRY_ATTEMPTS: usize = 2;

/// API endpoint
const API_URL: &str = "https://api.openai.com/v1/embeddings";

/// Embedding model; 1536 native dimensions, supports down-projection via
/// the `dimensions` request field.
const MODEL: &str = "text-embedding-3-small";

/// OpenAI embeddings client
pub struct OpenAiEmbeddings {
    api_key: String,
    dimensions: usize,
    batch_size: usize,
    http_client: reqwest::Client,
}

impl OpenAiEmbeddings {
    pub fn new(api_key: String, dimensions: usize, batch_size: usize) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            api_key,
            dimensions,
            batch_size: batch_size.max(1),
            http_client,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn truncate(text: &str) -> &str {
        if text.len() > MAX_TEXT_CHARS {
            let mut end = MAX_TEXT_CHARS;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            &text[..end]
        } else {
            text
        }
    }

    /// Embed a single text with retry on transient failures.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let results = self.request_embeddings(&[Self::truncate(text).to_string()]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| MemoriaError::Transient("empty embedding response".into()))
    }

    /// Embed multiple texts. Each sub-batch of `batch_size` maps to one
    /// HTTP request and the requests run concurrently, so a failed call
    /// only fails the inputs of its own sub-batch.
    pub async fn embed_batch(&self, texts: &[String]) -> Vec<Result<Vec<f32>>> {
        if texts.is_empty() {
            return Vec::new();
        }

        let chunks: Vec<&[String]> = texts.chunks(self.batch_size).collect();
        if chunks.len() > 1 {
            debug!(
                texts = texts.len(),
                batches = chunks.len(),
                "embedding in parallel sub-batches"
            );
        }

        let futures: Vec<_> = chunks
            .iter()
            .map(|chunk| {
                let inputs: Vec<String> =
                    chunk.iter().map(|t| Self::truncate(t).to_string()).collect();
                async move { self.request_embeddings(&inputs).await }
            })
            .collect();
        let batch_results = futures::future::join_all(futures).await;

        let mut all: Vec<Result<Vec<f32>>> = Vec::with_capacity(texts.len());
        for (chunk, result) in chunks.iter().zip(batch_results) {
            match result {
                Ok(vectors) if vectors.len() == chunk.len() => {
                    all.extend(vectors.into_iter().map(Ok));
                }
                Ok(vectors) => {
                    debug!(
                        got = vectors.len(),
                        want = chunk.len(),
                        "short embedding response"
                    );
                    for _ in chunk.iter() {
                        all.push(Err(MemoriaError::Transient(
                            "embedding response count mismatch".into(),
                        )));
                    }
                }
                Err(e) => {
                    let msg = e.to_string();
                    for _ in chunk.iter() {
                        all.push(Err(MemoriaError::Transient(msg.clone())));
                    }
                }
            }
        }
        all
    }

    /// One HTTP round trip with bounded retry.
    async fn request_embeddings(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": MODEL,
            "input": inputs,
            "dimensions": self.dimensions,
        });

        let mut last_error: Option<MemoriaError> = None;
        for attempt in 0..=RETRY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
            }

            let response = self
                .http_client
                .post(API_URL)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await;

            match response {
                Ok(response) if response.status().is_success() => {
                    let json: serde_json::Value = response
                        .json()
                        .await
                        .map_err(|e| MemoriaError::Transient(e.to_string()))?;
                    return parse_embedding_response(&json, self.dimensions);
                }
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    let err = if status.as_u16() == 429 || status.is_server_error() {
                        MemoriaError::Transient(format!("embeddings API {status}: {text}"))
                    } else {
                        MemoriaError::Fatal(format!("embeddings API {status}: {text}"))
                    };
                    if err.is_fatal() {
                        return Err(err);
                    }
                    last_error = Some(err);
                }
                Err(e) => {
                    last_error = Some(e.into());
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| MemoriaError::Transient("embedding request failed".into())))
    }
}

/// Extract index-ordered embeddings from the response payload.
fn parse_embedding_response(
    json: &serde_json::Value,
    dimensions: usize,
) -> Result<Vec<Vec<f32>>> {
    let data = json["data"]
        .as_array()
        .ok_or_else(|| MemoriaError::Transient("invalid embedding response".into()))?;

    // The API returns results with an index field; sort to preserve
    // input order.
    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for item in data {
        let index = item["index"].as_u64().unwrap_or(0) as usize;
        if let Some(values) = item["embedding"].as_array() {
            let vec: Vec<f32> = values
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect();
            if vec.len() != dimensions {
                return Err(MemoriaError::Fatal(format!(
                    "embedding dimension mismatch: got {}, expected {}",
                    vec.len(),
                    dimensions
                )));
            }
            indexed.push((index, vec));
        }
    }
    indexed.sort_by_key(|(i, _)| *i);

    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}
