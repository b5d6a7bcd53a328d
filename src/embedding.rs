//! Embedding providers.
//!
//! Implements the core [`Embedder`] trait over HTTP:
//! - **[`OpenAIEmbedder`]**: `POST {url}/v1/embeddings`, key from `OPENAI_API_KEY`.
//! - **[`OllamaEmbedder`]**: `POST {url}/api/embed` on a local Ollama instance.
//!
//! plus the offline `hash` provider from the core crate.
//!
//! Providers make exactly one request per call and classify failures:
//! - HTTP 429 (rate limited), 5xx and network errors → [`EmbedError::Transient`]
//! - other HTTP 4xx and malformed responses → [`EmbedError::Rejected`]
//!
//! Retries and backoff belong to the indexing worker pool, which sees every
//! chunk's attempt count.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use repo_lens_core::embedding::{EmbedError, Embedder, HashEmbedder};

use crate::config::{EmbeddingConfig, DEFAULT_HASH_DIMS};

/// Build the embedder named by `embedding.provider`.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(
            config.dims.unwrap_or(DEFAULT_HASH_DIMS),
        ))),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Send one JSON request and classify the outcome.
async fn post_json(
    request: reqwest::RequestBuilder,
    provider: &str,
) -> Result<serde_json::Value, EmbedError> {
    let response = request
        .send()
        .await
        .map_err(|e| EmbedError::Transient(format!("{} connection error: {}", provider, e)))?;
    let status = response.status();

    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| EmbedError::Transient(format!("{} response read error: {}", provider, e)));
    }

    let body_text = response.text().await.unwrap_or_default();
    let message = format!("{} API error {}: {}", provider, status, body_text);
    if status.as_u16() == 429 || status.is_server_error() {
        Err(EmbedError::Transient(message))
    } else {
        Err(EmbedError::Rejected(message))
    }
}

fn single_vector(mut vectors: Vec<Vec<f32>>, provider: &str) -> Result<Vec<f32>, EmbedError> {
    match vectors.len() {
        1 => Ok(vectors.remove(0)),
        n => Err(EmbedError::Rejected(format!(
            "{} returned {} embeddings for one input",
            provider, n
        ))),
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI embeddings API (or a compatible
/// endpoint given by `embedding.url`).
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
    api_key: String,
}

impl OpenAIEmbedder {
    /// # Errors
    ///
    /// Returns an error if `model` or `dims` is not set in config, or if
    /// `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            model,
            dims,
            url: url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let request = self
            .client
            .post(format!("{}/v1/embeddings", self.url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body);
        let json = post_json(request, "OpenAI").await?;
        let vectors = parse_openai_response(&json).map_err(|e| EmbedError::Rejected(e.to_string()))?;
        single_vector(vectors, "OpenAI")
    }
}

/// Extract the `data[].embedding` arrays in input order.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Requires Ollama to be running with an embedding model pulled
/// (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            model,
            dims,
            url: url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let request = self
            .client
            .post(format!("{}/api/embed", self.url))
            .header("Content-Type", "application/json")
            .json(&body);
        let json = post_json(request, "Ollama").await?;
        let vectors = parse_ollama_response(&json).map_err(|e| EmbedError::Rejected(e.to_string()))?;
        single_vector(vectors, "Ollama")
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: embedding is not an array"))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_provider_is_default() {
        let embedder = create_embedder(&EmbeddingConfig::default()).unwrap();
        assert_eq!(embedder.model_name(), "hash-256");
        assert_eq!(embedder.dims(), DEFAULT_HASH_DIMS);
    }

    #[test]
    fn unknown_provider_fails() {
        let config = EmbeddingConfig {
            provider: "magic".into(),
            ..Default::default()
        };
        let err = create_embedder(&config).err().unwrap();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn ollama_requires_model_and_dims() {
        let config = EmbeddingConfig {
            provider: "ollama".into(),
            ..Default::default()
        };
        assert!(create_embedder(&config).is_err());

        let config = EmbeddingConfig {
            provider: "ollama".into(),
            model: Some("nomic-embed-text".into()),
            dims: Some(768),
            ..Default::default()
        };
        let embedder = create_embedder(&config).unwrap();
        assert_eq!(embedder.model_name(), "nomic-embed-text");
        assert_eq!(embedder.dims(), 768);
    }

    #[test]
    fn openai_response_is_reordered_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert!(parse_openai_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn ollama_response_parses() {
        let json = serde_json::json!({ "embeddings": [[0.5, 0.25]] });
        assert_eq!(parse_ollama_response(&json).unwrap(), vec![vec![0.5, 0.25]]);
        let bad = serde_json::json!({ "embeddings": ["nope"] });
        assert!(parse_ollama_response(&bad).is_err());
    }

    #[test]
    fn single_vector_rejects_wrong_counts() {
        assert!(single_vector(vec![vec![1.0]], "x").is_ok());
        assert!(matches!(
            single_vector(vec![], "x"),
            Err(EmbedError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_server_is_transient() {
        let config = EmbeddingConfig {
            provider: "ollama".into(),
            model: Some("m".into()),
            dims: Some(4),
            url: Some("http://127.0.0.1:1".into()),
            timeout_secs: 2,
            ..Default::default()
        };
        let embedder = OllamaEmbedder::new(&config).unwrap();
        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(err, EmbedError::Transient(_)));
    }
}
