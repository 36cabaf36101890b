//! Embedding provider abstraction and the OpenAI implementation.
//!
//! [`Embedder::embed_many`] returns one slot per input text; a `None` slot
//! signals a per-item failure. Callers persist chunks without vectors for
//! failed slots and record an embed-stage warning — embedding failures
//! never abort indexing.
//!
//! The OpenAI provider retries rate limits (HTTP 429), server errors
//! (5xx), and transport failures, doubling the pause between attempts
//! from one second up to a 32-second ceiling. Any other client error
//! fails on the first response.

use async_trait::async_trait;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

/// Batch embedding over a provider-specific model.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch. The result has exactly `texts.len()` slots; a `None`
    /// slot marks a per-item failure the caller tolerates.
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>>;

    /// Embed a single query text.
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut result = self.embed_many(&[text.to_string()]).await?;
        result
            .pop()
            .flatten()
            .ok_or_else(|| Error::Upstream("empty embedding response".to_string()))
    }

    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Vector dimensionality.
    fn dims(&self) -> usize;
}

/// Embedding provider calling the OpenAI `POST /v1/embeddings` endpoint.
#[derive(Debug)]
pub struct OpenAiEmbedder {
    model: String,
    dims: usize,
    api_key: String,
    base_url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    /// # Errors
    ///
    /// `Validation` when the API key is empty.
    pub fn new(config: &EmbeddingConfig, api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(Error::Validation("embedding API key not set".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model: config.model.clone(),
            dims: config.dims,
            api_key,
            base_url: "https://api.openai.com/v1".to_string(),
            max_retries: config.max_retries,
            client,
        })
    }

    /// Override the API base URL. Intended for tests and proxies.
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    async fn call(&self, texts: &[String]) -> Result<serde_json::Value> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err: Option<Error> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/embeddings", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json().await?);
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(Error::Upstream(format!(
                            "embeddings API {status}: {body_text}"
                        )));
                        continue;
                    }
                    return Err(Error::Upstream(format!(
                        "embeddings API {status}: {body_text}"
                    )));
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::Upstream("embedding failed after retries".to_string())))
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let json = self.call(texts).await?;
        parse_embeddings_response(&json, texts.len())
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

/// Parse the embeddings response, placing each vector at its reported
/// `index`. Items the provider omitted stay `None`.
fn parse_embeddings_response(
    json: &serde_json::Value,
    expected: usize,
) -> Result<Vec<Option<Vec<f32>>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| Error::Upstream("embeddings response missing data array".to_string()))?;

    let mut slots: Vec<Option<Vec<f32>>> = vec![None; expected];
    for item in data {
        let Some(index) = item.get("index").and_then(serde_json::Value::as_u64) else {
            continue;
        };
        let Some(values) = item.get("embedding").and_then(|e| e.as_array()) else {
            continue;
        };
        let vector: Vec<f32> = values
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        if let Some(slot) = slots.get_mut(index as usize) {
            *slot = Some(vector);
        }
    }
    Ok(slots)
}
