//! Embedding oracle client: HTTP `/embed/batch`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;

use super::{EmbeddingOracle, OracleError, RetryPolicy, Sleeper, TokioSleeper};

#[derive(Deserialize)]
struct EmbedBatchResponse {
    vectors: Option<Vec<Vec<f32>>>,
}

/// Embedding client: POST `{base}/embed/batch` with `{texts, model?}`.
pub struct EmbeddingClient {
    client: reqwest::Client,
    base_url: String,
    model: Option<String>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl EmbeddingClient {
    /// Create a client; `model` is an optional hint forwarded to the service.
    #[must_use]
    pub fn new(base_url: &str, model: Option<String>, timeout_secs: u64) -> Self {
        Self::with_policy(
            base_url,
            model,
            timeout_secs,
            RetryPolicy::default(),
            Arc::new(TokioSleeper),
        )
    }

    /// Create a client with an explicit retry policy and sleeper.
    #[must_use]
    pub fn with_policy(
        base_url: &str,
        model: Option<String>,
        timeout_secs: u64,
        policy: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.map(|m| m.trim().to_string()).filter(|m| !m.is_empty()),
            policy,
            sleeper,
        }
    }

    /// Embed a batch of texts; preserves input order.
    ///
    /// # Errors
    /// Fails on transport errors, undecodable bodies, or exhausted
    /// rate-limit retries.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, OracleError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        for attempt in 1..=self.policy.max_attempts {
            match self.embed_batch_once(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(OracleError::RateLimited(detail)) => {
                    let backoff = self.policy.backoff_after(attempt);
                    tracing::warn!(
                        event = "nexus.embedding.rate_limited",
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        detail = %detail,
                        "embedding oracle rate limited; backing off"
                    );
                    self.sleeper.sleep(backoff).await;
                }
                Err(other) => return Err(other),
            }
        }
        Err(OracleError::RetriesExhausted {
            attempts: self.policy.max_attempts,
        })
    }

    async fn embed_batch_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, OracleError> {
        let started = Instant::now();
        let url = format!("{}/embed/batch", self.base_url);
        let mut body = serde_json::json!({ "texts": texts });
        if let Some(ref model) = self.model {
            body["model"] = serde_json::Value::String(model.clone());
        }
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| OracleError::Http(e.to_string()))?;
        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(OracleError::RateLimited(format!("status {status}")));
        }
        if !status.is_success() {
            return Err(OracleError::Http(format!("status {status}")));
        }
        let data: EmbedBatchResponse = resp
            .json()
            .await
            .map_err(|e| OracleError::Decode(e.to_string()))?;
        let vectors = data.vectors.ok_or(OracleError::Empty)?;
        tracing::debug!(
            event = "nexus.embedding.batch.completed",
            texts = texts.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "embedding batch completed"
        );
        if vectors.len() != texts.len() {
            return Err(OracleError::Decode(format!(
                "expected {} vectors, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingOracle for EmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, OracleError> {
        let texts = [text.to_string()];
        let mut vectors = self.embed_batch(&texts).await?;
        vectors.pop().ok_or(OracleError::Empty)
    }
}
