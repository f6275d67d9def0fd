//! Reasoning oracle client: OpenAI-compatible chat completions.
//!
//! Enforces minimum inter-call spacing and retries rate-limit responses with
//! linearly increasing backoff; exhausting retries is fatal for that call.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{OracleError, ReasoningOracle, RetryPolicy, Sleeper, TokioSleeper};

/// Request body for chat completions (OpenAI format).
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

/// Response: choices[0].message.content.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}

/// HTTP client for the reasoning oracle.
pub struct LlmClient {
    client: reqwest::Client,
    inference_url: String,
    model: String,
    api_key: Option<String>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    last_call: tokio::sync::Mutex<Option<Instant>>,
}

impl LlmClient {
    /// Create a client with the default retry policy and tokio sleeper.
    #[must_use]
    pub fn new(inference_url: String, model: String, api_key: Option<String>) -> Self {
        Self::with_policy(
            inference_url,
            model,
            api_key,
            RetryPolicy::default(),
            Arc::new(TokioSleeper),
        )
    }

    /// Create a client with an explicit retry policy and sleeper (tests
    /// inject a recording fake here).
    #[must_use]
    pub fn with_policy(
        inference_url: String,
        model: String,
        api_key: Option<String>,
        policy: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            inference_url,
            model,
            api_key,
            policy,
            sleeper,
            last_call: tokio::sync::Mutex::new(None),
        }
    }

    /// Wait out the remainder of the cooldown window, then stamp this call.
    async fn respect_cooldown(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.policy.cooldown {
                self.sleeper.sleep(self.policy.cooldown - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn send_once(&self, prompt: &str) -> Result<String, OracleError> {
        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user",
                content: prompt.to_string(),
            }],
        };
        let mut req = self
            .client
            .post(&self.inference_url)
            .json(&body)
            .header("Content-Type", "application/json");
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        let res = req
            .send()
            .await
            .map_err(|e| OracleError::Http(e.to_string()))?;
        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| OracleError::Http(e.to_string()))?;
        if status.as_u16() == 429 || text.contains("RESOURCE_EXHAUSTED") {
            return Err(OracleError::RateLimited(format!("status {status}")));
        }
        if !status.is_success() {
            return Err(OracleError::Http(format!("status {status}: {text}")));
        }
        let parsed: ChatCompletionResponse = serde_json::from_str(&text)
            .map_err(|e| OracleError::Decode(format!("{e}; body: {text}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        content.ok_or(OracleError::Empty)
    }
}

#[async_trait]
impl ReasoningOracle for LlmClient {
    async fn reason(&self, prompt: &str) -> Result<String, OracleError> {
        for attempt in 1..=self.policy.max_attempts {
            self.respect_cooldown().await;
            match self.send_once(prompt).await {
                Ok(text) => return Ok(text),
                Err(OracleError::RateLimited(detail)) => {
                    let backoff = self.policy.backoff_after(attempt);
                    tracing::warn!(
                        event = "nexus.oracle.rate_limited",
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        backoff_secs = backoff.as_secs(),
                        detail = %detail,
                        "reasoning oracle rate limited; backing off"
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
}
