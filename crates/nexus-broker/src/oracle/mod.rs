//! Oracle capability interfaces: semantic reasoning and text embedding.
//!
//! Oracles are external request/response services; they never own broker
//! state. Both clients share the retry policy and the response-hygiene
//! helpers in [`parse`].

mod embedding;
mod llm;
mod parse;

pub use embedding::EmbeddingClient;
pub use llm::LlmClient;
pub use parse::{OracleJson, decode_oracle_json, decode_oracle_json_lenient, strip_code_fences};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by oracle calls.
#[derive(Debug, Error)]
pub enum OracleError {
    /// The service signalled a rate limit; retried internally first.
    #[error("oracle rate limited: {0}")]
    RateLimited(String),
    /// Every retry attempt hit a rate limit. Fatal for this call.
    #[error("oracle retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        /// Attempts made before giving up.
        attempts: u32,
    },
    /// Transport-level failure.
    #[error("oracle transport error: {0}")]
    Http(String),
    /// The response body could not be decoded.
    #[error("oracle response decode error: {0}")]
    Decode(String),
    /// The service returned an empty response.
    #[error("oracle returned an empty response")]
    Empty,
}

/// Text-in / structured-text-out reasoning oracle.
#[async_trait]
pub trait ReasoningOracle: Send + Sync {
    /// Send a prompt, return the raw response text (may be fence-wrapped JSON).
    async fn reason(&self, prompt: &str) -> Result<String, OracleError>;
}

/// Text-in / vector-out embedding oracle.
#[async_trait]
pub trait EmbeddingOracle: Send + Sync {
    /// Embed one text into a fixed-dimensionality vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, OracleError>;
}

/// Retry behavior for rate-limited oracle calls.
///
/// `cooldown` is the minimum spacing between consecutive calls; backoff
/// grows linearly with the attempt number.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts before [`OracleError::RetriesExhausted`].
    pub max_attempts: u32,
    /// Minimum inter-call spacing.
    pub cooldown: Duration,
    /// Linear backoff step: wait `backoff_step * attempt` after attempt N.
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            cooldown: Duration::from_secs(4),
            backoff_step: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retrying after the given 1-based attempt.
    #[must_use]
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }
}

/// Clock abstraction so retry behavior is testable without real delays.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Suspend for the given duration.
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_linearly() {
        let policy = RetryPolicy {
            max_attempts: 3,
            cooldown: Duration::from_millis(0),
            backoff_step: Duration::from_secs(15),
        };
        assert_eq!(policy.backoff_after(1), Duration::from_secs(15));
        assert_eq!(policy.backoff_after(2), Duration::from_secs(30));
        assert_eq!(policy.backoff_after(3), Duration::from_secs(45));
    }
}
