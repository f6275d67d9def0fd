//! Broker settings: oracle endpoints, candidate tuning, failure policy.
//!
//! Loaded from a JSON settings file; a missing file means defaults. The
//! API key is resolved from the environment at client construction, never
//! stored in the file.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::executor::FailurePolicy;

/// Default OpenAI-compatible chat completions endpoint.
pub const DEFAULT_REASONING_URL: &str = "http://127.0.0.1:4000/v1/chat/completions";
/// Default embedding service base URL.
pub const DEFAULT_EMBEDDING_URL: &str = "http://127.0.0.1:8100";
/// Environment variable consulted for the reasoning API key.
pub const API_KEY_ENV: &str = "NEXUS_API_KEY";

const DEFAULT_REASONING_MODEL: &str = "gemini-2.0-flash";
const DEFAULT_CANDIDATE_THRESHOLD: f32 = 0.45;
const DEFAULT_TOP_K_PER_NODE: usize = 10;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_EMBED_TIMEOUT_SECS: u64 = 30;
const DEFAULT_ORACLE_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_ORACLE_COOLDOWN_MS: u64 = 4_000;
const DEFAULT_ORACLE_BACKOFF_STEP_MS: u64 = 15_000;

/// Runtime settings for the broker.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSettings {
    /// Chat completions endpoint for the reasoning oracle.
    #[serde(default = "default_reasoning_url")]
    pub reasoning_url: String,
    /// Model id for the reasoning oracle.
    #[serde(default = "default_reasoning_model")]
    pub reasoning_model: String,
    /// Embedding service base URL.
    #[serde(default = "default_embedding_url")]
    pub embedding_url: String,
    /// Optional embedding model hint.
    #[serde(default)]
    pub embedding_model: Option<String>,
    /// Cosine-similarity threshold for candidate pairs.
    #[serde(default = "default_candidate_threshold")]
    pub candidate_threshold: f32,
    /// Global candidate cap multiplier (`top_k * indexed operations`).
    #[serde(default = "default_top_k_per_node")]
    pub top_k_per_node: usize,
    /// MCP handshake timeout per tool-server connect, in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Embedding HTTP timeout, in seconds.
    #[serde(default = "default_embed_timeout_secs")]
    pub embed_timeout_secs: u64,
    /// Oracle retry attempts before giving up.
    #[serde(default = "default_oracle_max_attempts")]
    pub oracle_max_attempts: u32,
    /// Minimum spacing between oracle calls, in milliseconds.
    #[serde(default = "default_oracle_cooldown_ms")]
    pub oracle_cooldown_ms: u64,
    /// Linear backoff step after a rate-limit signal, in milliseconds.
    #[serde(default = "default_oracle_backoff_step_ms")]
    pub oracle_backoff_step_ms: u64,
    /// What the executor does when a step fails.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            reasoning_url: default_reasoning_url(),
            reasoning_model: default_reasoning_model(),
            embedding_url: default_embedding_url(),
            embedding_model: None,
            candidate_threshold: default_candidate_threshold(),
            top_k_per_node: default_top_k_per_node(),
            connect_timeout_secs: default_connect_timeout_secs(),
            embed_timeout_secs: default_embed_timeout_secs(),
            oracle_max_attempts: default_oracle_max_attempts(),
            oracle_cooldown_ms: default_oracle_cooldown_ms(),
            oracle_backoff_step_ms: default_oracle_backoff_step_ms(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl BrokerSettings {
    /// Retry policy derived from the oracle knobs.
    #[must_use]
    pub fn retry_policy(&self) -> crate::oracle::RetryPolicy {
        crate::oracle::RetryPolicy {
            max_attempts: self.oracle_max_attempts.max(1),
            cooldown: std::time::Duration::from_millis(self.oracle_cooldown_ms),
            backoff_step: std::time::Duration::from_millis(self.oracle_backoff_step_ms),
        }
    }
}

/// Load settings from a JSON file. Missing file means defaults.
///
/// # Errors
/// Fails when the file exists but cannot be read or parsed.
pub fn load_settings(path: &Path) -> Result<BrokerSettings> {
    if !path.exists() {
        return Ok(BrokerSettings::default());
    }
    let bytes = std::fs::read(path)
        .with_context(|| format!("read settings file {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
}

fn default_reasoning_url() -> String {
    DEFAULT_REASONING_URL.to_string()
}

fn default_reasoning_model() -> String {
    DEFAULT_REASONING_MODEL.to_string()
}

fn default_embedding_url() -> String {
    DEFAULT_EMBEDDING_URL.to_string()
}

fn default_candidate_threshold() -> f32 {
    DEFAULT_CANDIDATE_THRESHOLD
}

fn default_top_k_per_node() -> usize {
    DEFAULT_TOP_K_PER_NODE
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_embed_timeout_secs() -> u64 {
    DEFAULT_EMBED_TIMEOUT_SECS
}

fn default_oracle_max_attempts() -> u32 {
    DEFAULT_ORACLE_MAX_ATTEMPTS
}

fn default_oracle_cooldown_ms() -> u64 {
    DEFAULT_ORACLE_COOLDOWN_MS
}

fn default_oracle_backoff_step_ms() -> u64 {
    DEFAULT_ORACLE_BACKOFF_STEP_MS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings.reasoning_url, DEFAULT_REASONING_URL);
        assert!((settings.candidate_threshold - 0.45).abs() < f32::EPSILON);
        assert_eq!(settings.failure_policy, FailurePolicy::ContinueWithStaleData);
    }

    #[test]
    fn partial_file_keeps_defaults_for_omitted_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nexus.json");
        let json = r#"{"reasoning_model": "local-model", "failure_policy": "abort_on_failure"}"#;
        std::fs::File::create(&path)
            .unwrap()
            .write_all(json.as_bytes())
            .unwrap();
        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.reasoning_model, "local-model");
        assert_eq!(settings.failure_policy, FailurePolicy::AbortOnFailure);
        assert_eq!(settings.top_k_per_node, 10);
    }
}
