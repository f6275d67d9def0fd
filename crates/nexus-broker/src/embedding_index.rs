//! Embedding index over operation inputs/outputs.
//!
//! Avoids exhaustive pairwise compatibility checks: each operation gets a
//! "produces" vector and a "consumes" vector, and candidate connections are
//! the cross-server pairs whose produces→consumes cosine similarity clears a
//! threshold. O(N) embedding calls, O(N²) in-memory similarity, and only the
//! surviving candidates reach the reasoning oracle.

use std::collections::HashMap;

use anyhow::Result;

use crate::models::OperationDescriptor;
use crate::oracle::EmbeddingOracle;

/// Key of an indexed operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OpKey {
    /// Owning server name.
    pub server: String,
    /// Operation name.
    pub operation: String,
}

impl std::fmt::Display for OpKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.server, self.operation)
    }
}

/// A candidate connection surfaced by similarity, not yet validated.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Producing side.
    pub source: OpKey,
    /// Consuming side.
    pub target: OpKey,
    /// Cosine similarity of produces(source) × consumes(target).
    pub similarity: f32,
}

/// Per-operation embedding cache: one "produces" and one "consumes" vector,
/// derived once and kept for the index lifetime.
#[derive(Default)]
pub struct EmbeddingIndex {
    produces: HashMap<OpKey, Vec<f32>>,
    consumes: HashMap<OpKey, Vec<f32>>,
    keys: Vec<OpKey>,
}

impl EmbeddingIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether nothing is indexed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Index one operation; no-op when the key is already present.
    ///
    /// # Errors
    /// Fails when the embedding oracle fails.
    pub async fn index_operation(
        &mut self,
        server: &str,
        operation: &OperationDescriptor,
        profile_summary: &str,
        oracle: &dyn EmbeddingOracle,
    ) -> Result<()> {
        let key = OpKey {
            server: server.to_string(),
            operation: operation.name.clone(),
        };
        if self.produces.contains_key(&key) {
            return Ok(());
        }
        tracing::debug!(
            event = "nexus.index.embed",
            key = %key,
            "generating embeddings for operation"
        );
        let output_text = produces_text(server, operation, profile_summary);
        let output_vec = oracle.embed(&output_text).await?;
        let input_text = consumes_text(server, operation, profile_summary);
        let input_vec = oracle.embed(&input_text).await?;

        self.produces.insert(key.clone(), output_vec);
        self.consumes.insert(key.clone(), input_vec);
        self.keys.push(key);
        Ok(())
    }

    /// Candidate pairs: every ordered cross-server pair whose similarity is
    /// at or above `threshold`, sorted descending, capped at
    /// `top_k_per_node * indexed_len`.
    ///
    /// With fewer than two indexed operations this is an empty list, not an
    /// error.
    #[must_use]
    pub fn find_candidates(&self, threshold: f32, top_k_per_node: usize) -> Vec<Candidate> {
        if self.keys.len() < 2 {
            return vec![];
        }
        let mut candidates = Vec::new();
        for source in &self.keys {
            let Some(source_vec) = self.produces.get(source) else {
                continue;
            };
            for target in &self.keys {
                if source.server == target.server {
                    continue;
                }
                let Some(target_vec) = self.consumes.get(target) else {
                    continue;
                };
                let similarity = cosine_similarity(source_vec, target_vec);
                if similarity >= threshold {
                    candidates.push(Candidate {
                        source: source.clone(),
                        target: target.clone(),
                        similarity,
                    });
                }
            }
        }
        candidates.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        candidates.truncate(top_k_per_node.saturating_mul(self.keys.len()));
        candidates
    }
}

/// Text emphasizing what the operation produces.
fn produces_text(server: &str, operation: &OperationDescriptor, profile_summary: &str) -> String {
    let mut parts = vec![
        format!("This tool ({server}.{}) produces output.", operation.name),
        format!("Tool description: {}", operation.description),
        format!("Server context: {profile_summary}"),
    ];
    if schema_is_empty(&operation.output_schema) {
        parts.push(format!("Output: derived from {}", operation.description));
    } else {
        parts.push(format!("Output schema: {}", operation.output_schema));
    }
    parts.join("\n")
}

/// Text emphasizing what the operation requires.
fn consumes_text(server: &str, operation: &OperationDescriptor, profile_summary: &str) -> String {
    let mut parts = vec![
        format!("This tool ({server}.{}) requires input.", operation.name),
        format!("Tool description: {}", operation.description),
        format!("Server context: {profile_summary}"),
    ];
    if !schema_is_empty(&operation.input_schema) {
        parts.push(format!("Input schema: {}", operation.input_schema));
    }
    parts.join("\n")
}

fn schema_is_empty(schema: &serde_json::Value) -> bool {
    match schema {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Cosine similarity; 0.0 for mismatched or zero-norm vectors.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::OracleError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic oracle: axis-aligned unit vectors per call index.
    struct FakeEmbedder {
        calls: AtomicUsize,
    }

    impl FakeEmbedder {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl crate::oracle::EmbeddingOracle for FakeEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, OracleError> {
            let n = self.calls.fetch_add(1, Ordering::Relaxed);
            let mut v = vec![0.0f32; 4];
            v[n % 4] = 1.0;
            Ok(v)
        }
    }

    fn op(name: &str) -> OperationDescriptor {
        OperationDescriptor {
            name: name.to_string(),
            description: format!("does {name}"),
            input_schema: serde_json::json!({"type": "object"}),
            output_schema: serde_json::json!({}),
        }
    }

    async fn two_server_index() -> EmbeddingIndex {
        let oracle = FakeEmbedder::new();
        let mut index = EmbeddingIndex::new();
        index
            .index_operation("alpha", &op("produce"), "", &oracle)
            .await
            .unwrap();
        index
            .index_operation("beta", &op("consume"), "", &oracle)
            .await
            .unwrap();
        index
    }

    #[tokio::test]
    async fn index_operation_is_idempotent_per_key() {
        let oracle = FakeEmbedder::new();
        let mut index = EmbeddingIndex::new();
        index
            .index_operation("alpha", &op("x"), "", &oracle)
            .await
            .unwrap();
        index
            .index_operation("alpha", &op("x"), "", &oracle)
            .await
            .unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(oracle.calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn fewer_than_two_operations_yields_no_candidates() {
        let oracle = FakeEmbedder::new();
        let mut index = EmbeddingIndex::new();
        index
            .index_operation("alpha", &op("only"), "", &oracle)
            .await
            .unwrap();
        assert!(index.find_candidates(-1.1, 10).is_empty());
    }

    #[tokio::test]
    async fn threshold_above_any_cosine_yields_empty() {
        let index = two_server_index().await;
        assert!(index.find_candidates(1.1, 10).is_empty());
    }

    #[tokio::test]
    async fn threshold_below_any_cosine_yields_all_cross_server_pairs() {
        let index = two_server_index().await;
        let candidates = index.find_candidates(-1.1, 10);
        // 2 operations on distinct servers: alpha->beta and beta->alpha.
        assert_eq!(candidates.len(), 2);
        assert!(
            candidates
                .iter()
                .all(|c| c.source.server != c.target.server)
        );
    }

    #[tokio::test]
    async fn same_server_pairs_are_excluded() {
        let oracle = FakeEmbedder::new();
        let mut index = EmbeddingIndex::new();
        index
            .index_operation("alpha", &op("one"), "", &oracle)
            .await
            .unwrap();
        index
            .index_operation("alpha", &op("two"), "", &oracle)
            .await
            .unwrap();
        assert!(index.find_candidates(-1.1, 10).is_empty());
    }

    #[test]
    fn cosine_similarity_handles_zero_norm() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }
}
