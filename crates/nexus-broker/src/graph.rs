//! Capability graph: validated, persisted edges between tool operations.
//!
//! Candidates come from the embedding index; only those are validated by the
//! reasoning oracle. Edges are upserted by compound key and reloaded from
//! storage after every build for read-your-writes consistency.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;

use crate::embedding_index::{Candidate, EmbeddingIndex};
use crate::models::{Compatibility, EdgeKey, GraphEdge, ServerRecord};
use crate::oracle::{
    EmbeddingOracle, OracleError, OracleJson, ReasoningOracle, decode_oracle_json,
};

/// Counters from one `build_edges` pass.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BuildReport {
    /// Candidates surfaced by the embedding index.
    pub candidates: usize,
    /// Newly validated and persisted edges.
    pub new_edges: usize,
    /// Candidates skipped because their compound key was already stored.
    pub cached_edges: usize,
    /// Candidates rejected as incompatible (including parse failures).
    pub rejected: usize,
    /// Total edges after the storage reload.
    pub total_edges: usize,
}

/// Graph statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GraphStats {
    /// Total edges.
    pub total_edges: usize,
    /// Direct edges.
    pub direct_edges: usize,
    /// Translatable edges.
    pub translatable_edges: usize,
    /// Mean confidence over all edges (0 when empty).
    pub avg_confidence: f64,
    /// Operations currently indexed for similarity.
    pub indexed_operations: usize,
}

/// Oracle verdict for one candidate pair.
#[derive(Debug, Deserialize)]
struct EdgeVerdict {
    compatibility_type: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    translation_hint: String,
}

/// Builds and holds the capability graph.
pub struct CapabilityGraph {
    storage: crate::storage::Storage,
    reasoning: Arc<dyn ReasoningOracle>,
    embedding: Arc<dyn EmbeddingOracle>,
    index: EmbeddingIndex,
    edges: Vec<GraphEdge>,
    candidate_threshold: f32,
    top_k_per_node: usize,
}

impl CapabilityGraph {
    /// Create a graph over the given storage and oracles, loading any
    /// persisted edges.
    ///
    /// # Errors
    /// Fails when the stored edges cannot be loaded.
    pub fn new(
        storage: crate::storage::Storage,
        reasoning: Arc<dyn ReasoningOracle>,
        embedding: Arc<dyn EmbeddingOracle>,
        candidate_threshold: f32,
        top_k_per_node: usize,
    ) -> Result<Self> {
        let edges = storage.load_all_edges()?;
        if !edges.is_empty() {
            tracing::info!(
                event = "nexus.graph.loaded",
                edges = edges.len(),
                "loaded edges from storage"
            );
        }
        Ok(Self {
            storage,
            reasoning,
            embedding,
            index: EmbeddingIndex::new(),
            edges,
            candidate_threshold,
            top_k_per_node,
        })
    }

    /// Current in-memory edge set.
    #[must_use]
    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    /// Refresh the in-memory edge set from storage.
    ///
    /// # Errors
    /// Fails when the stored edges cannot be loaded.
    pub fn reload(&mut self) -> Result<()> {
        self.edges = self.storage.load_all_edges()?;
        Ok(())
    }

    /// Build edges for the given servers.
    ///
    /// Non-incremental builds clear persisted edges first; incremental
    /// builds skip candidates whose compound key is already stored. After
    /// the pass, the in-memory set is reloaded fully from storage.
    ///
    /// # Errors
    /// Fails when embedding an operation or touching storage fails;
    /// per-candidate oracle failures are skipped, not fatal.
    pub async fn build_edges(
        &mut self,
        servers: &HashMap<String, ServerRecord>,
        incremental: bool,
    ) -> Result<BuildReport> {
        if !incremental {
            let cleared = self.storage.clear_all_edges()?;
            self.edges.clear();
            tracing::info!(
                event = "nexus.graph.cleared",
                cleared,
                "full rebuild requested; cleared stored edges"
            );
        }

        for record in servers.values() {
            let summary = record
                .profile
                .as_ref()
                .map(|p| p.plain_language_summary.as_str())
                .unwrap_or_default();
            for operation in &record.operations {
                self.index
                    .index_operation(&record.name, operation, summary, self.embedding.as_ref())
                    .await?;
            }
        }

        let candidates = self
            .index
            .find_candidates(self.candidate_threshold, self.top_k_per_node);
        tracing::info!(
            event = "nexus.graph.candidates",
            count = candidates.len(),
            threshold = self.candidate_threshold,
            "found candidate pairs above threshold"
        );

        let mut report = BuildReport {
            candidates: candidates.len(),
            ..BuildReport::default()
        };

        for candidate in candidates {
            let key = EdgeKey {
                source_server: candidate.source.server.clone(),
                source_op: candidate.source.operation.clone(),
                target_server: candidate.target.server.clone(),
                target_op: candidate.target.operation.clone(),
            };
            if incremental && self.storage.edge_exists(&key)? {
                report.cached_edges += 1;
                continue;
            }
            let Some(edge) = self.validate_candidate(servers, &candidate).await else {
                report.rejected += 1;
                continue;
            };
            if edge.compatibility == Compatibility::Incompatible {
                report.rejected += 1;
                continue;
            }
            self.storage.save_edge(&edge)?;
            report.new_edges += 1;
            tracing::info!(
                event = "nexus.graph.edge_validated",
                edge = %key,
                compatibility = edge.compatibility.as_str(),
                confidence = edge.confidence,
                "validated edge"
            );
        }

        // Read-your-writes: pick up this pass plus any concurrent build.
        self.edges = self.storage.load_all_edges()?;
        report.total_edges = self.edges.len();
        tracing::info!(
            event = "nexus.graph.build_complete",
            new_edges = report.new_edges,
            cached_edges = report.cached_edges,
            rejected = report.rejected,
            total_edges = report.total_edges,
            "graph build complete"
        );
        Ok(report)
    }

    /// Ask the oracle to judge one candidate. `None` when the operations
    /// cannot be resolved or the oracle call failed terminally.
    async fn validate_candidate(
        &self,
        servers: &HashMap<String, ServerRecord>,
        candidate: &Candidate,
    ) -> Option<GraphEdge> {
        let src_server = servers.get(&candidate.source.server)?;
        let tgt_server = servers.get(&candidate.target.server)?;
        let src_op = src_server.operation(&candidate.source.operation)?;
        let tgt_op = tgt_server.operation(&candidate.target.operation)?;

        let src_summary = src_server
            .profile
            .as_ref()
            .map(|p| p.plain_language_summary.as_str())
            .unwrap_or("unknown");
        let tgt_summary = tgt_server
            .profile
            .as_ref()
            .map(|p| p.plain_language_summary.as_str())
            .unwrap_or("unknown");

        let prompt = format!(
            r#"You are evaluating whether the output of one MCP tool can feed into the input of another.

SOURCE TOOL:
- Server: {src_server_name}
- Tool: {src_op_name}
- Description: {src_desc}
- Server summary: {src_summary}
- Output schema: {src_output}

TARGET TOOL:
- Server: {tgt_server_name}
- Tool: {tgt_op_name}
- Description: {tgt_desc}
- Server summary: {tgt_summary}
- Input schema: {tgt_input}

Can the output of the SOURCE tool meaningfully feed into the input of the TARGET tool?

Return JSON in EXACTLY this format, nothing else:
{{
    "compatibility_type": "direct or translatable or incompatible",
    "confidence": 0.85,
    "translation_hint": "brief description of what mapping is needed, or empty string if direct or incompatible"
}}

Rules:
- "direct" means output fields map to input fields with minimal renaming
- "translatable" means data is semantically related but needs transformation
- "incompatible" means output has nothing useful for the input
- confidence is 0.0 to 1.0"#,
            src_server_name = candidate.source.server,
            src_op_name = src_op.name,
            src_desc = src_op.description,
            src_summary = src_summary,
            src_output = src_op.output_schema,
            tgt_server_name = candidate.target.server,
            tgt_op_name = tgt_op.name,
            tgt_desc = tgt_op.description,
            tgt_summary = tgt_summary,
            tgt_input = tgt_op.input_schema,
        );

        let raw = match self.reasoning.reason(&prompt).await {
            Ok(raw) => raw,
            Err(OracleError::RetriesExhausted { attempts }) => {
                tracing::warn!(
                    event = "nexus.graph.validation_skipped",
                    source = %candidate.source,
                    target = %candidate.target,
                    attempts,
                    "oracle retries exhausted; skipping candidate"
                );
                return None;
            }
            Err(error) => {
                tracing::warn!(
                    event = "nexus.graph.validation_failed",
                    source = %candidate.source,
                    target = %candidate.target,
                    error = %error,
                    "oracle call failed; skipping candidate"
                );
                return None;
            }
        };

        // A verdict that fails to decode is a conservative incompatible/0.
        let (compatibility, confidence, hint) = match decode_oracle_json::<EdgeVerdict>(&raw) {
            OracleJson::Parsed(verdict) => (
                Compatibility::parse(&verdict.compatibility_type),
                verdict.confidence.clamp(0.0, 1.0),
                verdict.translation_hint,
            ),
            OracleJson::ParseError { raw } => {
                tracing::warn!(
                    event = "nexus.graph.verdict_unparsable",
                    source = %candidate.source,
                    target = %candidate.target,
                    raw = %raw,
                    "verdict did not decode; treating as incompatible"
                );
                (Compatibility::Incompatible, 0.0, String::new())
            }
        };

        Some(GraphEdge {
            source_server: candidate.source.server.clone(),
            source_op: candidate.source.operation.clone(),
            target_server: candidate.target.server.clone(),
            target_op: candidate.target.operation.clone(),
            compatibility,
            confidence,
            translation_hint: hint,
        })
    }

    /// Edges leaving a server, optionally filtered by operation.
    #[must_use]
    pub fn edges_from(&self, server: &str, operation: Option<&str>) -> Vec<&GraphEdge> {
        self.edges
            .iter()
            .filter(|e| {
                e.source_server == server && operation.is_none_or(|op| e.source_op == op)
            })
            .collect()
    }

    /// Edges entering a server, optionally filtered by operation.
    #[must_use]
    pub fn edges_to(&self, server: &str, operation: Option<&str>) -> Vec<&GraphEdge> {
        self.edges
            .iter()
            .filter(|e| {
                e.target_server == server && operation.is_none_or(|op| e.target_op == op)
            })
            .collect()
    }

    /// Shortest server-level path from `source` to `target`, bounded by
    /// `max_hops`. BFS with an explicit visited set; each branch carries its
    /// own immutable path, so traversal has no side effects.
    #[must_use]
    pub fn find_path(&self, source: &str, target: &str, max_hops: usize) -> Vec<GraphEdge> {
        if source == target {
            return vec![];
        }
        let mut visited: HashSet<&str> = HashSet::new();
        visited.insert(source);
        let mut queue: VecDeque<(&str, Vec<GraphEdge>)> = VecDeque::new();
        queue.push_back((source, vec![]));
        while let Some((current, path)) = queue.pop_front() {
            for edge in self.edges.iter().filter(|e| e.source_server == current) {
                if edge.target_server == target {
                    let mut found = path.clone();
                    found.push(edge.clone());
                    return found;
                }
                if !visited.contains(edge.target_server.as_str()) && path.len() < max_hops {
                    visited.insert(edge.target_server.as_str());
                    let mut next = path.clone();
                    next.push(edge.clone());
                    queue.push_back((edge.target_server.as_str(), next));
                }
            }
        }
        vec![]
    }

    /// Aggregate statistics over edges and the embedding index.
    #[must_use]
    pub fn stats(&self) -> GraphStats {
        let total = self.edges.len();
        let direct = self
            .edges
            .iter()
            .filter(|e| e.compatibility == Compatibility::Direct)
            .count();
        let translatable = self
            .edges
            .iter()
            .filter(|e| e.compatibility == Compatibility::Translatable)
            .count();
        let avg_confidence = if total == 0 {
            0.0
        } else {
            self.edges.iter().map(|e| e.confidence).sum::<f64>() / total as f64
        };
        GraphStats {
            total_edges: total,
            direct_edges: direct,
            translatable_edges: translatable,
            avg_confidence,
            indexed_operations: self.index.len(),
        }
    }
}
