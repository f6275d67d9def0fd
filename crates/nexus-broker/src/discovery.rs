//! Pipeline discovery: natural-language request → ordered, edge-annotated plan.
//!
//! The oracle plans against the full capability listing plus the known edges.
//! Parsing is resilient: fences are stripped, an embedded JSON object is
//! recovered from prose, and an unusable response degrades to a deterministic
//! keyword heuristic rather than an error.

use std::collections::HashMap;

use anyhow::Result;
use serde::Deserialize;

use crate::models::{GraphEdge, Pipeline, PipelineStep, ServerRecord};
use crate::oracle::{OracleJson, ReasoningOracle, decode_oracle_json_lenient};

/// Confidence assigned to every keyword-fallback pipeline.
const FALLBACK_CONFIDENCE: f64 = 0.7;

/// Fixed fallback order: keyword set → (server, operation, reason).
const FALLBACK_STEPS: &[(&[&str], &str, &str, &str)] = &[
    (
        &["fetch", "get", "web", "url", "http"],
        "web-fetcher",
        "fetch_url",
        "Fetch web content",
    ),
    (
        &["translate", "translation", "language"],
        "translator",
        "translate_text",
        "Translate content",
    ),
    (
        &["summar", "condense", "brief"],
        "summarizer",
        "summarize_text",
        "Summarize content",
    ),
    (
        &["sentiment", "emotion", "tone", "feel"],
        "sentiment-analyzer",
        "analyze_sentiment",
        "Analyze sentiment",
    ),
    (
        &["slack", "post", "send", "message"],
        "slack-sender",
        "send_slack_message",
        "Post to Slack",
    ),
];

/// Oracle plan shape.
#[derive(Debug, Deserialize)]
struct PlanResponse {
    #[serde(default)]
    steps: Vec<PlanStep>,
    #[serde(default = "default_confidence")]
    overall_confidence: f64,
    #[serde(default)]
    explanation: String,
}

#[derive(Debug, Deserialize)]
struct PlanStep {
    #[serde(default)]
    server: String,
    #[serde(default)]
    tool: String,
    #[serde(default)]
    reason: String,
}

fn default_confidence() -> f64 {
    0.5
}

/// Discovers pipelines to fulfill user requests.
///
/// Borrows the shared broker state (server map + committed edge list); owns
/// nothing.
pub struct DiscoveryEngine<'a> {
    servers: &'a HashMap<String, ServerRecord>,
    edges: &'a [GraphEdge],
    oracle: &'a dyn ReasoningOracle,
}

impl<'a> DiscoveryEngine<'a> {
    /// Create an engine over the given state.
    #[must_use]
    pub fn new(
        servers: &'a HashMap<String, ServerRecord>,
        edges: &'a [GraphEdge],
        oracle: &'a dyn ReasoningOracle,
    ) -> Self {
        Self {
            servers,
            edges,
            oracle,
        }
    }

    /// Turn a natural-language request into an ordered pipeline.
    ///
    /// # Errors
    /// Fails only when the oracle call itself fails terminally (e.g. retries
    /// exhausted); an unusable response body falls back to the keyword plan.
    pub async fn discover(&self, request: &str) -> Result<Pipeline> {
        tracing::info!(
            event = "nexus.discovery.started",
            request = %request,
            "analyzing request"
        );
        let prompt = self.build_prompt(request);
        let raw = self.oracle.reason(&prompt).await?;

        let plan = match decode_oracle_json_lenient::<PlanResponse>(&raw) {
            OracleJson::Parsed(plan) => plan,
            OracleJson::ParseError { raw } => {
                tracing::warn!(
                    event = "nexus.discovery.fallback",
                    raw_len = raw.len(),
                    "plan did not decode; using keyword fallback"
                );
                fallback_plan(request)
            }
        };
        tracing::debug!(
            event = "nexus.discovery.plan",
            explanation = %plan.explanation,
            steps = plan.steps.len(),
            "oracle plan parsed"
        );
        Ok(self.assemble(plan))
    }

    /// Build `Pipeline` from the parsed plan: skip invalid steps, resolve
    /// the edge feeding into each step after the first.
    fn assemble(&self, plan: PlanResponse) -> Pipeline {
        let mut steps: Vec<PipelineStep> = Vec::with_capacity(plan.steps.len());
        for raw_step in &plan.steps {
            if raw_step.server.is_empty() || raw_step.tool.is_empty() {
                continue;
            }
            let edge = steps
                .last()
                .and_then(|prev| self.find_edge(&prev.server, &prev.operation, raw_step));
            tracing::debug!(
                event = "nexus.discovery.step",
                server = %raw_step.server,
                operation = %raw_step.tool,
                reason = %raw_step.reason,
                has_edge = edge.is_some(),
                "pipeline step resolved"
            );
            steps.push(PipelineStep {
                server: raw_step.server.clone(),
                operation: raw_step.tool.clone(),
                edge,
            });
        }
        Pipeline {
            steps,
            confidence: plan.overall_confidence,
        }
    }

    /// Exact 4-tuple match first; failing that, the first edge matching both
    /// server names.
    fn find_edge(&self, prev_server: &str, prev_op: &str, step: &PlanStep) -> Option<GraphEdge> {
        self.edges
            .iter()
            .find(|e| {
                e.source_server == prev_server
                    && e.source_op == prev_op
                    && e.target_server == step.server
                    && e.target_op == step.tool
            })
            .or_else(|| {
                self.edges
                    .iter()
                    .find(|e| e.source_server == prev_server && e.target_server == step.server)
            })
            .cloned()
    }

    fn build_prompt(&self, request: &str) -> String {
        let mut capabilities = String::new();
        for (name, record) in self.servers {
            let ops: Vec<&str> = record.operations.iter().map(|t| t.name.as_str()).collect();
            capabilities.push_str(&format!("\nServer: {name}\n"));
            capabilities.push_str(&format!("  Tools: {}\n", ops.join(", ")));
            if let Some(ref profile) = record.profile {
                capabilities.push_str(&format!(
                    "  Summary: {}\n",
                    profile.plain_language_summary
                ));
                capabilities.push_str(&format!(
                    "  Tags: {}\n",
                    profile.capability_tags.join(", ")
                ));
            }
        }

        let mut connections = String::new();
        for edge in self.edges {
            connections.push_str(&format!(
                "\n  {}.{} -> {}.{} [{}, confidence={}]",
                edge.source_server,
                edge.source_op,
                edge.target_server,
                edge.target_op,
                edge.compatibility.as_str(),
                edge.confidence,
            ));
            if !edge.translation_hint.is_empty() {
                connections.push_str(&format!(" hint: {}", edge.translation_hint));
            }
        }

        format!(
            r#"You are a pipeline planner. Given a user request and available MCP servers, determine the optimal pipeline.

USER REQUEST: "{request}"

AVAILABLE SERVERS:
{capabilities}

KNOWN CONNECTIONS:
{connections}

Return a JSON object with this EXACT structure (no extra text):
{{
    "steps": [
        {{"server": "server-name", "tool": "tool-name", "reason": "why needed"}}
    ],
    "overall_confidence": 0.85,
    "explanation": "brief explanation"
}}

Rules:
- Only use servers listed above
- Order steps logically (data flows from one to next)
- Keep the JSON simple and valid"#
        )
    }
}

/// Deterministic keyword plan, in fixed order, confidence 0.7.
fn fallback_plan(request: &str) -> PlanResponse {
    let lowered = request.to_lowercase();
    let steps = FALLBACK_STEPS
        .iter()
        .filter(|(keywords, _, _, _)| keywords.iter().any(|k| lowered.contains(k)))
        .map(|(_, server, tool, reason)| PlanStep {
            server: (*server).to_string(),
            tool: (*tool).to_string(),
            reason: (*reason).to_string(),
        })
        .collect();
    PlanResponse {
        steps,
        overall_confidence: FALLBACK_CONFIDENCE,
        explanation: "Fallback pipeline based on keywords".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Compatibility;
    use crate::oracle::OracleError;
    use async_trait::async_trait;

    struct CannedOracle(String);

    #[async_trait]
    impl ReasoningOracle for CannedOracle {
        async fn reason(&self, _prompt: &str) -> Result<String, OracleError> {
            Ok(self.0.clone())
        }
    }

    fn edge(src: &str, src_op: &str, tgt: &str, tgt_op: &str) -> GraphEdge {
        GraphEdge {
            source_server: src.to_string(),
            source_op: src_op.to_string(),
            target_server: tgt.to_string(),
            target_op: tgt_op.to_string(),
            compatibility: Compatibility::Translatable,
            confidence: 0.8,
            translation_hint: String::new(),
        }
    }

    async fn discover_with(response: &str, edges: &[GraphEdge], request: &str) -> Pipeline {
        let servers = HashMap::new();
        let oracle = CannedOracle(response.to_string());
        let engine = DiscoveryEngine::new(&servers, edges, &oracle);
        engine.discover(request).await.unwrap()
    }

    #[tokio::test]
    async fn unparseable_response_falls_back_to_keyword_plan() {
        let pipeline = discover_with(
            "I could not produce a plan, sorry.",
            &[],
            "fetch https://x.com and post to Slack",
        )
        .await;
        assert_eq!(pipeline.steps.len(), 2);
        assert_eq!(pipeline.steps[0].server, "web-fetcher");
        assert_eq!(pipeline.steps[0].operation, "fetch_url");
        assert_eq!(pipeline.steps[1].server, "slack-sender");
        assert_eq!(pipeline.steps[1].operation, "send_slack_message");
        assert!((pipeline.confidence - 0.7).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn fallback_keeps_fixed_order() {
        let pipeline = discover_with(
            "nope",
            &[],
            "post a brief summary of the tone of this message",
        )
        .await;
        let servers: Vec<&str> = pipeline.steps.iter().map(|s| s.server.as_str()).collect();
        assert_eq!(servers, vec!["summarizer", "sentiment-analyzer", "slack-sender"]);
    }

    #[tokio::test]
    async fn fenced_plan_parses_and_resolves_exact_edge() {
        let response = r#"```json
{
  "steps": [
    {"server": "web-fetcher", "tool": "fetch_url", "reason": "fetch"},
    {"server": "summarizer", "tool": "summarize_text", "reason": "summarize"}
  ],
  "overall_confidence": 0.9,
  "explanation": "fetch then summarize"
}
```"#;
        let edges = vec![edge("web-fetcher", "fetch_url", "summarizer", "summarize_text")];
        let pipeline = discover_with(response, &edges, "whatever").await;
        assert_eq!(pipeline.steps.len(), 2);
        assert!(pipeline.steps[0].edge.is_none(), "entry step has no edge");
        let resolved = pipeline.steps[1].edge.as_ref().unwrap();
        assert_eq!(resolved.source_op, "fetch_url");
        assert!((pipeline.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn edge_resolution_falls_back_to_server_level_match() {
        let response = r#"{"steps": [
            {"server": "web-fetcher", "tool": "fetch_url", "reason": ""},
            {"server": "summarizer", "tool": "summarize_text", "reason": ""}
        ], "overall_confidence": 0.8, "explanation": ""}"#;
        // Stored edge has a different source operation; only servers match.
        let edges = vec![edge("web-fetcher", "fetch_page", "summarizer", "summarize_text")];
        let pipeline = discover_with(response, &edges, "whatever").await;
        let resolved = pipeline.steps[1].edge.as_ref().unwrap();
        assert_eq!(resolved.source_op, "fetch_page");
    }

    #[tokio::test]
    async fn plan_embedded_in_prose_is_recovered() {
        let response = r#"Sure! Here is the pipeline:
{"steps": [{"server": "summarizer", "tool": "summarize_text", "reason": "r"}], "overall_confidence": 0.75, "explanation": "e"}
Let me know if you need anything else."#;
        let pipeline = discover_with(response, &[], "whatever").await;
        assert_eq!(pipeline.steps.len(), 1);
        assert!((pipeline.confidence - 0.75).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn steps_missing_server_or_tool_are_skipped() {
        let response = r#"{"steps": [
            {"server": "", "tool": "fetch_url", "reason": ""},
            {"server": "summarizer", "tool": "", "reason": ""},
            {"server": "summarizer", "tool": "summarize_text", "reason": ""}
        ], "overall_confidence": 0.6, "explanation": ""}"#;
        let pipeline = discover_with(response, &[], "whatever").await;
        assert_eq!(pipeline.steps.len(), 1);
        assert_eq!(pipeline.steps[0].server, "summarizer");
    }
}
