//! Broker facade: wires storage, registry, graph, discovery, and execution.
//!
//! Holds the shared state explicitly (server map via the registry, edge list
//! via the graph) and passes it by reference into the engines; there is no
//! module-level state anywhere.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde_json::Value;

use crate::config::{API_KEY_ENV, BrokerSettings};
use crate::discovery::DiscoveryEngine;
use crate::executor::PipelineExecutor;
use crate::graph::{BuildReport, CapabilityGraph};
use crate::invoker::{StdioToolInvoker, ToolInvoker};
use crate::models::{ExecutionResult, Pipeline, RunSummary, ServerRecord};
use crate::oracle::{EmbeddingClient, EmbeddingOracle, LlmClient, ReasoningOracle};
use crate::registry::Registry;
use crate::storage::Storage;

/// Default delivery channel when the caller names none.
const DEFAULT_CHANNEL: &str = "#team-updates";

/// Parameters of one execute call.
#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    /// Natural-language request.
    pub request: String,
    /// Optional explicit URL; extracted from the request text when absent.
    pub url: Option<String>,
    /// Optional delivery channel.
    pub channel: Option<String>,
    /// Optional source language for translation steps.
    pub source_language: Option<String>,
    /// Optional target language for translation steps.
    pub target_language: Option<String>,
}

/// Outcome of one discover-and-execute call.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    /// The original request text.
    pub request: String,
    /// Discovery confidence.
    pub confidence: f64,
    /// Per-step results.
    pub results: Vec<ExecutionResult>,
    /// Aggregate summary.
    pub summary: RunSummary,
    /// Output of the last step (`{}` when nothing ran).
    pub final_output: Value,
}

/// The broker: one instance owns all engine state for a deployment.
pub struct Broker {
    settings: BrokerSettings,
    storage: Storage,
    registry: Registry,
    graph: CapabilityGraph,
    reasoning: Arc<dyn ReasoningOracle>,
    invoker: Arc<dyn ToolInvoker>,
}

impl Broker {
    /// Open a broker over the database at `db_path` with production oracle
    /// clients and the stdio tool invoker.
    ///
    /// # Errors
    /// Fails when the database cannot be opened or state cannot be loaded.
    pub fn open(db_path: &Path, settings: BrokerSettings) -> Result<Self> {
        let api_key = std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty());
        let reasoning: Arc<dyn ReasoningOracle> = Arc::new(LlmClient::with_policy(
            settings.reasoning_url.clone(),
            settings.reasoning_model.clone(),
            api_key,
            settings.retry_policy(),
            Arc::new(crate::oracle::TokioSleeper),
        ));
        let embedding: Arc<dyn EmbeddingOracle> = Arc::new(EmbeddingClient::with_policy(
            &settings.embedding_url,
            settings.embedding_model.clone(),
            settings.embed_timeout_secs,
            settings.retry_policy(),
            Arc::new(crate::oracle::TokioSleeper),
        ));
        let invoker: Arc<dyn ToolInvoker> = Arc::new(StdioToolInvoker::new(
            std::time::Duration::from_secs(settings.connect_timeout_secs),
        ));
        let storage = Storage::open(db_path)?;
        Self::with_components(storage, reasoning, embedding, invoker, settings)
    }

    /// Assemble a broker from explicit components (tests inject fakes here).
    ///
    /// # Errors
    /// Fails when persisted state cannot be loaded.
    pub fn with_components(
        storage: Storage,
        reasoning: Arc<dyn ReasoningOracle>,
        embedding: Arc<dyn EmbeddingOracle>,
        invoker: Arc<dyn ToolInvoker>,
        settings: BrokerSettings,
    ) -> Result<Self> {
        let registry = Registry::new(storage.clone(), Arc::clone(&invoker), Arc::clone(&reasoning))?;
        let graph = CapabilityGraph::new(
            storage.clone(),
            Arc::clone(&reasoning),
            embedding,
            settings.candidate_threshold,
            settings.top_k_per_node,
        )?;
        Ok(Self {
            settings,
            storage,
            registry,
            graph,
            reasoning,
            invoker,
        })
    }

    /// Registered servers.
    #[must_use]
    pub fn servers(&self) -> &HashMap<String, ServerRecord> {
        self.registry.servers()
    }

    /// Committed edges.
    #[must_use]
    pub fn edges(&self) -> &[crate::models::GraphEdge] {
        self.graph.edges()
    }

    /// Storage statistics.
    ///
    /// # Errors
    /// Fails on storage errors.
    pub fn stats(&self) -> Result<crate::storage::StorageStats> {
        self.storage.stats()
    }

    /// Graph statistics.
    #[must_use]
    pub fn graph_stats(&self) -> crate::graph::GraphStats {
        self.graph.stats()
    }

    /// Recent pipeline runs.
    ///
    /// # Errors
    /// Fails on storage errors.
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<crate::storage::PipelineRunRecord>> {
        self.storage.recent_runs(limit)
    }

    /// Register a tool server and keep it in the shared map.
    ///
    /// # Errors
    /// Fails when the server cannot be reached, profiled, or persisted.
    pub async fn register_server(
        &mut self,
        name: &str,
        command: &str,
        args: &[String],
        force_refresh: bool,
    ) -> Result<ServerRecord> {
        self.registry.register(name, command, args, force_refresh).await
    }

    /// Unregister a server and drop its edges.
    ///
    /// # Errors
    /// Fails on storage errors.
    pub fn unregister_server(&mut self, name: &str) -> Result<bool> {
        let removed = self.registry.unregister(name)?;
        // Edge rows are already gone; refresh the in-memory view.
        self.graph.reload()?;
        Ok(removed)
    }

    /// Build or extend the capability graph over all registered servers.
    ///
    /// # Errors
    /// Fails when embedding or storage fails; individual candidate
    /// validations are skipped, not fatal.
    pub async fn rebuild_graph(&mut self, incremental: bool) -> Result<BuildReport> {
        self.registry.reload()?;
        self.graph
            .build_edges(self.registry.servers(), incremental)
            .await
    }

    /// Discover a pipeline for a request without executing it.
    ///
    /// # Errors
    /// Fails when the discovery oracle call fails terminally.
    pub async fn discover(&self, request: &str) -> Result<Pipeline> {
        if self.registry.servers().is_empty() {
            return Err(anyhow!("no servers registered"));
        }
        let engine = DiscoveryEngine::new(
            self.registry.servers(),
            self.graph.edges(),
            self.reasoning.as_ref(),
        );
        engine.discover(request).await
    }

    /// Discover and execute a pipeline; the run is recorded in history.
    ///
    /// # Errors
    /// Fails when discovery fails or history cannot be recorded; step
    /// failures are reported inside the result list, never as an error.
    pub async fn execute(&mut self, req: ExecuteRequest) -> Result<ExecutionReport> {
        let url = req.url.clone().or_else(|| extract_url(&req.request));

        let full_request = match &url {
            Some(url) if !req.request.to_lowercase().contains("fetch") => {
                format!("Fetch content from {url}, then {}", req.request)
            }
            _ => req.request.clone(),
        };

        let mut context: HashMap<String, Value> = HashMap::new();
        context.insert(
            "channel".to_string(),
            Value::String(req.channel.clone().unwrap_or_else(|| DEFAULT_CHANNEL.to_string())),
        );
        if let Some(ref lang) = req.source_language {
            context.insert("source_language".to_string(), Value::String(lang.clone()));
        }
        if let Some(ref lang) = req.target_language {
            context.insert("target_language".to_string(), Value::String(lang.clone()));
        }

        let mut initial_input = serde_json::Map::new();
        if let Some(ref url) = url {
            initial_input.insert("url".to_string(), Value::String(url.clone()));
        }

        let pipeline = self.discover(&full_request).await?;

        let steps_json = serde_json::to_value(&pipeline.steps)?;
        let context_json = serde_json::to_value(&context)?;
        let run_id = self
            .storage
            .record_run_started(&req.request, &steps_json, &context_json)
            .context("record pipeline run")?;

        let mut executor = PipelineExecutor::new(
            self.registry.servers(),
            Arc::clone(&self.invoker),
            Arc::clone(&self.reasoning),
            self.settings.failure_policy,
        );
        let (results, summary) = executor
            .execute(&pipeline, Value::Object(initial_input), &context)
            .await;

        let final_output = results
            .last()
            .map(|r| r.output.clone())
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        let report = ExecutionReport {
            request: req.request,
            confidence: pipeline.confidence,
            results,
            summary: summary.clone(),
            final_output,
        };

        let status = if summary.all_succeeded {
            "completed"
        } else {
            "failed"
        };
        self.storage.record_run_finished(
            run_id,
            status,
            &serde_json::to_value(&report)?,
            summary.total_duration_ms,
        )?;
        Ok(report)
    }
}

/// Pull a URL out of free text: explicit `http(s)://` first, then a
/// domain-like pattern.
#[must_use]
pub fn extract_url(text: &str) -> Option<String> {
    let explicit = regex::Regex::new(r"https?://[^\s,]+").ok()?;
    if let Some(m) = explicit.find(text) {
        return Some(m.as_str().to_string());
    }
    let domain = regex::Regex::new(r"\b([a-zA-Z0-9-]+\.(com|org|net|io|dev|co|ai|news))\b").ok()?;
    domain
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| format!("https://{}", m.as_str()))
}
