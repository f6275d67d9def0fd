//! HTTP gateway: REST interface over the broker under `/api`.
//!
//! Request validation returns 400; unknown servers 404; broker errors 500.
//! Graph rebuilds triggered over HTTP run as background tasks so
//! registration responds promptly.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::broker::{Broker, ExecuteRequest};

/// Shared state for the HTTP server: the broker behind one lock, matching
/// the single-sequential-flow execution model.
#[derive(Clone)]
pub struct GatewayState {
    /// The broker instance served by this gateway.
    pub broker: Arc<Mutex<Broker>>,
}

/// Request body for POST /api/servers/register.
#[derive(Debug, Deserialize)]
pub struct RegisterRequestBody {
    /// Server name (e.g. "web-fetcher").
    pub name: String,
    /// Launch command (e.g. "uv").
    pub command: String,
    /// Command arguments (e.g. ["run", "python", "server.py"]).
    #[serde(default)]
    pub args: Vec<String>,
    /// Re-register even when the server is cached.
    #[serde(default)]
    pub force_refresh: bool,
}

/// Request body for POST /api/discover.
#[derive(Debug, Deserialize)]
pub struct DiscoverRequestBody {
    /// Natural-language request to plan.
    pub request: String,
}

/// Request body for POST /api/execute.
#[derive(Debug, Deserialize)]
pub struct ExecuteRequestBody {
    /// Natural-language request.
    pub request: String,
    /// URL to fetch, when the request needs one.
    #[serde(default)]
    pub url: Option<String>,
    /// Delivery channel override.
    #[serde(default)]
    pub channel: Option<String>,
    /// Source language for translation.
    #[serde(default)]
    pub source_language: Option<String>,
    /// Target language for translation.
    #[serde(default)]
    pub target_language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    20
}

type HandlerError = (StatusCode, String);

/// Validate a register body; trims fields and rejects empties.
///
/// # Errors
/// 400 with a reason for empty name or command.
pub fn validate_register_request(
    body: &RegisterRequestBody,
) -> Result<(String, String), HandlerError> {
    let name = body.name.trim().to_string();
    let command = body.command.trim().to_string();
    if name.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "name must be non-empty".to_string()));
    }
    if command.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "command must be non-empty".to_string(),
        ));
    }
    Ok((name, command))
}

fn internal(error: anyhow::Error) -> HandlerError {
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}

async fn handle_root() -> Json<serde_json::Value> {
    Json(json!({ "service": "nexus-broker", "status": "healthy" }))
}

async fn handle_status(
    State(state): State<GatewayState>,
) -> Result<Json<serde_json::Value>, HandlerError> {
    let broker = state.broker.lock().await;
    let stats = broker.stats().map_err(internal)?;
    Ok(Json(json!({
        "status": if stats.servers > 0 { "ready" } else { "empty" },
        "servers": stats.servers,
        "operations": stats.operations,
        "edges": stats.edges,
        "direct_edges": stats.direct_edges,
        "translatable_edges": stats.translatable_edges,
        "pipeline_runs": stats.pipeline_runs,
    })))
}

async fn handle_list_servers(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let broker = state.broker.lock().await;
    let servers: Vec<serde_json::Value> = broker
        .servers()
        .values()
        .map(|record| {
            json!({
                "name": record.name,
                "status": record.status,
                "summary": record.profile.as_ref().map(|p| p.plain_language_summary.clone()),
                "domain": record.profile.as_ref().map(|p| p.domain.clone()),
                "tags": record.profile.as_ref().map(|p| p.capability_tags.clone()).unwrap_or_default(),
                "operations": record.operations.iter().map(|op| op.name.clone()).collect::<Vec<_>>(),
            })
        })
        .collect();
    Json(json!({ "total": servers.len(), "servers": servers }))
}

async fn handle_register(
    State(state): State<GatewayState>,
    Json(body): Json<RegisterRequestBody>,
) -> Result<Json<serde_json::Value>, HandlerError> {
    let (name, command) = validate_register_request(&body)?;
    let record = {
        let mut broker = state.broker.lock().await;
        broker
            .register_server(&name, &command, &body.args, body.force_refresh)
            .await
            .map_err(internal)?
    };
    spawn_background_rebuild(Arc::clone(&state.broker));
    Ok(Json(json!({
        "status": "registered",
        "name": record.name,
        "summary": record.profile.as_ref().map(|p| p.plain_language_summary.clone()),
        "operations": record.operations.iter().map(|op| op.name.clone()).collect::<Vec<_>>(),
        "message": "Server registered. Graph rebuild started in background.",
    })))
}

async fn handle_unregister(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, HandlerError> {
    let mut broker = state.broker.lock().await;
    if !broker.servers().contains_key(&name) {
        return Err((
            StatusCode::NOT_FOUND,
            format!("Server '{name}' not found"),
        ));
    }
    let removed = broker.unregister_server(&name).map_err(internal)?;
    Ok(Json(json!({
        "status": if removed { "removed" } else { "failed" },
        "name": name,
    })))
}

async fn handle_graph(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let broker = state.broker.lock().await;
    let mut edges: Vec<_> = broker.edges().to_vec();
    edges.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let edges: Vec<serde_json::Value> = edges
        .iter()
        .map(|edge| {
            json!({
                "source": format!("{}.{}", edge.source_server, edge.source_op),
                "target": format!("{}.{}", edge.target_server, edge.target_op),
                "type": edge.compatibility,
                "confidence": edge.confidence,
                "hint": edge.translation_hint,
            })
        })
        .collect();
    Json(json!({ "total_edges": edges.len(), "edges": edges }))
}

async fn handle_rebuild(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    spawn_background_rebuild(Arc::clone(&state.broker));
    Json(json!({
        "status": "rebuild_started",
        "message": "Graph rebuild started in background.",
    }))
}

async fn handle_discover(
    State(state): State<GatewayState>,
    Json(body): Json<DiscoverRequestBody>,
) -> Result<Json<serde_json::Value>, HandlerError> {
    let broker = state.broker.lock().await;
    if broker.servers().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No servers registered".to_string()));
    }
    if broker.edges().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "Graph is empty. Register servers first.".to_string(),
        ));
    }
    let pipeline = broker.discover(&body.request).await.map_err(internal)?;
    let steps: Vec<serde_json::Value> = pipeline
        .steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let mut entry = json!({
                "step": i + 1,
                "server": step.server,
                "operation": step.operation,
                "connection_type": step.edge.as_ref()
                    .map(|e| e.compatibility.as_str())
                    .unwrap_or("entry_point"),
            });
            if let Some(edge) = &step.edge {
                if !edge.translation_hint.is_empty() {
                    entry["translation_hint"] = json!(edge.translation_hint);
                }
            }
            entry
        })
        .collect();
    Ok(Json(json!({
        "request": body.request,
        "confidence": pipeline.confidence,
        "steps": steps,
    })))
}

async fn handle_execute(
    State(state): State<GatewayState>,
    Json(body): Json<ExecuteRequestBody>,
) -> Result<Json<serde_json::Value>, HandlerError> {
    let mut broker = state.broker.lock().await;
    if broker.servers().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No servers registered".to_string()));
    }
    if broker.edges().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Graph is empty".to_string()));
    }
    let report = broker
        .execute(ExecuteRequest {
            request: body.request,
            url: body.url,
            channel: body.channel,
            source_language: body.source_language,
            target_language: body.target_language,
        })
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::to_value(&report).map_err(|e| internal(e.into()))?))
}

async fn handle_history(
    State(state): State<GatewayState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<serde_json::Value>, HandlerError> {
    let broker = state.broker.lock().await;
    let runs = broker.recent_runs(params.limit).map_err(internal)?;
    Ok(Json(json!({ "total": runs.len(), "runs": runs })))
}

fn spawn_background_rebuild(broker: Arc<Mutex<Broker>>) {
    tokio::spawn(async move {
        let mut broker = broker.lock().await;
        match broker.rebuild_graph(true).await {
            Ok(report) => {
                tracing::info!(
                    event = "nexus.gateway.rebuild_finished",
                    new_edges = report.new_edges,
                    total_edges = report.total_edges,
                    "background graph rebuild finished"
                );
            }
            Err(error) => {
                tracing::warn!(
                    event = "nexus.gateway.rebuild_failed",
                    error = %error,
                    "background graph rebuild failed"
                );
            }
        }
    });
}

/// Build the gateway router.
#[must_use]
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(handle_root))
        .route("/api/status", get(handle_status))
        .route("/api/servers", get(handle_list_servers))
        .route("/api/servers/register", post(handle_register))
        .route("/api/servers/{name}", delete(handle_unregister))
        .route("/api/graph", get(handle_graph))
        .route("/api/graph/rebuild", post(handle_rebuild))
        .route("/api/discover", post(handle_discover))
        .route("/api/execute", post(handle_execute))
        .route("/api/history", get(handle_history))
        .with_state(state)
}

/// Serve the gateway on `bind` until the process exits.
///
/// # Errors
/// Fails when the listener cannot bind or the server errors.
pub async fn run_http(bind: &str, state: GatewayState) -> Result<()> {
    let listener = TcpListener::bind(bind).await?;
    tracing::info!(
        event = "nexus.gateway.listening",
        bind = %bind,
        "gateway listening"
    );
    axum::serve(listener, router(state)).await?;
    Ok(())
}
