//! Pipeline executor: drive a discovered pipeline step by step.
//!
//! Between steps, data is bridged by the translation engine, repaired by a
//! required-field fallback chain, and enriched from the run context. A step
//! failure is recorded and, under the default policy, the run continues
//! with the last valid data instead of aborting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::invoker::ToolInvoker;
use crate::models::{ExecutionResult, Pipeline, PipelineStep, RunSummary, ServerRecord};
use crate::oracle::ReasoningOracle;
use crate::translator::TranslationEngine;

/// Server treated as the message-delivery sink: its input is composed from
/// all prior outputs instead of the generic translator.
const DELIVERY_SINK_SERVER: &str = "slack-sender";

/// Conventionally-named text aliases tried when a required field is missing.
const TEXT_ALIASES: &[&str] = &["content", "translated_text", "summary", "text", "result"];

/// Name fragments marking a field as text-carrying; only such fields may be
/// filled by serializing the whole previous output as a last resort.
const TEXT_FIELD_MARKERS: &[&str] = &["message", "text", "content", "body", "summary"];

/// Bound on serialized-output fallbacks.
const SERIALIZED_FALLBACK_MAX_CHARS: usize = 500;

/// What to do when a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the failure and keep stepping with the last valid data.
    #[default]
    ContinueWithStaleData,
    /// Stop the run at the first failed step.
    AbortOnFailure,
}

/// Executes discovered pipelines by calling tool servers.
pub struct PipelineExecutor<'a> {
    servers: &'a HashMap<String, ServerRecord>,
    invoker: Arc<dyn ToolInvoker>,
    translator: TranslationEngine,
    policy: FailurePolicy,
}

impl<'a> PipelineExecutor<'a> {
    /// Create an executor over the given server map.
    #[must_use]
    pub fn new(
        servers: &'a HashMap<String, ServerRecord>,
        invoker: Arc<dyn ToolInvoker>,
        reasoning: Arc<dyn ReasoningOracle>,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            servers,
            invoker,
            translator: TranslationEngine::new(reasoning),
            policy,
        }
    }

    /// Execute a pipeline step by step.
    ///
    /// Always returns one `ExecutionResult` per attempted step; there is no
    /// run-level error path that skips result reporting.
    pub async fn execute(
        &mut self,
        pipeline: &Pipeline,
        initial_input: Value,
        context: &HashMap<String, Value>,
    ) -> (Vec<ExecutionResult>, RunSummary) {
        let mut results: Vec<ExecutionResult> = Vec::with_capacity(pipeline.steps.len());
        let mut current_data = initial_input;
        // Outputs keyed by server name, for the delivery aggregation path.
        let mut all_outputs: HashMap<String, Value> = HashMap::new();

        for (i, step) in pipeline.steps.iter().enumerate() {
            tracing::info!(
                event = "nexus.execute.step_started",
                step = i + 1,
                total = pipeline.steps.len(),
                server = %step.server,
                operation = %step.operation,
                "executing pipeline step"
            );

            let Some(server) = self.servers.get(&step.server) else {
                let error = format!("Server '{}' not found", step.server);
                tracing::warn!(
                    event = "nexus.execute.server_missing",
                    server = %step.server,
                    "step target is not registered"
                );
                results.push(ExecutionResult {
                    server: step.server.clone(),
                    operation: step.operation.clone(),
                    input: current_data.clone(),
                    output: Value::Object(serde_json::Map::new()),
                    duration_ms: 0,
                    success: false,
                    error: Some(error),
                });
                if self.policy == FailurePolicy::AbortOnFailure {
                    break;
                }
                continue;
            };

            let step_input = self
                .resolve_step_input(step, server, &current_data, &all_outputs, context)
                .await;

            let started = Instant::now();
            match self.invoker.call(server, &step.operation, &step_input).await {
                Ok(output) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    tracing::info!(
                        event = "nexus.execute.step_succeeded",
                        server = %step.server,
                        operation = %step.operation,
                        duration_ms,
                        "step succeeded"
                    );
                    results.push(ExecutionResult {
                        server: step.server.clone(),
                        operation: step.operation.clone(),
                        input: step_input,
                        output: output.clone(),
                        duration_ms,
                        success: true,
                        error: None,
                    });
                    all_outputs.insert(step.server.clone(), output.clone());
                    current_data = output;
                }
                Err(error) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    tracing::warn!(
                        event = "nexus.execute.step_failed",
                        server = %step.server,
                        operation = %step.operation,
                        duration_ms,
                        error = %error,
                        "step failed"
                    );
                    results.push(ExecutionResult {
                        server: step.server.clone(),
                        operation: step.operation.clone(),
                        input: step_input,
                        output: Value::Object(serde_json::Map::new()),
                        duration_ms,
                        success: false,
                        error: Some(error.to_string()),
                    });
                    if self.policy == FailurePolicy::AbortOnFailure {
                        break;
                    }
                    // Continue with stale data: current_data stays as-is.
                }
            }
        }

        let summary = RunSummary::from_results(&results);
        tracing::info!(
            event = "nexus.execute.run_complete",
            total_steps = summary.total_steps,
            succeeded = summary.succeeded,
            total_duration_ms = summary.total_duration_ms,
            all_succeeded = summary.all_succeeded,
            "pipeline run complete"
        );
        (results, summary)
    }

    /// Resolve the input for one step: translate (or aggregate for the
    /// delivery sink), repair required fields, merge context.
    async fn resolve_step_input(
        &mut self,
        step: &PipelineStep,
        server: &ServerRecord,
        current_data: &Value,
        all_outputs: &HashMap<String, Value>,
        context: &HashMap<String, Value>,
    ) -> Value {
        let target_schema = server
            .operation(&step.operation)
            .map(|op| op.input_schema.clone())
            .unwrap_or_else(|| serde_json::json!({}));

        let mut step_input = match &step.edge {
            None => current_data.clone(),
            Some(_) if step.server == DELIVERY_SINK_SERVER => {
                build_delivery_message(all_outputs, context)
            }
            Some(edge) => {
                match self
                    .translator
                    .generate_spec(edge, current_data, &target_schema)
                    .await
                {
                    Ok(spec) => {
                        TranslationEngine::apply_translation(&spec, current_data, context)
                    }
                    Err(error) => {
                        // Degrade to an empty mapping; the repair pass below
                        // still runs against the previous output.
                        tracing::warn!(
                            event = "nexus.execute.translation_failed",
                            edge = %edge.key(),
                            error = %error,
                            "translation failed; starting from empty input"
                        );
                        Value::Object(serde_json::Map::new())
                    }
                }
            }
        };

        repair_required_fields(&mut step_input, &target_schema, current_data);
        merge_context(&mut step_input, &target_schema, context);
        step_input
    }
}

/// Fill required fields the translation left missing or empty.
///
/// Priority per field: a same-named field from the previous output; for a
/// `url` field, `url` then `source_url`; the conventional text aliases; and,
/// for text-carrying fields only, a bounded serialization of the whole
/// previous output.
fn repair_required_fields(step_input: &mut Value, target_schema: &Value, previous_output: &Value) {
    let required: Vec<String> = target_schema
        .get("required")
        .and_then(Value::as_array)
        .map(|fields| {
            fields
                .iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default();
    if required.is_empty() {
        return;
    }
    if !step_input.is_object() {
        *step_input = Value::Object(serde_json::Map::new());
    }

    for field in &required {
        if has_nonempty_field(step_input, field) {
            continue;
        }
        let repaired = repair_value(field, previous_output);
        match repaired {
            Some(value) => {
                tracing::debug!(
                    event = "nexus.execute.field_repaired",
                    field = %field,
                    "required field filled from previous output"
                );
                if let Some(obj) = step_input.as_object_mut() {
                    obj.insert(field.clone(), value);
                }
            }
            // No heuristic applies: leave the field absent and let the
            // invocation surface whatever the server says.
            None => {
                tracing::debug!(
                    event = "nexus.execute.field_unrepairable",
                    field = %field,
                    "required field left absent"
                );
            }
        }
    }
}

fn repair_value(field: &str, previous_output: &Value) -> Option<Value> {
    // Same-named field in the previous output wins.
    if let Some(value) = previous_output.get(field) {
        if !is_empty_value(value) {
            return Some(value.clone());
        }
    }
    if field == "url" {
        for key in ["url", "source_url"] {
            if let Some(value) = previous_output.get(key) {
                if !is_empty_value(value) {
                    return Some(value.clone());
                }
            }
        }
        return None;
    }
    for alias in TEXT_ALIASES {
        if let Some(value) = previous_output.get(*alias) {
            if value.as_str().is_some_and(|s| !s.is_empty()) {
                return Some(value.clone());
            }
        }
    }
    if is_text_field(field) && previous_output.as_object().is_some_and(|o| !o.is_empty()) {
        let mut serialized = previous_output.to_string();
        serialized.truncate(floor_char_boundary(&serialized, SERIALIZED_FALLBACK_MAX_CHARS));
        return Some(Value::String(serialized));
    }
    None
}

fn is_text_field(field: &str) -> bool {
    let lowered = field.to_lowercase();
    TEXT_ALIASES.contains(&lowered.as_str())
        || TEXT_FIELD_MARKERS.iter().any(|m| lowered.contains(m))
}

fn has_nonempty_field(input: &Value, field: &str) -> bool {
    input.get(field).is_some_and(|v| !is_empty_value(v))
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// Add context keys the input lacks, but only when the target's declared
/// input schema textually mentions the key.
fn merge_context(step_input: &mut Value, target_schema: &Value, context: &HashMap<String, Value>) {
    if context.is_empty() {
        return;
    }
    let schema_text = target_schema.to_string();
    if !step_input.is_object() {
        return;
    }
    for (key, value) in context {
        let already_present = step_input.get(key).is_some();
        if !already_present && schema_text.contains(key.as_str()) {
            if let Some(obj) = step_input.as_object_mut() {
                obj.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Compose the delivery-sink input from all prior outputs: summary and key
/// points from the summarizer, sentiment verdict from the analyzer, with a
/// bounded serialized fallback when neither produced anything.
fn build_delivery_message(
    all_outputs: &HashMap<String, Value>,
    context: &HashMap<String, Value>,
) -> Value {
    let mut parts: Vec<String> = Vec::new();

    if let Some(summary_data) = all_outputs.get("summarizer") {
        if let Some(summary) = summary_data.get("summary").and_then(Value::as_str) {
            parts.push(format!("📝 *Summary:*\n{summary}"));
        }
        if let Some(points) = summary_data.get("key_points").and_then(Value::as_array) {
            if !points.is_empty() {
                let bullets: Vec<String> = points
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|p| format!("  • {p}"))
                    .collect();
                parts.push(format!("\n🔑 *Key Points:*\n{}", bullets.join("\n")));
            }
        }
    }

    if let Some(sentiment_data) = all_outputs.get("sentiment-analyzer") {
        let sentiment = sentiment_data
            .get("sentiment")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let confidence = sentiment_data
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let emoji = match sentiment {
            "positive" => "😊",
            "neutral" => "😐",
            _ => "😟",
        };
        parts.push(format!(
            "\n{emoji} *Sentiment:* {} ({:.0}% confidence)",
            title_case(sentiment),
            confidence * 100.0
        ));
        if let Some(explanation) = sentiment_data.get("explanation").and_then(Value::as_str) {
            if !explanation.is_empty() {
                parts.push(format!("_{explanation}_"));
            }
        }
    }

    let message_body = if parts.is_empty() {
        let mut serialized = serde_json::to_string(all_outputs).unwrap_or_default();
        serialized.truncate(floor_char_boundary(&serialized, SERIALIZED_FALLBACK_MAX_CHARS));
        serialized
    } else {
        parts.join("\n")
    };

    let channel = context
        .get("channel")
        .cloned()
        .unwrap_or_else(|| Value::String("#team-updates".to_string()));

    serde_json::json!({
        "channel": channel,
        "message_body": message_body,
    })
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
