//! Translation engine: bridge schema mismatches between pipeline steps.
//!
//! For each edge, the oracle produces a field-mapping spec from a live
//! sample of the source output plus the target's declared input schema.
//! Specs are cached per edge compound key; the mapping is assumed stable
//! for a given edge regardless of the specific data instance.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use crate::models::{EdgeKey, GraphEdge, MappingOrigin, TranslationSpec};
use crate::oracle::{OracleJson, ReasoningOracle, decode_oracle_json};

/// Generates and applies data translations between pipeline steps.
pub struct TranslationEngine {
    oracle: Arc<dyn ReasoningOracle>,
    specs: HashMap<EdgeKey, TranslationSpec>,
}

impl TranslationEngine {
    /// Create an engine over the given reasoning oracle.
    #[must_use]
    pub fn new(oracle: Arc<dyn ReasoningOracle>) -> Self {
        Self {
            oracle,
            specs: HashMap::new(),
        }
    }

    /// Produce (or reuse) the mapping spec for an edge.
    ///
    /// A response that fails to decode degrades to an empty spec (logged,
    /// not cached, so a later attempt can still succeed).
    ///
    /// # Errors
    /// Fails when the oracle call itself fails terminally.
    pub async fn generate_spec(
        &mut self,
        edge: &GraphEdge,
        source_output: &Value,
        target_input_schema: &Value,
    ) -> Result<TranslationSpec> {
        let key = edge.key();
        if let Some(cached) = self.specs.get(&key) {
            tracing::debug!(
                event = "nexus.translate.spec_cache_hit",
                edge = %key,
                "reusing cached translation spec"
            );
            return Ok(cached.clone());
        }

        let required_fields = target_input_schema
            .get("required")
            .cloned()
            .unwrap_or_else(|| Value::Array(vec![]));

        let prompt = format!(
            r#"You are a data transformation expert. Generate a mapping specification to transform data from one tool's output to another tool's input.

SOURCE: {src_server}.{src_op}
SOURCE OUTPUT (actual data):
{source_output}

TARGET: {tgt_server}.{tgt_op}
TARGET INPUT SCHEMA:
{target_input_schema}

REQUIRED TARGET FIELDS: {required_fields}

HINT: {hint}

Generate a JSON mapping specification in EXACTLY this format:
{{
    "mappings": [
        {{
            "target_field": "field name in target input",
            "source_field": "field name from source output, or null if from context",
            "source": "output or context",
            "required": true or false
        }}
    ]
}}

IMPORTANT RULES:
- ONLY map fields that are in the REQUIRED list, unless there is clear data for optional fields
- Do NOT include optional fields that have defaults (like max_sentences, limit, etc.)
- If a field is optional and you have no specific value for it, LEAVE IT OUT entirely"#,
            src_server = edge.source_server,
            src_op = edge.source_op,
            tgt_server = edge.target_server,
            tgt_op = edge.target_op,
            hint = edge.translation_hint,
        );

        let raw = self.oracle.reason(&prompt).await?;
        let spec = match decode_oracle_json::<TranslationSpec>(&raw) {
            OracleJson::Parsed(spec) => {
                self.specs.insert(key.clone(), spec.clone());
                tracing::debug!(
                    event = "nexus.translate.spec_generated",
                    edge = %key,
                    mappings = spec.mappings.len(),
                    "translation spec generated"
                );
                spec
            }
            OracleJson::ParseError { raw } => {
                tracing::warn!(
                    event = "nexus.translate.spec_unparsable",
                    edge = %key,
                    raw_len = raw.len(),
                    "translation spec did not decode; using empty mapping"
                );
                TranslationSpec::default()
            }
        };
        Ok(spec)
    }

    /// Apply a spec to a source output under the given run context.
    ///
    /// A resolved value that is JSON null or the empty string is omitted
    /// entirely, never written; downstream required-field repair relies on
    /// the gap being detectable.
    #[must_use]
    pub fn apply_translation(
        spec: &TranslationSpec,
        source_output: &Value,
        context: &HashMap<String, Value>,
    ) -> Value {
        let mut result = serde_json::Map::new();
        for mapping in &spec.mappings {
            let value = match (&mapping.origin, &mapping.source_field) {
                (MappingOrigin::RunContext, source_field) => context
                    .get(&mapping.target_field)
                    .or_else(|| source_field.as_ref().and_then(|f| context.get(f)))
                    .cloned(),
                (MappingOrigin::PreviousOutput, None) => {
                    context.get(&mapping.target_field).cloned()
                }
                (MappingOrigin::PreviousOutput, Some(field)) => {
                    source_output.get(field).cloned()
                }
            };
            match value {
                None | Some(Value::Null) => {}
                Some(Value::String(s)) if s.is_empty() => {}
                Some(value) => {
                    result.insert(mapping.target_field.clone(), value);
                }
            }
        }
        Value::Object(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Compatibility, FieldMapping};
    use crate::oracle::OracleError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingOracle {
        response: String,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ReasoningOracle for CountingOracle {
        async fn reason(&self, _prompt: &str) -> Result<String, OracleError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(self.response.clone())
        }
    }

    fn edge() -> GraphEdge {
        GraphEdge {
            source_server: "summarizer".into(),
            source_op: "summarize_text".into(),
            target_server: "slack-sender".into(),
            target_op: "send_slack_message".into(),
            compatibility: Compatibility::Translatable,
            confidence: 0.8,
            translation_hint: "map summary to message_body".into(),
        }
    }

    fn mapping(target: &str, source: Option<&str>, origin: MappingOrigin) -> FieldMapping {
        FieldMapping {
            target_field: target.to_string(),
            source_field: source.map(ToString::to_string),
            origin,
            required: true,
        }
    }

    #[test]
    fn apply_never_writes_null_or_empty_values() {
        let spec = TranslationSpec {
            mappings: vec![
                mapping("a", Some("null_field"), MappingOrigin::PreviousOutput),
                mapping("b", Some("empty_field"), MappingOrigin::PreviousOutput),
                mapping("c", Some("real_field"), MappingOrigin::PreviousOutput),
                mapping("d", Some("missing"), MappingOrigin::PreviousOutput),
            ],
        };
        let output = serde_json::json!({
            "null_field": null,
            "empty_field": "",
            "real_field": "kept"
        });
        let translated = TranslationEngine::apply_translation(&spec, &output, &HashMap::new());
        let obj = translated.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert_eq!(obj["c"], "kept");
    }

    #[test]
    fn context_origin_resolves_by_target_then_source_name() {
        let spec = TranslationSpec {
            mappings: vec![
                mapping("channel", None, MappingOrigin::RunContext),
                mapping("lang", Some("target_language"), MappingOrigin::RunContext),
            ],
        };
        let mut context = HashMap::new();
        context.insert("channel".to_string(), serde_json::json!("#team-updates"));
        context.insert("target_language".to_string(), serde_json::json!("French"));
        let translated =
            TranslationEngine::apply_translation(&spec, &serde_json::json!({}), &context);
        assert_eq!(translated["channel"], "#team-updates");
        assert_eq!(translated["lang"], "French");
    }

    #[tokio::test]
    async fn spec_is_cached_per_edge_key() {
        let calls = Arc::new(AtomicUsize::new(0));
        let oracle = CountingOracle {
            response: r#"{"mappings": [{"target_field": "message_body", "source_field": "summary", "source": "output", "required": true}]}"#.to_string(),
            calls: Arc::clone(&calls),
        };
        let mut engine = TranslationEngine::new(Arc::new(oracle));
        let schema = serde_json::json!({"required": ["message_body"]});
        let sample = serde_json::json!({"summary": "short"});

        let first = engine.generate_spec(&edge(), &sample, &schema).await.unwrap();
        let second = engine
            .generate_spec(&edge(), &serde_json::json!({"different": true}), &schema)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 1, "second call hits cache");
        assert_eq!(first.mappings.len(), second.mappings.len());
    }

    #[tokio::test]
    async fn unparsable_spec_degrades_to_empty_and_is_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let oracle = CountingOracle {
            response: "cannot help with that".to_string(),
            calls: Arc::clone(&calls),
        };
        let mut engine = TranslationEngine::new(Arc::new(oracle));
        let schema = serde_json::json!({"required": ["message_body"]});
        let sample = serde_json::json!({});

        let spec = engine.generate_spec(&edge(), &sample, &schema).await.unwrap();
        assert!(spec.mappings.is_empty());
        let _ = engine.generate_spec(&edge(), &sample, &schema).await.unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 2, "parse failures are retried");
    }
}
