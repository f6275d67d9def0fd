//! Core data model: server records, operations, graph edges, pipelines, results.

use serde::{Deserialize, Serialize};

/// Raw metadata about a single operation declared by a tool server.
///
/// Immutable once registered for a given run; schemas are whatever the
/// server declares, kept as raw JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationDescriptor {
    /// Operation name, unique within its server.
    pub name: String,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
    /// Declared input schema (JSON Schema object, possibly empty).
    #[serde(default)]
    pub input_schema: serde_json::Value,
    /// Declared output schema (JSON Schema object, possibly empty).
    #[serde(default)]
    pub output_schema: serde_json::Value,
}

/// Oracle-generated semantic understanding of a tool server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SemanticProfile {
    /// What the server does, in plain language.
    #[serde(default)]
    pub plain_language_summary: String,
    /// Capability tags, e.g. `["web", "scraping"]`.
    #[serde(default)]
    pub capability_tags: Vec<String>,
    /// Real-world things the server needs as input.
    #[serde(default)]
    pub input_concepts: Vec<String>,
    /// Real-world things the server produces.
    #[serde(default)]
    pub output_concepts: Vec<String>,
    /// Concrete usage scenarios.
    #[serde(default)]
    pub use_cases: Vec<String>,
    /// Capabilities it claims to chain well with.
    #[serde(default)]
    pub compatible_with: Vec<String>,
    /// Primary domain label, e.g. "NLP" or "communication".
    #[serde(default)]
    pub domain: String,
}

/// Lifecycle status of a registered server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// Operations listed, not yet profiled.
    Registered,
    /// Semantic profile generated.
    Profiled,
    /// Server unreachable at last contact.
    Offline,
}

impl ServerStatus {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Profiled => "profiled",
            Self::Offline => "offline",
        }
    }

    /// Parse the storage representation; unknown values degrade to `Registered`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "profiled" => Self::Profiled,
            "offline" => Self::Offline,
            _ => Self::Registered,
        }
    }
}

/// Complete record of a registered tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    /// Unique server name.
    pub name: String,
    /// Command that launches the server (stdio transport).
    pub command: String,
    /// Arguments for the launch command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Declared operations, in listing order.
    #[serde(default)]
    pub operations: Vec<OperationDescriptor>,
    /// Semantic profile, present once profiling succeeded.
    #[serde(default)]
    pub profile: Option<SemanticProfile>,
    /// Lifecycle status.
    pub status: ServerStatus,
    /// RFC 3339 registration timestamp.
    pub registered_at: String,
}

impl ServerRecord {
    /// Look up a declared operation by name.
    #[must_use]
    pub fn operation(&self, name: &str) -> Option<&OperationDescriptor> {
        self.operations.iter().find(|op| op.name == name)
    }
}

/// Validated compatibility between two operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compatibility {
    /// Output fields map onto input fields with minimal renaming.
    Direct,
    /// Semantically related, needs a field-level transformation.
    Translatable,
    /// Output has nothing useful for the input.
    Incompatible,
}

impl Compatibility {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Translatable => "translatable",
            Self::Incompatible => "incompatible",
        }
    }

    /// Parse the storage/oracle representation; unknown values degrade to
    /// `Incompatible` so a malformed verdict is never persisted.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "direct" => Self::Direct,
            "translatable" => Self::Translatable,
            _ => Self::Incompatible,
        }
    }
}

/// Compound key identifying an edge: the sole idempotency key for upsert
/// and existence checks, on the wire and in storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EdgeKey {
    /// Source server name.
    pub source_server: String,
    /// Source operation name.
    pub source_op: String,
    /// Target server name.
    pub target_server: String,
    /// Target operation name.
    pub target_op: String,
}

impl std::fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}->{}.{}",
            self.source_server, self.source_op, self.target_server, self.target_op
        )
    }
}

/// A validated, directed connection between two operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    /// Source server name.
    pub source_server: String,
    /// Source operation name.
    pub source_op: String,
    /// Target server name.
    pub target_server: String,
    /// Target operation name.
    pub target_op: String,
    /// Compatibility verdict from validation.
    pub compatibility: Compatibility,
    /// Oracle confidence in [0, 1].
    pub confidence: f64,
    /// Free-text hint for the translation engine; empty for direct edges.
    #[serde(default)]
    pub translation_hint: String,
}

impl GraphEdge {
    /// The compound key of this edge.
    #[must_use]
    pub fn key(&self) -> EdgeKey {
        EdgeKey {
            source_server: self.source_server.clone(),
            source_op: self.source_op.clone(),
            target_server: self.target_server.clone(),
            target_op: self.target_op.clone(),
        }
    }
}

/// A single step of a discovered pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStep {
    /// Server to invoke.
    pub server: String,
    /// Operation to invoke.
    pub operation: String,
    /// Edge feeding into this step; `None` for the entry step.
    #[serde(default)]
    pub edge: Option<GraphEdge>,
}

/// An ordered pipeline meant to satisfy one user request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Steps in execution order.
    pub steps: Vec<PipelineStep>,
    /// Oracle-reported overall confidence; never recomputed from edges.
    pub confidence: f64,
}

/// Where a mapped field's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingOrigin {
    /// The previous step's output.
    #[serde(alias = "output")]
    PreviousOutput,
    /// The run context supplied by the caller.
    #[serde(alias = "context")]
    RunContext,
}

/// One field-level mapping in a translation spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Field name in the target input.
    pub target_field: String,
    /// Field name in the source; `None` when the value comes from context.
    #[serde(default)]
    pub source_field: Option<String>,
    /// Value origin.
    #[serde(default = "default_mapping_origin", rename = "source")]
    pub origin: MappingOrigin,
    /// Whether the target declares the field required.
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_mapping_origin() -> MappingOrigin {
    MappingOrigin::PreviousOutput
}

fn default_true() -> bool {
    true
}

/// A field-mapping plan from one operation's output shape to another's
/// input shape. Cached per edge compound key for the process lifetime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranslationSpec {
    /// Ordered field mappings.
    #[serde(default)]
    pub mappings: Vec<FieldMapping>,
}

/// Result of a single executed pipeline step. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Server that was (or should have been) invoked.
    pub server: String,
    /// Operation that was (or should have been) invoked.
    pub operation: String,
    /// Input actually sent.
    pub input: serde_json::Value,
    /// Output received; `{}` on failure.
    pub output: serde_json::Value,
    /// Elapsed wall time in milliseconds.
    pub duration_ms: u64,
    /// Whether the invocation succeeded.
    pub success: bool,
    /// Error text on failure.
    #[serde(default)]
    pub error: Option<String>,
}

/// Aggregate view over a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Number of executed (or attempted) steps.
    pub total_steps: usize,
    /// Steps that succeeded.
    pub succeeded: usize,
    /// Total elapsed wall time in milliseconds.
    pub total_duration_ms: u64,
    /// `true` when every step succeeded.
    pub all_succeeded: bool,
}

impl RunSummary {
    /// Summarize a result list.
    #[must_use]
    pub fn from_results(results: &[ExecutionResult]) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        Self {
            total_steps: results.len(),
            succeeded,
            total_duration_ms: results.iter().map(|r| r.duration_ms).sum(),
            all_succeeded: succeeded == results.len(),
        }
    }
}
