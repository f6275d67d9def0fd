//! NEXUS broker: an intelligent MCP broker.
//!
//! - **Registry**: connect to stdio tool servers, list their operations,
//!   profile them with the reasoning oracle, persist everything.
//! - **Capability graph**: embedding-pruned candidate pairs validated by the
//!   oracle into durable, deduplicated edges.
//! - **Discovery**: natural-language request → ordered, edge-annotated
//!   pipeline, with a deterministic keyword fallback.
//! - **Execution**: step-by-step runs with schema-bridging translation,
//!   required-field repair, and continue-on-failure stepping.

mod broker;
mod config;
mod discovery;
mod embedding_index;
mod executor;
mod gateway;
mod graph;
mod invoker;
mod models;
mod oracle;
mod profiler;
mod registry;
mod storage;
mod translator;

pub use broker::{Broker, ExecuteRequest, ExecutionReport, extract_url};
pub use config::{
    API_KEY_ENV, BrokerSettings, DEFAULT_EMBEDDING_URL, DEFAULT_REASONING_URL, load_settings,
};
pub use discovery::DiscoveryEngine;
pub use embedding_index::{Candidate, EmbeddingIndex, OpKey, cosine_similarity};
pub use executor::{FailurePolicy, PipelineExecutor};
pub use gateway::{
    DiscoverRequestBody, ExecuteRequestBody, GatewayState, RegisterRequestBody, router, run_http,
    validate_register_request,
};
pub use graph::{BuildReport, CapabilityGraph, GraphStats};
pub use invoker::{StdioToolInvoker, ToolInvoker};
pub use models::{
    Compatibility, EdgeKey, ExecutionResult, FieldMapping, GraphEdge, MappingOrigin,
    OperationDescriptor, Pipeline, PipelineStep, RunSummary, SemanticProfile, ServerRecord,
    ServerStatus, TranslationSpec,
};
pub use oracle::{
    EmbeddingClient, EmbeddingOracle, LlmClient, OracleError, OracleJson, ReasoningOracle,
    RetryPolicy, Sleeper, TokioSleeper, decode_oracle_json, decode_oracle_json_lenient,
    strip_code_fences,
};
pub use profiler::profile_server;
pub use registry::Registry;
pub use storage::{PipelineRunRecord, Storage, StorageStats};
pub use translator::TranslationEngine;
