//! Executor integration tests: translation + repair between steps, failure
//! policies, delivery aggregation. Uses fake invokers and oracles so no
//! external services are required.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use nexus_broker::{
    Compatibility, FailurePolicy, GraphEdge, OperationDescriptor, OracleError, Pipeline,
    PipelineExecutor, PipelineStep, ReasoningOracle, ServerRecord, ServerStatus, ToolInvoker,
};

/// Invoker returning canned per-server outputs and recording every input.
struct ScriptedInvoker {
    outputs: HashMap<String, Value>,
    recorded_inputs: Arc<Mutex<Vec<(String, Value)>>>,
}

impl ScriptedInvoker {
    fn new(outputs: HashMap<String, Value>) -> (Self, Arc<Mutex<Vec<(String, Value)>>>) {
        let recorded = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                outputs,
                recorded_inputs: Arc::clone(&recorded),
            },
            recorded,
        )
    }
}

#[async_trait]
impl ToolInvoker for ScriptedInvoker {
    async fn list_operations(
        &self,
        _command: &str,
        _args: &[String],
    ) -> Result<Vec<OperationDescriptor>> {
        Ok(vec![])
    }

    async fn call(&self, server: &ServerRecord, _operation: &str, input: &Value) -> Result<Value> {
        self.recorded_inputs
            .lock()
            .unwrap()
            .push((server.name.clone(), input.clone()));
        self.outputs
            .get(&server.name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("invocation error for '{}'", server.name))
    }
}

/// Oracle whose translation specs never map the required field, to force the
/// repair pass.
struct UselessSpecOracle;

#[async_trait]
impl ReasoningOracle for UselessSpecOracle {
    async fn reason(&self, _prompt: &str) -> Result<String, OracleError> {
        Ok(r#"{"mappings": []}"#.to_string())
    }
}

fn server(name: &str, op: &str, input_schema: Value) -> ServerRecord {
    ServerRecord {
        name: name.to_string(),
        command: "uv".to_string(),
        args: vec![],
        operations: vec![OperationDescriptor {
            name: op.to_string(),
            description: format!("{op} operation"),
            input_schema,
            output_schema: serde_json::json!({}),
        }],
        profile: None,
        status: ServerStatus::Profiled,
        registered_at: "2026-01-01T00:00:00Z".to_string(),
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

fn step(server: &str, op: &str, edge: Option<GraphEdge>) -> PipelineStep {
    PipelineStep {
        server: server.to_string(),
        operation: op.to_string(),
        edge,
    }
}

#[tokio::test]
async fn two_step_pipeline_repairs_required_field_from_summary_alias() {
    // A produces {summary}; B requires message_body; the spec maps nothing.
    let mut servers = HashMap::new();
    servers.insert(
        "condenser".to_string(),
        server("condenser", "summarize_text", serde_json::json!({"type": "object"})),
    );
    servers.insert(
        "notifier".to_string(),
        server(
            "notifier",
            "send_message",
            serde_json::json!({
                "type": "object",
                "properties": {"channel": {"type": "string"}, "message_body": {"type": "string"}},
                "required": ["channel", "message_body"]
            }),
        ),
    );

    let mut outputs = HashMap::new();
    outputs.insert(
        "condenser".to_string(),
        serde_json::json!({"summary": "the gist of it"}),
    );
    outputs.insert("notifier".to_string(), serde_json::json!({"ok": true}));
    let (invoker, recorded) = ScriptedInvoker::new(outputs);

    let pipeline = Pipeline {
        steps: vec![
            step("condenser", "summarize_text", None),
            step(
                "notifier",
                "send_message",
                Some(edge("condenser", "summarize_text", "notifier", "send_message")),
            ),
        ],
        confidence: 0.9,
    };

    let mut context = HashMap::new();
    context.insert("channel".to_string(), serde_json::json!("#team-updates"));

    let mut executor = PipelineExecutor::new(
        &servers,
        Arc::new(invoker),
        Arc::new(UselessSpecOracle),
        FailurePolicy::default(),
    );
    let (results, summary) = executor
        .execute(
            &pipeline,
            serde_json::json!({"url": "https://e.com"}),
            &context,
        )
        .await;

    assert_eq!(results.len(), 2, "one result per step, always");
    assert!(summary.all_succeeded);

    let recorded = recorded.lock().unwrap();
    let (_, notifier_input) = recorded
        .iter()
        .find(|(name, _)| name == "notifier")
        .expect("notifier invoked");
    assert_eq!(
        notifier_input["message_body"], "the gist of it",
        "required field filled from the summary alias"
    );
    assert_eq!(
        notifier_input["channel"], "#team-updates",
        "channel merged from context via schema mention"
    );
}

#[tokio::test]
async fn missing_server_is_recorded_and_run_continues_by_default() {
    let mut servers = HashMap::new();
    servers.insert(
        "fetcher".to_string(),
        server("fetcher", "fetch_url", serde_json::json!({"type": "object"})),
    );
    servers.insert(
        "condenser".to_string(),
        server("condenser", "summarize_text", serde_json::json!({"type": "object"})),
    );

    let mut outputs = HashMap::new();
    outputs.insert(
        "fetcher".to_string(),
        serde_json::json!({"content": "page text"}),
    );
    outputs.insert(
        "condenser".to_string(),
        serde_json::json!({"summary": "short"}),
    );
    let (invoker, recorded) = ScriptedInvoker::new(outputs);

    let pipeline = Pipeline {
        steps: vec![
            step("fetcher", "fetch_url", None),
            step("ghost", "vanish", None),
            step("condenser", "summarize_text", None),
        ],
        confidence: 0.8,
    };

    let mut executor = PipelineExecutor::new(
        &servers,
        Arc::new(invoker),
        Arc::new(UselessSpecOracle),
        FailurePolicy::ContinueWithStaleData,
    );
    let (results, summary) = executor
        .execute(&pipeline, serde_json::json!({}), &HashMap::new())
        .await;

    assert_eq!(results.len(), 3, "failed step does not abort the run");
    assert!(results[0].success);
    assert!(!results[1].success);
    assert!(results[1].error.as_ref().unwrap().contains("ghost"));
    assert!(results[2].success);
    assert_eq!(summary.succeeded, 2);
    assert!(!summary.all_succeeded);

    // The third step ran against the stale data from step one.
    let recorded = recorded.lock().unwrap();
    let (_, condenser_input) = recorded
        .iter()
        .find(|(name, _)| name == "condenser")
        .expect("condenser invoked");
    assert_eq!(condenser_input["content"], "page text");
}

#[tokio::test]
async fn abort_policy_stops_at_first_failure() {
    let mut servers = HashMap::new();
    servers.insert(
        "fetcher".to_string(),
        server("fetcher", "fetch_url", serde_json::json!({"type": "object"})),
    );
    servers.insert(
        "condenser".to_string(),
        server("condenser", "summarize_text", serde_json::json!({"type": "object"})),
    );

    // fetcher has no scripted output, so its invocation errors.
    let (invoker, _) = ScriptedInvoker::new(HashMap::new());

    let pipeline = Pipeline {
        steps: vec![
            step("fetcher", "fetch_url", None),
            step("condenser", "summarize_text", None),
        ],
        confidence: 0.8,
    };

    let mut executor = PipelineExecutor::new(
        &servers,
        Arc::new(invoker),
        Arc::new(UselessSpecOracle),
        FailurePolicy::AbortOnFailure,
    );
    let (results, summary) = executor
        .execute(&pipeline, serde_json::json!({}), &HashMap::new())
        .await;

    assert_eq!(results.len(), 1, "abort policy stops the run");
    assert!(!results[0].success);
    assert_eq!(summary.succeeded, 0);
}

#[tokio::test]
async fn default_policy_is_continue_with_stale_data() {
    assert_eq!(FailurePolicy::default(), FailurePolicy::ContinueWithStaleData);
}

#[tokio::test]
async fn delivery_sink_input_is_aggregated_not_translated() {
    let mut servers = HashMap::new();
    servers.insert(
        "summarizer".to_string(),
        server("summarizer", "summarize_text", serde_json::json!({"type": "object"})),
    );
    servers.insert(
        "sentiment-analyzer".to_string(),
        server(
            "sentiment-analyzer",
            "analyze_sentiment",
            serde_json::json!({"type": "object"}),
        ),
    );
    servers.insert(
        "slack-sender".to_string(),
        server(
            "slack-sender",
            "send_slack_message",
            serde_json::json!({
                "type": "object",
                "required": ["channel", "message_body"]
            }),
        ),
    );

    let mut outputs = HashMap::new();
    outputs.insert(
        "summarizer".to_string(),
        serde_json::json!({"summary": "big news", "key_points": ["one", "two"]}),
    );
    outputs.insert(
        "sentiment-analyzer".to_string(),
        serde_json::json!({"sentiment": "positive", "confidence": 0.9, "explanation": "upbeat"}),
    );
    outputs.insert("slack-sender".to_string(), serde_json::json!({"success": true}));
    let (invoker, recorded) = ScriptedInvoker::new(outputs);

    let pipeline = Pipeline {
        steps: vec![
            step("summarizer", "summarize_text", None),
            step(
                "sentiment-analyzer",
                "analyze_sentiment",
                Some(edge(
                    "summarizer",
                    "summarize_text",
                    "sentiment-analyzer",
                    "analyze_sentiment",
                )),
            ),
            step(
                "slack-sender",
                "send_slack_message",
                Some(edge(
                    "sentiment-analyzer",
                    "analyze_sentiment",
                    "slack-sender",
                    "send_slack_message",
                )),
            ),
        ],
        confidence: 0.85,
    };

    let mut context = HashMap::new();
    context.insert("channel".to_string(), serde_json::json!("#news"));

    let mut executor = PipelineExecutor::new(
        &servers,
        Arc::new(invoker),
        Arc::new(UselessSpecOracle),
        FailurePolicy::default(),
    );
    let (results, _) = executor
        .execute(&pipeline, serde_json::json!({"text": "article"}), &context)
        .await;
    assert_eq!(results.len(), 3);

    let recorded = recorded.lock().unwrap();
    let (_, slack_input) = recorded
        .iter()
        .find(|(name, _)| name == "slack-sender")
        .expect("slack-sender invoked");
    assert_eq!(slack_input["channel"], "#news");
    let body = slack_input["message_body"].as_str().unwrap();
    assert!(body.contains("big news"), "summary aggregated into body");
    assert!(body.contains("• one"), "key points aggregated into body");
    assert!(body.contains("Positive"), "sentiment aggregated into body");
}

#[tokio::test]
async fn entry_step_receives_the_initial_input_unchanged() {
    let mut servers = HashMap::new();
    servers.insert(
        "fetcher".to_string(),
        server("fetcher", "fetch_url", serde_json::json!({"type": "object"})),
    );
    let mut outputs = HashMap::new();
    outputs.insert("fetcher".to_string(), serde_json::json!({"content": "x"}));
    let (invoker, recorded) = ScriptedInvoker::new(outputs);

    let pipeline = Pipeline {
        steps: vec![step("fetcher", "fetch_url", None)],
        confidence: 1.0,
    };
    let mut executor = PipelineExecutor::new(
        &servers,
        Arc::new(invoker),
        Arc::new(UselessSpecOracle),
        FailurePolicy::default(),
    );
    let (results, _) = executor
        .execute(
            &pipeline,
            serde_json::json!({"url": "https://e.com"}),
            &HashMap::new(),
        )
        .await;
    assert!(results[0].success);

    let recorded = recorded.lock().unwrap();
    assert_eq!(recorded[0].1["url"], "https://e.com");
}
