//! Storage integration tests: edge upsert idempotency, server roundtrip,
//! cascade deletes, run history.

use nexus_broker::{
    Compatibility, EdgeKey, GraphEdge, OperationDescriptor, SemanticProfile, ServerRecord,
    ServerStatus, Storage,
};

fn sample_edge(confidence: f64) -> GraphEdge {
    GraphEdge {
        source_server: "web-fetcher".to_string(),
        source_op: "fetch_url".to_string(),
        target_server: "summarizer".to_string(),
        target_op: "summarize_text".to_string(),
        compatibility: Compatibility::Translatable,
        confidence,
        translation_hint: "map content to text".to_string(),
    }
}

fn sample_server(name: &str) -> ServerRecord {
    ServerRecord {
        name: name.to_string(),
        command: "uv".to_string(),
        args: vec!["run".to_string(), "python".to_string(), "server.py".to_string()],
        operations: vec![OperationDescriptor {
            name: "fetch_url".to_string(),
            description: "Fetches a web page".to_string(),
            input_schema: serde_json::json!({"type": "object", "required": ["url"]}),
            output_schema: serde_json::json!({"type": "object"}),
        }],
        profile: Some(SemanticProfile {
            plain_language_summary: "Fetches web pages".to_string(),
            capability_tags: vec!["web".to_string(), "fetching".to_string()],
            domain: "web".to_string(),
            ..SemanticProfile::default()
        }),
        status: ServerStatus::Profiled,
        registered_at: "2026-01-01T00:00:00Z".to_string(),
    }
}

#[test]
fn edge_upsert_is_idempotent_and_last_write_wins() {
    let storage = Storage::open_in_memory().unwrap();
    storage.save_edge(&sample_edge(0.5)).unwrap();

    let mut updated = sample_edge(0.9);
    updated.compatibility = Compatibility::Direct;
    updated.translation_hint = String::new();
    storage.save_edge(&updated).unwrap();

    let edges = storage.load_all_edges().unwrap();
    assert_eq!(edges.len(), 1, "same compound key stores exactly one row");
    assert!((edges[0].confidence - 0.9).abs() < f64::EPSILON);
    assert_eq!(edges[0].compatibility, Compatibility::Direct);
    assert!(edges[0].translation_hint.is_empty());
}

#[test]
fn edge_exists_checks_the_compound_key() {
    let storage = Storage::open_in_memory().unwrap();
    storage.save_edge(&sample_edge(0.5)).unwrap();

    let stored = EdgeKey {
        source_server: "web-fetcher".to_string(),
        source_op: "fetch_url".to_string(),
        target_server: "summarizer".to_string(),
        target_op: "summarize_text".to_string(),
    };
    assert!(storage.edge_exists(&stored).unwrap());

    let other_op = EdgeKey {
        source_op: "fetch_page".to_string(),
        ..stored
    };
    assert!(!storage.edge_exists(&other_op).unwrap());
}

#[test]
fn server_roundtrip_preserves_operations_and_profile() {
    let storage = Storage::open_in_memory().unwrap();
    storage.save_server(&sample_server("web-fetcher")).unwrap();

    let loaded = storage.load_server("web-fetcher").unwrap().unwrap();
    assert_eq!(loaded.command, "uv");
    assert_eq!(loaded.args.len(), 3);
    assert_eq!(loaded.operations.len(), 1);
    assert_eq!(loaded.operations[0].name, "fetch_url");
    assert_eq!(
        loaded.operations[0].input_schema["required"][0],
        serde_json::json!("url")
    );
    let profile = loaded.profile.unwrap();
    assert_eq!(profile.capability_tags, vec!["web", "fetching"]);
    assert_eq!(loaded.status, ServerStatus::Profiled);
}

#[test]
fn save_server_twice_replaces_operations() {
    let storage = Storage::open_in_memory().unwrap();
    storage.save_server(&sample_server("web-fetcher")).unwrap();

    let mut updated = sample_server("web-fetcher");
    updated.operations[0].name = "fetch_page".to_string();
    storage.save_server(&updated).unwrap();

    let loaded = storage.load_server("web-fetcher").unwrap().unwrap();
    assert_eq!(loaded.operations.len(), 1);
    assert_eq!(loaded.operations[0].name, "fetch_page");
}

#[test]
fn delete_server_cascades_to_operations_and_profile() {
    let storage = Storage::open_in_memory().unwrap();
    storage.save_server(&sample_server("web-fetcher")).unwrap();
    assert!(storage.delete_server("web-fetcher").unwrap());
    assert!(storage.load_server("web-fetcher").unwrap().is_none());
    let stats = storage.stats().unwrap();
    assert_eq!(stats.servers, 0);
    assert_eq!(stats.operations, 0);
}

#[test]
fn delete_edges_for_server_removes_both_directions() {
    let storage = Storage::open_in_memory().unwrap();
    storage.save_edge(&sample_edge(0.5)).unwrap();
    let mut reverse = sample_edge(0.4);
    reverse.source_server = "summarizer".to_string();
    reverse.target_server = "web-fetcher".to_string();
    storage.save_edge(&reverse).unwrap();

    let removed = storage.delete_edges_for_server("web-fetcher").unwrap();
    assert_eq!(removed, 2);
    assert!(storage.load_all_edges().unwrap().is_empty());
}

#[test]
fn clear_all_edges_empties_the_table() {
    let storage = Storage::open_in_memory().unwrap();
    storage.save_edge(&sample_edge(0.5)).unwrap();
    assert_eq!(storage.clear_all_edges().unwrap(), 1);
    assert!(storage.load_all_edges().unwrap().is_empty());
}

#[test]
fn run_history_records_lifecycle() {
    let storage = Storage::open_in_memory().unwrap();
    let run_id = storage
        .record_run_started(
            "summarize and post",
            &serde_json::json!([{"server": "summarizer", "operation": "summarize_text"}]),
            &serde_json::json!({"channel": "#team-updates"}),
        )
        .unwrap();
    storage
        .record_run_finished(run_id, "completed", &serde_json::json!({"ok": true}), 1234)
        .unwrap();

    let runs = storage.recent_runs(10).unwrap();
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.status, "completed");
    assert_eq!(run.total_duration_ms, Some(1234));
    assert_eq!(run.context["channel"], "#team-updates");
    assert!(run.completed_at.is_some());
    assert_eq!(run.result.as_ref().unwrap()["ok"], true);
}

#[test]
fn recent_runs_returns_newest_first_and_respects_limit() {
    let storage = Storage::open_in_memory().unwrap();
    for i in 0..5 {
        storage
            .record_run_started(
                &format!("request {i}"),
                &serde_json::json!([]),
                &serde_json::json!({}),
            )
            .unwrap();
    }
    let runs = storage.recent_runs(3).unwrap();
    assert_eq!(runs.len(), 3);
    assert_eq!(runs[0].request, "request 4");
    assert_eq!(runs[2].request, "request 2");
}

#[test]
fn stats_counts_by_compatibility() {
    let storage = Storage::open_in_memory().unwrap();
    storage.save_edge(&sample_edge(0.5)).unwrap();
    let mut direct = sample_edge(0.95);
    direct.target_op = "summarize_page".to_string();
    direct.compatibility = Compatibility::Direct;
    storage.save_edge(&direct).unwrap();

    let stats = storage.stats().unwrap();
    assert_eq!(stats.edges, 2);
    assert_eq!(stats.direct_edges, 1);
    assert_eq!(stats.translatable_edges, 1);
}
