//! Tool-server registry: registration, profiling, persistence.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::invoker::ToolInvoker;
use crate::models::{ServerRecord, ServerStatus};
use crate::oracle::ReasoningOracle;
use crate::profiler::profile_server;
use crate::storage::Storage;

/// Manages registration and profiling of tool servers, backed by storage.
pub struct Registry {
    storage: Storage,
    invoker: Arc<dyn ToolInvoker>,
    reasoning: Arc<dyn ReasoningOracle>,
    servers: HashMap<String, ServerRecord>,
}

impl Registry {
    /// Create a registry, loading any persisted servers into memory.
    ///
    /// # Errors
    /// Fails when the stored servers cannot be loaded.
    pub fn new(
        storage: Storage,
        invoker: Arc<dyn ToolInvoker>,
        reasoning: Arc<dyn ReasoningOracle>,
    ) -> Result<Self> {
        let servers = storage.load_all_servers()?;
        if !servers.is_empty() {
            tracing::info!(
                event = "nexus.registry.loaded",
                servers = servers.len(),
                "loaded servers from storage"
            );
        }
        Ok(Self {
            storage,
            invoker,
            reasoning,
            servers,
        })
    }

    /// The in-memory server map.
    #[must_use]
    pub fn servers(&self) -> &HashMap<String, ServerRecord> {
        &self.servers
    }

    /// Look up a server, falling back to storage on a memory miss.
    ///
    /// # Errors
    /// Fails on storage errors.
    pub fn get(&mut self, name: &str) -> Result<Option<ServerRecord>> {
        if let Some(record) = self.servers.get(name) {
            return Ok(Some(record.clone()));
        }
        if let Some(record) = self.storage.load_server(name)? {
            self.servers.insert(name.to_string(), record.clone());
            return Ok(Some(record));
        }
        Ok(None)
    }

    /// Register a tool server: connect, list operations, profile, persist.
    ///
    /// Unless `force_refresh` is set, a server already in storage is reused
    /// without reconnecting.
    ///
    /// # Errors
    /// Fails when the server cannot be reached, profiling fails, or
    /// persistence fails.
    pub async fn register(
        &mut self,
        name: &str,
        command: &str,
        args: &[String],
        force_refresh: bool,
    ) -> Result<ServerRecord> {
        if !force_refresh && self.storage.server_exists(name)? {
            if let Some(cached) = self.storage.load_server(name)? {
                tracing::info!(
                    event = "nexus.registry.cache_hit",
                    server = %name,
                    "server loaded from storage"
                );
                self.servers.insert(name.to_string(), cached.clone());
                return Ok(cached);
            }
        }

        tracing::info!(
            event = "nexus.registry.connecting",
            server = %name,
            command = %command,
            "connecting to tool server"
        );
        let operations = self
            .invoker
            .list_operations(command, args)
            .await
            .with_context(|| format!("list operations of '{name}'"))?;
        for op in &operations {
            tracing::info!(
                event = "nexus.registry.operation_found",
                server = %name,
                operation = %op.name,
                "found operation"
            );
        }

        let mut record = ServerRecord {
            name: name.to_string(),
            command: command.to_string(),
            args: args.to_vec(),
            operations,
            profile: None,
            status: ServerStatus::Registered,
            registered_at: chrono::Utc::now().to_rfc3339(),
        };

        tracing::info!(
            event = "nexus.registry.profiling",
            server = %name,
            "analyzing capabilities"
        );
        let profile = profile_server(self.reasoning.as_ref(), name, &record.operations).await?;
        tracing::info!(
            event = "nexus.registry.profiled",
            server = %name,
            domain = %profile.domain,
            tags = profile.capability_tags.join(","),
            "server profiled"
        );
        record.profile = Some(profile);
        record.status = ServerStatus::Profiled;

        self.storage.save_server(&record)?;
        self.servers.insert(name.to_string(), record.clone());
        self.log_potential_connections(name);
        Ok(record)
    }

    /// Remove a server and every edge touching it.
    ///
    /// # Errors
    /// Fails on storage errors.
    pub fn unregister(&mut self, name: &str) -> Result<bool> {
        self.servers.remove(name);
        let removed_edges = self.storage.delete_edges_for_server(name)?;
        if removed_edges > 0 {
            tracing::info!(
                event = "nexus.registry.edges_removed",
                server = %name,
                removed = removed_edges,
                "removed edges for unregistered server"
            );
        }
        self.storage.delete_server(name)
    }

    /// Force-reload the in-memory map from storage.
    ///
    /// # Errors
    /// Fails on storage errors.
    pub fn reload(&mut self) -> Result<()> {
        self.servers = self.storage.load_all_servers()?;
        tracing::info!(
            event = "nexus.registry.reloaded",
            servers = self.servers.len(),
            "reloaded servers from storage"
        );
        Ok(())
    }

    /// Log servers the newcomer plausibly chains with, going by tag overlap
    /// and claimed compatibilities.
    fn log_potential_connections(&self, new_server: &str) {
        let Some(new_profile) = self
            .servers
            .get(new_server)
            .and_then(|r| r.profile.as_ref())
        else {
            return;
        };
        let new_tags: std::collections::HashSet<&str> = new_profile
            .capability_tags
            .iter()
            .map(String::as_str)
            .collect();

        for (existing_name, existing_record) in &self.servers {
            if existing_name == new_server {
                continue;
            }
            let Some(existing_profile) = existing_record.profile.as_ref() else {
                continue;
            };
            let tag_overlap = existing_profile
                .capability_tags
                .iter()
                .any(|t| new_tags.contains(t.as_str()));
            let compatible_mention = new_profile.compatible_with.iter().any(|claim| {
                let claim = claim.to_lowercase();
                claim.contains(&existing_name.to_lowercase())
                    || existing_profile
                        .capability_tags
                        .iter()
                        .any(|t| claim.contains(&t.to_lowercase()))
            });
            if tag_overlap || compatible_mention {
                tracing::info!(
                    event = "nexus.registry.potential_chain",
                    server = %new_server,
                    partner = %existing_name,
                    "servers can potentially chain"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OperationDescriptor;
    use crate::oracle::OracleError;
    use async_trait::async_trait;
    use serde_json::Value;

    struct FakeInvoker {
        listings: Vec<OperationDescriptor>,
    }

    #[async_trait]
    impl ToolInvoker for FakeInvoker {
        async fn list_operations(
            &self,
            _command: &str,
            _args: &[String],
        ) -> Result<Vec<OperationDescriptor>> {
            Ok(self.listings.clone())
        }

        async fn call(
            &self,
            _server: &ServerRecord,
            _operation: &str,
            _input: &Value,
        ) -> Result<Value> {
            Ok(serde_json::json!({}))
        }
    }

    struct ProfileOracle;

    #[async_trait]
    impl ReasoningOracle for ProfileOracle {
        async fn reason(&self, _prompt: &str) -> Result<String, OracleError> {
            Ok(r#"{"plain_language_summary": "summarizes text", "capability_tags": ["nlp"], "domain": "NLP"}"#.to_string())
        }
    }

    fn registry_with_op(op: &str) -> Registry {
        let storage = Storage::open_in_memory().unwrap();
        let invoker = FakeInvoker {
            listings: vec![OperationDescriptor {
                name: op.to_string(),
                description: "desc".to_string(),
                input_schema: serde_json::json!({"type": "object"}),
                output_schema: serde_json::json!({}),
            }],
        };
        Registry::new(storage, Arc::new(invoker), Arc::new(ProfileOracle)).unwrap()
    }

    #[tokio::test]
    async fn register_profiles_and_persists() {
        let mut registry = registry_with_op("summarize_text");
        let record = registry
            .register("summarizer", "uv", &["run".to_string()], false)
            .await
            .unwrap();
        assert_eq!(record.status, ServerStatus::Profiled);
        assert_eq!(
            record.profile.as_ref().unwrap().plain_language_summary,
            "summarizes text"
        );
        assert!(registry.storage.server_exists("summarizer").unwrap());
    }

    #[tokio::test]
    async fn second_register_reuses_storage_without_reconnect() {
        let mut registry = registry_with_op("summarize_text");
        registry
            .register("summarizer", "uv", &[], false)
            .await
            .unwrap();
        // A registry with a failing invoker still resolves from storage.
        struct FailingInvoker;
        #[async_trait]
        impl ToolInvoker for FailingInvoker {
            async fn list_operations(
                &self,
                _command: &str,
                _args: &[String],
            ) -> Result<Vec<OperationDescriptor>> {
                Err(anyhow::anyhow!("unreachable"))
            }
            async fn call(
                &self,
                _server: &ServerRecord,
                _operation: &str,
                _input: &Value,
            ) -> Result<Value> {
                Err(anyhow::anyhow!("unreachable"))
            }
        }
        let mut second = Registry::new(
            registry.storage.clone(),
            Arc::new(FailingInvoker),
            Arc::new(ProfileOracle),
        )
        .unwrap();
        let record = second.register("summarizer", "uv", &[], false).await.unwrap();
        assert_eq!(record.name, "summarizer");
    }

    #[tokio::test]
    async fn unregister_removes_server_and_edges() {
        let mut registry = registry_with_op("summarize_text");
        registry
            .register("summarizer", "uv", &[], false)
            .await
            .unwrap();
        registry
            .storage
            .save_edge(&crate::models::GraphEdge {
                source_server: "summarizer".into(),
                source_op: "summarize_text".into(),
                target_server: "slack-sender".into(),
                target_op: "send_slack_message".into(),
                compatibility: crate::models::Compatibility::Translatable,
                confidence: 0.8,
                translation_hint: String::new(),
            })
            .unwrap();
        assert!(registry.unregister("summarizer").unwrap());
        assert!(!registry.storage.server_exists("summarizer").unwrap());
        assert!(registry.storage.load_all_edges().unwrap().is_empty());
    }
}
