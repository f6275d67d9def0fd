//! Tool-invocation collaborator: connect → call → disconnect per use.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use nexus_mcp_client::ToolServerClient;

use crate::models::{OperationDescriptor, ServerRecord};

/// Seam to the external tool servers. One connection per call; nothing is
/// held across pipeline steps.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Launch the server and list its declared operations.
    async fn list_operations(
        &self,
        command: &str,
        args: &[String],
    ) -> Result<Vec<OperationDescriptor>>;

    /// Launch the server, call one operation, tear the connection down.
    async fn call(&self, server: &ServerRecord, operation: &str, input: &Value) -> Result<Value>;
}

/// Production invoker: stdio MCP transport via `nexus-mcp-client`.
pub struct StdioToolInvoker {
    connect_timeout: Duration,
}

impl StdioToolInvoker {
    /// Create an invoker with the given per-connect handshake timeout.
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl ToolInvoker for StdioToolInvoker {
    async fn list_operations(
        &self,
        command: &str,
        args: &[String],
    ) -> Result<Vec<OperationDescriptor>> {
        let client = ToolServerClient::connect_stdio(command, args, Some(self.connect_timeout))
            .await
            .with_context(|| format!("connect to tool server: {command}"))?;
        let listings = client.list_operations().await?;
        Ok(listings
            .into_iter()
            .map(|l| OperationDescriptor {
                name: l.name,
                description: l.description,
                input_schema: l.input_schema,
                output_schema: l.output_schema,
            })
            .collect())
    }

    async fn call(&self, server: &ServerRecord, operation: &str, input: &Value) -> Result<Value> {
        let client =
            ToolServerClient::connect_stdio(&server.command, &server.args, Some(self.connect_timeout))
                .await
                .with_context(|| format!("connect to tool server '{}'", server.name))?;
        client.call(operation, Some(input.clone())).await
    }
}
