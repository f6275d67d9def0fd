//! MCP client: stdio handshake, operation listing, tool calls.
//!
//! **Protocol (MCP spec):**
//! 1. Spawn the tool-server command; stdin/stdout carry JSON-RPC.
//! 2. `serve_client(init_params, transport)` runs the handshake:
//!    - Client sends `initialize` with protocolVersion, capabilities, clientInfo.
//!    - Server responds with `InitializeResult`.
//!    - Client sends `notifications/initialized`.
//! 3. After handshake, use `list_operations` and `call` on the running service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rmcp::model::{
    CallToolRequestParams, ClientCapabilities, InitializeRequestParams, ProtocolVersion,
};
use rmcp::service::{RoleClient, serve_client};
use rmcp::transport::child_process::TokioChildProcess;
use tokio::process::Command;

use crate::payload::decode_call_payload;

/// Build init params for stdio tool servers (protocol 2024-11-05).
#[must_use]
pub fn init_params_tool_server() -> InitializeRequestParams {
    InitializeRequestParams {
        meta: None,
        protocol_version: ProtocolVersion::V_2024_11_05,
        capabilities: ClientCapabilities::default(),
        client_info: rmcp::model::Implementation::from_build_env(),
    }
}

/// One operation as declared by a tool server on `tools/list`.
#[derive(Debug, Clone)]
pub struct OperationListing {
    /// Operation name.
    pub name: String,
    /// Free-text description (empty when the server declares none).
    pub description: String,
    /// Declared input schema; `{}` when the server declares none.
    pub input_schema: serde_json::Value,
    /// Declared output schema; `{}` when the server declares none.
    pub output_schema: serde_json::Value,
}

/// MCP client for one tool server: connect once, then `list_operations` / `call`.
///
/// Dropping the client tears down the child process; the broker holds a client
/// only for the span of a single connect → call → drop cycle.
pub struct ToolServerClient {
    service: Arc<rmcp::service::RunningService<RoleClient, InitializeRequestParams>>,
}

impl ToolServerClient {
    /// Spawn `command args…` and run the MCP handshake over stdio.
    ///
    /// # Errors
    /// Returns an error if spawning the subprocess fails, the handshake times
    /// out, or the server rejects initialization.
    pub async fn connect_stdio(
        command: &str,
        args: &[String],
        timeout: Option<Duration>,
    ) -> Result<Self> {
        tracing::debug!(
            event = "mcp.client.connect",
            command = %command,
            args = args.len(),
            "spawning tool server for stdio transport"
        );
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped());
        let (transport, _stderr) = TokioChildProcess::builder(cmd)
            .spawn()
            .map_err(|e| anyhow::anyhow!("spawn tool-server process: {e}"))?;
        let init_params = init_params_tool_server();
        let service = match timeout {
            Some(d) => tokio::time::timeout(d, serve_client(init_params, transport))
                .await
                .map_err(|_| anyhow::anyhow!("MCP handshake timeout"))?
                .map_err(|e| anyhow::anyhow!("MCP handshake: {e}"))?,
            None => serve_client(init_params, transport)
                .await
                .map_err(|e| anyhow::anyhow!("MCP handshake: {e}"))?,
        };
        Ok(Self {
            service: Arc::new(service),
        })
    }

    /// List the server's operations with their declared schemas.
    ///
    /// # Errors
    /// Returns an error if the server fails `tools/list`.
    pub async fn list_operations(&self) -> Result<Vec<OperationListing>> {
        let list = self
            .service
            .list_tools(None)
            .await
            .map_err(|e| anyhow::anyhow!("tools/list: {e}"))?;
        let operations = list
            .tools
            .iter()
            .map(|t| OperationListing {
                name: t.name.to_string(),
                description: t
                    .description
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
                input_schema: serde_json::Value::Object(t.input_schema.as_ref().clone()),
                output_schema: t
                    .output_schema
                    .as_ref()
                    .map(|s| serde_json::Value::Object(s.as_ref().clone()))
                    .unwrap_or_else(|| serde_json::json!({})),
            })
            .collect();
        Ok(operations)
    }

    /// Call an operation and decode its payload.
    ///
    /// The first text content item is decoded as JSON; a payload that is not
    /// valid JSON is wrapped as `{"result": <text>}`, and an empty content
    /// list yields `{}`; neither case is an error.
    ///
    /// # Errors
    /// Returns an error if the server fails `tools/call` or flags the result
    /// as a tool-level error.
    pub async fn call(
        &self,
        operation: &str,
        input: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let args = input.and_then(|v| v.as_object().cloned());
        let params = CallToolRequestParams {
            meta: None,
            name: operation.to_string().into(),
            arguments: args,
            task: None,
        };
        let result = self
            .service
            .call_tool(params)
            .await
            .map_err(|e| anyhow::anyhow!("tools/call: {e}"))?;
        let text: Option<String> = result.content.iter().find_map(|c| {
            if let rmcp::model::RawContent::Text(t) = &c.raw {
                Some(t.text.clone())
            } else {
                None
            }
        });
        if result.is_error.unwrap_or(false) {
            return Err(anyhow::anyhow!(
                "tool call '{operation}' failed: {}",
                text.unwrap_or_else(|| "no error detail".to_string())
            ));
        }
        Ok(decode_call_payload(text.as_deref()))
    }
}
