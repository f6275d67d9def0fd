//! MCP client for the NEXUS broker.
//!
//! Follows the [MCP protocol](https://spec.modelcontextprotocol.io/) client pattern:
//! `serve_client(init_params, transport)` for the handshake, then `tools/list` /
//! `tools/call` on the running service. Tool servers are child processes spoken to
//! over stdio; one client per connect → call → drop cycle.

mod client;
mod payload;

pub use client::{OperationListing, ToolServerClient, init_params_tool_server};
pub use payload::decode_call_payload;
