//! Semantic profiling: raw operation metadata → oracle-generated profile.

use anyhow::{Result, anyhow};

use crate::models::{OperationDescriptor, SemanticProfile};
use crate::oracle::{OracleJson, ReasoningOracle, decode_oracle_json};

/// Produce a semantic profile for a server from its declared operations.
///
/// Profiling is on the registration critical path, so a response that fails
/// to decode is an error here, not a silent fallback.
///
/// # Errors
/// Fails when the oracle call fails or the response does not decode.
pub async fn profile_server(
    oracle: &dyn ReasoningOracle,
    server_name: &str,
    operations: &[OperationDescriptor],
) -> Result<SemanticProfile> {
    let mut operations_text = String::new();
    for op in operations {
        operations_text.push_str(&format!(
            "\nTool: {}\nDescription: {}\nInput Schema: {}\nOutput Schema: {}\n---\n",
            op.name, op.description, op.input_schema, op.output_schema
        ));
    }

    let prompt = format!(
        r#"You are analyzing an MCP server's capabilities. Given the following metadata, produce a rich semantic profile.

SERVER NAME: {server_name}

TOOLS:
{operations_text}

Produce a JSON response in EXACTLY this format, nothing else:
{{
    "plain_language_summary": "What this server does in simple terms",
    "capability_tags": ["tag1", "tag2", "tag3"],
    "input_concepts": ["what real-world things this server needs as input"],
    "output_concepts": ["what real-world things this server produces"],
    "use_cases": ["concrete scenario 1", "concrete scenario 2", "concrete scenario 3"],
    "compatible_with": ["what kinds of other capabilities would chain well with this, both upstream and downstream"],
    "domain": "primary domain like NLP, web, communication, analytics"
}}

Be thorough. Think about non-obvious use cases. Think about what OTHER tools would pair well with this one."#
    );

    let raw = oracle.reason(&prompt).await?;
    match decode_oracle_json::<SemanticProfile>(&raw) {
        OracleJson::Parsed(profile) => Ok(profile),
        OracleJson::ParseError { raw } => Err(anyhow!(
            "semantic profile for '{server_name}' did not decode: {raw}"
        )),
    }
}
