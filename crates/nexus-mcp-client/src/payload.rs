//! Tool-call payload decoding.

/// Decode the text payload of a `tools/call` result into a JSON object.
///
/// Tool servers return their structured result as a JSON-encoded text item.
/// A missing payload decodes to `{}`; a payload that is not valid JSON is
/// wrapped under a `result` key so the raw text stays available downstream.
#[must_use]
pub fn decode_call_payload(text: Option<&str>) -> serde_json::Value {
    match text {
        None => serde_json::json!({}),
        Some(raw) => match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(value) => value,
            Err(_) => serde_json::json!({ "result": raw }),
        },
    }
}
