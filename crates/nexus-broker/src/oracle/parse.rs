//! Oracle response hygiene: fence stripping and tagged JSON decoding.

use serde::de::DeserializeOwned;

/// Strip leading/trailing markdown code fences and an optional language tag.
///
/// Oracles are asked for bare JSON but routinely wrap it in ```` ```json ````
/// fences; parsing must tolerate that before structured decode.
#[must_use]
pub fn strip_code_fences(raw: &str) -> String {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        text = match rest.split_once('\n') {
            Some((_, body)) => body,
            None => rest,
        };
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    let text = text.trim();
    if let Some(rest) = text.strip_prefix("json") {
        return rest.trim().to_string();
    }
    text.to_string()
}

/// Decode result for a structured oracle response.
///
/// Every call site pattern-matches this instead of nesting decode fallbacks;
/// what "parse error" means (incompatible edge, empty mapping, keyword
/// fallback) is the caller's decision.
#[derive(Debug)]
pub enum OracleJson<T> {
    /// The response decoded into the expected shape.
    Parsed(T),
    /// The response did not decode; the cleaned raw text is kept for logging.
    ParseError {
        /// Fence-stripped response text.
        raw: String,
    },
}

/// Strict decode: strip fences, then one `serde_json` pass.
pub fn decode_oracle_json<T: DeserializeOwned>(raw: &str) -> OracleJson<T> {
    let cleaned = strip_code_fences(raw);
    match serde_json::from_str(&cleaned) {
        Ok(value) => OracleJson::Parsed(value),
        Err(_) => OracleJson::ParseError { raw: cleaned },
    }
}

/// Lenient decode: strict pass first, then retry on the outermost `{…}` span.
///
/// Some oracle responses surround the JSON object with prose; locating the
/// outermost brace pair recovers those without giving up on the response.
pub fn decode_oracle_json_lenient<T: DeserializeOwned>(raw: &str) -> OracleJson<T> {
    let cleaned = strip_code_fences(raw);
    if let Ok(value) = serde_json::from_str(&cleaned) {
        return OracleJson::Parsed(value);
    }
    if let (Some(start), Some(end)) = (cleaned.find('{'), cleaned.rfind('}')) {
        if end > start {
            if let Ok(value) = serde_json::from_str(&cleaned[start..=end]) {
                return OracleJson::Parsed(value);
            }
        }
    }
    OracleJson::ParseError { raw: cleaned }
}
