// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The initial-payload parser: a pluggable hook applied to the raw body
//! text position 0 of history carries.
//!
//! The default: try a JSON decode of the raw payload, and fall back to the
//! raw string untouched when it isn't valid JSON (an empty body, or a body
//! the caller intentionally sent as plain text, must not turn into a parse
//! error).

use std::sync::Arc;

use serde_json::Value;

/// A hook that turns the raw initial payload string into the `Value` user
/// workflow functions see as `WorkflowContext::initial_payload`.
pub type InitialPayloadParser = Arc<dyn Fn(&str) -> Value + Send + Sync>;

/// Attempts a JSON decode of `raw`, falling back to the raw string
/// unchanged when it does not parse. An empty payload parses to `null`
/// rather than an empty string.
pub fn default_initial_payload_parser() -> InitialPayloadParser {
    Arc::new(|raw: &str| {
        if raw.is_empty() {
            return Value::Null;
        }
        serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_json_payload() {
        let parser = default_initial_payload_parser();
        assert_eq!(parser("{\"a\":1}"), serde_json::json!({"a": 1}));
    }

    #[test]
    fn falls_back_to_raw_string_for_non_json_payload() {
        let parser = default_initial_payload_parser();
        assert_eq!(parser("plain text"), Value::String("plain text".to_string()));
    }

    #[test]
    fn empty_payload_parses_to_null() {
        let parser = default_initial_payload_parser();
        assert_eq!(parser(""), Value::Null);
    }
}
