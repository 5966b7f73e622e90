// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request parsing: turning an incoming invocation into a run id plus the
//! step history the executor replays against.

use base64::Engine;
use serde_json::Value;

use crate::constants::*;
use crate::error::{Result, WorkflowError};
use crate::headers::Headers;
use crate::step::{HttpMethod, Step, StepType};

/// Result of parsing an incoming request: enough to construct a
/// [`crate::context::WorkflowContext`] and drive the executor.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub workflow_run_id: String,
    pub workflow_url: String,
    pub is_first_invocation: bool,
    pub raw_initial_payload: String,
    pub steps: Vec<Step>,
}

impl ParsedRequest {
    /// Applies the configured initial-payload parser to this invocation's
    /// raw initial payload, producing the `Value` user workflow functions
    /// see as `WorkflowContext::initial_payload`.
    pub fn initial_payload(&self, parser: &crate::payload::InitialPayloadParser) -> Value {
        parser(&self.raw_initial_payload)
    }
}

/// Checks the protocol version header on every non-first invocation and
/// resolves the run id, generating a fresh one when this is the first call.
pub fn validate_request(headers: &Headers, is_first_invocation: bool) -> Result<String> {
    if !is_first_invocation {
        match headers.get(WORKFLOW_PROTOCOL_VERSION_HEADER) {
            Some(version) if version == WORKFLOW_PROTOCOL_VERSION => {}
            Some(version) => {
                return Err(WorkflowError::IncompatibleProtocolVersion {
                    expected: WORKFLOW_PROTOCOL_VERSION.to_string(),
                    got: version.to_string(),
                })
            }
            None => {
                return Err(WorkflowError::IncompatibleProtocolVersion {
                    expected: WORKFLOW_PROTOCOL_VERSION.to_string(),
                    got: String::new(),
                })
            }
        }
    }

    match headers.get(WORKFLOW_ID_HEADER) {
        Some(run_id) if !run_id.is_empty() => Ok(run_id.to_string()),
        _ if is_first_invocation => Ok(generate_run_id()),
        _ => Err(WorkflowError::MissingRunId),
    }
}

/// Generates a fresh `wfr_`-prefixed run id.
pub fn generate_run_id() -> String {
    format!("{RUN_ID_PREFIX}{}", nanoid::nanoid!(RUN_ID_SUFFIX_LEN))
}

/// True when `headers` describe the very first invocation of a run: no run
/// id header yet, or the init header explicitly says so.
pub fn is_first_invocation(headers: &Headers) -> bool {
    headers.get(WORKFLOW_ID_HEADER).is_none() || headers.get(WORKFLOW_INIT_HEADER) == Some("true")
}

/// Parses the request body into the step history, prepending the synthetic
/// Initial step. `body` is the raw request body exactly as received; on a
/// first invocation this is the user's initial payload, on a later one it
/// is the base64-encoded, possibly-compressed step array the broker
/// redelivers (decompression of the optional gzip envelope is left to the
/// framework adapter, which must pass already-decompressed bytes here).
pub fn parse_request(
    headers: &Headers,
    workflow_run_id: String,
    workflow_url: String,
    body: &str,
) -> Result<ParsedRequest> {
    let is_first_invocation = headers.get(WORKFLOW_ID_HEADER).is_none()
        || headers.get(WORKFLOW_INIT_HEADER) == Some("true");

    if !is_first_invocation && body.is_empty() {
        return Err(WorkflowError::EmptyBody);
    }

    let raw_initial_payload;
    let mut steps = Vec::new();

    if is_first_invocation {
        raw_initial_payload = body.to_string();
    } else {
        let raw: Value = serde_json::from_str(body)?;
        let array = raw.as_array().ok_or_else(|| {
            WorkflowError::Configuration("step history payload is not a JSON array".to_string())
        })?;
        let mut entries = array.iter();

        let init_entry = entries
            .next()
            .ok_or_else(|| WorkflowError::Configuration("step history payload is empty".to_string()))?;
        raw_initial_payload = decode_entry_body(init_entry)?;

        for entry in entries {
            let call_type = entry.get("callType").and_then(Value::as_str);
            if call_type != Some("step") {
                continue;
            }
            let decoded = decode_entry_body(entry)?;
            let step_json: Value = serde_json::from_str(&decoded)?;
            steps.push(entry_to_step(rewrite_wait_event_entry(step_json))?);
        }
    }

    let mut full_steps = Vec::with_capacity(steps.len() + 1);
    full_steps.push(Step::initial(&raw_initial_payload));
    full_steps.extend(steps);

    Ok(ParsedRequest {
        workflow_run_id,
        workflow_url,
        is_first_invocation,
        raw_initial_payload,
        steps: full_steps,
    })
}

/// Decodes one top-level history array element's `body` field, which the
/// broker always base64-encodes (standard or url-safe alphabet), into the
/// raw inner payload string.
fn decode_entry_body(entry: &Value) -> Result<String> {
    let body = entry
        .get("body")
        .and_then(Value::as_str)
        .ok_or_else(|| WorkflowError::Configuration("history entry missing body field".to_string()))?;
    decode_base64_any(body)
}

/// Tolerates both the standard and url-safe base64 alphabets, with or
/// without padding, matching what different broker versions have emitted.
fn decode_base64_any(body: &str) -> Result<String> {
    let trimmed = body.trim();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(trimmed)
        .or_else(|_| base64::engine::general_purpose::STANDARD_NO_PAD.decode(trimmed))
        .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(trimmed))
        .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(trimmed))
        .map_err(|e| WorkflowError::Configuration(format!("invalid base64 payload: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| WorkflowError::Configuration(format!("payload is not valid utf-8: {e}")))
}

/// If a decoded step record carries `waitEventId`, its `out` is the
/// base64-encoded event payload (or absent); normalize it to the
/// `{event_data, timeout}` shape `Step::out` expects for Wait steps.
fn rewrite_wait_event_entry(mut step_json: Value) -> Value {
    if step_json.get("waitEventId").is_none() {
        return step_json;
    }
    let event_data = match step_json.get("out") {
        Some(Value::String(s)) if !s.is_empty() => {
            decode_base64_any(s).ok().map(|decoded| {
                serde_json::from_str::<Value>(&decoded).unwrap_or(Value::String(decoded))
            })
        }
        _ => None,
    };
    let timeout = step_json
        .get("waitTimeout")
        .cloned()
        .unwrap_or(Value::Bool(false));
    if let Some(obj) = step_json.as_object_mut() {
        obj.insert(
            "out".to_string(),
            serde_json::json!({ "event_data": event_data, "timeout": timeout }),
        );
    }
    step_json
}

/// Converts one raw history entry into a resolved [`Step`], attempting a
/// second JSON decode of `out`/`body` (results from `run`/`call` steps are
/// frequently JSON-encoded twice: once by the user's return value, once by
/// the broker's transport envelope).
fn entry_to_step(entry: Value) -> Result<Step> {
    let step_id = entry
        .get("stepId")
        .and_then(Value::as_i64)
        .ok_or_else(|| WorkflowError::Configuration("history entry missing stepId".to_string()))?;
    let step_name = entry
        .get("stepName")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let step_type_raw = entry.get("stepType").and_then(Value::as_str).unwrap_or_default();
    let step_type = StepType::parse(step_type_raw).ok_or_else(|| {
        WorkflowError::Configuration(format!("unknown step type in history: {step_type_raw}"))
    })?;
    let concurrent = entry.get("concurrent").and_then(Value::as_i64).unwrap_or(NO_CONCURRENCY);

    let out = entry.get("out").map(|v| double_decode(v.clone()));
    let call_method = entry
        .get("callMethod")
        .and_then(Value::as_str)
        .and_then(parse_http_method);

    Ok(Step {
        step_id,
        step_name,
        step_type,
        concurrent,
        out,
        sleep_for: entry.get("sleepFor").cloned(),
        sleep_until: entry.get("sleepUntil").and_then(Value::as_i64),
        target_step: entry.get("targetStep").and_then(Value::as_i64),
        call_url: entry.get("callUrl").and_then(Value::as_str).map(str::to_string),
        call_method,
        call_body: entry.get("callBody").map(|v| double_decode(v.clone())),
        call_headers: entry.get("callHeaders").and_then(|v| {
            serde_json::from_value(v.clone()).ok()
        }),
    })
}

/// If `value` is a JSON string that itself parses as JSON, returns the
/// inner parsed value; otherwise returns `value` unchanged. Mirrors the
/// broker's habit of double-encoding step results.
fn double_decode(value: Value) -> Value {
    if let Value::String(s) = &value {
        if let Ok(inner) = serde_json::from_str::<Value>(s) {
            return inner;
        }
    }
    value
}

fn parse_http_method(raw: &str) -> Option<HttpMethod> {
    match raw.to_ascii_uppercase().as_str() {
        "GET" => Some(HttpMethod::GET),
        "POST" => Some(HttpMethod::POST),
        "PUT" => Some(HttpMethod::PUT),
        "DELETE" => Some(HttpMethod::DELETE),
        "PATCH" => Some(HttpMethod::PATCH),
        _ => None,
    }
}
