// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Handling for the invocation the broker makes back to the workflow
//! endpoint once a `Call` step's third-party request completes.

use std::sync::Arc;

use base64::Engine;
use serde_json::Value;
use tracing::warn;

use crate::broker::{BrokerClient, PublishRequest};
use crate::constants::*;
use crate::error::{Result, WorkflowError};
use crate::headers::{self, HeaderContext, Headers};
use crate::step::{HttpMethod, Step, StepType};

/// What the caller should do after [`handle_callback`] runs.
pub enum CallbackOutcome {
    /// This was not a callback invocation at all; continue the normal
    /// serve pipeline.
    NotACallback,
    /// The third-party call failed and the broker still has retries left;
    /// respond 200 and do nothing else, the broker will retry the call.
    CallWillRetry,
    /// The call's result was submitted back to the workflow endpoint as a
    /// resolved step; respond 200 and stop.
    IsCallReturn,
}

/// Body shape the broker sends to the callback invocation: the outcome of
/// the third-party request a `Call` step delegated.
#[derive(Debug, serde::Deserialize)]
struct CallbackPayload {
    status: u16,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    header: Value,
    #[serde(default, rename = "retried")]
    retried: Option<u32>,
    #[serde(default, rename = "maxRetries")]
    max_retries: Option<u32>,
}

/// Detects and processes a callback invocation. Returns
/// [`CallbackOutcome::NotACallback`] immediately if the required header is
/// absent, so callers can always invoke this unconditionally early in the
/// pipeline.
pub async fn handle_callback(
    headers: &Headers,
    body: &str,
    workflow_run_id: &str,
    workflow_url: &str,
    user_headers: &Headers,
    retries: u32,
    failure_url: Option<&str>,
    broker: Arc<dyn BrokerClient>,
) -> Result<CallbackOutcome> {
    if headers.get(WORKFLOW_CALLBACK_HEADER).is_none() {
        return Ok(CallbackOutcome::NotACallback);
    }

    let payload: CallbackPayload = serde_json::from_str(body)?;

    if !(200..300).contains(&payload.status) {
        let retried = payload.retried.unwrap_or(0);
        let max = payload.max_retries.unwrap_or(0);
        if retried < max {
            warn!(status = payload.status, retried, max, "call step failed, broker will retry");
            return Ok(CallbackOutcome::CallWillRetry);
        }
    }

    let step_id: i64 = headers
        .get(WORKFLOW_CALLBACK_STEP_ID_HEADER)
        .ok_or(WorkflowError::MissingCallbackField("stepId"))?
        .parse()
        .map_err(|_| WorkflowError::MissingCallbackField("stepId"))?;
    let step_name = headers
        .get(WORKFLOW_CALLBACK_STEP_NAME_HEADER)
        .ok_or(WorkflowError::MissingCallbackField("stepName"))?
        .to_string();
    let step_type_raw = headers
        .get(WORKFLOW_CALLBACK_STEP_TYPE_HEADER)
        .ok_or(WorkflowError::MissingCallbackField("stepType"))?;
    let step_type = crate::step::StepType::parse(step_type_raw)
        .ok_or(WorkflowError::MissingCallbackField("stepType"))?;
    let concurrent = headers
        .get(WORKFLOW_CALLBACK_CONCURRENT_HEADER)
        .and_then(|v| v.parse().ok())
        .unwrap_or(NO_CONCURRENCY);
    // Required even though it doesn't shape `out` below: a callback
    // invocation missing it is a malformed echo from the broker.
    headers
        .get(WORKFLOW_CALLBACK_CONTENT_TYPE_HEADER)
        .ok_or(WorkflowError::MissingCallbackField("contentType"))?;
    // The synthetic result step's `out` is exactly `{status, body, header}`,
    // body being the base64-decoded third-party response verbatim (no JSON
    // re-parsing here -- `WorkflowContext::call` attempts that on replay).
    let decoded_body = match payload.body.as_deref() {
        Some(b) if !b.is_empty() => Value::String(decode_base64(b)),
        _ => Value::Null,
    };
    let out = serde_json::json!({
        "status": payload.status,
        "body": decoded_body,
        "header": payload.header,
    });

    let result_step = Step {
        step_id,
        step_name,
        step_type,
        concurrent,
        out: Some(out),
        sleep_for: None,
        sleep_until: None,
        target_step: None,
        call_url: None,
        call_method: None,
        call_body: None,
        call_headers: None,
    };

    submit_result(
        &result_step,
        workflow_run_id,
        workflow_url,
        user_headers,
        retries,
        failure_url,
        broker,
    )
    .await?;

    Ok(CallbackOutcome::IsCallReturn)
}

/// Decodes the third party's base64-encoded response body to a plain
/// string. Falls back to the raw input if it is not valid base64/UTF-8, so
/// a malformed payload still surfaces to user code instead of vanishing.
fn decode_base64(raw: &str) -> String {
    base64::engine::general_purpose::STANDARD
        .decode(raw)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| raw.to_string())
}

async fn submit_result(
    step: &Step,
    workflow_run_id: &str,
    workflow_url: &str,
    user_headers: &Headers,
    retries: u32,
    failure_url: Option<&str>,
    broker: Arc<dyn BrokerClient>,
) -> Result<()> {
    let ctx = HeaderContext {
        workflow_run_id,
        workflow_url,
        user_headers,
        retries,
        call_retries: None,
        failure_url,
    };
    let built_headers = headers::build_headers(&ctx, false, Some(step));
    let request = PublishRequest {
        url: workflow_url.to_string(),
        method: headers::http_method_str(HttpMethod::POST).to_string(),
        headers: built_headers,
        body: serde_json::to_value(step)?,
        not_before: None,
    };

    broker
        .publish(request)
        .await
        .map_err(|e| WorkflowError::BrokerRequest(e.to_string()))?;
    Ok(())
}
