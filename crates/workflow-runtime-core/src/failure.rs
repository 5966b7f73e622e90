// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Handling for the terminal failure callback the broker sends once a
//! workflow run exhausts its retries.
//!
//! Unlike the call-result callback, a failure callback does not carry the
//! ordinary step history: it carries the run's *source* initial payload so
//! the route can be re-authenticated (the same auth dry-run every other
//! invocation goes through) before the user's failure function ever runs.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use base64::Engine;
use serde_json::Value;

use crate::auth::{try_authentication, AuthOutcome};
use crate::broker::BrokerClient;
use crate::constants::WORKFLOW_FAILURE_HEADER;
use crate::context::WorkflowContext;
use crate::error::{Result, WorkflowError};
use crate::executor::AutoExecutor;
use crate::headers::Headers;
use crate::payload::InitialPayloadParser;
use crate::serve::WorkflowFunction;
use crate::step::Step;

/// The failed request's outcome, handed to the configured failure
/// function so it can decide how to notify a human or clean up.
#[derive(Debug, Clone)]
pub struct WorkflowFailure {
    pub status: u16,
    pub header: HashMap<String, Vec<String>>,
    pub body: Value,
}

/// A user-supplied handler invoked once, after all retries for a step are
/// exhausted and the run is abandoned. Receives a real (not trap)
/// [`WorkflowContext`] reconstructed from the failing run's source
/// payload, along with the failure's `(status, decoded-error-message,
/// header)` contract.
pub type FailureFunction = Box<
    dyn Fn(Arc<WorkflowContext>, WorkflowFailure) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct FailurePayload {
    status: u16,
    #[serde(default)]
    header: HashMap<String, Vec<String>>,
    #[serde(default)]
    body: Option<String>,
    url: String,
    #[serde(default)]
    source_body: Option<String>,
    workflow_run_id: String,
}

/// Whether the incoming request is a failure callback at all.
pub fn is_failure_callback(headers: &Headers) -> bool {
    headers.get(WORKFLOW_FAILURE_HEADER) == Some("true")
}

/// Parses and dispatches a failure callback.
///
/// Errors with [`WorkflowError::UnauthenticatedFailureCallback`] when no
/// failure function is configured for this route, or when the auth
/// dry-run against the reconstructed source payload returns
/// [`AuthOutcome::RunEnded`] (spec: "if run-ended ⇒ unauthorised error").
#[allow(clippy::too_many_arguments)]
pub async fn handle_failure(
    body: &str,
    user_headers: Headers,
    retries: u32,
    failure_url: Option<String>,
    initial_payload_parser: &InitialPayloadParser,
    broker: Arc<dyn BrokerClient>,
    workflow_fn: WorkflowFunction,
    failure_function: Option<&FailureFunction>,
) -> Result<()> {
    let failure_function = failure_function.ok_or(WorkflowError::UnauthenticatedFailureCallback)?;

    let payload: FailurePayload = serde_json::from_str(body)?;

    let decoded_error_message = payload
        .body
        .as_deref()
        .map(decode_body)
        .unwrap_or(Value::Null);

    let raw_source_payload = payload
        .source_body
        .as_deref()
        .map(decode_base64_string)
        .unwrap_or_default();
    let initial_payload = initial_payload_parser(&raw_source_payload);

    let auth_outcome = try_authentication(broker.clone(), initial_payload.clone(), {
        let workflow_fn = workflow_fn.clone();
        move |ctx| async move { workflow_fn(ctx).await }
    })
    .await?;

    if auth_outcome == AuthOutcome::RunEnded {
        return Err(WorkflowError::UnauthenticatedFailureCallback);
    }

    let executor = AutoExecutor::new(
        vec![Step::initial(&raw_source_payload)],
        payload.workflow_run_id.clone(),
        payload.url.clone(),
        user_headers,
        retries,
        failure_url,
        broker,
    );
    let ctx = WorkflowContext::new(executor, payload.workflow_run_id, initial_payload);

    let failure = WorkflowFailure {
        status: payload.status,
        header: payload.header,
        body: decoded_error_message,
    };

    failure_function(ctx, failure).await
}

fn decode_base64_string(raw: &str) -> String {
    base64::engine::general_purpose::STANDARD
        .decode(raw)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| raw.to_string())
}

fn decode_body(raw: &str) -> Value {
    let decoded = decode_base64_string(raw);
    serde_json::from_str(&decoded).unwrap_or(Value::String(decoded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, PublishRequest, PublishResponse};
    use async_trait::async_trait;

    struct DummyBroker;

    #[async_trait]
    impl BrokerClient for DummyBroker {
        async fn publish(
            &self,
            _request: PublishRequest,
        ) -> std::result::Result<PublishResponse, BrokerError> {
            Ok(PublishResponse {
                message_id: "unused".to_string(),
            })
        }

        async fn batch(
            &self,
            _requests: Vec<PublishRequest>,
        ) -> std::result::Result<Vec<PublishResponse>, BrokerError> {
            Ok(vec![])
        }

        async fn delete(&self, _workflow_run_id: &str, _cancel: bool) -> std::result::Result<(), BrokerError> {
            Ok(())
        }
    }

    fn authenticated_workflow_fn() -> WorkflowFunction {
        Arc::new(|ctx: Arc<WorkflowContext>| {
            Box::pin(async move {
                let _: i64 = ctx.run("step1", || async { Ok(1) }).await?;
                Ok(())
            })
        })
    }

    fn unauthenticated_workflow_fn() -> WorkflowFunction {
        Arc::new(|_ctx: Arc<WorkflowContext>| Box::pin(async move { Ok(()) }))
    }

    fn failure_payload(source_body: &str) -> String {
        let body_b64 = base64::engine::general_purpose::STANDARD.encode("{\"reason\":\"boom\"}");
        let source_b64 = base64::engine::general_purpose::STANDARD.encode(source_body);
        serde_json::json!({
            "status": 500,
            "header": { "content-type": ["application/json"] },
            "body": body_b64,
            "url": "https://example.com/workflow",
            "sourceBody": source_b64,
            "workflowRunId": "wfr_test",
        })
        .to_string()
    }

    #[tokio::test]
    async fn missing_failure_function_is_rejected() {
        let err = handle_failure(
            &failure_payload("{}"),
            Headers::new(),
            3,
            None,
            &crate::payload::default_initial_payload_parser(),
            Arc::new(DummyBroker),
            authenticated_workflow_fn(),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WorkflowError::UnauthenticatedFailureCallback));
    }

    #[tokio::test]
    async fn unauthenticated_source_payload_is_rejected() {
        let captured = Arc::new(std::sync::Mutex::new(false));
        let captured_clone = captured.clone();
        let func: FailureFunction = Box::new(move |_ctx, _failure| {
            let captured = captured_clone.clone();
            Box::pin(async move {
                *captured.lock().unwrap() = true;
                Ok(())
            })
        });

        let err = handle_failure(
            &failure_payload("{}"),
            Headers::new(),
            3,
            None,
            &crate::payload::default_initial_payload_parser(),
            Arc::new(DummyBroker),
            unauthenticated_workflow_fn(),
            Some(&func),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, WorkflowError::UnauthenticatedFailureCallback));
        assert!(!*captured.lock().unwrap());
    }

    #[tokio::test]
    async fn dispatches_decoded_failure_to_configured_function() {
        let captured: Arc<std::sync::Mutex<Option<WorkflowFailure>>> = Arc::new(std::sync::Mutex::new(None));
        let captured_clone = captured.clone();

        let func: FailureFunction = Box::new(move |_ctx, failure| {
            let captured = captured_clone.clone();
            Box::pin(async move {
                *captured.lock().unwrap() = Some(failure);
                Ok(())
            })
        });

        handle_failure(
            &failure_payload("{}"),
            Headers::new(),
            3,
            None,
            &crate::payload::default_initial_payload_parser(),
            Arc::new(DummyBroker),
            authenticated_workflow_fn(),
            Some(&func),
        )
        .await
        .unwrap();

        let failure = captured.lock().unwrap().clone().unwrap();
        assert_eq!(failure.status, 500);
        assert_eq!(failure.body, serde_json::json!({"reason": "boom"}));
    }
}
