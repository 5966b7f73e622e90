// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The top-level serve loop: the single entry point a framework adapter
//! calls for every request that lands on a workflow route.
//!
//! The failure callback is recognized and dispatched before the
//! call-result callback is even considered, since a failure callback's
//! request shape would otherwise also satisfy the callback detection
//! header.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::auth::{try_authentication, AuthOutcome};
use crate::broker::{BrokerClient, PublishRequest, SignatureVerifier};
use crate::callback::{handle_callback, CallbackOutcome};
use crate::constants::{AUTH_FAIL_MESSAGE, WORKFLOW_SIGNATURE_HEADER};
use crate::context::WorkflowContext;
use crate::error::{Result, WorkflowError};
use crate::executor::AutoExecutor;
use crate::failure::{handle_failure, is_failure_callback, FailureFunction};
use crate::headers::{self, HeaderContext, Headers};
use crate::history::{parse_request, validate_request};
use crate::payload::InitialPayloadParser;

/// A user's workflow function: takes the context, authors steps against
/// it, returns when the workflow (not just this invocation) is done.
pub type WorkflowFunction =
    Arc<dyn Fn(Arc<WorkflowContext>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// Everything the serve loop needs that does not change between
/// invocations of the same route.
pub struct ServeConfig {
    pub retries: u32,
    pub failure_url: Option<String>,
    pub failure_function: Option<FailureFunction>,
    pub verifier: Option<Arc<dyn SignatureVerifier>>,
    pub broker: Arc<dyn BrokerClient>,
    pub initial_payload_parser: InitialPayloadParser,
}

/// How one invocation of the serve loop concluded. Callers that want to
/// branch on outcome (loggers, metrics, framework adapters) should match on
/// this rather than re-parsing [`ServeResponse::body`], since the body's
/// only guaranteed field is `workflowRunId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishCondition {
    /// The invocation completed a normal step of the durable execution:
    /// the workflow function either ran to completion or submitted its
    /// next step and aborted; either way this invocation is done.
    Success,
    /// This invocation was a `Call` step's result or retry notification;
    /// it never touched the user's workflow function at all.
    FromCallback,
    /// The auth dry-run found that the workflow function never authors a
    /// step; the request is rejected.
    AuthFail,
    /// The terminal failure callback was dispatched.
    FailureCallback,
    /// An error propagated out of the serve loop uncaught (signature
    /// verification, malformed history, a non-aborting error from the
    /// workflow function); synthesized by [`serve`] itself, since the
    /// broker-facing contract never classifies this case beyond "retry
    /// me" (a 500 response).
    Error,
}

/// The plain HTTP response the framework adapter should send back. Every
/// path through the serve loop answers 200 except malformed or
/// unauthenticated requests, per spec's principle that the broker only
/// needs to know "got it" vs "retry me".
pub struct ServeResponse {
    pub status: u16,
    pub body: Value,
    pub finish_condition: FinishCondition,
}

impl ServeResponse {
    /// Every success path responds `{"workflowRunId": ...}` at 200.
    fn ok(workflow_run_id: &str, finish_condition: FinishCondition) -> Self {
        ServeResponse {
            status: 200,
            body: serde_json::json!({ "workflowRunId": workflow_run_id }),
            finish_condition,
        }
    }

    fn auth_fail(workflow_run_id: &str) -> Self {
        ServeResponse {
            status: 400,
            body: serde_json::json!({
                "message": AUTH_FAIL_MESSAGE,
                "workflowRunId": workflow_run_id,
            }),
            finish_condition: FinishCondition::AuthFail,
        }
    }

    fn error(status: u16, body: Value) -> Self {
        ServeResponse {
            status,
            body,
            finish_condition: FinishCondition::Error,
        }
    }
}

/// Runs one invocation of the workflow route.
pub async fn serve(
    config: &ServeConfig,
    workflow_url: String,
    headers: Headers,
    body: String,
    func: WorkflowFunction,
) -> ServeResponse {
    match serve_inner(config, workflow_url, &headers, &body, func).await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "workflow invocation failed");
            ServeResponse::error(500, e.to_error_body())
        }
    }
}

async fn serve_inner(
    config: &ServeConfig,
    workflow_url: String,
    headers: &Headers,
    body: &str,
    func: WorkflowFunction,
) -> Result<ServeResponse> {
    if let Some(verifier) = &config.verifier {
        let signature = headers
            .get(WORKFLOW_SIGNATURE_HEADER)
            .ok_or_else(|| WorkflowError::SignatureVerification("missing signature header".to_string()))?;
        verifier
            .verify(body, signature)
            .await
            .map_err(|e| WorkflowError::SignatureVerification(e.to_string()))?;
    }

    let is_first_invocation = headers.get(crate::constants::WORKFLOW_ID_HEADER).is_none();
    let workflow_run_id = validate_request(headers, is_first_invocation)?;

    if is_failure_callback(headers) {
        let user_headers = headers.recreate_user_headers();
        handle_failure(
            body,
            user_headers,
            config.retries,
            config.failure_url.clone(),
            &config.initial_payload_parser,
            config.broker.clone(),
            func.clone(),
            config.failure_function.as_ref(),
        )
        .await?;
        return Ok(ServeResponse::ok(&workflow_run_id, FinishCondition::FailureCallback));
    }

    let user_headers = headers.recreate_user_headers();
    let parsed = parse_request(headers, workflow_run_id.clone(), workflow_url.clone(), body)?;
    let initial_payload = parsed.initial_payload(&config.initial_payload_parser);

    let auth_outcome = try_authentication(
        config.broker.clone(),
        initial_payload.clone(),
        |ctx| {
            let func = func.clone();
            async move { func(ctx).await }
        },
    )
    .await?;
    if auth_outcome == AuthOutcome::RunEnded {
        warn!(workflow_run_id = %workflow_run_id, "auth dry-run found no step; rejecting request");
        let run_id_for_response = if is_first_invocation { "no-workflow-id" } else { workflow_run_id.as_str() };
        return Ok(ServeResponse::auth_fail(run_id_for_response));
    }

    match handle_callback(
        headers,
        body,
        &workflow_run_id,
        &workflow_url,
        &user_headers,
        config.retries,
        config.failure_url.as_deref(),
        config.broker.clone(),
    )
    .await?
    {
        CallbackOutcome::CallWillRetry | CallbackOutcome::IsCallReturn => {
            return Ok(ServeResponse::ok("no-workflow-id", FinishCondition::FromCallback));
        }
        CallbackOutcome::NotACallback => {}
    }

    if is_first_invocation {
        trigger_first_invocation(config, &workflow_run_id, &workflow_url, &user_headers, &parsed.raw_initial_payload)
            .await?;
        info!(workflow_run_id = %workflow_run_id, "first invocation triggered");
        return Ok(ServeResponse::ok(&workflow_run_id, FinishCondition::Success));
    }

    let executor = AutoExecutor::new(
        parsed.steps,
        workflow_run_id.clone(),
        workflow_url,
        user_headers,
        config.retries,
        config.failure_url.clone(),
        config.broker.clone(),
    );
    let ctx = WorkflowContext::new(executor, workflow_run_id.clone(), initial_payload);

    match func(ctx.clone()).await {
        Ok(()) => {
            info!(workflow_run_id = %workflow_run_id, "workflow run completed");
            ctx.cleanup_on_success().await?;
            Ok(ServeResponse::ok(&workflow_run_id, FinishCondition::Success))
        }
        Err(e) if e.is_aborted() => Ok(ServeResponse::ok(&workflow_run_id, FinishCondition::Success)),
        Err(e) => Err(e),
    }
}

/// First-invocation handling: the very first call to a
/// workflow route never runs user code directly. Instead it republishes the
/// raw initial payload back to the same endpoint with `Upstash-Workflow-Init:
/// true` and the freshly generated run id, then returns. The broker's
/// redelivery of that publish is what carries the `Sdk-Version`/`RunId`
/// headers that make the *next* invocation of this same route a non-first
/// one, at which point the user's workflow function actually begins
/// authoring steps.
async fn trigger_first_invocation(
    config: &ServeConfig,
    workflow_run_id: &str,
    workflow_url: &str,
    user_headers: &Headers,
    raw_initial_payload: &str,
) -> Result<()> {
    let ctx = HeaderContext {
        workflow_run_id,
        workflow_url,
        user_headers,
        retries: config.retries,
        call_retries: None,
        failure_url: config.failure_url.as_deref(),
    };
    let built_headers = headers::build_headers(&ctx, true, None);
    let request = PublishRequest {
        url: workflow_url.to_string(),
        method: "POST".to_string(),
        headers: built_headers,
        body: Value::String(raw_initial_payload.to_string()),
        not_before: None,
    };
    config
        .broker
        .publish(request)
        .await
        .map_err(|e| WorkflowError::BrokerRequest(e.to_string()))?;
    Ok(())
}
