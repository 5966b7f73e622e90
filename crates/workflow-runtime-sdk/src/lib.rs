// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The public façade for authoring durable workflows as ordinary HTTP
//! endpoints: [`ServeOptions`] to configure a route, [`serve`] to run one
//! invocation, and re-exports of the pieces a workflow function or a host
//! framework adapter needs ([`WorkflowContext`], [`WorkflowError`], the
//! step-authoring option structs).
//!
//! This crate holds no transport of its own — mounting `serve`'s result
//! onto an actual HTTP route (axum, actix, a Lambda handler) is left to
//! the caller.

mod options;

pub use options::ServeOptions;

pub use workflow_runtime_core::{
    default_initial_payload_parser, serve as serve_raw, AuthOutcome, BrokerClient, BrokerError,
    CallOptions, FailureFunction, FinishCondition, Headers, InitialPayloadParser, PublishRequest,
    PublishResponse, Result, ServeResponse, SignatureVerifier, SleepUntilTarget, WorkflowContext,
    WorkflowError, WorkflowFailure, WorkflowFunction,
};
pub use workflow_runtime_broker::{HttpBrokerClient, JwtSignatureVerifier};

use std::sync::Arc;

use workflow_runtime_core::Headers as CoreHeaders;

/// Runs one invocation of a workflow route: parses `body` against
/// `headers`, replays or submits the next step of `func`, and returns the
/// plain response a framework adapter should send back.
///
/// `workflow_url` should be the route's own absolute URL. When
/// `options.url_override` is set, only its scheme and authority (host and
/// port) replace `workflow_url`'s — the incoming request's path and query
/// are kept, since the override exists to correct what a reverse proxy or
/// load balancer does to the externally visible host, not to redirect the
/// route somewhere else.
pub async fn serve(
    options: ServeOptions,
    workflow_url: String,
    headers: CoreHeaders,
    body: String,
    func: WorkflowFunction,
) -> ServeResponse {
    let url_override = options.url_override.clone();
    let config = options.into_config();
    let effective_url = match url_override {
        Some(base) => rewrite_scheme_and_authority(&workflow_url, &base),
        None => workflow_url,
    };
    serve_raw(&config, effective_url, headers, body, func).await
}

/// Returns the `scheme://host[:port]` prefix of `url` (everything before
/// the path that follows it, if any).
fn scheme_and_authority(url: &str) -> &str {
    match url.find("://") {
        Some(scheme_end) => {
            let authority_start = scheme_end + 3;
            match url[authority_start..].find('/') {
                Some(path_start) => &url[..authority_start + path_start],
                None => url,
            }
        }
        None => url,
    }
}

/// Replaces `url`'s scheme and authority with `base`'s, keeping `url`'s
/// path and query untouched.
fn rewrite_scheme_and_authority(url: &str, base: &str) -> String {
    let original_authority = scheme_and_authority(url);
    let override_authority = scheme_and_authority(base);
    format!("{override_authority}{}", &url[original_authority.len()..])
}

/// Convenience constructor for a [`WorkflowFunction`] from any closure
/// with the right shape, so callers don't have to spell out the
/// `Pin<Box<dyn Future...>>` machinery themselves.
pub fn workflow_fn<F, Fut>(func: F) -> WorkflowFunction
where
    F: Fn(Arc<WorkflowContext>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(func(ctx)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_fn_adapts_a_plain_closure() {
        let func = workflow_fn(|_ctx| async move { Ok(()) });
        // Just exercises the generic bound; the real behavior is covered by
        // workflow-runtime-core's serve() tests.
        let _: WorkflowFunction = func;
    }

    #[test]
    fn url_override_replaces_authority_but_keeps_path_and_query() {
        let rewritten = rewrite_scheme_and_authority(
            "https://internal.local:8080/workflows/my-route?x=1",
            "https://public.example.com",
        );
        assert_eq!(rewritten, "https://public.example.com/workflows/my-route?x=1");
    }

    #[test]
    fn url_override_with_no_path_leaves_nothing_to_keep() {
        let rewritten = rewrite_scheme_and_authority("https://internal.local", "https://public.example.com");
        assert_eq!(rewritten, "https://public.example.com");
    }
}
