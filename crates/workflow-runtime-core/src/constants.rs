// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire-protocol constants shared by every component in this crate.
//!
//! Every header name, default, and feature flag the broker contract relies
//! on is defined exactly once here so the rest of the crate never spells
//! out a literal header name more than once.

/// Header carrying the workflow run id.
pub const WORKFLOW_ID_HEADER: &str = "Upstash-Workflow-RunId";
/// Header that marks the very first invocation of a run.
pub const WORKFLOW_INIT_HEADER: &str = "Upstash-Workflow-Init";
/// Header carrying the workflow endpoint URL.
pub const WORKFLOW_URL_HEADER: &str = "Upstash-Workflow-Url";
/// Header that marks an invocation as a terminal failure callback.
pub const WORKFLOW_FAILURE_HEADER: &str = "Upstash-Workflow-Is-Failure";
/// Header advertising which optional protocol features this SDK supports.
pub const WORKFLOW_FEATURE_HEADER: &str = "Upstash-Feature-Set";
/// Header present on every non-first invocation, carrying the protocol version.
pub const WORKFLOW_PROTOCOL_VERSION_HEADER: &str = "Upstash-Workflow-Sdk-Version";
/// The only protocol version this crate understands.
pub const WORKFLOW_PROTOCOL_VERSION: &str = "1";

/// Header present on a third-party-call-result invocation.
pub const WORKFLOW_CALLBACK_HEADER: &str = "Upstash-Workflow-Callback";
/// Step metadata echoed back on a callback invocation.
pub const WORKFLOW_CALLBACK_STEP_ID_HEADER: &str = "Upstash-Workflow-StepId";
pub const WORKFLOW_CALLBACK_STEP_NAME_HEADER: &str = "Upstash-Workflow-StepName";
pub const WORKFLOW_CALLBACK_STEP_TYPE_HEADER: &str = "Upstash-Workflow-StepType";
pub const WORKFLOW_CALLBACK_CONCURRENT_HEADER: &str = "Upstash-Workflow-Concurrent";
pub const WORKFLOW_CALLBACK_CONTENT_TYPE_HEADER: &str = "Upstash-Workflow-ContentType";

/// Header carrying the broker's HMAC/JWT signature of the request body.
pub const WORKFLOW_SIGNATURE_HEADER: &str = "Upstash-Signature";

/// Prefix applied to every user header forwarded on redelivery.
pub const FORWARD_PREFIX: &str = "Upstash-Forward-";
/// Prefix applied to user headers forwarded for Call steps.
pub const CALLBACK_FORWARD_PREFIX: &str = "Upstash-Callback-Forward-";
/// Prefix applied to user headers forwarded to the failure callback.
pub const FAILURE_CALLBACK_FORWARD_PREFIX: &str = "Upstash-Failure-Callback-Forward-";

/// Default feature set advertised for ordinary (non-Call) steps.
pub const FEATURE_SET_DEFAULT: &str = "LazyFetch,InitialBody";
/// Feature set advertised when the outbound submission is a Call step.
pub const FEATURE_SET_CALL: &str = "WF_NoDelete,InitialBody";

/// Default `Content-Type` assumed for a Call step's callback payload.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// `concurrent` value meaning "sequential, no fan-out".
pub const NO_CONCURRENCY: i64 = 1;
/// Default number of broker-side retries for a step.
pub const DEFAULT_RETRIES: u32 = 3;
/// Default number of broker-side retries for a Call step's outbound request.
pub const DEFAULT_CALL_RETRIES: u32 = 0;

/// Prefix every generated workflow run id carries.
pub const RUN_ID_PREFIX: &str = "wfr_";
/// Length of the random suffix appended to [`RUN_ID_PREFIX`].
pub const RUN_ID_SUFFIX_LEN: usize = 21;

/// Header name/value-name prefixes that are never forwarded from the
/// incoming user request, because they are either our own protocol
/// headers or platform-injected ones that would leak internal topology.
pub const STRIPPED_HEADER_PREFIXES: &[&str] = &["upstash-workflow-", "x-vercel-", "x-forwarded-"];

/// Exact (lower-cased) header names that are never forwarded.
pub const STRIPPED_HEADER_NAMES: &[&str] = &[
    "cf-connecting-ip",
    "cdn-loop",
    "cf-ew-via",
    "cf-ray",
    "render-proxy-ttl",
];

/// Message returned to the caller on a 400 auth-fail response.
pub const AUTH_FAIL_MESSAGE: &str = "Failed to authenticate Workflow request. If this is unexpected, see the caveat https://upstash.com/docs/workflow/basics/caveats#avoid-non-deterministic-code-outside-context-run";
