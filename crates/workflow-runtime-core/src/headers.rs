// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Incoming header storage and the outbound header builder.
//!
//! The header builder is the single source of truth for wire format: every
//! header name below is pinned literally, and tests in this module assert
//! on the exact set produced for each step shape.

use std::collections::HashMap;

use crate::constants::*;
use crate::step::{HttpMethod, Step, StepType};

/// A case-insensitive bag of HTTP headers.
///
/// Framework adapters (out of scope for this crate) build one of these
/// from whatever request type their framework hands them; everything
/// downstream only ever sees a [`Headers`].
#[derive(Debug, Clone, Default)]
pub struct Headers {
    lower_to_value: HashMap<String, String>,
    original_case: HashMap<String, String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut headers = Headers::new();
        for (k, v) in pairs {
            headers.insert(k.into(), v.into());
        }
        headers
    }

    pub fn insert(&mut self, name: String, value: String) {
        let lower = name.to_ascii_lowercase();
        self.original_case.insert(lower.clone(), name);
        self.lower_to_value.insert(lower, value);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.lower_to_value
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.lower_to_value.is_empty()
    }

    /// Iterates `(original-case name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.lower_to_value.iter().map(|(lower, value)| {
            let original = self
                .original_case
                .get(lower)
                .map(String::as_str)
                .unwrap_or(lower.as_str());
            (original, value.as_str())
        })
    }

    /// Drops protocol/platform headers that must never be forwarded to the
    /// broker or re-exposed to user code.
    pub fn recreate_user_headers(&self) -> Headers {
        let mut out = Headers::new();
        for (name, value) in self.iter() {
            let lower = name.to_ascii_lowercase();
            let stripped = STRIPPED_HEADER_PREFIXES
                .iter()
                .any(|prefix| lower.starts_with(prefix))
                || STRIPPED_HEADER_NAMES.contains(&lower.as_str());
            if !stripped {
                out.insert(name.to_string(), value.to_string());
            }
        }
        out
    }
}

/// Inputs the header builder needs beyond the step itself: everything that
/// is constant across every submission within one invocation.
pub struct HeaderContext<'a> {
    pub workflow_run_id: &'a str,
    pub workflow_url: &'a str,
    pub user_headers: &'a Headers,
    pub retries: u32,
    /// Per-call retries (`LazyStep::Call::retries`), consulted only when
    /// the step being submitted is a Call step. Defaults to
    /// [`DEFAULT_CALL_RETRIES`] when `None`, independent of `retries`
    /// (which governs ordinary step retries, not Call steps).
    pub call_retries: Option<u32>,
    pub failure_url: Option<&'a str>,
}

/// Builds the exact outbound header set for one broker submission.
///
/// `init` selects `Upstash-Workflow-Init: true|false`; pass `step = None`
/// only for the first-invocation publish.
pub fn build_headers(ctx: &HeaderContext<'_>, init: bool, step: Option<&Step>) -> Headers {
    let mut headers = Headers::new();
    headers.insert(
        WORKFLOW_INIT_HEADER.to_string(),
        if init { "true" } else { "false" }.to_string(),
    );
    headers.insert(WORKFLOW_ID_HEADER.to_string(), ctx.workflow_run_id.to_string());
    headers.insert(WORKFLOW_URL_HEADER.to_string(), ctx.workflow_url.to_string());

    let is_call = matches!(step, Some(s) if s.step_type == StepType::Call);
    headers.insert(
        WORKFLOW_FEATURE_HEADER.to_string(),
        if is_call {
            FEATURE_SET_CALL
        } else {
            FEATURE_SET_DEFAULT
        }
        .to_string(),
    );

    if !is_call {
        headers.insert(
            format!("{FORWARD_PREFIX}{WORKFLOW_PROTOCOL_VERSION_HEADER}"),
            WORKFLOW_PROTOCOL_VERSION.to_string(),
        );
    }

    if is_call {
        let call_retries = ctx.call_retries.unwrap_or(DEFAULT_CALL_RETRIES);
        headers.insert("Upstash-Retries".to_string(), call_retries.to_string());
        if call_retries > 0 {
            headers.insert("Upstash-Callback-Retries".to_string(), call_retries.to_string());
            headers.insert(
                "Upstash-Failure-Callback-Retries".to_string(),
                call_retries.to_string(),
            );
        }
    } else if ctx.retries != DEFAULT_RETRIES {
        headers.insert("Upstash-Retries".to_string(), ctx.retries.to_string());
        headers.insert(
            "Upstash-Failure-Callback-Retries".to_string(),
            ctx.retries.to_string(),
        );
    }

    // User headers are forwarded to the actual request the broker makes on
    // this submission (the workflow endpoint for ordinary steps, the
    // external URL for Call steps) as `Upstash-Forward-X`, unconditionally,
    // and mirrored as `Upstash-Failure-Callback-Forward-X` so the failure
    // function would see them too. `Upstash-Callback-Forward-X` is a
    // distinct namespace reserved for the step metadata the broker must
    // echo back on the *callback* invocation (see the Call step additions
    // below) — not a second copy of user headers.
    for (name, value) in ctx.user_headers.iter() {
        headers.insert(format!("{FORWARD_PREFIX}{name}"), value.to_string());
        headers.insert(format!("{FAILURE_CALLBACK_FORWARD_PREFIX}{name}"), value.to_string());
    }

    if let Some(failure_url) = ctx.failure_url {
        headers.insert(
            "Upstash-Failure-Callback-Workflow-RunId".to_string(),
            ctx.workflow_run_id.to_string(),
        );
        headers.insert(
            "Upstash-Failure-Callback-Workflow-Init".to_string(),
            "false".to_string(),
        );
        headers.insert(
            "Upstash-Failure-Callback-Workflow-Url".to_string(),
            ctx.workflow_url.to_string(),
        );
        headers.insert(
            "Upstash-Failure-Callback-Workflow-Calltype".to_string(),
            "failureCall".to_string(),
        );
        headers.insert(
            "Upstash-Failure-Callback-Forward-Upstash-Workflow-Is-Failure".to_string(),
            "true".to_string(),
        );
        headers.insert(
            "Upstash-Failure-Callback-Forward-Upstash-Workflow-Failure-Callback".to_string(),
            "true".to_string(),
        );
        headers.insert(
            "Upstash-Failure-Callback".to_string(),
            failure_url.to_string(),
        );

        if is_call {
            headers.insert(
                "Upstash-Callback-Failure-Callback-Workflow-RunId".to_string(),
                ctx.workflow_run_id.to_string(),
            );
            headers.insert(
                "Upstash-Callback-Failure-Callback-Workflow-Init".to_string(),
                "false".to_string(),
            );
            headers.insert(
                "Upstash-Callback-Failure-Callback-Workflow-Url".to_string(),
                ctx.workflow_url.to_string(),
            );
            headers.insert(
                "Upstash-Callback-Failure-Callback-Workflow-Calltype".to_string(),
                "failureCall".to_string(),
            );
            headers.insert(
                "Upstash-Callback-Failure-Callback-Forward-Upstash-Workflow-Is-Failure"
                    .to_string(),
                "true".to_string(),
            );
            headers.insert(
                "Upstash-Callback-Failure-Callback-Forward-Upstash-Workflow-Failure-Callback"
                    .to_string(),
                "true".to_string(),
            );
            headers.insert(
                "Upstash-Callback-Failure-Callback".to_string(),
                failure_url.to_string(),
            );
        }
    }

    if let Some(step) = step {
        if is_call {
            let content_type = ctx
                .user_headers
                .get("content-type")
                .map(str::to_string)
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

            headers.insert("Upstash-Callback".to_string(), ctx.workflow_url.to_string());
            headers.insert(
                "Upstash-Callback-Workflow-RunId".to_string(),
                ctx.workflow_run_id.to_string(),
            );
            headers.insert(
                "Upstash-Callback-Workflow-CallType".to_string(),
                "fromCallback".to_string(),
            );
            headers.insert(
                "Upstash-Callback-Workflow-Init".to_string(),
                "false".to_string(),
            );
            headers.insert(
                "Upstash-Callback-Workflow-Url".to_string(),
                ctx.workflow_url.to_string(),
            );
            headers.insert(
                "Upstash-Callback-Feature-Set".to_string(),
                FEATURE_SET_DEFAULT.to_string(),
            );
            headers.insert(
                "Upstash-Callback-Forward-Upstash-Workflow-Callback".to_string(),
                "true".to_string(),
            );
            headers.insert(
                "Upstash-Callback-Forward-Upstash-Workflow-StepId".to_string(),
                step.step_id.to_string(),
            );
            headers.insert(
                "Upstash-Callback-Forward-Upstash-Workflow-StepName".to_string(),
                step.step_name.clone(),
            );
            headers.insert(
                "Upstash-Callback-Forward-Upstash-Workflow-StepType".to_string(),
                step.step_type.to_string(),
            );
            headers.insert(
                "Upstash-Callback-Forward-Upstash-Workflow-Concurrent".to_string(),
                step.concurrent.to_string(),
            );
            headers.insert(
                "Upstash-Callback-Forward-Upstash-Workflow-ContentType".to_string(),
                content_type,
            );
            headers.insert(
                "Upstash-Workflow-CallType".to_string(),
                "toCallback".to_string(),
            );
        }
    }

    headers
}

/// Extends [`build_headers`] with the per-call timeout header, which lives
/// on the still-lazy call descriptor rather than the resolved [`Step`].
pub fn apply_call_timeout(headers: &mut Headers, timeout: Option<&str>) {
    if let Some(timeout) = timeout {
        headers.insert("Upstash-Timeout".to_string(), timeout.to_string());
    }
}

pub fn http_method_str(method: HttpMethod) -> &'static str {
    match method {
        HttpMethod::GET => "GET",
        HttpMethod::POST => "POST",
        HttpMethod::PUT => "PUT",
        HttpMethod::DELETE => "DELETE",
        HttpMethod::PATCH => "PATCH",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepType;

    fn ctx<'a>(user_headers: &'a Headers, failure_url: Option<&'a str>) -> HeaderContext<'a> {
        HeaderContext {
            workflow_run_id: "wfr_test",
            workflow_url: "https://example.com/workflow",
            user_headers,
            retries: DEFAULT_RETRIES,
            call_retries: None,
            failure_url,
        }
    }

    #[test]
    fn non_call_step_has_default_feature_set() {
        let user_headers = Headers::new();
        let step = Step {
            step_id: 2,
            step_name: "step2".to_string(),
            step_type: StepType::Run,
            concurrent: NO_CONCURRENCY,
            out: Some(serde_json::json!("xy")),
            sleep_for: None,
            sleep_until: None,
            target_step: None,
            call_url: None,
            call_method: None,
            call_body: None,
            call_headers: None,
        };
        let c = ctx(&user_headers, None);
        let headers = build_headers(&c, false, Some(&step));
        assert_eq!(headers.get(WORKFLOW_FEATURE_HEADER), Some(FEATURE_SET_DEFAULT));
        assert_eq!(
            headers.get(&format!("{FORWARD_PREFIX}{WORKFLOW_PROTOCOL_VERSION_HEADER}")),
            Some(WORKFLOW_PROTOCOL_VERSION)
        );
    }

    #[test]
    fn call_step_has_callback_family() {
        let mut user_headers = Headers::new();
        user_headers.insert("my-header".to_string(), "my-value".to_string());
        let step = Step {
            step_id: 1,
            step_name: "my-step".to_string(),
            step_type: StepType::Call,
            concurrent: NO_CONCURRENCY,
            out: None,
            sleep_for: None,
            sleep_until: None,
            target_step: None,
            call_url: Some("https://ext".to_string()),
            call_method: Some(HttpMethod::PATCH),
            call_body: Some(serde_json::json!("request-body")),
            call_headers: Some(HashMap::new()),
        };
        let mut c = ctx(&user_headers, None);
        c.call_retries = Some(10);
        let headers = build_headers(&c, false, Some(&step));
        assert_eq!(headers.get(WORKFLOW_FEATURE_HEADER), Some(FEATURE_SET_CALL));
        assert_eq!(headers.get("Upstash-Callback"), Some("https://example.com/workflow"));
        assert_eq!(headers.get("Upstash-Workflow-CallType"), Some("toCallback"));
        assert_eq!(headers.get("Upstash-Retries"), Some("10"));
        assert_eq!(headers.get("Upstash-Callback-Retries"), Some("10"));
        assert_eq!(headers.get("Upstash-Failure-Callback-Retries"), Some("10"));
        assert_eq!(
            headers.get("Upstash-Callback-Forward-Upstash-Workflow-StepId"),
            Some("1")
        );
        assert_eq!(
            headers.get("Upstash-Callback-Forward-Upstash-Workflow-StepName"),
            Some("my-step")
        );
        assert_eq!(
            headers.get("Upstash-Callback-Forward-Upstash-Workflow-StepType"),
            Some("Call")
        );
        assert_eq!(headers.get("Upstash-Forward-my-header"), Some("my-value"));
    }

    #[test]
    fn call_step_default_retries_is_zero_not_general_default() {
        let user_headers = Headers::new();
        let step = Step {
            step_id: 1,
            step_name: "my-step".to_string(),
            step_type: StepType::Call,
            concurrent: NO_CONCURRENCY,
            out: None,
            sleep_for: None,
            sleep_until: None,
            target_step: None,
            call_url: Some("https://ext".to_string()),
            call_method: Some(HttpMethod::GET),
            call_body: None,
            call_headers: Some(HashMap::new()),
        };
        // ctx.retries is left at the workflow-level DEFAULT_RETRIES (3), but
        // since call_retries is None the Call step must still advertise 0.
        let c = ctx(&user_headers, None);
        let headers = build_headers(&c, false, Some(&step));
        assert_eq!(headers.get("Upstash-Retries"), Some("0"));
        assert_eq!(headers.get("Upstash-Callback-Retries"), None);
    }

    #[test]
    fn failure_url_emits_failure_family() {
        let user_headers = Headers::new();
        let c = ctx(&user_headers, Some("https://example.com/failure"));
        let headers = build_headers(&c, false, None);
        assert_eq!(
            headers.get("Upstash-Failure-Callback"),
            Some("https://example.com/failure")
        );
        assert_eq!(
            headers.get("Upstash-Failure-Callback-Workflow-Calltype"),
            Some("failureCall")
        );
    }

    #[test]
    fn recreate_user_headers_strips_platform_headers() {
        let mut headers = Headers::new();
        headers.insert("Upstash-Workflow-RunId".to_string(), "x".to_string());
        headers.insert("X-Vercel-Id".to_string(), "y".to_string());
        headers.insert("CF-Connecting-IP".to_string(), "z".to_string());
        headers.insert("Authentication".to_string(), "Bearer s".to_string());
        let stripped = headers.recreate_user_headers();
        assert_eq!(stripped.get("Authentication"), Some("Bearer s"));
        assert_eq!(stripped.get("Upstash-Workflow-RunId"), None);
        assert_eq!(stripped.get("X-Vercel-Id"), None);
        assert_eq!(stripped.get("CF-Connecting-IP"), None);
    }
}
