// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error taxonomy for the workflow engine.

use crate::step::Step;
use thiserror::Error;

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Every way a workflow invocation can fail to produce a normal response.
///
/// [`WorkflowError::Aborted`] is not a failure: it is the internal signal
/// that a step was just submitted to the broker and the invocation should
/// stop and return success. It is threaded through `Result`/`?` instead of
/// being raised as a language-level exception, per spec's suggestion to
/// prefer an explicit control-flow value over unwinding where the host
/// language discourages it. Callers must propagate it with `?`, never
/// match it away.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Raised synchronously while building steps or options, before any
    /// invocation is ever handled.
    #[error("workflow configuration error: {0}")]
    Configuration(String),

    /// `Upstash-Workflow-Sdk-Version` did not match the supported version.
    #[error("incompatible workflow sdk protocol version: expected {expected}, got {got}")]
    IncompatibleProtocolVersion { expected: String, got: String },

    /// Non-first invocation arrived without a run id header.
    #[error("couldn't get workflow id from header")]
    MissingRunId,

    /// Non-first invocation arrived with an empty body.
    #[error("only the first call can have an empty body")]
    EmptyBody,

    /// The (name, type) of an authored step did not match history.
    #[error(
        "incompatible step at position {position}: expected name '{expected_name}' type \
         '{expected_type}', got name '{actual_name}' type '{actual_type}' from the request"
    )]
    DeterminismViolation {
        position: usize,
        expected_name: String,
        expected_type: String,
        actual_name: String,
        actual_type: String,
    },

    /// A second step was authored in the same invocation after one was
    /// already submitted to the broker.
    #[error(
        "parallel step execution is not supported, encountered while submitting step '{0}'"
    )]
    ParallelStepsNotSupported(String),

    /// `Upstash-Signature` failed to verify, or was missing while a
    /// verifier was configured.
    #[error("failed to verify that the workflow request comes from the broker: {0}")]
    SignatureVerification(String),

    /// The broker client returned an error while publishing/batching/deleting.
    #[error("broker request failed: {0}")]
    BrokerRequest(String),

    /// A required field was missing from a callback or failure payload.
    #[error("missing field in callback message: {0}")]
    MissingCallbackField(&'static str),

    /// A failure callback arrived for a workflow with no failure function
    /// configured, or whose auth dry-run rejected it.
    #[error("unauthenticated or unconfigured failure callback")]
    UnauthenticatedFailureCallback,

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An error raised by user code running inside a `run` step.
    #[error("{class}: {message}")]
    User { class: String, message: String },

    /// Internal control-flow signal: a step was just submitted, stop now.
    #[error("aborting workflow after executing step '{}'", .0.step_name)]
    Aborted(Box<Step>),
}

impl WorkflowError {
    /// Builds the `{error, message}` body used for the catch-all 500
    /// response.
    pub fn to_error_body(&self) -> serde_json::Value {
        match self {
            WorkflowError::User { class, message } => serde_json::json!({
                "error": class,
                "message": message,
            }),
            other => serde_json::json!({
                "error": other.class_name(),
                "message": other.to_string(),
            }),
        }
    }

    fn class_name(&self) -> &'static str {
        match self {
            WorkflowError::Configuration(_) => "WorkflowConfigurationError",
            WorkflowError::IncompatibleProtocolVersion { .. } => "WorkflowProtocolError",
            WorkflowError::MissingRunId => "WorkflowProtocolError",
            WorkflowError::EmptyBody => "WorkflowProtocolError",
            WorkflowError::DeterminismViolation { .. } => "WorkflowDeterminismError",
            WorkflowError::ParallelStepsNotSupported(_) => "WorkflowParallelStepsError",
            WorkflowError::SignatureVerification(_) => "WorkflowSignatureError",
            WorkflowError::BrokerRequest(_) => "WorkflowBrokerError",
            WorkflowError::MissingCallbackField(_) => "WorkflowProtocolError",
            WorkflowError::UnauthenticatedFailureCallback => "WorkflowAuthError",
            WorkflowError::Serialization(_) => "WorkflowSerializationError",
            WorkflowError::User { .. } => "Error",
            WorkflowError::Aborted(_) => "WorkflowAbort",
        }
    }

    /// True for the internal abort signal, so callers can special-case it
    /// without pattern-matching the whole enum.
    pub fn is_aborted(&self) -> bool {
        matches!(self, WorkflowError::Aborted(_))
    }
}
