// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The step data model: resolved [`Step`] records as they travel the wire,
//! and the [`LazyStep`] descriptors user code builds before they are
//! resolved into one.

use std::collections::HashMap;
use std::fmt;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::NO_CONCURRENCY;
use crate::error::{Result, WorkflowError};

/// The kind of durable unit of work a [`Step`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepType {
    Initial,
    Run,
    SleepFor,
    SleepUntil,
    Call,
    Wait,
    Notify,
}

impl StepType {
    /// Parses the wire representation, used when validating callback
    /// metadata headers which carry the type as a bare string.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Initial" => Some(StepType::Initial),
            "Run" => Some(StepType::Run),
            "SleepFor" => Some(StepType::SleepFor),
            "SleepUntil" => Some(StepType::SleepUntil),
            "Call" => Some(StepType::Call),
            "Wait" => Some(StepType::Wait),
            "Notify" => Some(StepType::Notify),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Initial => "Initial",
            StepType::Run => "Run",
            StepType::SleepFor => "SleepFor",
            StepType::SleepUntil => "SleepUntil",
            StepType::Call => "Call",
            StepType::Wait => "Wait",
            StepType::Notify => "Notify",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An HTTP method a Call step may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    GET,
    POST,
    PUT,
    DELETE,
    PATCH,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpMethod::GET => "GET",
            HttpMethod::POST => "POST",
            HttpMethod::PUT => "PUT",
            HttpMethod::DELETE => "DELETE",
            HttpMethod::PATCH => "PATCH",
        };
        f.write_str(s)
    }
}

/// A resolved step record, either decoded from broker-delivered history or
/// produced by materialising a [`LazyStep`] before submission.
///
/// Field names are renamed to the wire's camelCase form so this struct can
/// be serialized directly as the body of a non-Call broker submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub step_id: i64,
    pub step_name: String,
    pub step_type: StepType,
    pub concurrent: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub out: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sleep_for: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sleep_until: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target_step: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub call_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub call_method: Option<HttpMethod>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub call_body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub call_headers: Option<HashMap<String, String>>,
}

impl Step {
    /// Builds the synthetic position-0 step whose `out` is the raw initial
    /// payload verbatim (no JSON parsing applied at this layer, per the
    /// data model invariant).
    pub fn initial(raw_initial_payload: &str) -> Self {
        Step {
            step_id: 0,
            step_name: "init".to_string(),
            step_type: StepType::Initial,
            concurrent: NO_CONCURRENCY,
            out: Some(Value::String(raw_initial_payload.to_string())),
            sleep_for: None,
            sleep_until: None,
            target_step: None,
            call_url: None,
            call_method: None,
            call_body: None,
            call_headers: None,
        }
    }
}

/// A future that resolves a [`LazyStep::Run`]'s user function to a
/// JSON-encodable value. Boxed so `LazyStep` does not need to be generic
/// over every user closure's concrete future type.
pub type RunFuture = BoxFuture<'static, std::result::Result<Value, String>>;

/// A not-yet-resolved step descriptor produced by [`crate::context::WorkflowContext`]
/// methods. Each variant knows how to turn itself into a resolved [`Step`]
/// given the assigned `(concurrent, step_id)`.
pub enum LazyStep {
    Run {
        step_name: String,
        func: RunFuture,
    },
    SleepFor {
        step_name: String,
        seconds: Value,
    },
    SleepUntil {
        step_name: String,
        epoch_seconds: i64,
    },
    Call {
        step_name: String,
        url: String,
        method: HttpMethod,
        body: Option<Value>,
        headers: HashMap<String, String>,
        retries: u32,
        timeout: Option<Value>,
    },
}

impl LazyStep {
    /// Name every variant carries; used for determinism checks.
    pub fn step_name(&self) -> &str {
        match self {
            LazyStep::Run { step_name, .. } => step_name,
            LazyStep::SleepFor { step_name, .. } => step_name,
            LazyStep::SleepUntil { step_name, .. } => step_name,
            LazyStep::Call { step_name, .. } => step_name,
        }
    }

    /// Type tag every variant carries; used for determinism checks.
    pub fn step_type(&self) -> StepType {
        match self {
            LazyStep::Run { .. } => StepType::Run,
            LazyStep::SleepFor { .. } => StepType::SleepFor,
            LazyStep::SleepUntil { .. } => StepType::SleepUntil,
            LazyStep::Call { .. } => StepType::Call,
        }
    }

    /// Validates that a step name is non-empty, per the invariant that
    /// creating a step with an empty name is a configuration error.
    pub fn validate_name(step_name: &str) -> Result<()> {
        if step_name.is_empty() {
            return Err(WorkflowError::Configuration(
                "a workflow step name cannot be empty; please provide a name for your workflow step"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Resolves this descriptor into a [`Step`] record, running the user
    /// function for a `Run` step. For `Call` steps no `out` is populated:
    /// the result arrives later through the callback path.
    pub async fn get_result_step(self, concurrent: i64, step_id: i64) -> Result<Step> {
        match self {
            LazyStep::Run { step_name, func } => {
                let out = func.await.map_err(|message| WorkflowError::User {
                    class: "Error".to_string(),
                    message,
                })?;
                Ok(Step {
                    step_id,
                    step_name,
                    step_type: StepType::Run,
                    concurrent,
                    out: Some(out),
                    sleep_for: None,
                    sleep_until: None,
                    target_step: None,
                    call_url: None,
                    call_method: None,
                    call_body: None,
                    call_headers: None,
                })
            }
            LazyStep::SleepFor { step_name, seconds } => Ok(Step {
                step_id,
                step_name,
                step_type: StepType::SleepFor,
                concurrent,
                out: None,
                sleep_for: Some(seconds),
                sleep_until: None,
                target_step: None,
                call_url: None,
                call_method: None,
                call_body: None,
                call_headers: None,
            }),
            LazyStep::SleepUntil {
                step_name,
                epoch_seconds,
            } => Ok(Step {
                step_id,
                step_name,
                step_type: StepType::SleepUntil,
                concurrent,
                out: None,
                sleep_for: None,
                sleep_until: Some(epoch_seconds),
                target_step: None,
                call_url: None,
                call_method: None,
                call_body: None,
                call_headers: None,
            }),
            LazyStep::Call {
                step_name,
                url,
                method,
                body,
                headers,
                ..
            } => Ok(Step {
                step_id,
                step_name,
                step_type: StepType::Call,
                concurrent,
                out: None,
                sleep_for: None,
                sleep_until: None,
                target_step: None,
                call_url: Some(url),
                call_method: Some(method),
                call_body: body,
                call_headers: Some(headers),
            }),
        }
    }
}
