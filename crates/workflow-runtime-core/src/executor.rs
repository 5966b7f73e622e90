// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The replay engine: for each step user code authors, either return the
//! cached result from history or submit it to the broker and abort.
//!
//! This is the heart of the durable-execution model.
//! Nothing here retains state across invocations; `AutoExecutor` is built
//! fresh from the parsed history on every call and discarded at the end.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::broker::{BrokerClient, PublishRequest};
use crate::constants::*;
use crate::error::{Result, WorkflowError};
use crate::headers::{self, HeaderContext, Headers};
use crate::step::{LazyStep, Step, StepType};

/// Drives step resolution against history and, when the first not-yet-run
/// step is encountered, submits it and signals the caller to abort.
pub struct AutoExecutor {
    steps: Vec<Step>,
    /// Number of real (non-`Initial`) steps already recorded in history.
    non_plan_step_count: usize,
    step_count: usize,
    already_submitted: bool,

    workflow_run_id: String,
    workflow_url: String,
    user_headers: Headers,
    retries: u32,
    failure_url: Option<String>,

    broker: Arc<dyn BrokerClient>,
    /// When set, `add_step` never consults history or the broker: it
    /// aborts on the very first step authored. Used by the auth dry-run
    /// pre-flight, which only cares whether user code reaches a step at
    /// all.
    disabled: bool,
}

impl AutoExecutor {
    pub fn new(
        steps: Vec<Step>,
        workflow_run_id: String,
        workflow_url: String,
        user_headers: Headers,
        retries: u32,
        failure_url: Option<String>,
        broker: Arc<dyn BrokerClient>,
    ) -> Self {
        let non_plan_step_count = steps
            .iter()
            .filter(|s| s.step_type != StepType::Initial)
            .count();
        AutoExecutor {
            steps,
            non_plan_step_count,
            step_count: 0,
            already_submitted: false,
            workflow_run_id,
            workflow_url,
            user_headers,
            retries,
            failure_url,
            broker,
            disabled: false,
        }
    }

    /// Builds a trap executor for the auth dry-run: no history is
    /// consulted and no broker call is ever made.
    pub fn new_disabled(broker: Arc<dyn BrokerClient>) -> Self {
        AutoExecutor {
            steps: vec![Step::initial("")],
            non_plan_step_count: 0,
            step_count: 0,
            already_submitted: false,
            workflow_run_id: String::new(),
            workflow_url: String::new(),
            user_headers: Headers::new(),
            retries: DEFAULT_RETRIES,
            failure_url: None,
            broker,
            disabled: true,
        }
    }

    /// The decoded initial payload, always at history position 0.
    pub fn initial_payload(&self) -> Option<&Value> {
        self.steps.first().and_then(|s| s.out.as_ref())
    }

    /// Resolves one authored step: returns its cached output if history
    /// already has it, otherwise submits it and returns
    /// [`WorkflowError::Aborted`].
    pub async fn add_step(&mut self, lazy: LazyStep) -> Result<Value> {
        LazyStep::validate_name(lazy.step_name())?;

        if self.disabled {
            return Err(WorkflowError::Aborted(Box::new(Step::initial(""))));
        }

        self.step_count += 1;
        let position = self.step_count;

        if position <= self.non_plan_step_count {
            let recorded = &self.steps[position];
            if recorded.step_name != lazy.step_name() || recorded.step_type != lazy.step_type() {
                return Err(WorkflowError::DeterminismViolation {
                    position,
                    expected_name: lazy.step_name().to_string(),
                    expected_type: lazy.step_type().to_string(),
                    actual_name: recorded.step_name.clone(),
                    actual_type: recorded.step_type.to_string(),
                });
            }
            debug!(step = %recorded.step_name, position, "replaying cached step result");
            return Ok(recorded.out.clone().unwrap_or(Value::Null));
        }

        if self.already_submitted {
            return Err(WorkflowError::ParallelStepsNotSupported(
                lazy.step_name().to_string(),
            ));
        }
        self.already_submitted = true;

        let (timeout, call_retries) = match &lazy {
            LazyStep::Call { timeout, retries, .. } => {
                (timeout.as_ref().map(value_to_header_str), Some(*retries))
            }
            _ => (None, None),
        };
        let resolved = lazy.get_result_step(NO_CONCURRENCY, position as i64).await?;

        self.submit(&resolved, timeout.as_deref(), call_retries).await?;
        Err(WorkflowError::Aborted(Box::new(resolved)))
    }

    /// Builds and sends the broker submission for a just-resolved step.
    async fn submit(
        &self,
        step: &Step,
        call_timeout: Option<&str>,
        call_retries: Option<u32>,
    ) -> Result<()> {
        let ctx = HeaderContext {
            workflow_run_id: &self.workflow_run_id,
            workflow_url: &self.workflow_url,
            user_headers: &self.user_headers,
            retries: self.retries,
            call_retries,
            failure_url: self.failure_url.as_deref(),
        };
        let mut built_headers = headers::build_headers(&ctx, false, Some(step));
        if step.step_type == StepType::Call {
            headers::apply_call_timeout(&mut built_headers, call_timeout);
        }

        let not_before = if step.concurrent == NO_CONCURRENCY {
            compute_not_before(step)
        } else {
            None
        };

        let (url, method, body) = if step.step_type == StepType::Call {
            (
                step.call_url.clone().unwrap_or_default(),
                step.call_method.map(headers::http_method_str).unwrap_or("GET").to_string(),
                step.call_body.clone().unwrap_or(Value::Null),
            )
        } else {
            (
                self.workflow_url.clone(),
                "POST".to_string(),
                serde_json::to_value(step).map_err(WorkflowError::from)?,
            )
        };

        let request = PublishRequest {
            url,
            method,
            headers: built_headers,
            body,
            not_before,
        };

        // Every step submission goes out as a batch, even a single one:
        // the broker's batch endpoint is the only one this protocol uses
        // to enqueue a step.
        self.broker
            .batch(vec![request])
            .await
            .map_err(|e| WorkflowError::BrokerRequest(e.to_string()))?;

        Ok(())
    }

    /// Tells the broker to stop delivering any further messages for this
    /// run; called once the user function returns successfully, or when
    /// the user explicitly cancels.
    pub async fn cleanup(&self, cancel: bool) -> Result<()> {
        self.broker
            .delete(&self.workflow_run_id, cancel)
            .await
            .map_err(|e| WorkflowError::BrokerRequest(e.to_string()))?;
        Ok(())
    }
}

/// `SleepFor`/`SleepUntil` steps are delivered with a broker-side delay
/// instead of immediately, so the next invocation only fires once the
/// sleep has elapsed.
fn compute_not_before(step: &Step) -> Option<i64> {
    match step.step_type {
        StepType::SleepUntil => step.sleep_until,
        StepType::SleepFor => step.sleep_for.as_ref().and_then(value_to_epoch_offset),
        _ => None,
    }
}

fn value_to_epoch_offset(value: &Value) -> Option<i64> {
    let seconds = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.parse::<i64>().ok()?,
        _ => return None,
    };
    Some(chrono::Utc::now().timestamp() + seconds)
}

fn value_to_header_str(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, PublishResponse};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingBroker {
        published: Mutex<Vec<PublishRequest>>,
    }

    impl RecordingBroker {
        fn new() -> Self {
            RecordingBroker {
                published: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BrokerClient for RecordingBroker {
        async fn publish(
            &self,
            request: PublishRequest,
        ) -> std::result::Result<PublishResponse, BrokerError> {
            self.published.lock().unwrap().push(request);
            Ok(PublishResponse {
                message_id: "msg_1".to_string(),
            })
        }

        async fn batch(
            &self,
            requests: Vec<PublishRequest>,
        ) -> std::result::Result<Vec<PublishResponse>, BrokerError> {
            let mut published = self.published.lock().unwrap();
            let responses = requests
                .into_iter()
                .map(|request| {
                    published.push(request);
                    PublishResponse {
                        message_id: "msg_1".to_string(),
                    }
                })
                .collect();
            Ok(responses)
        }

        async fn delete(&self, _workflow_run_id: &str, _cancel: bool) -> std::result::Result<(), BrokerError> {
            Ok(())
        }
    }

    fn initial_step() -> Step {
        Step::initial("{}")
    }

    #[tokio::test]
    async fn replays_cached_run_step_from_history() {
        let history = vec![
            initial_step(),
            Step {
                step_id: 1,
                step_name: "step1".to_string(),
                step_type: StepType::Run,
                concurrent: NO_CONCURRENCY,
                out: Some(Value::String("cached".to_string())),
                sleep_for: None,
                sleep_until: None,
                target_step: None,
                call_url: None,
                call_method: None,
                call_body: None,
                call_headers: None,
            },
        ];
        let broker = Arc::new(RecordingBroker::new());
        let mut executor = AutoExecutor::new(
            history,
            "wfr_test".to_string(),
            "https://example.com/wf".to_string(),
            Headers::new(),
            DEFAULT_RETRIES,
            None,
            broker.clone(),
        );

        let result = executor
            .add_step(LazyStep::Run {
                step_name: "step1".to_string(),
                func: Box::pin(async { Ok(Value::String("ignored".to_string())) }),
            })
            .await
            .unwrap();

        assert_eq!(result, Value::String("cached".to_string()));
        assert!(broker.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn submits_and_aborts_on_first_undone_step() {
        let history = vec![initial_step()];
        let broker = Arc::new(RecordingBroker::new());
        let mut executor = AutoExecutor::new(
            history,
            "wfr_test".to_string(),
            "https://example.com/wf".to_string(),
            Headers::new(),
            DEFAULT_RETRIES,
            None,
            broker.clone(),
        );

        let err = executor
            .add_step(LazyStep::Run {
                step_name: "step1".to_string(),
                func: Box::pin(async { Ok(Value::String("result".to_string())) }),
            })
            .await
            .unwrap_err();

        assert!(err.is_aborted());
        assert_eq!(broker.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn determinism_violation_on_name_mismatch() {
        let history = vec![
            initial_step(),
            Step {
                step_id: 1,
                step_name: "other-name".to_string(),
                step_type: StepType::Run,
                concurrent: NO_CONCURRENCY,
                out: Some(Value::Null),
                sleep_for: None,
                sleep_until: None,
                target_step: None,
                call_url: None,
                call_method: None,
                call_body: None,
                call_headers: None,
            },
        ];
        let broker = Arc::new(RecordingBroker::new());
        let mut executor = AutoExecutor::new(
            history,
            "wfr_test".to_string(),
            "https://example.com/wf".to_string(),
            Headers::new(),
            DEFAULT_RETRIES,
            None,
            broker,
        );

        let err = executor
            .add_step(LazyStep::Run {
                step_name: "step1".to_string(),
                func: Box::pin(async { Ok(Value::Null) }),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::DeterminismViolation { .. }));
    }

    #[tokio::test]
    async fn second_step_in_same_invocation_is_rejected() {
        let history = vec![initial_step()];
        let broker = Arc::new(RecordingBroker::new());
        let mut executor = AutoExecutor::new(
            history,
            "wfr_test".to_string(),
            "https://example.com/wf".to_string(),
            Headers::new(),
            DEFAULT_RETRIES,
            None,
            broker,
        );

        let _ = executor
            .add_step(LazyStep::Run {
                step_name: "step1".to_string(),
                func: Box::pin(async { Ok(Value::Null) }),
            })
            .await;

        let err = executor
            .add_step(LazyStep::Run {
                step_name: "step2".to_string(),
                func: Box::pin(async { Ok(Value::Null) }),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::ParallelStepsNotSupported(_)));
    }
}
