// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [`WorkflowContext`]: the façade user workflow functions hold onto. Every
//! method here either replays a cached result or submits a new step and
//! returns `Err(WorkflowError::Aborted)`, which the serve loop translates
//! into a plain 200 response.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::executor::AutoExecutor;
use crate::headers::Headers;
use crate::step::{HttpMethod, LazyStep};

/// A point in time accepted by [`WorkflowContext::sleep_until`]: either a
/// raw epoch-seconds number or a `chrono` timestamp.
pub enum SleepUntilTarget {
    EpochSeconds(i64),
    DateTime(DateTime<Utc>),
}

impl From<i64> for SleepUntilTarget {
    fn from(value: i64) -> Self {
        SleepUntilTarget::EpochSeconds(value)
    }
}

impl From<DateTime<Utc>> for SleepUntilTarget {
    fn from(value: DateTime<Utc>) -> Self {
        SleepUntilTarget::DateTime(value)
    }
}

/// Options accepted by [`WorkflowContext::call`], mirroring the Call step
/// fields carried on the wire.
#[derive(Default)]
pub struct CallOptions {
    pub method: HttpMethod,
    pub body: Option<Value>,
    pub headers: HashMap<String, String>,
    pub retries: u32,
    pub timeout: Option<Value>,
}

impl Default for HttpMethod {
    fn default() -> Self {
        HttpMethod::GET
    }
}

/// The handle passed to every workflow function. Wraps an [`AutoExecutor`]
/// behind a mutex so it can be shared with user code that may itself be
/// `Send` across an `.await` without giving out `&mut` directly.
pub struct WorkflowContext {
    executor: Mutex<AutoExecutor>,
    pub workflow_run_id: String,
    pub initial_payload: Value,
}

impl WorkflowContext {
    pub fn new(executor: AutoExecutor, workflow_run_id: String, initial_payload: Value) -> Arc<Self> {
        Arc::new(WorkflowContext {
            executor: Mutex::new(executor),
            workflow_run_id,
            initial_payload,
        })
    }

    /// Runs `func` durably: on replay, returns the cached result without
    /// calling `func` again; on first execution, calls `func`, submits the
    /// result to the broker, and aborts this invocation.
    pub async fn run<F, Fut, T>(&self, step_name: &str, func: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, String>> + Send + 'static,
        T: Serialize + serde::de::DeserializeOwned + Send + 'static,
    {
        let fut = Box::pin(async move {
            func().await.map(|value| {
                serde_json::to_value(value).unwrap_or(Value::Null)
            })
        });
        let lazy = LazyStep::Run {
            step_name: step_name.to_string(),
            func: fut,
        };
        let out = self.executor.lock().await.add_step(lazy).await?;
        Ok(serde_json::from_value(out)?)
    }

    /// Sleeps for `seconds`, durably: the broker redelivers this
    /// invocation once the delay elapses.
    pub async fn sleep(&self, step_name: &str, seconds: u64) -> Result<()> {
        let lazy = LazyStep::SleepFor {
            step_name: step_name.to_string(),
            seconds: Value::from(seconds),
        };
        self.executor.lock().await.add_step(lazy).await?;
        Ok(())
    }

    /// Sleeps until an absolute point in time.
    pub async fn sleep_until(&self, step_name: &str, target: impl Into<SleepUntilTarget>) -> Result<()> {
        let epoch_seconds = match target.into() {
            SleepUntilTarget::EpochSeconds(s) => s,
            SleepUntilTarget::DateTime(dt) => dt.timestamp(),
        };
        let lazy = LazyStep::SleepUntil {
            step_name: step_name.to_string(),
            epoch_seconds,
        };
        self.executor.lock().await.add_step(lazy).await?;
        Ok(())
    }

    /// Delegates an HTTP request to the broker, which performs it on this
    /// process's behalf and redelivers the result through the callback
    /// path, so the workflow invocation never blocks on a third-party
    /// response.
    ///
    /// On replay, the cached `out` is the `{status, body, header}` record
    /// the callback handler built; `body` is usually a JSON-encoded
    /// string, so this attempts one more JSON decode of it and returns it
    /// as-is if that fails.
    pub async fn call(&self, step_name: &str, url: &str, options: CallOptions) -> Result<Value> {
        let mut headers = Headers::from_pairs(options.headers.clone());
        if headers.get("content-type").is_none() {
            headers.insert("Content-Type".to_string(), "application/json".to_string());
        }
        let lazy = LazyStep::Call {
            step_name: step_name.to_string(),
            url: url.to_string(),
            method: options.method,
            body: options.body,
            headers: options.headers,
            retries: options.retries,
            timeout: options.timeout,
        };
        let out = self.executor.lock().await.add_step(lazy).await?;
        Ok(decode_call_response(out))
    }

    /// Tells the broker to stop delivering any further messages for this
    /// run. Unlike `run`/`sleep`/`call`, this does not abort the
    /// invocation; it is meant to be awaited just before returning.
    pub async fn cancel(&self) -> Result<()> {
        self.executor.lock().await.cleanup(true).await
    }

    /// Deletes the run's queue state after a successful completion, so the
    /// broker does not keep retrying a workflow that already finished.
    pub(crate) async fn cleanup_on_success(&self) -> Result<()> {
        self.executor.lock().await.cleanup(false).await
    }
}

/// Attempts one JSON decode of a cached Call step's `body` field; returns
/// the record unchanged (or untouched) if `out` isn't the expected shape
/// or `body` doesn't parse as JSON.
fn decode_call_response(out: Value) -> Value {
    let Some(obj) = out.as_object() else {
        return out;
    };
    let Some(Value::String(body)) = obj.get("body") else {
        return out;
    };
    match serde_json::from_str::<Value>(body) {
        Ok(decoded) => {
            let mut obj = obj.clone();
            obj.insert("body".to_string(), decoded);
            Value::Object(obj)
        }
        Err(_) => out,
    }
}
