// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The authentication dry-run: execute the user's workflow function against
//! a trap context that aborts on the very first step it authors, without
//! ever touching history or the broker. This distinguishes a genuine
//! workflow invocation (the function reaches at least one step) from a
//! request that merely hit the route without a valid run (the function
//! runs to completion, or fails, before authoring anything).

use std::sync::Arc;

use serde_json::Value;

use crate::broker::BrokerClient;
use crate::context::WorkflowContext;
use crate::executor::AutoExecutor;

/// Outcome of the auth dry-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The user function authored a step before returning: this looks like
    /// a real workflow, proceed with normal execution.
    StepFound,
    /// The user function returned (successfully or not) without ever
    /// authoring a step: reject the request.
    RunEnded,
}

/// Runs `func` against a disabled context and reports which of the two
/// outcomes above occurred. `func` must be the exact same workflow
/// function the real invocation will run, so that whatever step it
/// authors first is a faithful predictor of the real run.
///
/// Any error other than the trap context's abort sentinel propagates
/// unchanged rather than being folded into [`AuthOutcome::RunEnded`].
pub async fn try_authentication<F, Fut>(
    broker: Arc<dyn BrokerClient>,
    initial_payload: Value,
    func: F,
) -> crate::error::Result<AuthOutcome>
where
    F: FnOnce(Arc<WorkflowContext>) -> Fut,
    Fut: std::future::Future<Output = crate::error::Result<()>>,
{
    let executor = AutoExecutor::new_disabled(broker);
    let ctx = WorkflowContext::new(executor, String::new(), initial_payload);

    match func(ctx).await {
        Ok(()) => Ok(AuthOutcome::RunEnded),
        Err(e) if e.is_aborted() => Ok(AuthOutcome::StepFound),
        Err(e) => Err(e),
    }
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

    #[tokio::test]
    async fn function_that_authors_a_step_is_accepted() {
        let outcome = try_authentication(Arc::new(DummyBroker), Value::Null, |ctx| async move {
            let _: i64 = ctx.run("step1", || async { Ok(1) }).await?;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(outcome, AuthOutcome::StepFound);
    }

    #[tokio::test]
    async fn function_that_returns_without_a_step_is_rejected() {
        let outcome = try_authentication(Arc::new(DummyBroker), Value::Null, |_ctx| async move { Ok(()) })
            .await
            .unwrap();
        assert_eq!(outcome, AuthOutcome::RunEnded);
    }

    #[tokio::test]
    async fn other_errors_propagate_instead_of_being_treated_as_run_ended() {
        let err = try_authentication(Arc::new(DummyBroker), Value::Null, |_ctx| async move {
            Err(crate::error::WorkflowError::Configuration("bad config".to_string()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, crate::error::WorkflowError::Configuration(_)));
    }
}
