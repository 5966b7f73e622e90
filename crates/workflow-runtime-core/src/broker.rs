// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The broker interface: the only way this crate talks to the outside
//! world. Concrete implementations (an HTTP client, a signature verifier)
//! live in `workflow-runtime-broker`, which depends on this crate rather
//! than the other way around, since these traits describe what the
//! executor *consumes*, not how a given broker happens to be reached.

use async_trait::async_trait;
use serde_json::Value;

use crate::headers::Headers;

/// One message to submit to the broker: either a redelivery of the
/// workflow endpoint itself (the common case) or a direct call to a
/// third-party URL (a `Call` step).
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub url: String,
    pub method: String,
    pub headers: Headers,
    pub body: Value,
    /// Epoch-seconds delay before the broker should deliver this message,
    /// set when the submitted step is sequential.
    pub not_before: Option<i64>,
}

/// The broker's acknowledgement of one publish.
#[derive(Debug, Clone)]
pub struct PublishResponse {
    pub message_id: String,
}

/// Errors a broker implementation can raise; adapters map their own
/// transport errors (reqwest, etc.) into this before returning.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker transport error: {0}")]
    Transport(String),
    #[error("broker rejected the request: {0}")]
    Rejected(String),
}

/// The subset of QStash-like broker operations the executor needs:
/// publish a step, publish several atomically, and delete a run's
/// in-flight messages on completion or cancellation.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn publish(&self, request: PublishRequest) -> std::result::Result<PublishResponse, BrokerError>;

    async fn batch(
        &self,
        requests: Vec<PublishRequest>,
    ) -> std::result::Result<Vec<PublishResponse>, BrokerError>;

    async fn delete(&self, workflow_run_id: &str, cancel: bool) -> std::result::Result<(), BrokerError>;
}

/// Verifies that an incoming request actually came from the broker, via
/// the `Upstash-Signature` JWT.
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    async fn verify(&self, body: &str, signature: &str) -> std::result::Result<(), BrokerError>;
}
