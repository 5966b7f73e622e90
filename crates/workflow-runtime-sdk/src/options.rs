// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `ServeOptions`: the user-facing configuration surface, a builder-style
//! options struct with chainable `with_*` setters and an `from_env`
//! constructor.

use std::collections::HashMap;
use std::sync::Arc;

use workflow_runtime_core::{
    default_initial_payload_parser, BrokerClient, FailureFunction, InitialPayloadParser,
    ServeConfig, SignatureVerifier, WorkflowError,
};
use workflow_runtime_broker::{HttpBrokerClient, JwtSignatureVerifier};

/// Every knob a caller can set before mounting a workflow route.
///
/// Construct with [`ServeOptions::new`] (explicit broker) or
/// [`ServeOptions::from_env`] (reads `QSTASH_TOKEN`,
/// `QSTASH_CURRENT_SIGNING_KEY`, `QSTASH_NEXT_SIGNING_KEY`,
/// `UPSTASH_WORKFLOW_URL`), then chain `with_*` calls to override
/// individual fields.
pub struct ServeOptions {
    broker: Arc<dyn BrokerClient>,
    initial_payload_parser: InitialPayloadParser,
    verifier: Option<Arc<dyn SignatureVerifier>>,
    retries: u32,
    failure_function: Option<FailureFunction>,
    failure_url: Option<String>,
    /// Overrides the scheme and authority of the workflow URL the caller
    /// otherwise derives from the incoming request, keeping its path and
    /// query untouched.
    pub url_override: Option<String>,
}

impl ServeOptions {
    /// Starts from an explicit broker client with every other option at
    /// its default.
    pub fn new(broker: Arc<dyn BrokerClient>) -> Self {
        ServeOptions {
            broker,
            initial_payload_parser: default_initial_payload_parser(),
            verifier: None,
            retries: workflow_runtime_core::constants::DEFAULT_RETRIES,
            failure_function: None,
            failure_url: None,
            url_override: None,
        }
    }

    /// Builds broker and (if the signing keys are present) verifier from
    /// environment variables, matching `_process_options`'s environment
    /// map default of `std::env::vars().collect()`.
    pub fn from_env() -> Result<Self, WorkflowError> {
        Self::from_env_map(&std::env::vars().collect())
    }

    /// Same as [`Self::from_env`] but reads from a supplied map instead of
    /// the process environment, so callers (and tests) can inject values
    /// without mutating global state.
    pub fn from_env_map(env: &HashMap<String, String>) -> Result<Self, WorkflowError> {
        let token = env
            .get("QSTASH_TOKEN")
            .cloned()
            .ok_or_else(|| WorkflowError::Configuration("QSTASH_TOKEN is not set".to_string()))?;
        let broker: Arc<dyn BrokerClient> = Arc::new(HttpBrokerClient::new(token));

        let mut options = ServeOptions::new(broker);
        options.url_override = env.get("UPSTASH_WORKFLOW_URL").cloned();

        if let Some(current) = env.get("QSTASH_CURRENT_SIGNING_KEY").cloned() {
            let mut verifier = JwtSignatureVerifier::new(current);
            if let Some(next) = env.get("QSTASH_NEXT_SIGNING_KEY").cloned() {
                verifier = verifier.with_next_key(next);
            }
            options.verifier = Some(Arc::new(verifier));
        }

        Ok(options)
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_failure_function(mut self, failure_function: FailureFunction) -> Self {
        self.failure_function = Some(failure_function);
        self
    }

    pub fn with_failure_url(mut self, failure_url: String) -> Self {
        self.failure_url = Some(failure_url);
        self
    }

    pub fn with_url_override(mut self, url: String) -> Self {
        self.url_override = Some(url);
        self
    }

    pub fn with_initial_payload_parser(mut self, parser: InitialPayloadParser) -> Self {
        self.initial_payload_parser = parser;
        self
    }

    /// Materializes these options into the immutable [`ServeConfig`] the
    /// core engine drives every invocation with.
    pub fn into_config(self) -> ServeConfig {
        ServeConfig {
            retries: self.retries,
            failure_url: self.failure_url,
            failure_function: self.failure_function,
            verifier: self.verifier,
            broker: self.broker,
            initial_payload_parser: self.initial_payload_parser,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_runtime_core::{BrokerError, PublishRequest, PublishResponse};
    use async_trait::async_trait;

    struct DummyBroker;

    #[async_trait]
    impl BrokerClient for DummyBroker {
        async fn publish(&self, _request: PublishRequest) -> std::result::Result<PublishResponse, BrokerError> {
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

    #[test]
    fn from_env_map_requires_broker_token() {
        let env = HashMap::new();
        let err = ServeOptions::from_env_map(&env).unwrap_err();
        assert!(matches!(err, WorkflowError::Configuration(_)));
    }

    #[test]
    fn from_env_map_picks_up_url_override_and_signing_keys() {
        let mut env = HashMap::new();
        env.insert("QSTASH_TOKEN".to_string(), "tok".to_string());
        env.insert(
            "UPSTASH_WORKFLOW_URL".to_string(),
            "https://example.com/workflow".to_string(),
        );
        env.insert("QSTASH_CURRENT_SIGNING_KEY".to_string(), "current".to_string());

        let options = ServeOptions::from_env_map(&env).unwrap();
        assert_eq!(options.url_override.as_deref(), Some("https://example.com/workflow"));
        assert!(options.verifier.is_some());
    }

    #[test]
    fn builder_overrides_apply() {
        let options = ServeOptions::new(Arc::new(DummyBroker))
            .with_retries(5)
            .with_failure_url("https://example.com/failure".to_string());
        let config = options.into_config();
        assert_eq!(config.retries, 5);
        assert_eq!(config.failure_url.as_deref(), Some("https://example.com/failure"));
    }
}
