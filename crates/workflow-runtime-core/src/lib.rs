// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Replay-based step executor and protocol engine for durable HTTP
//! workflows.
//!
//! This crate has no opinion on transport: it consumes a [`broker::BrokerClient`]
//! and a [`broker::SignatureVerifier`] and hands back plain data
//! ([`serve::ServeResponse`]) for a framework adapter to translate into an
//! actual HTTP response. Concrete broker/signature implementations live in
//! `workflow-runtime-broker`; a batteries-included façade lives in
//! `workflow-runtime-sdk`.

pub mod auth;
pub mod broker;
pub mod callback;
pub mod constants;
pub mod context;
pub mod error;
pub mod executor;
pub mod failure;
pub mod headers;
pub mod history;
pub mod payload;
pub mod serve;
pub mod step;

pub use auth::{try_authentication, AuthOutcome};
pub use broker::{BrokerClient, BrokerError, PublishRequest, PublishResponse, SignatureVerifier};
pub use callback::{handle_callback, CallbackOutcome};
pub use context::{CallOptions, SleepUntilTarget, WorkflowContext};
pub use error::{Result, WorkflowError};
pub use executor::AutoExecutor;
pub use failure::{handle_failure, is_failure_callback, FailureFunction, WorkflowFailure};
pub use headers::Headers;
pub use history::{generate_run_id, is_first_invocation, parse_request, validate_request, ParsedRequest};
pub use payload::{default_initial_payload_parser, InitialPayloadParser};
pub use serve::{serve, FinishCondition, ServeConfig, ServeResponse, WorkflowFunction};
pub use step::{HttpMethod, LazyStep, RunFuture, Step, StepType};
