// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Concrete [`workflow_runtime_core::BrokerClient`] and
//! [`workflow_runtime_core::SignatureVerifier`] implementations: an HTTP
//! client for the QStash-shaped broker the protocol targets, and a JWT
//! signature verifier for the `Upstash-Signature` header.

mod http_client;
mod signature;

pub use http_client::HttpBrokerClient;
pub use signature::JwtSignatureVerifier;
