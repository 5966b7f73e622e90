// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Verifies the `Upstash-Signature` header the broker attaches to every
//! request it delivers, using `jsonwebtoken` for verification only: this
//! crate never signs anything itself.
//!
//! The broker signs with whichever of two rotating keys is current at
//! publish time, so a verifier must accept either the current or the next
//! signing key to avoid rejecting in-flight messages during a key
//! rotation.

use base64::Engine;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use async_trait::async_trait;

use workflow_runtime_core::{BrokerError, SignatureVerifier};

const ISSUER: &str = "Upstash";

#[derive(Debug, Deserialize)]
struct SignatureClaims {
    iss: String,
    sub: String,
}

/// Verifies `Upstash-Signature` as a JWT whose `sub` claim carries the
/// base64 SHA-256 hash of the request body.
pub struct JwtSignatureVerifier {
    current_signing_key: String,
    next_signing_key: Option<String>,
}

impl JwtSignatureVerifier {
    /// Creates a verifier accepting only the current signing key.
    pub fn new(current_signing_key: String) -> Self {
        Self {
            current_signing_key,
            next_signing_key: None,
        }
    }

    /// Also accepts `next_signing_key`, so messages signed just before a
    /// key rotation still verify.
    pub fn with_next_key(mut self, next_signing_key: String) -> Self {
        self.next_signing_key = Some(next_signing_key);
        self
    }

    /// Reads both signing keys from the environment.
    pub fn from_env() -> Result<Self, BrokerError> {
        let current = std::env::var("QSTASH_CURRENT_SIGNING_KEY").map_err(|_| {
            BrokerError::Transport("QSTASH_CURRENT_SIGNING_KEY environment variable not set".to_string())
        })?;
        let verifier = Self::new(current);
        Ok(match std::env::var("QSTASH_NEXT_SIGNING_KEY") {
            Ok(next) => verifier.with_next_key(next),
            Err(_) => verifier,
        })
    }

    fn verify_with_key(&self, body: &str, token: &str, key: &str) -> Result<(), BrokerError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        let decoding_key = DecodingKey::from_secret(key.as_bytes());

        let data = decode::<SignatureClaims>(token, &decoding_key, &validation)
            .map_err(|e| BrokerError::Rejected(e.to_string()))?;

        if data.claims.iss != ISSUER {
            return Err(BrokerError::Rejected("unexpected signature issuer".to_string()));
        }
        if data.claims.sub != body_hash(body) {
            return Err(BrokerError::Rejected("signature body hash mismatch".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SignatureVerifier for JwtSignatureVerifier {
    async fn verify(&self, body: &str, signature: &str) -> Result<(), BrokerError> {
        if self.verify_with_key(body, signature, &self.current_signing_key).is_ok() {
            return Ok(());
        }
        if let Some(next) = &self.next_signing_key {
            if self.verify_with_key(body, signature, next).is_ok() {
                return Ok(());
            }
        }
        Err(BrokerError::Rejected(
            "signature did not verify against the current or next signing key".to_string(),
        ))
    }
}

fn body_hash(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        iss: String,
        sub: String,
        exp: usize,
    }

    fn sign(key: &str, body: &str) -> String {
        let claims = TestClaims {
            iss: ISSUER.to_string(),
            sub: body_hash(body),
            exp: (chrono::Utc::now().timestamp() + 300) as usize,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(key.as_bytes())).unwrap()
    }

    #[tokio::test]
    async fn verifies_against_current_key() {
        let verifier = JwtSignatureVerifier::new("current-secret".to_string());
        let body = "{\"a\":1}";
        let token = sign("current-secret", body);
        verifier.verify(body, &token).await.unwrap();
    }

    #[tokio::test]
    async fn verifies_against_next_key_during_rotation() {
        let verifier =
            JwtSignatureVerifier::new("current-secret".to_string()).with_next_key("next-secret".to_string());
        let body = "{\"a\":1}";
        let token = sign("next-secret", body);
        verifier.verify(body, &token).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_wrong_key() {
        let verifier = JwtSignatureVerifier::new("current-secret".to_string());
        let body = "{\"a\":1}";
        let token = sign("some-other-secret", body);
        let err = verifier.verify(body, &token).await.unwrap_err();
        assert!(matches!(err, BrokerError::Rejected(_)));
    }

    #[tokio::test]
    async fn rejects_mismatched_body_hash() {
        let verifier = JwtSignatureVerifier::new("current-secret".to_string());
        let token = sign("current-secret", "original-body");
        let err = verifier.verify("tampered-body", &token).await.unwrap_err();
        assert!(matches!(err, BrokerError::Rejected(_)));
    }
}
