// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A `reqwest`-backed [`BrokerClient`]: a base URL, a bearer token, and a
//! `convert_reqwest_error` helper that classifies transport failures
//! instead of letting every call surface a bare `reqwest::Error`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use workflow_runtime_core::{BrokerClient, BrokerError, PublishRequest, PublishResponse};

const DEFAULT_BASE_URL: &str = "https://qstash.upstash.io";

/// Talks to the QStash-shaped broker this crate's protocol targets:
/// `POST /v2/publish/{url}` for a single immediate publish (the
/// first-invocation self-trigger and callback-result resubmission),
/// `POST /v2/batch` to enqueue one or more steps atomically (every
/// ordinary step submission), `DELETE /v2/workflows/runs/{id}` to clean
/// up.
pub struct HttpBrokerClient {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct PublishApiResponse {
    #[serde(rename = "messageId")]
    message_id: String,
}

/// One entry of a `/v2/batch` request body: a single submitted step,
/// targeting either the workflow endpoint itself or a `Call` step's
/// external URL.
#[derive(Debug, Serialize)]
struct BatchEnvelopeItem<'a> {
    destination: &'a str,
    method: &'a str,
    headers: HashMap<&'a str, &'a str>,
    body: &'a Value,
    #[serde(rename = "notBefore", skip_serializing_if = "Option::is_none")]
    not_before: Option<i64>,
}

impl<'a> BatchEnvelopeItem<'a> {
    fn from_request(request: &'a PublishRequest) -> Self {
        BatchEnvelopeItem {
            destination: &request.url,
            method: &request.method,
            headers: request.headers.iter().collect(),
            body: &request.body,
            not_before: request.not_before,
        }
    }
}

impl HttpBrokerClient {
    /// Creates a client against the default broker URL.
    pub fn new(token: String) -> Self {
        Self::with_base_url(token, DEFAULT_BASE_URL.to_string())
    }

    /// Creates a client against a custom base URL, useful for testing
    /// against a local broker or `mockito` server.
    pub fn with_base_url(token: String, base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build broker HTTP client");
        Self {
            client,
            token,
            base_url,
        }
    }

    /// Reads the broker token and, optionally, a base URL override from
    /// the environment.
    pub fn from_env() -> Result<Self, BrokerError> {
        let token = std::env::var("QSTASH_TOKEN")
            .map_err(|_| BrokerError::Transport("QSTASH_TOKEN environment variable not set".to_string()))?;
        let base_url = std::env::var("QSTASH_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Ok(Self::with_base_url(token, base_url))
    }

    fn convert_reqwest_error(err: reqwest::Error) -> BrokerError {
        if err.is_timeout() {
            BrokerError::Transport(format!("broker request timed out: {err}"))
        } else {
            BrokerError::Transport(err.to_string())
        }
    }

    fn method(&self, raw: &str) -> reqwest::Method {
        reqwest::Method::from_bytes(raw.as_bytes()).unwrap_or(reqwest::Method::POST)
    }

    async fn send_publish(&self, request: &PublishRequest) -> Result<PublishResponse, BrokerError> {
        let url = format!("{}/v2/publish/{}", self.base_url, request.url);
        let mut builder = self
            .client
            .request(self.method(&request.method), url)
            .bearer_auth(&self.token);

        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        if let Some(not_before) = request.not_before {
            builder = builder.header("Upstash-Not-Before", not_before.to_string());
        }

        let response = builder
            .json(&request.body)
            .send()
            .await
            .map_err(Self::convert_reqwest_error)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<failed to read broker response body>"));

        if !status.is_success() {
            return Err(BrokerError::Rejected(format!("[{}] {}", status.as_u16(), body)));
        }

        let parsed: PublishApiResponse = serde_json::from_str(&body)
            .map_err(|e| BrokerError::Transport(format!("malformed broker response: {e}")))?;
        Ok(PublishResponse {
            message_id: parsed.message_id,
        })
    }
}

#[async_trait]
impl BrokerClient for HttpBrokerClient {
    async fn publish(&self, request: PublishRequest) -> Result<PublishResponse, BrokerError> {
        self.send_publish(&request).await
    }

    async fn batch(&self, requests: Vec<PublishRequest>) -> Result<Vec<PublishResponse>, BrokerError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let envelope: Vec<BatchEnvelopeItem> = requests.iter().map(BatchEnvelopeItem::from_request).collect();
        let url = format!("{}/v2/batch", self.base_url);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&envelope)
            .send()
            .await
            .map_err(Self::convert_reqwest_error)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<failed to read broker response body>"));

        if !status.is_success() {
            return Err(BrokerError::Rejected(format!("[{}] {}", status.as_u16(), body)));
        }

        let parsed: Vec<PublishApiResponse> = serde_json::from_str(&body)
            .map_err(|e| BrokerError::Transport(format!("malformed broker response: {e}")))?;
        Ok(parsed
            .into_iter()
            .map(|p| PublishResponse {
                message_id: p.message_id,
            })
            .collect())
    }

    async fn delete(&self, workflow_run_id: &str, cancel: bool) -> Result<(), BrokerError> {
        let url = format!(
            "{}/v2/workflows/runs/{}?cancel={}",
            self.base_url, workflow_run_id, cancel
        );
        let response = self
            .client
            .delete(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(Self::convert_reqwest_error)?;

        if !response.status().is_success() && response.status().as_u16() != 404 {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Rejected(format!("[{}] {}", status.as_u16(), body)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_runtime_core::Headers;

    #[tokio::test]
    async fn publish_posts_to_v2_publish_with_destination_url() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v2/publish/https://example.com/workflow")
            .match_header("authorization", "Bearer test-token")
            .with_status(200)
            .with_body(r#"{"messageId":"msg_123"}"#)
            .create_async()
            .await;

        let client = HttpBrokerClient::with_base_url("test-token".to_string(), server.url());
        let response = client
            .publish(PublishRequest {
                url: "https://example.com/workflow".to_string(),
                method: "POST".to_string(),
                headers: Headers::new(),
                body: serde_json::json!({"stepId": 1}),
                not_before: None,
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.message_id, "msg_123");
    }

    #[tokio::test]
    async fn batch_posts_a_single_element_envelope_to_v2_batch() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v2/batch")
            .match_header("authorization", "Bearer test-token")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!([
                {"destination": "https://ext", "method": "PATCH"},
            ])))
            .with_status(200)
            .with_body(r#"[{"messageId":"msg_1"}]"#)
            .create_async()
            .await;

        let client = HttpBrokerClient::with_base_url("test-token".to_string(), server.url());
        let responses = client
            .batch(vec![PublishRequest {
                url: "https://ext".to_string(),
                method: "PATCH".to_string(),
                headers: Headers::new(),
                body: serde_json::json!("request-body"),
                not_before: None,
            }])
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].message_id, "msg_1");
    }

    #[tokio::test]
    async fn batch_with_no_requests_never_calls_the_broker() {
        let server = mockito::Server::new_async().await;
        let client = HttpBrokerClient::with_base_url("test-token".to_string(), server.url());
        let responses = client.batch(vec![]).await.unwrap();
        assert!(responses.is_empty());
    }

    #[tokio::test]
    async fn publish_rejects_non_success_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v2/publish/https://example.com/workflow")
            .with_status(401)
            .with_body("unauthorized")
            .create_async()
            .await;

        let client = HttpBrokerClient::with_base_url("bad-token".to_string(), server.url());
        let err = client
            .publish(PublishRequest {
                url: "https://example.com/workflow".to_string(),
                method: "POST".to_string(),
                headers: Headers::new(),
                body: serde_json::json!({}),
                not_before: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::Rejected(_)));
    }

    #[tokio::test]
    async fn delete_treats_missing_run_as_success() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", mockito::Matcher::Regex(r"^/v2/workflows/runs/wfr_gone".to_string()))
            .with_status(404)
            .create_async()
            .await;

        let client = HttpBrokerClient::with_base_url("test-token".to_string(), server.url());
        client.delete("wfr_gone", false).await.unwrap();
    }
}
