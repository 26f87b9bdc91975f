//! Signed webhook requests and the HTTP transport that sends them.

use crate::{WebhookError, WebhookResult};
use async_trait::async_trait;
use dispatch_core::signer::{
    self, DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
use dispatch_core::{Delivery, Endpoint};
use reqwest::{redirect, Client};
use std::time::Duration;
use tracing::debug;

/// `User-Agent` sent with every webhook.
pub const USER_AGENT: &str = concat!("dispatch/", env!("CARGO_PKG_VERSION"));

/// A fully signed POST, ready for a [`WebhookTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl WebhookRequest {
    /// Serialize the delivery payload and sign it with the endpoint secret.
    pub fn signed(endpoint: &Endpoint, delivery: &Delivery, timestamp: i64) -> WebhookResult<Self> {
        let body = serde_json::to_string(&delivery.payload)?;
        let signature = signer::sign(&endpoint.secret, timestamp, &body);

        Ok(Self {
            url: endpoint.url.clone(),
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("User-Agent".to_string(), USER_AGENT.to_string()),
                (TIMESTAMP_HEADER.to_string(), timestamp.to_string()),
                (SIGNATURE_HEADER.to_string(), signature),
                (EVENT_HEADER.to_string(), delivery.event_type.clone()),
                (DELIVERY_HEADER.to_string(), delivery.id.to_string()),
            ],
            body,
        })
    }

    /// First header value with this name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Sends a webhook and reports what came back.
///
/// `Ok(status)` for any HTTP response, `Err(text)` when no response arrived
/// (connect failure, timeout, protocol error).
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn send(&self, request: &WebhookRequest) -> Result<u16, String>;
}

/// [`WebhookTransport`] over reqwest. Redirects are not followed.
pub struct ReqwestTransport {
    client: Client,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> WebhookResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| WebhookError::Http(e.to_string()))?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl WebhookTransport for ReqwestTransport {
    async fn send(&self, request: &WebhookRequest) -> Result<u16, String> {
        let mut builder = self.client.post(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        match builder.body(request.body.clone()).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                debug!(url = %request.url, status, "Webhook response");
                Ok(status)
            }
            Err(e) if e.is_timeout() => Err(format!("timeout after {}ms", self.timeout.as_millis())),
            Err(e) => Err(e.to_string()),
        }
    }
}
