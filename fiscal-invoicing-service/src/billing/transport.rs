//! HTTP transport to the provider endpoint.

use async_trait::async_trait;
use reqwest::Client;
use service_core::retry::Retryable;
use std::time::Duration;
use thiserror::Error;

/// Whether a failed request may have reached the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The request certainly never left this process (connect/build failure).
    NotSent,
    /// The request may have been processed; the response was lost.
    Unknown,
}

/// Connectivity-level failure. Any delivered HTTP response is not one.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportFailure {
    pub delivery: Delivery,
    pub message: String,
}

impl TransportFailure {
    pub fn not_sent(message: impl Into<String>) -> Self {
        Self {
            delivery: Delivery::NotSent,
            message: message.into(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            delivery: Delivery::Unknown,
            message: message.into(),
        }
    }
}

/// Every transport failure is retried, ambiguous ones included. The client
/// reports the whole call as [`Delivery::Unknown`] if any attempt may have
/// reached the provider.
impl Retryable for TransportFailure {
    fn is_retryable(&self) -> bool {
        true
    }
}

/// A response delivered by the provider, whatever its HTTP status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderResponse {
    pub status: u16,
    pub body: String,
}

impl ProviderResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait ProviderTransport: Send + Sync {
    /// POST one envelope. `content_type` names the SOAP action.
    async fn post(
        &self,
        content_type: &str,
        body: String,
    ) -> Result<ProviderResponse, TransportFailure>;
}

/// reqwest-backed transport.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl ProviderTransport for HttpTransport {
    async fn post(
        &self,
        content_type: &str,
        body: String,
    ) -> Result<ProviderResponse, TransportFailure> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(reqwest::header::ACCEPT, "application/soap+xml")
            .body(body)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| TransportFailure::unknown(format!("reading response body: {e}")))?;

        tracing::debug!(status, body_len = body.len(), "Provider response received");

        Ok(ProviderResponse { status, body })
    }
}

fn classify(error: reqwest::Error) -> TransportFailure {
    if error.is_connect() || error.is_builder() {
        TransportFailure::not_sent(error.to_string())
    } else {
        TransportFailure::unknown(error.to_string())
    }
}
