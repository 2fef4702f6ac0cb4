//! Invoicing provider client: envelope, POST with retry, reply parsing.

use chrono::Utc;
use service_core::retry::{retry_call, RetryConfig, RetryError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, instrument, warn};

use super::envelope::{self, EnvelopeTarget, CREATE_INVOICE_ACTION, INVOICE_DETAIL_ACTION};
use super::response::{ResponseParser, StatusReply, SubmissionReply};
use super::transport::{Delivery, ProviderResponse, ProviderTransport, TransportFailure};
use crate::models::{InvoiceRequest, ProviderCredentials};
use crate::services::metrics;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BillingError {
    /// Every attempt failed before a response was delivered.
    #[error("provider unreachable after {attempts} attempt(s): {message}")]
    Transport {
        attempts: u32,
        delivery: Delivery,
        message: String,
    },
    /// The provider answered and refused the request.
    #[error("provider rejected the request: {message}")]
    Provider {
        status: Option<String>,
        message: String,
    },
    /// The provider answered but the reply could not be used.
    #[error("unusable provider response: {0}")]
    Envelope(String),
}

impl BillingError {
    /// Whether the provider may hold a document for this request.
    pub fn may_have_reached_provider(&self) -> bool {
        match self {
            BillingError::Transport { delivery, .. } => *delivery == Delivery::Unknown,
            BillingError::Provider { .. } => false,
            BillingError::Envelope(_) => true,
        }
    }
}

/// Synchronous acceptance of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub tracking_id: String,
    pub raw_status: String,
    pub message: Option<String>,
}

pub struct BillingClient {
    transport: Arc<dyn ProviderTransport>,
    parser: Arc<dyn ResponseParser>,
    target: EnvelopeTarget,
    retry: RetryConfig,
}

impl BillingClient {
    pub fn new(
        transport: Arc<dyn ProviderTransport>,
        parser: Arc<dyn ResponseParser>,
        target: EnvelopeTarget,
        retry: RetryConfig,
    ) -> Self {
        Self {
            transport,
            parser,
            target,
            retry,
        }
    }

    /// 3 attempts, 2 s apart.
    pub fn default_retry() -> RetryConfig {
        RetryConfig::fixed(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BACKOFF)
    }

    /// Submit one invoice. Only connectivity failures are retried.
    #[instrument(
        skip(self, request, credentials, callback_url),
        fields(order_number = %request.order_number, document_type = request.document_type.code())
    )]
    pub async fn submit(
        &self,
        request: &InvoiceRequest,
        credentials: &ProviderCredentials,
        callback_url: Option<&str>,
    ) -> Result<Submission, BillingError> {
        let xml = envelope::create_invoice(
            &self.target,
            request,
            credentials,
            callback_url,
            Utc::now(),
        );
        let response = self.post(CREATE_INVOICE_ACTION, xml).await?;
        let reply = SubmissionReply::parse(self.parser.as_ref(), &response.body);

        if !response.is_success() || !reply.is_ok() {
            let message = rejection_message(&response, reply.status.as_deref(), reply.message);
            warn!(
                http_status = response.status,
                provider_status = ?reply.status,
                message = %message,
                "Provider rejected invoice"
            );
            return Err(BillingError::Provider {
                status: reply.status,
                message,
            });
        }

        let tracking_id = reply.tracking_id.ok_or_else(|| {
            BillingError::Envelope("request accepted without IdComprobante".to_string())
        })?;

        info!(tracking_id = %tracking_id, "Provider accepted invoice");

        Ok(Submission {
            tracking_id,
            raw_status: reply.status.unwrap_or_default(),
            message: reply.message,
        })
    }

    /// Ask the provider for the current state of a submitted invoice.
    #[instrument(skip(self, credentials))]
    pub async fn query_status(
        &self,
        tracking_id: &str,
        credentials: &ProviderCredentials,
    ) -> Result<StatusReply, BillingError> {
        let xml = envelope::invoice_detail(&self.target, tracking_id, credentials);
        let response = self.post(INVOICE_DETAIL_ACTION, xml).await?;
        let reply = StatusReply::parse(self.parser.as_ref(), &response.body);

        if !response.is_success() {
            let message = rejection_message(&response, reply.status.as_deref(), reply.message);
            return Err(BillingError::Provider {
                status: reply.status,
                message,
            });
        }
        Ok(reply)
    }

    async fn post(&self, action: &str, xml: String) -> Result<ProviderResponse, BillingError> {
        let content_type = self.target.content_type(action);
        let started = Instant::now();

        let result = retry_call(&self.retry, action, |_attempt| {
            self.transport.post(&content_type, xml.clone())
        })
        .await;

        let elapsed = started.elapsed().as_secs_f64();
        match result {
            Ok(response) => {
                metrics::record_provider_request(action, "delivered", elapsed);
                Ok(response)
            }
            Err(err) => {
                metrics::record_provider_request(action, "transport_error", elapsed);
                metrics::record_error("provider_transport");
                Err(transport_error(err))
            }
        }
    }
}

fn transport_error(err: RetryError<TransportFailure>) -> BillingError {
    let failures = match err {
        RetryError::Permanent(failure) => vec![failure],
        RetryError::Exhausted(failures) => failures,
    };
    let delivery = if failures.iter().any(|f| f.delivery == Delivery::Unknown) {
        Delivery::Unknown
    } else {
        Delivery::NotSent
    };

    BillingError::Transport {
        attempts: failures.len() as u32,
        delivery,
        message: failures
            .last()
            .map(|f| f.message.clone())
            .unwrap_or_default(),
    }
}

fn rejection_message(
    response: &ProviderResponse,
    status: Option<&str>,
    message: Option<String>,
) -> String {
    message.unwrap_or_else(|| match status {
        Some(status) => format!("Estado inesperado: {status}"),
        None => format!("HTTP {}", response.status),
    })
}
