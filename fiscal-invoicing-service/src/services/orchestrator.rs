//! Invoice generation for one order: map, claim, submit, record.
//!
//! Shared by the manual API and the order-paid webhook. The ledger claim is
//! taken before the provider is called, so concurrent requests for the same
//! order produce at most one submission.

use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use super::ledger::{InvoiceLedger, LedgerError};
use super::mapper::{self, InvalidOrder};
use super::metrics;
use super::order_source::{short_id, InvoiceAnnotation, OrderSource};
use crate::billing::{BillingClient, BillingError, Delivery};
use crate::models::{ClaimResult, Invoice, InvoiceStatus, NewInvoice, Order, ShopConfig};

/// Default lease on a `submitting` claim.
pub const DEFAULT_SUBMISSION_LEASE: Duration = Duration::from_secs(300);

/// What to invoice: an order id to fetch, or an order already in hand.
#[derive(Debug, Clone)]
pub enum OrderInput {
    Reference(String),
    Full(Box<Order>),
}

impl OrderInput {
    pub fn order_id(&self) -> String {
        match self {
            OrderInput::Reference(id) => short_id(id.trim()).to_string(),
            OrderInput::Full(order) => order.id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerateOutcome {
    /// Accepted by the provider; authorization arrives later.
    Submitted { tracking_id: String },
    AlreadyInvoiced { authorization_code: Option<String> },
    AwaitingAuthorization { tracking_id: Option<String> },
}

/// Result of the automatic path for an order-paid event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoInvoiceOutcome {
    AlreadyRecorded,
    RecordedPending,
    Generated(GenerateOutcome),
    Failed(String),
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(transparent)]
    InvalidOrder(#[from] InvalidOrder),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("shop {0} is not active")]
    ShopInactive(String),
    #[error("provider unreachable: {message}")]
    Transport { delivery: Delivery, message: String },
    #[error("provider error: {0}")]
    Provider(String),
    #[error("order {0} not found")]
    NotFound(String),
    #[error("a submission for order {0} is already in flight")]
    SubmissionInFlight(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("order source failure: {0}")]
    OrderSource(#[source] anyhow::Error),
}

impl From<GenerationError> for AppError {
    fn from(err: GenerationError) -> Self {
        let message = err.to_string();
        match err {
            GenerationError::InvalidOrder(InvalidOrder::MissingTotal(_)) => {
                AppError::Unprocessable(anyhow::anyhow!(message))
            }
            GenerationError::InvalidOrder(_) | GenerationError::Configuration(_) => {
                AppError::BadRequest(anyhow::anyhow!(message))
            }
            GenerationError::ShopInactive(_) => AppError::Forbidden(anyhow::anyhow!(message)),
            GenerationError::NotFound(_) => AppError::NotFound(anyhow::anyhow!(message)),
            GenerationError::SubmissionInFlight(_) => AppError::Conflict(anyhow::anyhow!(message)),
            GenerationError::Transport { .. } => AppError::ServiceUnavailable(message),
            GenerationError::Provider(_) => AppError::BadGateway(message),
            GenerationError::Ledger(e) => e.into(),
            GenerationError::OrderSource(e) => AppError::InternalError(e),
        }
    }
}

pub struct GenerationOrchestrator {
    ledger: Arc<dyn InvoiceLedger>,
    billing: Arc<BillingClient>,
    orders: Option<Arc<dyn OrderSource>>,
    callback_url: Option<String>,
    lease: Duration,
}

impl GenerationOrchestrator {
    pub fn new(
        ledger: Arc<dyn InvoiceLedger>,
        billing: Arc<BillingClient>,
        orders: Option<Arc<dyn OrderSource>>,
        callback_url: Option<String>,
    ) -> Self {
        Self {
            ledger,
            billing,
            orders,
            callback_url,
            lease: DEFAULT_SUBMISSION_LEASE,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Generate the invoice for one order, at most once.
    #[instrument(skip(self, input, shop), fields(shop = %shop.shop_domain, order_id = %input.order_id()))]
    pub async fn generate(
        &self,
        input: OrderInput,
        shop: &ShopConfig,
    ) -> Result<GenerateOutcome, GenerationError> {
        if !shop.is_active() {
            return Err(GenerationError::ShopInactive(shop.shop_domain.clone()));
        }
        if !shop.credentials.is_complete() {
            return Err(GenerationError::Configuration(
                "provider credentials are not configured".to_string(),
            ));
        }

        let order_id = input.order_id();
        if let Some(existing) = self.ledger.find_by_order_id(&order_id).await? {
            match existing.status() {
                InvoiceStatus::Completed => {
                    return Ok(GenerateOutcome::AlreadyInvoiced {
                        authorization_code: existing.authorization_code,
                    });
                }
                InvoiceStatus::Processing => {
                    return Ok(GenerateOutcome::AwaitingAuthorization {
                        tracking_id: existing.tracking_id,
                    });
                }
                _ => {}
            }
        }

        let order = match input {
            OrderInput::Full(order) => *order,
            OrderInput::Reference(_) => self.fetch_order(shop, &order_id).await?,
        };
        let request = mapper::map_order(&order)?;

        let claim = self
            .ledger
            .claim_submission(
                NewInvoice::for_request(shop.id, &order_id, &request, InvoiceStatus::Submitting),
                self.lease,
            )
            .await?;
        let previous = match claim {
            ClaimResult::Claimed { previous, .. } => previous.map(|p| *p),
            ClaimResult::AlreadyCompleted(invoice) => {
                return Ok(GenerateOutcome::AlreadyInvoiced {
                    authorization_code: invoice.authorization_code,
                });
            }
            ClaimResult::AwaitingAuthorization(invoice) => {
                return Ok(GenerateOutcome::AwaitingAuthorization {
                    tracking_id: invoice.tracking_id,
                });
            }
            ClaimResult::InFlight(_) => {
                metrics::record_submission("in_flight");
                return Err(GenerationError::SubmissionInFlight(order_id));
            }
        };

        match self
            .billing
            .submit(&request, &shop.credentials, self.callback_url.as_deref())
            .await
        {
            Ok(submission) => {
                let tracking_id = submission.tracking_id;
                let invoice = self
                    .ledger
                    .mark_processing(&order_id, &tracking_id)
                    .await
                    .map_err(|e| {
                        error!(
                            error = %e,
                            tracking_id = %tracking_id,
                            "Provider accepted invoice but the ledger was not updated; row left submitting"
                        );
                        metrics::record_error("ledger_after_submit");
                        e
                    })?;
                metrics::record_submission("accepted");
                info!(tracking_id = %tracking_id, "Invoice submitted");
                self.annotate(shop, &invoice).await;
                Ok(GenerateOutcome::Submitted { tracking_id })
            }
            Err(BillingError::Provider { message, .. }) => {
                metrics::record_submission("rejected");
                let invoice = self.ledger.mark_failed(&order_id, &message).await?;
                self.annotate(shop, &invoice).await;
                Err(GenerationError::Provider(message))
            }
            Err(BillingError::Transport {
                delivery: Delivery::NotSent,
                message,
                ..
            }) => {
                metrics::record_submission("not_sent");
                self.ledger.release_claim(&order_id, previous).await?;
                Err(GenerationError::Transport {
                    delivery: Delivery::NotSent,
                    message,
                })
            }
            Err(err) => {
                // The provider may hold a document for this order.
                metrics::record_submission("unknown");
                let message = err.to_string();
                warn!(error = %message, "Submission outcome unknown; claim kept");
                self.ledger
                    .upsert(
                        NewInvoice::for_request(
                            shop.id,
                            &order_id,
                            &request,
                            InvoiceStatus::Submitting,
                        )
                        .with_error(format!("Resultado desconocido: {message}")),
                    )
                    .await?;
                Err(match err {
                    BillingError::Transport { delivery, .. } => {
                        GenerationError::Transport { delivery, message }
                    }
                    _ => GenerationError::Provider(message),
                })
            }
        }
    }

    /// Automatic invoicing for a paid order.
    ///
    /// Orders that already have a row are left alone. Without auto-invoicing
    /// (or credentials) the order is recorded as `pending`; a failed
    /// generation leaves a `failed` row with the reason.
    #[instrument(skip(self, shop, order), fields(shop = %shop.shop_domain, order_id = %order.id))]
    pub async fn handle_order_paid(
        &self,
        shop: &ShopConfig,
        order: Order,
    ) -> Result<AutoInvoiceOutcome, LedgerError> {
        if self.ledger.find_by_order_id(&order.id).await?.is_some() {
            return Ok(AutoInvoiceOutcome::AlreadyRecorded);
        }

        if !shop.auto_invoice || !shop.credentials.is_complete() {
            return match mapper::map_order(&order) {
                Ok(request) => {
                    self.ledger
                        .record_pending(NewInvoice::for_request(
                            shop.id,
                            &order.id,
                            &request,
                            InvoiceStatus::Pending,
                        ))
                        .await?;
                    Ok(AutoInvoiceOutcome::RecordedPending)
                }
                Err(e) => self.record_failure(shop, &order, e.to_string()).await,
            };
        }

        let order_id = order.id.clone();
        let fallback = order.clone();
        match self.generate(OrderInput::Full(Box::new(order)), shop).await {
            Ok(outcome) => Ok(AutoInvoiceOutcome::Generated(outcome)),
            Err(e) => {
                let message = e.to_string();
                warn!(error = %message, "Automatic invoice generation failed");
                if self.ledger.find_by_order_id(&order_id).await?.is_none() {
                    return self.record_failure(shop, &fallback, message).await;
                }
                Ok(AutoInvoiceOutcome::Failed(message))
            }
        }
    }

    async fn record_failure(
        &self,
        shop: &ShopConfig,
        order: &Order,
        message: String,
    ) -> Result<AutoInvoiceOutcome, LedgerError> {
        let new = match mapper::map_order(order) {
            Ok(request) => {
                NewInvoice::for_request(shop.id, &order.id, &request, InvoiceStatus::Failed)
            }
            Err(_) => NewInvoice {
                shop_id: shop.id,
                order_id: order.id.clone(),
                order_number: order.display_number(),
                customer_name: mapper::buyer_name(order),
                customer_email: mapper::buyer_email(order),
                total_amount: order.total_price.unwrap_or_default(),
                status: InvoiceStatus::Failed,
                tracking_id: None,
                error_message: None,
                invoice_data: None,
            },
        };
        let invoice = self.ledger.upsert(new.with_error(message.clone())).await?;
        self.annotate(shop, &invoice).await;
        Ok(AutoInvoiceOutcome::Failed(message))
    }

    async fn fetch_order(&self, shop: &ShopConfig, order_id: &str) -> Result<Order, GenerationError> {
        let orders = self.orders.as_ref().ok_or_else(|| {
            GenerationError::Configuration("no order source configured".to_string())
        })?;
        orders
            .fetch_order(shop, order_id)
            .await
            .map_err(GenerationError::OrderSource)?
            .ok_or_else(|| GenerationError::NotFound(order_id.to_string()))
    }

    async fn annotate(&self, shop: &ShopConfig, invoice: &Invoice) {
        let Some(orders) = &self.orders else {
            return;
        };
        let mut annotation = InvoiceAnnotation::status(invoice.status());
        if invoice.status() == InvoiceStatus::Failed {
            annotation.error = invoice.error_message.clone();
        }
        if let Err(e) = orders
            .annotate_invoice(shop, &invoice.order_id, &annotation)
            .await
        {
            warn!(error = %e, order_id = %invoice.order_id, "Failed to set invoice metafields");
        }
    }
}
