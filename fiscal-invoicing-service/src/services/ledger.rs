//! Invoice ledger: one row per order, guarded status transitions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    ApplyResult, AuthorizationOutcome, ClaimResult, Invoice, InvoiceStats, InvoiceStatus,
    NewInvoice, PendingResult, RedactionTarget,
};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("no invoice recorded for order {0}")]
    NotFound(String),
    #[error("order {order_id}: cannot move invoice from {from} to {to}")]
    InvalidTransition {
        order_id: String,
        from: InvoiceStatus,
        to: InvoiceStatus,
    },
    #[error("ledger storage failure: {0}")]
    Storage(#[source] anyhow::Error),
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(_) => AppError::NotFound(anyhow::anyhow!(err.to_string())),
            LedgerError::InvalidTransition { .. } => {
                AppError::Conflict(anyhow::anyhow!(err.to_string()))
            }
            LedgerError::Storage(e) => AppError::DatabaseError(e),
        }
    }
}

/// Statuses `mark_processing` may start from.
pub const PROCESSING_SOURCES: [InvoiceStatus; 3] = [
    InvoiceStatus::Pending,
    InvoiceStatus::Submitting,
    InvoiceStatus::Failed,
];

/// Statuses `mark_failed` may start from.
pub const FAILURE_SOURCES: [InvoiceStatus; 4] = [
    InvoiceStatus::Pending,
    InvoiceStatus::Submitting,
    InvoiceStatus::Processing,
    InvoiceStatus::Failed,
];

#[async_trait]
pub trait InvoiceLedger: Send + Sync {
    /// Create the row for `invoice.order_id`, or rewrite it if the status
    /// transition is legal.
    async fn upsert(&self, invoice: NewInvoice) -> Result<Invoice, LedgerError>;

    /// Insert a row only if the order has none yet.
    async fn record_pending(&self, invoice: NewInvoice) -> Result<PendingResult, LedgerError>;

    async fn find_by_order_id(&self, order_id: &str) -> Result<Option<Invoice>, LedgerError>;

    async fn find_by_tracking_id(&self, tracking_id: &str)
        -> Result<Option<Invoice>, LedgerError>;

    async fn find_by_order_ids(
        &self,
        shop_id: Uuid,
        order_ids: &[String],
    ) -> Result<Vec<Invoice>, LedgerError>;

    /// Atomically take the submission claim for an order. At most one caller
    /// holds a live claim per order.
    async fn claim_submission(
        &self,
        invoice: NewInvoice,
        lease: Duration,
    ) -> Result<ClaimResult, LedgerError>;

    /// Undo a claim whose request never reached the provider.
    async fn release_claim(
        &self,
        order_id: &str,
        previous: Option<Invoice>,
    ) -> Result<(), LedgerError>;

    async fn mark_processing(
        &self,
        order_id: &str,
        tracking_id: &str,
    ) -> Result<Invoice, LedgerError>;

    async fn mark_failed(&self, order_id: &str, message: &str) -> Result<Invoice, LedgerError>;

    /// Apply the provider's verdict to the `processing` row with this
    /// tracking id.
    async fn apply_authorization(
        &self,
        tracking_id: &str,
        outcome: &AuthorizationOutcome,
    ) -> Result<ApplyResult, LedgerError>;

    /// Null personal data on matching rows. Returns the number of rows touched.
    async fn redact_customers(
        &self,
        shop_id: Uuid,
        target: &RedactionTarget,
    ) -> Result<u64, LedgerError>;

    /// Delete every invoice of a shop.
    async fn purge_shop(&self, shop_id: Uuid) -> Result<u64, LedgerError>;

    async fn stats(&self, shop_id: Uuid) -> Result<InvoiceStats, LedgerError>;

    /// `processing` rows neither updated nor polled since `older_than`.
    /// Rows never polled come first, then the least recently polled.
    async fn list_stale_processing(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Invoice>, LedgerError>;

    /// Note that the provider was asked about this row and did not settle it.
    async fn touch_polled(&self, order_id: &str) -> Result<(), LedgerError>;
}

/// Error for a guarded write that matched no row in an allowed status.
pub(crate) fn rejected_transition(
    order_id: &str,
    current: Option<&Invoice>,
    to: InvoiceStatus,
) -> LedgerError {
    match current {
        Some(invoice) => LedgerError::InvalidTransition {
            order_id: order_id.to_string(),
            from: invoice.status(),
            to,
        },
        None => LedgerError::NotFound(order_id.to_string()),
    }
}
