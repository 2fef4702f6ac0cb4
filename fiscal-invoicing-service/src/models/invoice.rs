//! Invoice ledger rows and the status machine they follow.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::time::Duration;
use uuid::Uuid;

use super::invoice_request::InvoiceRequest;

/// Placeholder written over customer names on erasure requests.
pub const REDACTED_NAME: &str = "[REDACTED]";

/// Invoice status.
///
/// `pending -> submitting -> processing -> completed | failed`, with
/// `failed -> submitting` allowed for retries. A `submitting` row that comes
/// back to `pending` or `failed` is a released claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Submitting,
    Processing,
    Completed,
    Failed,
}

impl InvoiceStatus {
    pub const ALL: [InvoiceStatus; 5] = [
        InvoiceStatus::Pending,
        InvoiceStatus::Submitting,
        InvoiceStatus::Processing,
        InvoiceStatus::Completed,
        InvoiceStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Submitting => "submitting",
            InvoiceStatus::Processing => "processing",
            InvoiceStatus::Completed => "completed",
            InvoiceStatus::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "submitting" => InvoiceStatus::Submitting,
            "processing" => InvoiceStatus::Processing,
            "completed" => InvoiceStatus::Completed,
            "failed" => InvoiceStatus::Failed,
            _ => InvoiceStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InvoiceStatus::Completed)
    }

    /// Whether a row in `self` may be moved to `next`. Rewriting a
    /// non-terminal status onto itself is allowed.
    pub fn can_transition_to(&self, next: InvoiceStatus) -> bool {
        use InvoiceStatus::*;
        match (*self, next) {
            (Completed, _) => false,
            (a, b) if a == b => true,
            (Pending, Submitting | Processing | Failed) => true,
            (Submitting, Pending | Processing | Failed) => true,
            (Processing, Completed | Failed) => true,
            (Failed, Submitting | Processing | Pending) => true,
            _ => false,
        }
    }

    /// Statuses a row may currently hold for a write to `next` to be legal.
    pub fn allowed_sources(next: InvoiceStatus) -> Vec<InvoiceStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(next))
            .collect()
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ledger row per e-commerce order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub id: Uuid,
    pub shop_id: Uuid,
    pub order_id: String,
    pub order_number: String,
    pub customer_name: String,
    pub customer_email: Option<String>,
    pub total_amount: Decimal,
    pub status: String,
    pub tracking_id: Option<String>,
    pub document_number: Option<String>,
    pub authorization_code: Option<String>,
    pub error_message: Option<String>,
    pub invoice_data: Option<serde_json::Value>,
    pub submission_claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Invoice {
    pub fn status(&self) -> InvoiceStatus {
        InvoiceStatus::from_string(&self.status)
    }

    /// True while a submission claim is held and younger than `lease`.
    pub fn has_live_claim(&self, lease: Duration, now: DateTime<Utc>) -> bool {
        if self.status() != InvoiceStatus::Submitting {
            return false;
        }
        let Some(claimed_at) = self.submission_claimed_at else {
            return false;
        };
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(365));
        claimed_at + lease > now
    }

    /// Decide what a submission claim against this row yields. `None` means
    /// the row may be claimed.
    pub fn claim_conflict(&self, lease: Duration, now: DateTime<Utc>) -> Option<ClaimResult> {
        match self.status() {
            InvoiceStatus::Completed => Some(ClaimResult::AlreadyCompleted(self.clone())),
            InvoiceStatus::Processing => Some(ClaimResult::AwaitingAuthorization(self.clone())),
            InvoiceStatus::Submitting if self.has_live_claim(lease, now) => {
                Some(ClaimResult::InFlight(self.clone()))
            }
            _ => None,
        }
    }

    /// Stored request snapshot, if any.
    pub fn request(&self) -> Option<InvoiceRequest> {
        self.invoice_data
            .as_ref()
            .and_then(|data| serde_json::from_value(data.clone()).ok())
    }
}

/// Input for creating or rewriting a ledger row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewInvoice {
    pub shop_id: Uuid,
    pub order_id: String,
    pub order_number: String,
    pub customer_name: String,
    pub customer_email: Option<String>,
    pub total_amount: Decimal,
    pub status: InvoiceStatus,
    pub tracking_id: Option<String>,
    pub error_message: Option<String>,
    pub invoice_data: Option<serde_json::Value>,
}

impl NewInvoice {
    /// Ledger input snapshotting a mapped request.
    pub fn for_request(
        shop_id: Uuid,
        order_id: &str,
        request: &InvoiceRequest,
        status: InvoiceStatus,
    ) -> Self {
        Self {
            shop_id,
            order_id: order_id.to_string(),
            order_number: request.order_number.clone(),
            customer_name: request.buyer.name.clone(),
            customer_email: request.buyer.email.clone(),
            total_amount: request.order_total,
            status,
            tracking_id: None,
            error_message: None,
            invoice_data: serde_json::to_value(request).ok(),
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Materialize a fresh row.
    pub fn into_invoice(self, now: DateTime<Utc>) -> Invoice {
        let claimed = self.status == InvoiceStatus::Submitting;
        Invoice {
            id: Uuid::new_v4(),
            shop_id: self.shop_id,
            order_id: self.order_id,
            order_number: self.order_number,
            customer_name: self.customer_name,
            customer_email: self.customer_email,
            total_amount: self.total_amount,
            status: self.status.as_str().to_string(),
            tracking_id: self.tracking_id,
            document_number: None,
            authorization_code: None,
            error_message: self.error_message,
            invoice_data: self.invoice_data,
            submission_claimed_at: claimed.then_some(now),
            created_at: now,
            updated_at: now,
            processed_at: None,
        }
    }
}

/// Result of trying to take the submission claim for an order.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimResult {
    /// The caller owns the claim. `previous` is the row as it was before the
    /// claim, or `None` if the row was created by it.
    Claimed {
        invoice: Invoice,
        previous: Option<Box<Invoice>>,
    },
    AlreadyCompleted(Invoice),
    AwaitingAuthorization(Invoice),
    InFlight(Invoice),
}

/// Result of recording a `pending` row.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingResult {
    Inserted(Invoice),
    Existing(Invoice),
}

/// Final verdict reported by the provider for a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationOutcome {
    Authorized {
        authorization_code: Option<String>,
        document_number: Option<String>,
    },
    Rejected {
        reason: String,
    },
}

/// Result of applying an authorization outcome to the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyResult {
    Applied(Invoice),
    /// The row exists but is not awaiting authorization.
    Ignored(Invoice),
    NotFound,
}

/// Which invoices a customer erasure request covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedactionTarget {
    OrderIds(Vec<String>),
    CustomerEmail(String),
}

/// Per-shop counters. `pending` counts everything not yet final.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceStats {
    pub total: i64,
    pub invoiced: i64,
    pub pending: i64,
    pub errors: i64,
}
