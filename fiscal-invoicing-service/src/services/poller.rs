//! Polling fallback for authorization results whose callback never arrived.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::ledger::{InvoiceLedger, LedgerError};
use super::reconciliation::{CallbackAck, CallbackPayload, ReconciliationHandler, AUTHORIZED_STATUS};
use super::shop_store::ShopStore;
use crate::billing::{BillingClient, StatusReply};
use crate::models::Invoice;

/// Rows examined per tick.
pub const POLL_BATCH_SIZE: i64 = 50;

/// Provider statuses that settle an invoice as rejected.
const REJECTED_STATUSES: &[&str] = &["rechazado", "error", "anulado"];

/// Callback-equivalent payload for a status reply, or `None` while the
/// provider is still working on it.
pub fn settled_payload(tracking_id: &str, reply: &StatusReply) -> Option<CallbackPayload> {
    let status = reply.status.as_deref()?.trim().to_lowercase();
    let authorized = status == AUTHORIZED_STATUS && reply.authorization_code.is_some();
    if !authorized && !REJECTED_STATUSES.contains(&status.as_str()) {
        return None;
    }

    Some(CallbackPayload {
        tracking_id: Some(tracking_id.to_string()),
        authorization_code: reply.authorization_code.clone(),
        document_number: reply.document_number.clone(),
        status: reply.status.clone(),
        errors: reply.errors.clone(),
        message: reply.message.clone(),
    })
}

pub struct AuthorizationPoller {
    ledger: Arc<dyn InvoiceLedger>,
    shops: Arc<dyn ShopStore>,
    billing: Arc<BillingClient>,
    reconciliation: Arc<ReconciliationHandler>,
    period: Duration,
}

impl AuthorizationPoller {
    pub fn new(
        ledger: Arc<dyn InvoiceLedger>,
        shops: Arc<dyn ShopStore>,
        billing: Arc<BillingClient>,
        reconciliation: Arc<ReconciliationHandler>,
        period: Duration,
    ) -> Self {
        Self {
            ledger,
            shops,
            billing,
            reconciliation,
            period,
        }
    }

    /// Query the provider for up to one batch of `processing` rows that have
    /// been neither updated nor polled for one period. Returns how many rows
    /// were settled.
    pub async fn poll_once(&self) -> Result<usize, LedgerError> {
        let period = chrono::Duration::from_std(self.period).unwrap_or(chrono::Duration::zero());
        let stale = self
            .ledger
            .list_stale_processing(Utc::now() - period, POLL_BATCH_SIZE)
            .await?;

        let mut settled = 0;
        for invoice in stale {
            if self.poll_invoice(&invoice).await? {
                settled += 1;
            } else {
                // Moves the row behind the rest of the backlog.
                self.ledger.touch_polled(&invoice.order_id).await?;
            }
        }
        if settled > 0 {
            info!(settled, "Authorization poll settled invoices");
        }
        Ok(settled)
    }

    async fn poll_invoice(&self, invoice: &Invoice) -> Result<bool, LedgerError> {
        let Some(tracking_id) = invoice.tracking_id.as_deref() else {
            return Ok(false);
        };
        let shop = match self.shops.find_by_id(invoice.shop_id).await {
            Ok(Some(shop)) if shop.credentials.is_complete() => shop,
            Ok(_) => return Ok(false),
            Err(e) => {
                warn!(error = %e, order_id = %invoice.order_id, "Shop lookup failed during poll");
                return Ok(false);
            }
        };

        let reply = match self.billing.query_status(tracking_id, &shop.credentials).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, tracking_id, "Status query failed");
                return Ok(false);
            }
        };

        match settled_payload(tracking_id, &reply) {
            Some(payload) => Ok(self.reconciliation.apply(&payload).await? == CallbackAck::Processed),
            None => {
                debug!(tracking_id, status = ?reply.status, "Invoice still awaiting authorization");
                Ok(false)
            }
        }
    }

    /// Run `poll_once` every period until the runtime shuts down.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.poll_once().await {
                    warn!(error = %e, "Authorization poll failed");
                }
            }
        })
    }
}
