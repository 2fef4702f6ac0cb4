//! In-memory ledger and shop store, used when no database is configured and
//! by tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::models::{
    ApplyResult, AuthorizationOutcome, ClaimResult, Invoice, InvoiceStats, InvoiceStatus,
    NewInvoice, PendingResult, RedactionTarget, ShopConfig, ShopStatus, REDACTED_NAME,
};
use crate::services::ledger::{
    rejected_transition, InvoiceLedger, LedgerError, FAILURE_SOURCES, PROCESSING_SOURCES,
};
use crate::services::shop_store::ShopStore;

/// Ledger rows keyed by order id. One mutex guards the whole map, which
/// makes every operation atomic.
#[derive(Default)]
pub struct InMemoryInvoiceLedger {
    rows: Mutex<HashMap<String, Invoice>>,
    /// Last unsettled status poll per order id.
    polled: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl InMemoryInvoiceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row, in no particular order.
    pub async fn snapshot(&self) -> Vec<Invoice> {
        self.rows.lock().await.values().cloned().collect()
    }

    /// Insert a row as-is.
    pub async fn insert(&self, invoice: Invoice) {
        self.rows.lock().await.insert(invoice.order_id.clone(), invoice);
    }
}

fn guarded_update(
    rows: &mut HashMap<String, Invoice>,
    order_id: &str,
    allowed: &[InvoiceStatus],
    to: InvoiceStatus,
    apply: impl FnOnce(&mut Invoice),
) -> Result<Invoice, LedgerError> {
    match rows.get_mut(order_id) {
        Some(row) if allowed.contains(&row.status()) => {
            apply(row);
            row.status = to.as_str().to_string();
            row.updated_at = Utc::now();
            Ok(row.clone())
        }
        other => Err(rejected_transition(order_id, other.as_deref(), to)),
    }
}

fn refresh_snapshot(row: &mut Invoice, invoice: &NewInvoice) {
    row.order_number = invoice.order_number.clone();
    row.customer_name = invoice.customer_name.clone();
    row.customer_email = invoice.customer_email.clone();
    row.total_amount = invoice.total_amount;
    if invoice.invoice_data.is_some() {
        row.invoice_data = invoice.invoice_data.clone();
    }
}

#[async_trait]
impl InvoiceLedger for InMemoryInvoiceLedger {
    async fn upsert(&self, invoice: NewInvoice) -> Result<Invoice, LedgerError> {
        let mut rows = self.rows.lock().await;
        let now = Utc::now();

        let Some(row) = rows.get_mut(&invoice.order_id) else {
            let created = invoice.into_invoice(now);
            rows.insert(created.order_id.clone(), created.clone());
            return Ok(created);
        };

        let from = row.status();
        if !from.can_transition_to(invoice.status) {
            return Err(LedgerError::InvalidTransition {
                order_id: invoice.order_id,
                from,
                to: invoice.status,
            });
        }

        refresh_snapshot(row, &invoice);
        row.status = invoice.status.as_str().to_string();
        if invoice.tracking_id.is_some() {
            row.tracking_id = invoice.tracking_id;
        }
        row.error_message = invoice.error_message;
        row.submission_claimed_at = if invoice.status == InvoiceStatus::Submitting {
            row.submission_claimed_at.or(Some(now))
        } else {
            None
        };
        row.updated_at = now;
        Ok(row.clone())
    }

    async fn record_pending(&self, invoice: NewInvoice) -> Result<PendingResult, LedgerError> {
        let mut rows = self.rows.lock().await;
        if let Some(existing) = rows.get(&invoice.order_id) {
            return Ok(PendingResult::Existing(existing.clone()));
        }
        let created = NewInvoice {
            status: InvoiceStatus::Pending,
            ..invoice
        }
        .into_invoice(Utc::now());
        rows.insert(created.order_id.clone(), created.clone());
        Ok(PendingResult::Inserted(created))
    }

    async fn find_by_order_id(&self, order_id: &str) -> Result<Option<Invoice>, LedgerError> {
        Ok(self.rows.lock().await.get(order_id).cloned())
    }

    async fn find_by_tracking_id(
        &self,
        tracking_id: &str,
    ) -> Result<Option<Invoice>, LedgerError> {
        Ok(self
            .rows
            .lock()
            .await
            .values()
            .find(|row| row.tracking_id.as_deref() == Some(tracking_id))
            .cloned())
    }

    async fn find_by_order_ids(
        &self,
        shop_id: Uuid,
        order_ids: &[String],
    ) -> Result<Vec<Invoice>, LedgerError> {
        let rows = self.rows.lock().await;
        Ok(order_ids
            .iter()
            .filter_map(|id| rows.get(id))
            .filter(|row| row.shop_id == shop_id)
            .cloned()
            .collect())
    }

    async fn claim_submission(
        &self,
        invoice: NewInvoice,
        lease: Duration,
    ) -> Result<ClaimResult, LedgerError> {
        let mut rows = self.rows.lock().await;
        let now = Utc::now();

        let Some(row) = rows.get_mut(&invoice.order_id) else {
            let created = NewInvoice {
                status: InvoiceStatus::Submitting,
                ..invoice
            }
            .into_invoice(now);
            rows.insert(created.order_id.clone(), created.clone());
            return Ok(ClaimResult::Claimed {
                invoice: created,
                previous: None,
            });
        };

        if let Some(conflict) = row.claim_conflict(lease, now) {
            return Ok(conflict);
        }

        let previous = row.clone();
        refresh_snapshot(row, &invoice);
        row.status = InvoiceStatus::Submitting.as_str().to_string();
        row.error_message = None;
        row.submission_claimed_at = Some(now);
        row.updated_at = now;

        Ok(ClaimResult::Claimed {
            invoice: row.clone(),
            previous: Some(Box::new(previous)),
        })
    }

    async fn release_claim(
        &self,
        order_id: &str,
        previous: Option<Invoice>,
    ) -> Result<(), LedgerError> {
        let mut rows = self.rows.lock().await;
        let holds_claim = rows
            .get(order_id)
            .is_some_and(|row| row.status() == InvoiceStatus::Submitting);
        if !holds_claim {
            return Ok(());
        }
        match previous {
            Some(previous) => {
                rows.insert(order_id.to_string(), previous);
            }
            None => {
                rows.remove(order_id);
            }
        }
        Ok(())
    }

    async fn mark_processing(
        &self,
        order_id: &str,
        tracking_id: &str,
    ) -> Result<Invoice, LedgerError> {
        let mut rows = self.rows.lock().await;
        guarded_update(
            &mut rows,
            order_id,
            &PROCESSING_SOURCES,
            InvoiceStatus::Processing,
            |row| {
                row.tracking_id = Some(tracking_id.to_string());
                row.error_message = None;
                row.submission_claimed_at = None;
            },
        )
    }

    async fn mark_failed(&self, order_id: &str, message: &str) -> Result<Invoice, LedgerError> {
        let mut rows = self.rows.lock().await;
        guarded_update(
            &mut rows,
            order_id,
            &FAILURE_SOURCES,
            InvoiceStatus::Failed,
            |row| {
                row.error_message = Some(message.to_string());
                row.submission_claimed_at = None;
            },
        )
    }

    async fn apply_authorization(
        &self,
        tracking_id: &str,
        outcome: &AuthorizationOutcome,
    ) -> Result<ApplyResult, LedgerError> {
        let mut rows = self.rows.lock().await;
        let Some(row) = rows
            .values_mut()
            .find(|row| row.tracking_id.as_deref() == Some(tracking_id))
        else {
            return Ok(ApplyResult::NotFound);
        };

        if row.status() != InvoiceStatus::Processing {
            return Ok(ApplyResult::Ignored(row.clone()));
        }

        let now = Utc::now();
        match outcome {
            AuthorizationOutcome::Authorized {
                authorization_code,
                document_number,
            } => {
                row.status = InvoiceStatus::Completed.as_str().to_string();
                row.authorization_code = authorization_code.clone();
                row.document_number = document_number.clone();
                row.error_message = None;
            }
            AuthorizationOutcome::Rejected { reason } => {
                row.status = InvoiceStatus::Failed.as_str().to_string();
                row.error_message = Some(reason.clone());
            }
        }
        row.processed_at = Some(now);
        row.updated_at = now;
        Ok(ApplyResult::Applied(row.clone()))
    }

    async fn redact_customers(
        &self,
        shop_id: Uuid,
        target: &RedactionTarget,
    ) -> Result<u64, LedgerError> {
        let mut rows = self.rows.lock().await;
        let mut touched = 0;
        for row in rows.values_mut().filter(|row| row.shop_id == shop_id) {
            let matches = match target {
                RedactionTarget::OrderIds(ids) => ids.contains(&row.order_id),
                RedactionTarget::CustomerEmail(email) => row
                    .customer_email
                    .as_deref()
                    .is_some_and(|e| e.eq_ignore_ascii_case(email)),
            };
            if matches {
                row.customer_name = REDACTED_NAME.to_string();
                row.customer_email = None;
                row.invoice_data = None;
                row.updated_at = Utc::now();
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn purge_shop(&self, shop_id: Uuid) -> Result<u64, LedgerError> {
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|_, row| row.shop_id != shop_id);
        Ok((before - rows.len()) as u64)
    }

    async fn stats(&self, shop_id: Uuid) -> Result<InvoiceStats, LedgerError> {
        let rows = self.rows.lock().await;
        let mut stats = InvoiceStats::default();
        for row in rows.values().filter(|row| row.shop_id == shop_id) {
            stats.total += 1;
            match row.status() {
                InvoiceStatus::Completed => stats.invoiced += 1,
                InvoiceStatus::Failed => stats.errors += 1,
                _ => stats.pending += 1,
            }
        }
        Ok(stats)
    }

    async fn list_stale_processing(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Invoice>, LedgerError> {
        let rows = self.rows.lock().await;
        let polled = self.polled.lock().await;
        let mut stale: Vec<(Option<DateTime<Utc>>, Invoice)> = rows
            .values()
            .filter(|row| {
                row.status() == InvoiceStatus::Processing
                    && row.tracking_id.is_some()
                    && row.updated_at < older_than
            })
            .map(|row| (polled.get(&row.order_id).copied(), row.clone()))
            .filter(|(last_polled, _)| last_polled.map_or(true, |at| at < older_than))
            .collect();
        // `None` sorts first: never-polled rows lead.
        stale.sort_by_key(|(last_polled, row)| (*last_polled, row.updated_at));
        stale.truncate(limit.max(0) as usize);
        Ok(stale.into_iter().map(|(_, row)| row).collect())
    }

    async fn touch_polled(&self, order_id: &str) -> Result<(), LedgerError> {
        let rows = self.rows.lock().await;
        if rows
            .get(order_id)
            .is_some_and(|row| row.status() == InvoiceStatus::Processing)
        {
            self.polled
                .lock()
                .await
                .insert(order_id.to_string(), Utc::now());
        }
        Ok(())
    }
}

/// Shops keyed by domain.
#[derive(Default)]
pub struct InMemoryShopStore {
    shops: RwLock<HashMap<String, ShopConfig>>,
    sessions: RwLock<HashMap<String, usize>>,
}

impl InMemoryShopStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, shop: ShopConfig) {
        self.sessions
            .write()
            .await
            .insert(shop.shop_domain.clone(), 1);
        self.shops.write().await.insert(shop.shop_domain.clone(), shop);
    }

    /// Whether session data is still held for the shop.
    pub async fn has_sessions(&self, shop_domain: &str) -> bool {
        self.sessions.read().await.contains_key(shop_domain)
    }
}

#[async_trait]
impl ShopStore for InMemoryShopStore {
    async fn find_by_domain(&self, shop_domain: &str) -> anyhow::Result<Option<ShopConfig>> {
        Ok(self.shops.read().await.get(shop_domain).cloned())
    }

    async fn find_by_id(&self, shop_id: Uuid) -> anyhow::Result<Option<ShopConfig>> {
        Ok(self
            .shops
            .read()
            .await
            .values()
            .find(|shop| shop.id == shop_id)
            .cloned())
    }

    async fn mark_uninstalled(&self, shop_domain: &str) -> anyhow::Result<bool> {
        let mut shops = self.shops.write().await;
        Ok(match shops.get_mut(shop_domain) {
            Some(shop) => {
                shop.status = ShopStatus::Uninstalled;
                true
            }
            None => false,
        })
    }

    async fn delete_shop(&self, shop_domain: &str) -> anyhow::Result<bool> {
        self.sessions.write().await.remove(shop_domain);
        Ok(self.shops.write().await.remove(shop_domain).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn new_invoice(shop_id: Uuid, order_id: &str) -> NewInvoice {
        NewInvoice {
            shop_id,
            order_id: order_id.into(),
            order_number: format!("#{order_id}"),
            customer_name: "Ana Gomez".into(),
            customer_email: Some("ana@example.com".into()),
            total_amount: Decimal::from(1210),
            status: InvoiceStatus::Pending,
            tracking_id: None,
            error_message: None,
            invoice_data: Some(serde_json::json!({ "total": "1210.000" })),
        }
    }

    const LEASE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn claim_then_processing_then_completed() {
        let ledger = InMemoryInvoiceLedger::new();
        let shop = Uuid::new_v4();

        let claim = ledger.claim_submission(new_invoice(shop, "1"), LEASE).await.unwrap();
        assert!(matches!(claim, ClaimResult::Claimed { previous: None, .. }));

        let second = ledger.claim_submission(new_invoice(shop, "1"), LEASE).await.unwrap();
        assert!(matches!(second, ClaimResult::InFlight(_)));

        let row = ledger.mark_processing("1", "T-1").await.unwrap();
        assert_eq!(row.status(), InvoiceStatus::Processing);
        assert_eq!(row.submission_claimed_at, None);

        let outcome = AuthorizationOutcome::Authorized {
            authorization_code: Some("74000000000001".into()),
            document_number: Some("0001-00000001".into()),
        };
        let applied = ledger.apply_authorization("T-1", &outcome).await.unwrap();
        let ApplyResult::Applied(row) = applied else {
            panic!("expected applied, got {applied:?}");
        };
        assert_eq!(row.status(), InvoiceStatus::Completed);
        assert!(row.processed_at.is_some());

        // a late duplicate callback leaves the completed row alone
        let rejected = AuthorizationOutcome::Rejected { reason: "x".into() };
        assert!(matches!(
            ledger.apply_authorization("T-1", &rejected).await.unwrap(),
            ApplyResult::Ignored(_)
        ));
        assert!(matches!(
            ledger.claim_submission(new_invoice(shop, "1"), LEASE).await.unwrap(),
            ClaimResult::AlreadyCompleted(_)
        ));
    }

    #[tokio::test]
    async fn release_restores_previous_row() {
        let ledger = InMemoryInvoiceLedger::new();
        let shop = Uuid::new_v4();
        ledger
            .upsert(new_invoice(shop, "2").with_error("bad hash"))
            .await
            .unwrap();
        ledger.mark_failed("2", "bad hash").await.unwrap();

        let ClaimResult::Claimed { previous, .. } =
            ledger.claim_submission(new_invoice(shop, "2"), LEASE).await.unwrap()
        else {
            panic!("failed rows are claimable");
        };
        ledger.release_claim("2", previous.map(|b| *b)).await.unwrap();

        let row = ledger.find_by_order_id("2").await.unwrap().unwrap();
        assert_eq!(row.status(), InvoiceStatus::Failed);
        assert_eq!(row.error_message.as_deref(), Some("bad hash"));
    }

    #[tokio::test]
    async fn release_of_fresh_claim_removes_row() {
        let ledger = InMemoryInvoiceLedger::new();
        ledger
            .claim_submission(new_invoice(Uuid::new_v4(), "3"), LEASE)
            .await
            .unwrap();
        ledger.release_claim("3", None).await.unwrap();
        assert!(ledger.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn polled_rows_queue_behind_unpolled_ones() {
        let ledger = InMemoryInvoiceLedger::new();
        let shop = Uuid::new_v4();
        for (order_id, tracking_id) in [("1", "T-1"), ("2", "T-2"), ("3", "T-3")] {
            ledger.claim_submission(new_invoice(shop, order_id), LEASE).await.unwrap();
            ledger.mark_processing(order_id, tracking_id).await.unwrap();
        }
        let cutoff = Utc::now() + chrono::Duration::seconds(1);

        let first = ledger.list_stale_processing(cutoff, 1).await.unwrap();
        let polled = first[0].order_id.clone();
        ledger.touch_polled(&polled).await.unwrap();

        let batch = ledger.list_stale_processing(cutoff, 3).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[2].order_id, polled);
    }

    #[tokio::test]
    async fn stale_claim_can_be_taken_over() {
        let ledger = InMemoryInvoiceLedger::new();
        let shop = Uuid::new_v4();
        ledger
            .claim_submission(new_invoice(shop, "4"), Duration::ZERO)
            .await
            .unwrap();
        let again = ledger
            .claim_submission(new_invoice(shop, "4"), Duration::ZERO)
            .await
            .unwrap();
        assert!(matches!(again, ClaimResult::Claimed { previous: Some(_), .. }));
    }

    #[tokio::test]
    async fn upsert_rejects_rewriting_completed() {
        let ledger = InMemoryInvoiceLedger::new();
        let shop = Uuid::new_v4();
        let mut processing = new_invoice(shop, "5");
        processing.status = InvoiceStatus::Processing;
        processing.tracking_id = Some("T-5".into());
        ledger.upsert(processing).await.unwrap();
        ledger
            .apply_authorization(
                "T-5",
                &AuthorizationOutcome::Authorized {
                    authorization_code: Some("CAE".into()),
                    document_number: None,
                },
            )
            .await
            .unwrap();

        let err = ledger.upsert(new_invoice(shop, "5")).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InvalidTransition {
                from: InvoiceStatus::Completed,
                to: InvoiceStatus::Pending,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn guarded_writes_report_missing_rows() {
        let ledger = InMemoryInvoiceLedger::new();
        assert!(matches!(
            ledger.mark_processing("nope", "T").await,
            Err(LedgerError::NotFound(_))
        ));
        assert!(matches!(
            ledger
                .apply_authorization("nope", &AuthorizationOutcome::Rejected { reason: "r".into() })
                .await
                .unwrap(),
            ApplyResult::NotFound
        ));
    }

    #[tokio::test]
    async fn redaction_by_email_and_stats() {
        let ledger = InMemoryInvoiceLedger::new();
        let shop = Uuid::new_v4();
        ledger.record_pending(new_invoice(shop, "6")).await.unwrap();
        ledger.record_pending(new_invoice(shop, "7")).await.unwrap();
        ledger.mark_failed("7", "rechazado").await.unwrap();
        let mut other = new_invoice(shop, "8");
        other.customer_email = Some("otro@example.com".into());
        ledger.record_pending(other).await.unwrap();

        let touched = ledger
            .redact_customers(shop, &RedactionTarget::CustomerEmail("ANA@example.com".into()))
            .await
            .unwrap();
        assert_eq!(touched, 2);

        let row = ledger.find_by_order_id("6").await.unwrap().unwrap();
        assert_eq!(row.customer_name, REDACTED_NAME);
        assert_eq!(row.customer_email, None);
        assert_eq!(row.invoice_data, None);
        assert_eq!(row.total_amount, Decimal::from(1210));

        let stats = ledger.stats(shop).await.unwrap();
        assert_eq!(
            stats,
            InvoiceStats {
                total: 3,
                invoiced: 0,
                pending: 2,
                errors: 1
            }
        );
        assert_eq!(ledger.purge_shop(shop).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn record_pending_keeps_existing_row() {
        let ledger = InMemoryInvoiceLedger::new();
        let shop = Uuid::new_v4();
        ledger.claim_submission(new_invoice(shop, "9"), LEASE).await.unwrap();
        let result = ledger.record_pending(new_invoice(shop, "9")).await.unwrap();
        let PendingResult::Existing(row) = result else {
            panic!("expected existing row");
        };
        assert_eq!(row.status(), InvoiceStatus::Submitting);
    }

    #[tokio::test]
    async fn shop_store_lifecycle() {
        use crate::models::ProviderCredentials;
        use secrecy::Secret;

        let store = InMemoryShopStore::new();
        let shop = ShopConfig {
            id: Uuid::new_v4(),
            shop_domain: "demo.myshopify.com".into(),
            access_token: Secret::new("shpat".into()),
            status: ShopStatus::Active,
            auto_invoice: false,
            credentials: ProviderCredentials {
                account: "1".into(),
                username: "u".into(),
                secret_hash: Secret::new("h".into()),
                point_of_sale: "1".into(),
            },
        };
        store.insert(shop.clone()).await;

        assert!(store.find_by_id(shop.id).await.unwrap().is_some());
        assert!(store.mark_uninstalled("demo.myshopify.com").await.unwrap());
        let found = store.find_by_domain("demo.myshopify.com").await.unwrap().unwrap();
        assert_eq!(found.status, ShopStatus::Uninstalled);

        assert!(store.delete_shop("demo.myshopify.com").await.unwrap());
        assert!(!store.has_sessions("demo.myshopify.com").await);
        assert!(!store.delete_shop("demo.myshopify.com").await.unwrap());
    }
}
