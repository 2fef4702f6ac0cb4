//! PostgreSQL backend for the invoice ledger and shop store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::models::{
    ApplyResult, AuthorizationOutcome, ClaimResult, Invoice, InvoiceStats, InvoiceStatus,
    NewInvoice, PendingResult, RedactionTarget, ShopConfig, ShopRow, REDACTED_NAME,
};
use crate::services::ledger::{
    rejected_transition, InvoiceLedger, LedgerError, FAILURE_SOURCES, PROCESSING_SOURCES,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::shop_store::ShopStore;

const INVOICE_COLUMNS: &str = "id, shop_id, order_id, order_number, customer_name, \
     customer_email, total_amount, status, tracking_id, document_number, authorization_code, \
     error_message, invoice_data, submission_claimed_at, created_at, updated_at, processed_at";

const SHOP_COLUMNS: &str = "id, shop_domain, access_token, status, auto_invoice, \
     provider_account, provider_username, provider_secret_hash, point_of_sale";

fn db_err(action: &'static str) -> impl Fn(sqlx::Error) -> LedgerError {
    move |e| LedgerError::Storage(anyhow::anyhow!("Failed to {}: {}", action, e))
}

fn status_list(statuses: &[InvoiceStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "fiscal-invoicing-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn fetch_by_order_id<'e, E>(executor: E, order_id: &str) -> Result<Option<Invoice>, LedgerError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(executor)
        .await
        .map_err(db_err("fetch invoice"))
    }

    /// Status-guarded single-row update shared by `mark_processing` and
    /// `mark_failed`.
    async fn guarded_update(
        &self,
        operation: &'static str,
        order_id: &str,
        sources: &[InvoiceStatus],
        to: InvoiceStatus,
        set_clause: &str,
        value: &str,
    ) -> Result<Invoice, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&[operation])
            .start_timer();

        let updated = sqlx::query_as::<_, Invoice>(&format!(
            "UPDATE invoices SET status = $3, {set_clause}, submission_claimed_at = NULL, \
             updated_at = NOW() WHERE order_id = $1 AND status = ANY($2) \
             RETURNING {INVOICE_COLUMNS}"
        ))
        .bind(order_id)
        .bind(status_list(sources))
        .bind(to.as_str())
        .bind(value)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("update invoice status"))?;

        timer.observe_duration();

        match updated {
            Some(invoice) => Ok(invoice),
            None => {
                let current = Self::fetch_by_order_id(&self.pool, order_id).await?;
                Err(rejected_transition(order_id, current.as_ref(), to))
            }
        }
    }
}

#[async_trait]
impl InvoiceLedger for Database {
    #[instrument(skip(self, invoice), fields(order_id = %invoice.order_id, status = %invoice.status))]
    async fn upsert(&self, invoice: NewInvoice) -> Result<Invoice, LedgerError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["upsert"]).start_timer();
        let now = Utc::now();
        let sources = status_list(&InvoiceStatus::allowed_sources(invoice.status));

        let row = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            INSERT INTO invoices (id, shop_id, order_id, order_number, customer_name, customer_email,
                total_amount, status, tracking_id, error_message, invoice_data,
                submission_claimed_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                CASE WHEN $8 = 'submitting' THEN $12::timestamptz END, $12, $12)
            ON CONFLICT (order_id) DO UPDATE SET
                order_number = EXCLUDED.order_number,
                customer_name = EXCLUDED.customer_name,
                customer_email = EXCLUDED.customer_email,
                total_amount = EXCLUDED.total_amount,
                status = EXCLUDED.status,
                tracking_id = COALESCE(EXCLUDED.tracking_id, invoices.tracking_id),
                error_message = EXCLUDED.error_message,
                invoice_data = COALESCE(EXCLUDED.invoice_data, invoices.invoice_data),
                submission_claimed_at = CASE WHEN EXCLUDED.status = 'submitting'
                    THEN COALESCE(invoices.submission_claimed_at, EXCLUDED.updated_at) END,
                updated_at = EXCLUDED.updated_at
            WHERE invoices.status = ANY($13)
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(invoice.shop_id)
        .bind(&invoice.order_id)
        .bind(&invoice.order_number)
        .bind(&invoice.customer_name)
        .bind(&invoice.customer_email)
        .bind(invoice.total_amount)
        .bind(invoice.status.as_str())
        .bind(&invoice.tracking_id)
        .bind(&invoice.error_message)
        .bind(&invoice.invoice_data)
        .bind(now)
        .bind(sources)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("upsert invoice"))?;

        timer.observe_duration();

        match row {
            Some(row) => Ok(row),
            None => {
                let current = Self::fetch_by_order_id(&self.pool, &invoice.order_id).await?;
                Err(rejected_transition(&invoice.order_id, current.as_ref(), invoice.status))
            }
        }
    }

    #[instrument(skip(self, invoice), fields(order_id = %invoice.order_id))]
    async fn record_pending(&self, invoice: NewInvoice) -> Result<PendingResult, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_pending"])
            .start_timer();

        let inserted = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            INSERT INTO invoices (id, shop_id, order_id, order_number, customer_name, customer_email,
                total_amount, status, error_message, invoice_data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, $9)
            ON CONFLICT (order_id) DO NOTHING
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(invoice.shop_id)
        .bind(&invoice.order_id)
        .bind(&invoice.order_number)
        .bind(&invoice.customer_name)
        .bind(&invoice.customer_email)
        .bind(invoice.total_amount)
        .bind(&invoice.error_message)
        .bind(&invoice.invoice_data)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("record pending invoice"))?;

        timer.observe_duration();

        if let Some(row) = inserted {
            return Ok(PendingResult::Inserted(row));
        }
        Self::fetch_by_order_id(&self.pool, &invoice.order_id)
            .await?
            .map(PendingResult::Existing)
            .ok_or_else(|| LedgerError::NotFound(invoice.order_id.clone()))
    }

    #[instrument(skip(self))]
    async fn find_by_order_id(&self, order_id: &str) -> Result<Option<Invoice>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_by_order_id"])
            .start_timer();
        let invoice = Self::fetch_by_order_id(&self.pool, order_id).await?;
        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self))]
    async fn find_by_tracking_id(
        &self,
        tracking_id: &str,
    ) -> Result<Option<Invoice>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_by_tracking_id"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE tracking_id = $1"
        ))
        .bind(tracking_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("fetch invoice by tracking id"))?;

        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self, order_ids), fields(shop_id = %shop_id, count = order_ids.len()))]
    async fn find_by_order_ids(
        &self,
        shop_id: Uuid,
        order_ids: &[String],
    ) -> Result<Vec<Invoice>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_by_order_ids"])
            .start_timer();

        let invoices = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE shop_id = $1 AND order_id = ANY($2)"
        ))
        .bind(shop_id)
        .bind(order_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list invoices by order"))?;

        timer.observe_duration();
        Ok(invoices)
    }

    #[instrument(skip(self, invoice), fields(order_id = %invoice.order_id))]
    async fn claim_submission(
        &self,
        invoice: NewInvoice,
        lease: Duration,
    ) -> Result<ClaimResult, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["claim_submission"])
            .start_timer();
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(db_err("begin claim"))?;

        let existing = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE order_id = $1 FOR UPDATE"
        ))
        .bind(&invoice.order_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err("lock invoice"))?;

        let result = match existing {
            None => {
                let inserted = sqlx::query_as::<_, Invoice>(&format!(
                    r#"
                    INSERT INTO invoices (id, shop_id, order_id, order_number, customer_name,
                        customer_email, total_amount, status, invoice_data,
                        submission_claimed_at, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, 'submitting', $8, $9, $9, $9)
                    ON CONFLICT (order_id) DO NOTHING
                    RETURNING {INVOICE_COLUMNS}
                    "#
                ))
                .bind(Uuid::new_v4())
                .bind(invoice.shop_id)
                .bind(&invoice.order_id)
                .bind(&invoice.order_number)
                .bind(&invoice.customer_name)
                .bind(&invoice.customer_email)
                .bind(invoice.total_amount)
                .bind(&invoice.invoice_data)
                .bind(now)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err("insert claim"))?;

                match inserted {
                    Some(row) => ClaimResult::Claimed {
                        invoice: row,
                        previous: None,
                    },
                    // lost an insert race; the winner holds the claim
                    None => match Self::fetch_by_order_id(&mut *tx, &invoice.order_id).await? {
                        Some(row) => row
                            .claim_conflict(lease, now)
                            .unwrap_or(ClaimResult::InFlight(row)),
                        None => return Err(LedgerError::NotFound(invoice.order_id.clone())),
                    },
                }
            }
            Some(row) => match row.claim_conflict(lease, now) {
                Some(conflict) => conflict,
                None => {
                    let claimed = sqlx::query_as::<_, Invoice>(&format!(
                        r#"
                        UPDATE invoices SET
                            order_number = $2, customer_name = $3, customer_email = $4,
                            total_amount = $5, invoice_data = COALESCE($6, invoice_data),
                            status = 'submitting', error_message = NULL,
                            submission_claimed_at = $7, updated_at = $7
                        WHERE order_id = $1
                        RETURNING {INVOICE_COLUMNS}
                        "#
                    ))
                    .bind(&invoice.order_id)
                    .bind(&invoice.order_number)
                    .bind(&invoice.customer_name)
                    .bind(&invoice.customer_email)
                    .bind(invoice.total_amount)
                    .bind(&invoice.invoice_data)
                    .bind(now)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(db_err("claim invoice"))?;

                    ClaimResult::Claimed {
                        invoice: claimed,
                        previous: Some(Box::new(row)),
                    }
                }
            },
        };

        tx.commit().await.map_err(db_err("commit claim"))?;
        timer.observe_duration();
        Ok(result)
    }

    #[instrument(skip(self, previous))]
    async fn release_claim(
        &self,
        order_id: &str,
        previous: Option<Invoice>,
    ) -> Result<(), LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["release_claim"])
            .start_timer();

        let result = match previous {
            None => sqlx::query(
                "DELETE FROM invoices WHERE order_id = $1 AND status = 'submitting'",
            )
            .bind(order_id)
            .execute(&self.pool)
            .await,
            Some(previous) => sqlx::query(
                r#"
                UPDATE invoices SET
                    order_number = $2, customer_name = $3, customer_email = $4,
                    total_amount = $5, status = $6, tracking_id = $7, error_message = $8,
                    invoice_data = $9, submission_claimed_at = $10, updated_at = $11
                WHERE order_id = $1 AND status = 'submitting'
                "#,
            )
            .bind(order_id)
            .bind(&previous.order_number)
            .bind(&previous.customer_name)
            .bind(&previous.customer_email)
            .bind(previous.total_amount)
            .bind(&previous.status)
            .bind(&previous.tracking_id)
            .bind(&previous.error_message)
            .bind(&previous.invoice_data)
            .bind(previous.submission_claimed_at)
            .bind(previous.updated_at)
            .execute(&self.pool)
            .await,
        }
        .map_err(db_err("release claim"))?;

        timer.observe_duration();
        if result.rows_affected() == 0 {
            warn!("Claim already released or superseded");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_processing(
        &self,
        order_id: &str,
        tracking_id: &str,
    ) -> Result<Invoice, LedgerError> {
        self.guarded_update(
            "mark_processing",
            order_id,
            &PROCESSING_SOURCES,
            InvoiceStatus::Processing,
            "tracking_id = $4, error_message = NULL",
            tracking_id,
        )
        .await
    }

    #[instrument(skip(self, message))]
    async fn mark_failed(&self, order_id: &str, message: &str) -> Result<Invoice, LedgerError> {
        self.guarded_update(
            "mark_failed",
            order_id,
            &FAILURE_SOURCES,
            InvoiceStatus::Failed,
            "error_message = $4",
            message,
        )
        .await
    }

    #[instrument(skip(self, outcome))]
    async fn apply_authorization(
        &self,
        tracking_id: &str,
        outcome: &AuthorizationOutcome,
    ) -> Result<ApplyResult, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_authorization"])
            .start_timer();

        let query = match outcome {
            AuthorizationOutcome::Authorized {
                authorization_code,
                document_number,
            } => sqlx::query_as::<_, Invoice>(&format!(
                "UPDATE invoices SET status = 'completed', authorization_code = $2, \
                 document_number = $3, error_message = NULL, processed_at = NOW(), \
                 updated_at = NOW() WHERE tracking_id = $1 AND status = 'processing' \
                 RETURNING {INVOICE_COLUMNS}"
            ))
            .bind(tracking_id)
            .bind(authorization_code.clone())
            .bind(document_number.clone())
            .fetch_optional(&self.pool)
            .await,
            AuthorizationOutcome::Rejected { reason } => sqlx::query_as::<_, Invoice>(&format!(
                "UPDATE invoices SET status = 'failed', error_message = $2, \
                 processed_at = NOW(), updated_at = NOW() \
                 WHERE tracking_id = $1 AND status = 'processing' \
                 RETURNING {INVOICE_COLUMNS}"
            ))
            .bind(tracking_id)
            .bind(reason.clone())
            .fetch_optional(&self.pool)
            .await,
        };
        let updated = query.map_err(db_err("apply authorization"))?;
        timer.observe_duration();

        if let Some(invoice) = updated {
            return Ok(ApplyResult::Applied(invoice));
        }
        Ok(match self.find_by_tracking_id(tracking_id).await? {
            Some(invoice) => ApplyResult::Ignored(invoice),
            None => ApplyResult::NotFound,
        })
    }

    #[instrument(skip(self, target), fields(shop_id = %shop_id))]
    async fn redact_customers(
        &self,
        shop_id: Uuid,
        target: &RedactionTarget,
    ) -> Result<u64, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["redact_customers"])
            .start_timer();

        let set = "SET customer_name = $3, customer_email = NULL, invoice_data = NULL, updated_at = NOW()";
        let result = match target {
            RedactionTarget::OrderIds(ids) => {
                sqlx::query(&format!(
                    "UPDATE invoices {set} WHERE shop_id = $1 AND order_id = ANY($2)"
                ))
                .bind(shop_id)
                .bind(ids)
                .bind(REDACTED_NAME)
                .execute(&self.pool)
                .await
            }
            RedactionTarget::CustomerEmail(email) => {
                sqlx::query(&format!(
                    "UPDATE invoices {set} WHERE shop_id = $1 AND LOWER(customer_email) = LOWER($2)"
                ))
                .bind(shop_id)
                .bind(email)
                .bind(REDACTED_NAME)
                .execute(&self.pool)
                .await
            }
        }
        .map_err(db_err("redact customer data"))?;

        timer.observe_duration();
        info!(rows = result.rows_affected(), "Customer data redacted");
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn purge_shop(&self, shop_id: Uuid) -> Result<u64, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["purge_shop"])
            .start_timer();

        let result = sqlx::query("DELETE FROM invoices WHERE shop_id = $1")
            .bind(shop_id)
            .execute(&self.pool)
            .await
            .map_err(db_err("purge shop invoices"))?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn stats(&self, shop_id: Uuid) -> Result<InvoiceStats, LedgerError> {
        let timer = DB_QUERY_DURATION.with_label_values(&["stats"]).start_timer();

        let (total, invoiced, pending, errors) = sqlx::query_as::<_, (i64, i64, i64, i64)>(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE status = 'completed'),
                COUNT(*) FILTER (WHERE status IN ('pending', 'submitting', 'processing')),
                COUNT(*) FILTER (WHERE status = 'failed')
            FROM invoices
            WHERE shop_id = $1
            "#,
        )
        .bind(shop_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("count invoices"))?;

        timer.observe_duration();
        Ok(InvoiceStats {
            total,
            invoiced,
            pending,
            errors,
        })
    }

    #[instrument(skip(self))]
    async fn list_stale_processing(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Invoice>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_stale_processing"])
            .start_timer();

        let invoices = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices \
             WHERE status = 'processing' AND tracking_id IS NOT NULL AND updated_at < $1 \
             AND (last_polled_at IS NULL OR last_polled_at < $1) \
             ORDER BY last_polled_at ASC NULLS FIRST, updated_at ASC LIMIT $2"
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list stale processing invoices"))?;

        timer.observe_duration();
        Ok(invoices)
    }

    #[instrument(skip(self))]
    async fn touch_polled(&self, order_id: &str) -> Result<(), LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["touch_polled"])
            .start_timer();

        sqlx::query(
            "UPDATE invoices SET last_polled_at = NOW() \
             WHERE order_id = $1 AND status = 'processing'",
        )
        .bind(order_id)
        .execute(&self.pool)
        .await
        .map_err(db_err("touch polled invoice"))?;

        timer.observe_duration();
        Ok(())
    }
}

#[async_trait]
impl ShopStore for Database {
    #[instrument(skip(self))]
    async fn find_by_domain(&self, shop_domain: &str) -> anyhow::Result<Option<ShopConfig>> {
        let row = sqlx::query_as::<_, ShopRow>(&format!(
            "SELECT {SHOP_COLUMNS} FROM shops WHERE shop_domain = $1"
        ))
        .bind(shop_domain)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ShopConfig::from))
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, shop_id: Uuid) -> anyhow::Result<Option<ShopConfig>> {
        let row = sqlx::query_as::<_, ShopRow>(&format!(
            "SELECT {SHOP_COLUMNS} FROM shops WHERE id = $1"
        ))
        .bind(shop_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ShopConfig::from))
    }

    #[instrument(skip(self))]
    async fn mark_uninstalled(&self, shop_domain: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE shops SET status = 'uninstalled', updated_at = NOW() WHERE shop_domain = $1",
        )
        .bind(shop_domain)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn delete_shop(&self, shop_domain: &str) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM sessions WHERE shop = $1")
            .bind(shop_domain)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM shops WHERE shop_domain = $1")
            .bind(shop_domain)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}
