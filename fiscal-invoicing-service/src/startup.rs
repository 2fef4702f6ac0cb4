//! Application startup and lifecycle management.

use crate::billing::{BillingClient, EnvelopeTarget, HttpTransport, TagScanParser};
use crate::config::FiscalInvoicingConfig;
use crate::handlers::{self, invoices, provider_callback, webhooks};
use crate::services::{
    init_metrics, AuthorizationPoller, Database, GenerationOrchestrator, InMemoryInvoiceLedger,
    InMemoryShopStore, InvoiceLedger, OrderSource, ReconciliationHandler, ShopStore,
    ShopifyOrderSource,
};
use axum::{
    extract::FromRef,
    middleware,
    routing::{get, post},
    Router,
};
use secrecy::{ExposeSecret, Secret};
use service_core::error::AppError;
use service_core::middleware::tracing::{make_request_span, request_id_middleware};
use service_core::middleware::webhook_hmac::{webhook_hmac_middleware, WebhookSecretSource};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub db: Option<Arc<Database>>,
    pub ledger: Arc<dyn InvoiceLedger>,
    pub shops: Arc<dyn ShopStore>,
    pub orders: Option<Arc<dyn OrderSource>>,
    pub orchestrator: Arc<GenerationOrchestrator>,
    pub reconciliation: Arc<ReconciliationHandler>,
    pub webhook_secret: Arc<Secret<String>>,
    /// Shared token provider callbacks must present, when configured.
    pub callback_token: Option<Arc<Secret<String>>>,
}

impl WebhookSecretSource for AppState {
    fn webhook_secret(&self) -> &str {
        self.webhook_secret.expose_secret()
    }
}

impl FromRef<AppState> for Arc<dyn ShopStore> {
    fn from_ref(state: &AppState) -> Self {
        state.shops.clone()
    }
}

/// Routes, HMAC verification on platform webhooks, request ids and tracing.
pub fn build_router(state: AppState) -> Router {
    let platform_webhooks = Router::new()
        .route("/webhooks/shopify", post(webhooks::compliance))
        .route("/webhooks/shopify/order-paid", post(webhooks::order_paid))
        .route(
            "/webhooks/shopify/app-uninstalled",
            post(webhooks::app_uninstalled),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            webhook_hmac_middleware::<AppState>,
        ));

    let api = Router::new()
        .route("/api/invoices/orders", get(invoices::list_orders))
        .route("/api/invoices/stats", get(invoices::stats))
        .route("/api/invoices/generate", post(invoices::generate))
        .route(
            "/api/invoices/status/:order_id",
            get(invoices::invoice_status),
        );

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        .route(
            "/webhooks/provider",
            post(provider_callback::provider_callback),
        )
        .merge(platform_webhooks)
        .merge(api)
        .layer(TraceLayer::new_for_http().make_span_with(make_request_span))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
    poller: Option<AuthorizationPoller>,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: FiscalInvoicingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(
        config: FiscalInvoicingConfig,
    ) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(
        config: FiscalInvoicingConfig,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        init_metrics();

        let (db, ledger, shops) = match &config.database {
            Some(database) => {
                let db = Database::new(
                    &database.url,
                    database.max_connections,
                    database.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                    e
                })?;

                if run_migrations {
                    db.run_migrations().await.map_err(|e| {
                        tracing::error!(error = %e, "Failed to run migrations");
                        e
                    })?;
                }

                let db = Arc::new(db);
                let ledger: Arc<dyn InvoiceLedger> = db.clone();
                let shops: Arc<dyn ShopStore> = db.clone();
                (Some(db), ledger, shops)
            }
            None => {
                tracing::warn!("DATABASE_URL not set - using in-memory stores");
                let ledger: Arc<dyn InvoiceLedger> = Arc::new(InMemoryInvoiceLedger::new());
                let shops: Arc<dyn ShopStore> = Arc::new(InMemoryShopStore::new());
                (None, ledger, shops)
            }
        };

        let transport = HttpTransport::new(&config.provider.endpoint, config.provider.timeout)
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to create provider transport");
                AppError::InternalError(e)
            })?;
        let parser = Arc::new(TagScanParser);
        let billing = Arc::new(BillingClient::new(
            Arc::new(transport),
            parser.clone(),
            EnvelopeTarget {
                endpoint: config.provider.endpoint.clone(),
                action_base: config.provider.action_base.clone(),
            },
            config.retry_config(),
        ));

        let mut order_source = ShopifyOrderSource::new(
            config.shopify.api_version.clone(),
            Duration::from_secs(30),
        )
        .map_err(AppError::InternalError)?;
        if let Some(base_url) = &config.shopify.admin_base_url {
            order_source = order_source.with_base_url(base_url.clone());
        }
        let orders: Option<Arc<dyn OrderSource>> = Some(Arc::new(order_source));

        let callback_url = config.callback_url();
        if callback_url.is_none() {
            tracing::warn!("PUBLIC_BASE_URL not set - provider callbacks will not be requested");
        } else if config.provider.callback_token.is_none() {
            tracing::warn!("PROVIDER_CALLBACK_TOKEN not set - provider callbacks are unauthenticated");
        }

        let orchestrator = Arc::new(
            GenerationOrchestrator::new(
                ledger.clone(),
                billing.clone(),
                orders.clone(),
                callback_url,
            )
            .with_lease(config.submission_lease),
        );
        let reconciliation = Arc::new(ReconciliationHandler::new(
            ledger.clone(),
            shops.clone(),
            orders.clone(),
            parser,
        ));

        let poller = (!config.poll_interval.is_zero()).then(|| {
            AuthorizationPoller::new(
                ledger.clone(),
                shops.clone(),
                billing.clone(),
                reconciliation.clone(),
                config.poll_interval,
            )
        });

        let state = AppState {
            db,
            ledger,
            shops,
            orders,
            orchestrator,
            reconciliation,
            webhook_secret: Arc::new(config.shopify.api_secret.clone()),
            callback_token: config.provider.callback_token.clone().map(Arc::new),
        };

        let http_addr: SocketAddr = format!("{}:{}", config.common.host, config.common.port)
            .parse()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("invalid listen address: {e}")))?;
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Fiscal invoicing service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state,
            poller,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Get the application state.
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let poller = self.poller.map(|poller| {
            tracing::info!("Authorization poller started");
            poller.spawn()
        });

        let router = build_router(self.state);

        tracing::info!(
            service = "fiscal-invoicing-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        let result = axum::serve(self.http_listener, router).await;
        if let Some(poller) = poller {
            poller.abort();
        }
        if let Err(e) = result {
            tracing::error!(error = %e, "HTTP server error");
            return Err(std::io::Error::other(format!("HTTP server error: {}", e)));
        }
        Ok(())
    }
}
