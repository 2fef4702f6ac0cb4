//! Common test utilities for fiscal-invoicing-service integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use fiscal_invoicing_service::billing::{
    BillingClient, EnvelopeTarget, HttpTransport, ProviderResponse, ProviderTransport,
    TagScanParser, TransportFailure,
};
use fiscal_invoicing_service::models::{
    Order, OrderSummary, ProviderCredentials, ShopConfig, ShopStatus,
};
use fiscal_invoicing_service::services::{
    AuthorizationPoller, GenerationOrchestrator, InMemoryInvoiceLedger, InMemoryShopStore,
    InvoiceAnnotation, OrderSource, ReconciliationHandler,
};
use fiscal_invoicing_service::startup::{build_router, AppState};
use secrecy::Secret;
use serde_json::{json, Value};
use service_core::retry::RetryConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;
use wiremock::MockServer;

pub const WEBHOOK_SECRET: &str = "shpss_test_secret";
pub const SHOP_DOMAIN: &str = "tienda-test.myshopify.com";
pub const ACTION_BASE: &str = "http://www.facturante.com.API/IComprobantes";
pub const CALLBACK_URL: &str = "https://invoicing.example.com/webhooks/provider";

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,fiscal_invoicing_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn shop() -> ShopConfig {
    ShopConfig {
        id: Uuid::new_v4(),
        shop_domain: SHOP_DOMAIN.to_string(),
        access_token: Secret::new("shpat_test".to_string()),
        status: ShopStatus::Active,
        auto_invoice: true,
        credentials: ProviderCredentials {
            account: "20304050609".to_string(),
            username: "api-user".to_string(),
            secret_hash: Secret::new("hash".to_string()),
            point_of_sale: "3".to_string(),
        },
    }
}

/// A paid order at 1000.00 tax included, billed to a final consumer.
pub fn order_json(id: u64) -> Value {
    json!({
        "id": id,
        "name": format!("#{}", id),
        "order_number": id,
        "email": "ana@example.com",
        "total_price": "1000.00",
        "taxes_included": true,
        "billing_address": {
            "first_name": "Ana",
            "last_name": "Gomez",
            "address1": "Av. Corrientes 1234",
            "city": "CABA",
            "province": "Capital Federal",
            "zip": "1043"
        },
        "line_items": [{
            "title": "Mate de calabaza",
            "sku": "MATE-01",
            "quantity": 1,
            "price": "1000.00",
            "total_discount": "0.00",
            "tax_lines": [{ "rate": 0.21, "title": "IVA" }]
        }]
    })
}

pub fn order(id: u64) -> Order {
    serde_json::from_value(order_json(id)).expect("valid order fixture")
}

pub fn accepted_body(tracking_id: &str) -> String {
    format!(
        r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body><CrearComprobanteResponse xmlns="http://www.facturante.com.API"><CrearComprobanteResult xmlns:a="http://schemas.datacontract.org/2004/07/FacturanteMVC.API"><a:Estado>OK</a:Estado><a:IdComprobante>{tracking_id}</a:IdComprobante></CrearComprobanteResult></CrearComprobanteResponse></s:Body></s:Envelope>"#
    )
}

pub fn rejected_body(message: &str) -> String {
    format!(
        r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body><CrearComprobanteResponse><CrearComprobanteResult xmlns:a="x"><a:Estado>ERROR</a:Estado><a:Mensaje>{message}</a:Mensaje></CrearComprobanteResult></CrearComprobanteResponse></s:Body></s:Envelope>"#
    )
}

/// Order source double: serves fixed orders and records metafield writes.
#[derive(Default)]
pub struct FakeOrderSource {
    pub orders: Mutex<HashMap<String, Order>>,
    pub annotations: Mutex<Vec<(String, InvoiceAnnotation)>>,
}

impl FakeOrderSource {
    pub async fn add(&self, order: Order) {
        self.orders.lock().await.insert(order.id.clone(), order);
    }
}

#[async_trait]
impl OrderSource for FakeOrderSource {
    async fn list_paid_orders(
        &self,
        _shop: &ShopConfig,
        limit: u32,
    ) -> anyhow::Result<Vec<OrderSummary>> {
        let orders = self.orders.lock().await;
        let mut summaries: Vec<OrderSummary> = orders
            .values()
            .map(|order| OrderSummary {
                id: order.id.clone(),
                order_number: order.display_number(),
                total: order.total_price,
                created_at: None,
                customer_name: Some("Ana Gomez".to_string()),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries.truncate(limit as usize);
        Ok(summaries)
    }

    async fn fetch_order(&self, _shop: &ShopConfig, order_id: &str) -> anyhow::Result<Option<Order>> {
        Ok(self.orders.lock().await.get(order_id).cloned())
    }

    async fn annotate_invoice(
        &self,
        _shop: &ShopConfig,
        order_id: &str,
        annotation: &InvoiceAnnotation,
    ) -> anyhow::Result<()> {
        self.annotations
            .lock()
            .await
            .push((order_id.to_string(), annotation.clone()));
        Ok(())
    }
}

/// Fails the first `failures` posts as never sent, then delegates.
pub struct FlakyTransport {
    failures: AtomicU32,
    inner: HttpTransport,
}

impl FlakyTransport {
    pub fn new(failures: u32, inner: HttpTransport) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            inner,
        }
    }
}

#[async_trait]
impl ProviderTransport for FlakyTransport {
    async fn post(
        &self,
        content_type: &str,
        body: String,
    ) -> Result<ProviderResponse, TransportFailure> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportFailure::not_sent("connection refused"));
        }
        self.inner.post(content_type, body).await
    }
}

/// Test wiring: in-memory stores, fake order source, provider endpoint at
/// `endpoint` reached through `transport`.
pub struct TestApp {
    pub state: AppState,
    pub ledger: Arc<InMemoryInvoiceLedger>,
    pub shops: Arc<InMemoryShopStore>,
    pub orders: Arc<FakeOrderSource>,
    pub billing: Arc<BillingClient>,
    pub shop: ShopConfig,
}

impl TestApp {
    pub fn router(&self) -> axum::Router {
        build_router(self.state.clone())
    }

    /// Poller over this app's stores. A zero period makes every
    /// `processing` row due at once.
    pub fn poller(&self, period: Duration) -> AuthorizationPoller {
        AuthorizationPoller::new(
            self.ledger.clone(),
            self.shops.clone(),
            self.billing.clone(),
            self.state.reconciliation.clone(),
            period,
        )
    }
}

pub fn http_transport(endpoint: &str) -> HttpTransport {
    HttpTransport::new(endpoint, Duration::from_secs(5)).expect("http transport")
}

pub async fn spawn_app_with_transport(
    endpoint: &str,
    transport: Arc<dyn ProviderTransport>,
) -> TestApp {
    init_tracing();

    let ledger = Arc::new(InMemoryInvoiceLedger::new());
    let shops = Arc::new(InMemoryShopStore::new());
    let orders = Arc::new(FakeOrderSource::default());
    let shop = shop();
    shops.insert(shop.clone()).await;

    let billing = Arc::new(BillingClient::new(
        transport,
        Arc::new(TagScanParser),
        EnvelopeTarget {
            endpoint: endpoint.to_string(),
            action_base: ACTION_BASE.to_string(),
        },
        RetryConfig::fixed(3, Duration::from_millis(10)),
    ));

    let orchestrator = Arc::new(GenerationOrchestrator::new(
        ledger.clone(),
        billing.clone(),
        Some(orders.clone()),
        Some(CALLBACK_URL.to_string()),
    ));
    let reconciliation = Arc::new(ReconciliationHandler::new(
        ledger.clone(),
        shops.clone(),
        Some(orders.clone()),
        Arc::new(TagScanParser),
    ));

    let state = AppState {
        db: None,
        ledger: ledger.clone(),
        shops: shops.clone(),
        orders: Some(orders.clone()),
        orchestrator,
        reconciliation,
        webhook_secret: Arc::new(Secret::new(WEBHOOK_SECRET.to_string())),
        callback_token: None,
    };

    TestApp {
        state,
        ledger,
        shops,
        orders,
        billing,
        shop,
    }
}

/// App whose provider is the given wiremock server.
pub async fn spawn_app(provider: &MockServer) -> TestApp {
    let endpoint = provider.uri();
    let transport = Arc::new(http_transport(&endpoint));
    spawn_app_with_transport(&endpoint, transport).await
}

/// An address nothing listens on.
pub async fn closed_endpoint() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    format!("http://127.0.0.1:{port}/Comprobantes.svc")
}

pub async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}
