//! HTTP surface: platform webhooks, provider callbacks and the invoice API.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::*;
use fiscal_invoicing_service::handlers::webhooks::{process_compliance, CompliancePayload};
use fiscal_invoicing_service::models::{InvoiceStatus, REDACTED_NAME};
use fiscal_invoicing_service::services::{InvoiceLedger, OrderInput, ShopStore};
use fiscal_invoicing_service::startup::build_router;
use secrecy::Secret;
use serde_json::json;
use service_core::middleware::webhook_hmac::HMAC_HEADER;
use service_core::utils::signature::generate_signature;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn provider_accepting(tracking_id: &str) -> MockServer {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(accepted_body(tracking_id)))
        .mount(&provider)
        .await;
    provider
}

fn signed_webhook(path: &str, topic: &str, body: &str) -> Request<Body> {
    let signature = generate_signature(WEBHOOK_SECRET, body.as_bytes()).unwrap();
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .header(HMAC_HEADER, signature)
        .header("x-shopify-topic", topic)
        .header("x-shopify-shop-domain", SHOP_DOMAIN)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn api_request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("X-Shop-Domain", SHOP_DOMAIN)
        .header("content-type", "application/json");
    match body {
        Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn health_reports_memory_backend() {
    let provider = provider_accepting("1").await;
    let app = spawn_app(&provider).await;

    let response = app
        .router()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = body_json(response).await;
    assert_eq!(body["backend"], "memory");
}

#[tokio::test]
async fn unsigned_webhook_is_rejected() {
    let provider = provider_accepting("1").await;
    let app = spawn_app(&provider).await;

    let response = app
        .router()
        .oneshot(
            Request::post("/webhooks/shopify/order-paid")
                .header("x-shopify-shop-domain", SHOP_DOMAIN)
                .header(HMAC_HEADER, "bm9wZQ==")
                .body(Body::from(order_json(1).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(app.ledger.snapshot().await.is_empty());
}

#[tokio::test]
async fn order_paid_webhook_generates_invoice() {
    let provider = provider_accepting("4242").await;
    let app = spawn_app(&provider).await;

    let response = app
        .router()
        .oneshot(signed_webhook(
            "/webhooks/shopify/order-paid",
            "orders/paid",
            &order_json(1300).to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let ledger = app.ledger.clone();
    eventually(|| {
        let ledger = ledger.clone();
        async move {
            matches!(
                ledger.find_by_order_id("1300").await,
                Ok(Some(invoice)) if invoice.status() == InvoiceStatus::Processing
            )
        }
    })
    .await;
}

#[tokio::test]
async fn app_uninstalled_marks_shop() {
    let provider = provider_accepting("1").await;
    let app = spawn_app(&provider).await;

    let response = app
        .router()
        .oneshot(signed_webhook(
            "/webhooks/shopify/app-uninstalled",
            "app/uninstalled",
            "{}",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let shops = app.shops.clone();
    eventually(|| {
        let shops = shops.clone();
        async move {
            matches!(
                shops.find_by_domain(SHOP_DOMAIN).await,
                Ok(Some(shop)) if !shop.is_active()
            )
        }
    })
    .await;
}

#[tokio::test]
async fn provider_callback_for_unknown_tracking_id_changes_nothing() {
    let provider = provider_accepting("100").await;
    let app = spawn_app(&provider).await;
    app.state
        .orchestrator
        .generate(OrderInput::Full(Box::new(order(1400))), &app.shop)
        .await
        .unwrap();
    let before = app.ledger.snapshot().await;

    let response = app
        .router()
        .oneshot(
            Request::post("/webhooks/provider")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "IdComprobante": "999", "Estado": "Autorizado", "CAE": "1" })
                        .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({ "status": "not_found" }));
    assert_eq!(app.ledger.snapshot().await, before);
}

#[tokio::test]
async fn provider_callback_without_tracking_id_is_ignored() {
    let provider = provider_accepting("1").await;
    let app = spawn_app(&provider).await;

    let response = app
        .router()
        .oneshot(
            Request::post("/webhooks/provider")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"Estado": "Autorizado"}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({ "status": "ignored" }));
}

#[tokio::test]
async fn xml_rejection_callback_marks_failed() {
    let provider = provider_accepting("200").await;
    let app = spawn_app(&provider).await;
    app.state
        .orchestrator
        .generate(OrderInput::Full(Box::new(order(1500))), &app.shop)
        .await
        .unwrap();

    let body = r#"<Notificacion><IdComprobante>200</IdComprobante><Estado>Rechazado</Estado><Errores><string>Punto de venta invalido</string></Errores></Notificacion>"#;
    let response = app
        .router()
        .oneshot(
            Request::post("/webhooks/provider")
                .header("content-type", "text/xml")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(body_json(response).await, json!({ "status": "processed" }));
    let invoice = app.ledger.find_by_order_id("1500").await.unwrap().unwrap();
    assert_eq!(invoice.status(), InvoiceStatus::Failed);
    assert_eq!(invoice.error_message.as_deref(), Some("Punto de venta invalido"));
}

#[tokio::test]
async fn customer_erasure_keeps_fiscal_record() {
    let provider = provider_accepting("300").await;
    let app = spawn_app(&provider).await;
    app.state
        .orchestrator
        .generate(OrderInput::Full(Box::new(order(1600))), &app.shop)
        .await
        .unwrap();
    app.state
        .reconciliation
        .reconcile(
            r#"{"IdComprobante": "300", "Estado": "AUTORIZADO", "CAE": "74000000000001", "NumeroComprobante": "0003-00000010"}"#,
            None,
        )
        .await;

    let payload: CompliancePayload = serde_json::from_value(json!({
        "orders_to_redact": [1600],
        "customer": { "email": "ana@example.com" }
    }))
    .unwrap();
    process_compliance(&app.state, "customers/redact", SHOP_DOMAIN, payload).await;

    let invoice = app.ledger.find_by_order_id("1600").await.unwrap().unwrap();
    assert_eq!(invoice.customer_name, REDACTED_NAME);
    assert_eq!(invoice.customer_email, None);
    assert_eq!(invoice.invoice_data, None);
    assert_eq!(invoice.status(), InvoiceStatus::Completed);
    assert_eq!(invoice.total_amount.to_string(), "1000.00");
    assert_eq!(invoice.authorization_code.as_deref(), Some("74000000000001"));
    assert_eq!(invoice.document_number.as_deref(), Some("0003-00000010"));
}

#[tokio::test]
async fn shop_redaction_deletes_everything() {
    let provider = provider_accepting("400").await;
    let app = spawn_app(&provider).await;
    app.state
        .orchestrator
        .generate(OrderInput::Full(Box::new(order(1700))), &app.shop)
        .await
        .unwrap();

    process_compliance(
        &app.state,
        "shop/redact",
        SHOP_DOMAIN,
        CompliancePayload::default(),
    )
    .await;

    assert!(app.ledger.snapshot().await.is_empty());
    assert!(app.shops.find_by_domain(SHOP_DOMAIN).await.unwrap().is_none());
    assert!(!app.shops.has_sessions(SHOP_DOMAIN).await);
}

#[tokio::test]
async fn compliance_webhook_acknowledges() {
    let provider = provider_accepting("1").await;
    let app = spawn_app(&provider).await;

    let response = app
        .router()
        .oneshot(signed_webhook(
            "/webhooks/shopify",
            "customers/data_request",
            r#"{"customer": {"email": "ana@example.com"}}"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({ "received": true }));
}

#[tokio::test]
async fn api_requires_shop_header() {
    let provider = provider_accepting("1").await;
    let app = spawn_app(&provider).await;

    let response = app
        .router()
        .oneshot(Request::get("/api/invoices/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .router()
        .oneshot(
            Request::get("/api/invoices/stats")
                .header("X-Shop-Domain", "other.myshopify.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn generate_then_status_stats_and_orders() {
    let provider = provider_accepting("500").await;
    let app = spawn_app(&provider).await;
    app.orders.add(order(1800)).await;
    app.orders.add(order(1801)).await;

    let response = app
        .router()
        .oneshot(api_request(
            "POST",
            "/api/invoices/generate",
            Some(json!({ "order_id": "1800" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "processing");
    assert_eq!(body["tracking_id"], "500");

    let response = app
        .router()
        .oneshot(api_request("GET", "/api/invoices/status/1800", None))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["exists"], true);
    assert_eq!(body["status"], "processing");

    let response = app
        .router()
        .oneshot(api_request("GET", "/api/invoices/status/1801", None))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["exists"], false);

    let response = app
        .router()
        .oneshot(api_request("GET", "/api/invoices/stats", None))
        .await
        .unwrap();
    assert_eq!(
        body_json(response).await,
        json!({ "total": 1, "invoiced": 0, "pending": 1, "errors": 0 })
    );

    let response = app
        .router()
        .oneshot(api_request("GET", "/api/invoices/orders?limit=10", None))
        .await
        .unwrap();
    let body = body_json(response).await;
    let orders = body["orders"].as_array().unwrap();
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[0]["id"], "1800");
    assert_eq!(orders[0]["invoice_status"], "processing");
    assert!(orders[1]["invoice_status"].is_null());
}

#[tokio::test]
async fn generate_with_missing_total_is_unprocessable() {
    let provider = provider_accepting("1").await;
    let app = spawn_app(&provider).await;

    let mut order = order_json(1900);
    order.as_object_mut().unwrap().remove("total_price");
    let response = app
        .router()
        .oneshot(api_request(
            "POST",
            "/api/invoices/generate",
            Some(json!({ "order": order })),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(app.ledger.snapshot().await.is_empty());
}

#[tokio::test]
async fn provider_callback_requires_configured_token() {
    let provider = provider_accepting("600").await;
    let app = spawn_app(&provider).await;
    app.state
        .orchestrator
        .generate(OrderInput::Full(Box::new(order(2000))), &app.shop)
        .await
        .unwrap();

    let mut state = app.state.clone();
    state.callback_token = Some(Arc::new(Secret::new("cb-token".to_string())));
    let router = build_router(state);
    let forged = json!({ "IdComprobante": "600", "Estado": "Autorizado", "CAE": "74000000000002" })
        .to_string();

    for uri in ["/webhooks/provider", "/webhooks/provider?token=guess"] {
        let response = router
            .clone()
            .oneshot(
                Request::post(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(forged.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
    let invoice = app.ledger.find_by_order_id("2000").await.unwrap().unwrap();
    assert_eq!(invoice.status(), InvoiceStatus::Processing);

    let response = router
        .oneshot(
            Request::post("/webhooks/provider?token=cb-token")
                .header("content-type", "application/json")
                .body(Body::from(forged))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({ "status": "processed" }));
    let invoice = app.ledger.find_by_order_id("2000").await.unwrap().unwrap();
    assert_eq!(invoice.status(), InvoiceStatus::Completed);
}
