//! Invoice generation against a mocked provider endpoint.

mod common;

use common::*;
use fiscal_invoicing_service::billing::Delivery;
use fiscal_invoicing_service::models::{InvoiceStatus, ShopStatus};
use fiscal_invoicing_service::services::{
    AutoInvoiceOutcome, GenerateOutcome, GenerationError, InvoiceLedger, OrderInput,
};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn accept_with(provider: &MockServer, tracking_id: &str, delay: Duration, expected: u64) {
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(accepted_body(tracking_id))
                .set_delay(delay),
        )
        .expect(expected)
        .mount(provider)
        .await;
}

#[tokio::test]
async fn submitted_invoice_is_processing_with_tracking_id() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(accepted_body("556677")))
        .expect(1)
        .mount(&provider)
        .await;
    let app = spawn_app(&provider).await;

    let outcome = app
        .state
        .orchestrator
        .generate(OrderInput::Full(Box::new(order(1001))), &app.shop)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        GenerateOutcome::Submitted {
            tracking_id: "556677".into()
        }
    );
    let invoice = app.ledger.find_by_order_id("1001").await.unwrap().unwrap();
    assert_eq!(invoice.status(), InvoiceStatus::Processing);
    assert_eq!(invoice.tracking_id.as_deref(), Some("556677"));
    assert_eq!(invoice.total_amount.to_string(), "1000.00");
    assert_eq!(invoice.customer_name, "Ana Gomez");

    let requests = provider.received_requests().await.unwrap();
    let body = String::from_utf8(requests[0].body.clone()).unwrap();
    assert!(body.contains("826.446"), "unit price missing from {body}");
    assert!(body.contains("IComprobantes/CrearComprobante"));
    assert!(body.contains(CALLBACK_URL));
    assert!(body.contains("FB"));

    let annotations = app.orders.annotations.lock().await;
    assert_eq!(annotations.len(), 1);
    assert_eq!(annotations[0].1.status, InvoiceStatus::Processing);
}

#[tokio::test]
async fn concurrent_generation_submits_once() {
    let provider = MockServer::start().await;
    accept_with(&provider, "900", Duration::from_millis(300), 1).await;
    let app = Arc::new(spawn_app(&provider).await);

    let mut handles = Vec::new();
    for _ in 0..5 {
        let app = app.clone();
        handles.push(tokio::spawn(async move {
            app.state
                .orchestrator
                .generate(OrderInput::Full(Box::new(order(2002))), &app.shop)
                .await
        }));
    }

    let mut submitted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(GenerateOutcome::Submitted { .. }) => submitted += 1,
            Ok(GenerateOutcome::AwaitingAuthorization { .. })
            | Err(GenerationError::SubmissionInFlight(_)) => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(submitted, 1);
    assert_eq!(app.ledger.snapshot().await.len(), 1);
    assert_eq!(provider.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn two_transport_failures_then_success_records_once() {
    let provider = MockServer::start().await;
    accept_with(&provider, "31337", Duration::ZERO, 1).await;
    let endpoint = provider.uri();
    let transport = Arc::new(FlakyTransport::new(2, http_transport(&endpoint)));
    let app = spawn_app_with_transport(&endpoint, transport).await;

    let outcome = app
        .state
        .orchestrator
        .generate(OrderInput::Full(Box::new(order(3003))), &app.shop)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        GenerateOutcome::Submitted {
            tracking_id: "31337".into()
        }
    );
    let rows = app.ledger.snapshot().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status(), InvoiceStatus::Processing);
}

#[tokio::test]
async fn unreachable_provider_leaves_no_row() {
    let endpoint = closed_endpoint().await;
    let transport = Arc::new(http_transport(&endpoint));
    let app = spawn_app_with_transport(&endpoint, transport).await;

    let err = app
        .state
        .orchestrator
        .generate(OrderInput::Full(Box::new(order(4004))), &app.shop)
        .await
        .unwrap_err();

    match err {
        GenerationError::Transport { delivery, .. } => assert_eq!(delivery, Delivery::NotSent),
        other => panic!("expected transport error, got {other:?}"),
    }
    assert!(app.ledger.snapshot().await.is_empty());
}

#[tokio::test]
async fn provider_rejection_marks_failed() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rejected_body("CUIT invalido")))
        .expect(1)
        .mount(&provider)
        .await;
    let app = spawn_app(&provider).await;

    let err = app
        .state
        .orchestrator
        .generate(OrderInput::Full(Box::new(order(5005))), &app.shop)
        .await
        .unwrap_err();

    assert!(matches!(err, GenerationError::Provider(ref m) if m == "CUIT invalido"));
    let invoice = app.ledger.find_by_order_id("5005").await.unwrap().unwrap();
    assert_eq!(invoice.status(), InvoiceStatus::Failed);
    assert_eq!(invoice.error_message.as_deref(), Some("CUIT invalido"));

    let annotations = app.orders.annotations.lock().await;
    assert_eq!(annotations[0].1.error.as_deref(), Some("CUIT invalido"));
}

#[tokio::test]
async fn failed_invoice_can_be_retried() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rejected_body("Fecha")))
        .up_to_n_times(1)
        .mount(&provider)
        .await;
    accept_with(&provider, "777", Duration::ZERO, 1).await;
    let app = spawn_app(&provider).await;

    let first = app
        .state
        .orchestrator
        .generate(OrderInput::Full(Box::new(order(6006))), &app.shop)
        .await;
    assert!(first.is_err());

    let second = app
        .state
        .orchestrator
        .generate(OrderInput::Full(Box::new(order(6006))), &app.shop)
        .await
        .unwrap();
    assert_eq!(
        second,
        GenerateOutcome::Submitted {
            tracking_id: "777".into()
        }
    );
}

#[tokio::test]
async fn completed_invoice_is_not_resubmitted() {
    let provider = MockServer::start().await;
    accept_with(&provider, "42", Duration::ZERO, 1).await;
    let app = spawn_app(&provider).await;

    app.state
        .orchestrator
        .generate(OrderInput::Full(Box::new(order(7007))), &app.shop)
        .await
        .unwrap();
    let ack = app
        .state
        .reconciliation
        .reconcile(
            r#"{"IdComprobante": "42", "Estado": "Autorizado", "CAE": "74123456789012"}"#,
            Some("application/json"),
        )
        .await;
    assert_eq!(ack.as_str(), "processed");

    let again = app
        .state
        .orchestrator
        .generate(OrderInput::Full(Box::new(order(7007))), &app.shop)
        .await
        .unwrap();
    assert_eq!(
        again,
        GenerateOutcome::AlreadyInvoiced {
            authorization_code: Some("74123456789012".into())
        }
    );
}

#[tokio::test]
async fn reference_input_fetches_the_order() {
    let provider = MockServer::start().await;
    accept_with(&provider, "88", Duration::ZERO, 1).await;
    let app = spawn_app(&provider).await;
    app.orders.add(order(8008)).await;

    let outcome = app
        .state
        .orchestrator
        .generate(OrderInput::Reference("gid://shopify/Order/8008".into()), &app.shop)
        .await
        .unwrap();
    assert!(matches!(outcome, GenerateOutcome::Submitted { .. }));

    let missing = app
        .state
        .orchestrator
        .generate(OrderInput::Reference("9999".into()), &app.shop)
        .await
        .unwrap_err();
    assert!(matches!(missing, GenerationError::NotFound(_)));
}

#[tokio::test]
async fn inactive_shop_and_missing_credentials_are_rejected() {
    let provider = MockServer::start().await;
    accept_with(&provider, "1", Duration::ZERO, 0).await;
    let app = spawn_app(&provider).await;

    let mut inactive = app.shop.clone();
    inactive.status = ShopStatus::Uninstalled;
    let err = app
        .state
        .orchestrator
        .generate(OrderInput::Full(Box::new(order(1))), &inactive)
        .await
        .unwrap_err();
    assert!(matches!(err, GenerationError::ShopInactive(_)));

    let mut unconfigured = app.shop.clone();
    unconfigured.credentials.account = String::new();
    let err = app
        .state
        .orchestrator
        .generate(OrderInput::Full(Box::new(order(1))), &unconfigured)
        .await
        .unwrap_err();
    assert!(matches!(err, GenerationError::Configuration(_)));
}

#[tokio::test]
async fn order_paid_without_auto_invoice_records_pending() {
    let provider = MockServer::start().await;
    accept_with(&provider, "1", Duration::ZERO, 0).await;
    let app = spawn_app(&provider).await;

    let mut manual = app.shop.clone();
    manual.auto_invoice = false;
    let outcome = app
        .state
        .orchestrator
        .handle_order_paid(&manual, order(1100))
        .await
        .unwrap();
    assert_eq!(outcome, AutoInvoiceOutcome::RecordedPending);

    let again = app
        .state
        .orchestrator
        .handle_order_paid(&app.shop, order(1100))
        .await
        .unwrap();
    assert_eq!(again, AutoInvoiceOutcome::AlreadyRecorded);

    let invoice = app.ledger.find_by_order_id("1100").await.unwrap().unwrap();
    assert_eq!(invoice.status(), InvoiceStatus::Pending);
    assert!(invoice.request().is_some());
}

#[tokio::test]
async fn order_paid_with_unreachable_provider_records_failure() {
    let endpoint = closed_endpoint().await;
    let transport = Arc::new(http_transport(&endpoint));
    let app = spawn_app_with_transport(&endpoint, transport).await;

    let outcome = app
        .state
        .orchestrator
        .handle_order_paid(&app.shop, order(1200))
        .await
        .unwrap();

    assert!(matches!(outcome, AutoInvoiceOutcome::Failed(_)));
    let invoice = app.ledger.find_by_order_id("1200").await.unwrap().unwrap();
    assert_eq!(invoice.status(), InvoiceStatus::Failed);
    assert!(invoice.error_message.is_some());
}
