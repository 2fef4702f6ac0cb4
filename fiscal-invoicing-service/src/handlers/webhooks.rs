//! E-commerce platform webhooks.
//!
//! Signatures are checked by the HMAC middleware before these run. Each
//! handler acknowledges at once and does the work in a spawned task; failures
//! there are logged and never redelivered.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::models::{Order, RedactionTarget};
use crate::services::{metrics, AutoInvoiceOutcome};
use crate::startup::AppState;

pub const TOPIC_HEADER: &str = "x-shopify-topic";
pub const SHOP_DOMAIN_HEADER: &str = "x-shopify-shop-domain";

pub const TOPIC_CUSTOMERS_REDACT: &str = "customers/redact";
pub const TOPIC_SHOP_REDACT: &str = "shop/redact";
pub const TOPIC_CUSTOMERS_DATA_REQUEST: &str = "customers/data_request";

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// `POST /webhooks/shopify/order-paid`
pub async fn order_paid(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    metrics::record_webhook("orders/paid");
    let Some(shop_domain) = header(&headers, SHOP_DOMAIN_HEADER) else {
        warn!("order-paid webhook without shop domain");
        return StatusCode::OK;
    };
    let order = match serde_json::from_slice::<Order>(&body) {
        Ok(order) => order,
        Err(e) => {
            warn!(error = %e, shop = %shop_domain, "Unreadable order-paid payload");
            return StatusCode::OK;
        }
    };

    tokio::spawn(async move {
        process_order_paid(&state, &shop_domain, order).await;
    });
    StatusCode::OK
}

/// Automatic invoicing for one paid order.
pub async fn process_order_paid(state: &AppState, shop_domain: &str, order: Order) {
    let shop = match state.shops.find_by_domain(shop_domain).await {
        Ok(Some(shop)) => shop,
        Ok(None) => {
            info!(shop = %shop_domain, "order-paid for unknown shop ignored");
            return;
        }
        Err(e) => {
            error!(error = %e, shop = %shop_domain, "Shop lookup failed");
            metrics::record_error("webhook");
            return;
        }
    };

    let order_number = order.display_number();
    match state.orchestrator.handle_order_paid(&shop, order).await {
        Ok(AutoInvoiceOutcome::AlreadyRecorded) => {
            info!(order = %order_number, "Order already has an invoice")
        }
        Ok(outcome) => info!(order = %order_number, outcome = ?outcome, "Order processed"),
        Err(e) => {
            error!(error = %e, order = %order_number, "Webhook order-paid error");
            metrics::record_error("webhook");
        }
    }
}

/// `POST /webhooks/shopify/app-uninstalled`
pub async fn app_uninstalled(State(state): State<AppState>, headers: HeaderMap) -> StatusCode {
    metrics::record_webhook("app/uninstalled");
    let Some(shop_domain) = header(&headers, SHOP_DOMAIN_HEADER) else {
        return StatusCode::OK;
    };

    tokio::spawn(async move {
        match state.shops.mark_uninstalled(&shop_domain).await {
            Ok(true) => info!(shop = %shop_domain, "Shop marked uninstalled"),
            Ok(false) => info!(shop = %shop_domain, "Uninstall for unknown shop"),
            Err(e) => error!(error = %e, shop = %shop_domain, "Uninstall error"),
        }
    });
    StatusCode::OK
}

#[derive(Debug, Default, Deserialize)]
pub struct CompliancePayload {
    #[serde(default)]
    pub orders_to_redact: Vec<Value>,
    #[serde(default)]
    pub customer: Option<ComplianceCustomer>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ComplianceCustomer {
    #[serde(default)]
    pub email: Option<String>,
}

impl CompliancePayload {
    /// Order ids win over the customer email.
    pub fn redaction_target(&self) -> Option<RedactionTarget> {
        let order_ids: Vec<String> = self
            .orders_to_redact
            .iter()
            .filter_map(|id| match id {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect();
        if !order_ids.is_empty() {
            return Some(RedactionTarget::OrderIds(order_ids));
        }
        self.customer
            .as_ref()
            .and_then(|c| c.email.clone())
            .filter(|email| !email.trim().is_empty())
            .map(RedactionTarget::CustomerEmail)
    }
}

/// `POST /webhooks/shopify`: mandatory privacy topics.
pub async fn compliance(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    let topic = header(&headers, TOPIC_HEADER).unwrap_or_default();
    metrics::record_webhook(&topic);
    let shop_domain = header(&headers, SHOP_DOMAIN_HEADER).unwrap_or_default();
    let payload: CompliancePayload = serde_json::from_slice(&body).unwrap_or_else(|e| {
        warn!(error = %e, topic = %topic, "Unreadable compliance payload");
        CompliancePayload::default()
    });

    tokio::spawn(async move {
        process_compliance(&state, &topic, &shop_domain, payload).await;
    });
    Json(json!({ "received": true }))
}

pub async fn process_compliance(
    state: &AppState,
    topic: &str,
    shop_domain: &str,
    payload: CompliancePayload,
) {
    let result = match topic {
        TOPIC_CUSTOMERS_REDACT => redact_customer(state, shop_domain, &payload).await,
        TOPIC_SHOP_REDACT => redact_shop(state, shop_domain).await,
        TOPIC_CUSTOMERS_DATA_REQUEST => {
            // Only customer name and email are stored, on invoices; nothing
            // has to be sent anywhere.
            info!(shop = %shop_domain, "customers/data_request received");
            Ok(())
        }
        other => {
            warn!(topic = %other, "Unhandled compliance topic");
            Ok(())
        }
    };

    match result {
        Ok(()) => info!(topic, shop = %shop_domain, "Compliance webhook processed"),
        Err(e) => {
            error!(error = %e, topic, shop = %shop_domain, "Compliance webhook error");
            metrics::record_error("compliance");
        }
    }
}

async fn redact_customer(
    state: &AppState,
    shop_domain: &str,
    payload: &CompliancePayload,
) -> anyhow::Result<()> {
    let Some(shop) = state.shops.find_by_domain(shop_domain).await? else {
        return Ok(());
    };
    let Some(target) = payload.redaction_target() else {
        return Ok(());
    };
    let redacted = state.ledger.redact_customers(shop.id, &target).await?;
    info!(redacted, "Customer data redacted");
    Ok(())
}

async fn redact_shop(state: &AppState, shop_domain: &str) -> anyhow::Result<()> {
    let Some(shop) = state.shops.find_by_domain(shop_domain).await? else {
        return Ok(());
    };
    let purged = state.ledger.purge_shop(shop.id).await?;
    state.shops.delete_shop(shop_domain).await?;
    info!(purged, "Shop data deleted");
    Ok(())
}
