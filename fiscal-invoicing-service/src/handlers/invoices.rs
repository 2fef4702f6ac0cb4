//! Merchant-facing invoice API.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use service_core::error::AppError;
use std::collections::HashMap;

use crate::middleware::ShopContext;
use crate::models::{InvoiceStats, Order};
use crate::services::{GenerateOutcome, GenerationError, InvalidOrder, OrderInput};
use crate::startup::AppState;

pub const DEFAULT_ORDER_LIMIT: u32 = 50;
pub const MAX_ORDER_LIMIT: u32 = 250;

#[derive(Debug, Deserialize)]
pub struct OrdersQuery {
    pub limit: Option<u32>,
}

/// A paid order with the state of its invoice, if any.
#[derive(Debug, Serialize)]
pub struct OrderWithInvoice {
    pub id: String,
    pub order_number: String,
    pub total: Option<Decimal>,
    pub created_at: Option<String>,
    pub customer_name: Option<String>,
    pub invoice_status: Option<String>,
    pub authorization_code: Option<String>,
    pub document_number: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OrdersResponse {
    pub orders: Vec<OrderWithInvoice>,
}

/// `GET /api/invoices/orders`
pub async fn list_orders(
    State(state): State<AppState>,
    ShopContext { shop }: ShopContext,
    Query(query): Query<OrdersQuery>,
) -> Result<Json<OrdersResponse>, AppError> {
    let orders = state
        .orders
        .as_ref()
        .ok_or_else(|| AppError::ServiceUnavailable("order source not configured".to_string()))?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ORDER_LIMIT)
        .clamp(1, MAX_ORDER_LIMIT);

    let summaries = orders.list_paid_orders(&shop, limit).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to list orders");
        AppError::BadGateway(e.to_string())
    })?;

    let ids: Vec<String> = summaries.iter().map(|o| o.id.clone()).collect();
    let mut invoices: HashMap<String, _> = state
        .ledger
        .find_by_order_ids(shop.id, &ids)
        .await?
        .into_iter()
        .map(|invoice| (invoice.order_id.clone(), invoice))
        .collect();

    let orders = summaries
        .into_iter()
        .map(|summary| {
            let invoice = invoices.remove(&summary.id);
            OrderWithInvoice {
                id: summary.id,
                order_number: summary.order_number,
                total: summary.total,
                created_at: summary.created_at,
                customer_name: summary.customer_name,
                invoice_status: invoice.as_ref().map(|i| i.status.clone()),
                authorization_code: invoice.as_ref().and_then(|i| i.authorization_code.clone()),
                document_number: invoice.as_ref().and_then(|i| i.document_number.clone()),
                error_message: invoice.and_then(|i| i.error_message),
            }
        })
        .collect();

    Ok(Json(OrdersResponse { orders }))
}

/// `GET /api/invoices/stats`
pub async fn stats(
    State(state): State<AppState>,
    ShopContext { shop }: ShopContext,
) -> Result<Json<InvoiceStats>, AppError> {
    Ok(Json(state.ledger.stats(shop.id).await?))
}

/// Either an order id to fetch from the store, or the full order.
#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub order_id: Option<Value>,
    #[serde(default)]
    pub order: Option<Value>,
}

impl GenerateRequest {
    pub fn into_input(self) -> Result<OrderInput, AppError> {
        if let Some(order) = self.order {
            if !order.is_object() {
                return Err(GenerationError::from(InvalidOrder::NotAnObject).into());
            }
            let order: Order = serde_json::from_value(order).map_err(|e| {
                AppError::from(GenerationError::from(InvalidOrder::Malformed(e.to_string())))
            })?;
            return Ok(OrderInput::Full(Box::new(order)));
        }

        match self.order_id {
            Some(Value::String(id)) if !id.trim().is_empty() => Ok(OrderInput::Reference(id)),
            Some(Value::Number(id)) => Ok(OrderInput::Reference(id.to_string())),
            _ => Err(AppError::BadRequest(anyhow::anyhow!(
                "order_id or order is required"
            ))),
        }
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct GenerateResponse {
    pub success: bool,
    pub status: String,
    pub already_invoiced: bool,
    pub tracking_id: Option<String>,
    pub authorization_code: Option<String>,
}

impl From<GenerateOutcome> for GenerateResponse {
    fn from(outcome: GenerateOutcome) -> Self {
        match outcome {
            GenerateOutcome::Submitted { tracking_id } => Self {
                success: true,
                status: "processing".to_string(),
                already_invoiced: false,
                tracking_id: Some(tracking_id),
                authorization_code: None,
            },
            GenerateOutcome::AwaitingAuthorization { tracking_id } => Self {
                success: true,
                status: "processing".to_string(),
                already_invoiced: false,
                tracking_id,
                authorization_code: None,
            },
            GenerateOutcome::AlreadyInvoiced { authorization_code } => Self {
                success: true,
                status: "completed".to_string(),
                already_invoiced: true,
                tracking_id: None,
                authorization_code,
            },
        }
    }
}

/// `POST /api/invoices/generate`
pub async fn generate(
    State(state): State<AppState>,
    ShopContext { shop }: ShopContext,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, AppError> {
    let input = request.into_input()?;
    let outcome = state.orchestrator.generate(input, &shop).await.map_err(|e| {
        tracing::warn!(error = %e, shop = %shop.shop_domain, "Invoice generation failed");
        AppError::from(e)
    })?;
    Ok(Json(outcome.into()))
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct InvoiceStatusResponse {
    pub exists: bool,
    pub status: Option<String>,
    pub authorization_code: Option<String>,
    pub document_number: Option<String>,
    pub error_message: Option<String>,
}

/// `GET /api/invoices/status/:order_id`
pub async fn invoice_status(
    State(state): State<AppState>,
    ShopContext { shop }: ShopContext,
    Path(order_id): Path<String>,
) -> Result<Json<InvoiceStatusResponse>, AppError> {
    let invoice = state
        .ledger
        .find_by_order_id(&order_id)
        .await?
        .filter(|invoice| invoice.shop_id == shop.id);

    Ok(Json(match invoice {
        Some(invoice) => InvoiceStatusResponse {
            exists: true,
            status: Some(invoice.status),
            authorization_code: invoice.authorization_code,
            document_number: invoice.document_number,
            error_message: invoice.error_message,
        },
        None => InvoiceStatusResponse {
            exists: false,
            status: None,
            authorization_code: None,
            document_number: None,
            error_message: None,
        },
    }))
}
