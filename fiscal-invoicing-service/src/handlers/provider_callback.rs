//! Authorization callbacks from the invoicing provider.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    Json,
};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;

use crate::services::metrics;
use crate::startup::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    pub token: Option<String>,
}

/// Answers 200 with `{"status": ...}` for every authenticated delivery so the
/// provider does not retry ones this service cannot use. With a callback
/// token configured, a missing or wrong `token` is refused with 401.
pub async fn provider_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    if let Some(expected) = &state.callback_token {
        let presented = query.token.as_deref().unwrap_or_default();
        let valid: bool = presented
            .as_bytes()
            .ct_eq(expected.expose_secret().as_bytes())
            .into();
        if !valid {
            tracing::warn!("Provider callback with missing or invalid token");
            metrics::record_callback("unauthorized");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "status": "unauthorized" })),
            );
        }
    }

    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let body = String::from_utf8_lossy(&body);
    let ack = state.reconciliation.reconcile(&body, content_type).await;
    (StatusCode::OK, Json(json!({ "status": ack.as_str() })))
}
