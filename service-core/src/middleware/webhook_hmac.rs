use crate::error::AppError;
use crate::utils::signature::verify_signature;
use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

pub const HMAC_HEADER: &str = "x-shopify-hmac-sha256";

/// Upper bound on a webhook body read into memory for verification.
pub const MAX_WEBHOOK_BODY: usize = 2 * 1024 * 1024;

/// Source of the shared secret the e-commerce platform signs webhooks with.
pub trait WebhookSecretSource {
    fn webhook_secret(&self) -> &str;
}

/// Reject webhook deliveries whose body does not match the
/// `X-Shopify-Hmac-Sha256` header. The verified body is handed on unchanged.
pub async fn webhook_hmac_middleware<S>(
    State(state): State<S>,
    req: Request,
    next: Next,
) -> Result<Response, AppError>
where
    S: WebhookSecretSource + Clone + Send + Sync + 'static,
{
    let signature = req
        .headers()
        .get(HMAC_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            tracing::warn!(path = %req.uri().path(), "Webhook without HMAC header");
            AppError::Unauthorized(anyhow::anyhow!("Missing webhook signature"))
        })?;

    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_WEBHOOK_BODY)
        .await
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Failed to read body: {}", e)))?;

    let is_valid = verify_signature(state.webhook_secret(), &bytes, &signature)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Signature verification error: {}", e)))?;

    if !is_valid {
        tracing::warn!(path = %parts.uri.path(), "Invalid webhook signature");
        return Err(AppError::Unauthorized(anyhow::anyhow!("Invalid webhook signature")));
    }

    let req = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(req).await)
}
