//! Shop context for admin API routes.
//!
//! The authenticating gateway in front of this service verifies the merchant
//! session and forwards the shop domain in `X-Shop-Domain`. The header is
//! only trusted because this service is not exposed to browsers directly.

use axum::async_trait;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use service_core::error::AppError;
use std::sync::Arc;

use crate::models::ShopConfig;
use crate::services::ShopStore;

pub const SHOP_DOMAIN_HEADER: &str = "X-Shop-Domain";

/// The installed shop a request acts for.
#[derive(Debug, Clone)]
pub struct ShopContext {
    pub shop: ShopConfig,
}

#[async_trait]
impl<S> FromRequestParts<S> for ShopContext
where
    Arc<dyn ShopStore>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let shop_domain = parts
            .headers
            .get(SHOP_DOMAIN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                AppError::Unauthorized(anyhow::anyhow!(
                    "Missing X-Shop-Domain header (required from gateway)"
                ))
            })?;

        tracing::Span::current().record("shop_domain", shop_domain);

        let shops = <Arc<dyn ShopStore> as FromRef<S>>::from_ref(state);
        let shop = shops
            .find_by_domain(shop_domain)
            .await
            .map_err(AppError::InternalError)?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Shop {} is not installed", shop_domain))
            })?;

        Ok(ShopContext { shop })
    }
}
