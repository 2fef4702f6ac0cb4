//! Tenant configuration, owned by the settings collaborator.

use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShopStatus {
    Active,
    Uninstalled,
}

impl ShopStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShopStatus::Active => "active",
            ShopStatus::Uninstalled => "uninstalled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "active" => ShopStatus::Active,
            _ => ShopStatus::Uninstalled,
        }
    }
}

/// Provider account credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderCredentials {
    pub account: String,
    pub username: String,
    pub secret_hash: Secret<String>,
    pub point_of_sale: String,
}

impl ProviderCredentials {
    /// Account number and secret hash are required to talk to the provider.
    pub fn is_complete(&self) -> bool {
        !self.account.trim().is_empty() && !self.secret_hash.expose_secret().trim().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ShopConfig {
    pub id: Uuid,
    pub shop_domain: String,
    pub access_token: Secret<String>,
    pub status: ShopStatus,
    pub auto_invoice: bool,
    pub credentials: ProviderCredentials,
}

impl ShopConfig {
    pub fn is_active(&self) -> bool {
        self.status == ShopStatus::Active
    }
}

/// `shops` table row.
#[derive(Debug, Clone, FromRow)]
pub struct ShopRow {
    pub id: Uuid,
    pub shop_domain: String,
    pub access_token: String,
    pub status: String,
    pub auto_invoice: bool,
    pub provider_account: Option<String>,
    pub provider_username: Option<String>,
    pub provider_secret_hash: Option<String>,
    pub point_of_sale: Option<String>,
}

impl From<ShopRow> for ShopConfig {
    fn from(row: ShopRow) -> Self {
        Self {
            id: row.id,
            shop_domain: row.shop_domain,
            access_token: Secret::new(row.access_token),
            status: ShopStatus::from_string(&row.status),
            auto_invoice: row.auto_invoice,
            credentials: ProviderCredentials {
                account: row.provider_account.unwrap_or_default(),
                username: row.provider_username.unwrap_or_default(),
                secret_hash: Secret::new(row.provider_secret_hash.unwrap_or_default()),
                point_of_sale: row.point_of_sale.unwrap_or_else(|| "1".to_string()),
            },
        }
    }
}
