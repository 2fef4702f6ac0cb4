//! Read access to tenant configuration.

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::ShopConfig;

#[async_trait]
pub trait ShopStore: Send + Sync {
    async fn find_by_domain(&self, shop_domain: &str) -> anyhow::Result<Option<ShopConfig>>;

    async fn find_by_id(&self, shop_id: Uuid) -> anyhow::Result<Option<ShopConfig>>;

    /// Flag the shop as uninstalled. Returns false if it was unknown.
    async fn mark_uninstalled(&self, shop_domain: &str) -> anyhow::Result<bool>;

    /// Remove the shop and its sessions. Returns false if it was unknown.
    async fn delete_shop(&self, shop_domain: &str) -> anyhow::Result<bool>;
}
