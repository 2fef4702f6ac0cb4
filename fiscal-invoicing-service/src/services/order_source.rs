//! Order source collaborator: the e-commerce platform's admin API.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{instrument, warn};

use crate::models::{
    Address, InvoiceStatus, LineItem, NoteAttribute, Order, OrderSummary, ShopConfig, TaxLine,
};

pub const METAFIELD_NAMESPACE: &str = "shopifac";
const MAX_METAFIELD_ERROR_CHARS: usize = 255;

/// Invoice state mirrored onto the order as metafields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceAnnotation {
    pub status: InvoiceStatus,
    pub authorization_code: Option<String>,
    pub document_number: Option<String>,
    pub error: Option<String>,
}

impl InvoiceAnnotation {
    pub fn status(status: InvoiceStatus) -> Self {
        Self {
            status,
            authorization_code: None,
            document_number: None,
            error: None,
        }
    }

    /// `metafieldsSet` inputs for an order.
    pub fn metafields(&self, order_id: &str) -> Vec<serde_json::Value> {
        let owner_id = order_gid(order_id);
        let mut fields = vec![("invoice_status", self.status.as_str().to_string())];
        if let Some(code) = &self.authorization_code {
            fields.push(("invoice_cae", code.clone()));
        }
        if let Some(number) = &self.document_number {
            fields.push(("invoice_number", number.clone()));
        }
        if let Some(error) = &self.error {
            fields.push((
                "invoice_error",
                error.chars().take(MAX_METAFIELD_ERROR_CHARS).collect(),
            ));
        }

        fields
            .into_iter()
            .map(|(key, value)| {
                json!({
                    "ownerId": owner_id,
                    "namespace": METAFIELD_NAMESPACE,
                    "key": key,
                    "type": "single_line_text_field",
                    "value": value,
                })
            })
            .collect()
    }
}

#[async_trait]
pub trait OrderSource: Send + Sync {
    /// Most recent paid orders, newest first.
    async fn list_paid_orders(&self, shop: &ShopConfig, limit: u32) -> Result<Vec<OrderSummary>>;

    /// Full order detail, or `None` if the platform does not know the id.
    async fn fetch_order(&self, shop: &ShopConfig, order_id: &str) -> Result<Option<Order>>;

    async fn annotate_invoice(
        &self,
        shop: &ShopConfig,
        order_id: &str,
        annotation: &InvoiceAnnotation,
    ) -> Result<()>;
}

pub fn order_gid(order_id: &str) -> String {
    format!("gid://shopify/Order/{order_id}")
}

/// Numeric id from a `gid://shopify/Order/123` global id.
pub fn short_id(gid: &str) -> &str {
    gid.rsplit('/').next().unwrap_or(gid)
}

const PAID_ORDERS_QUERY: &str = "query($first: Int!) { orders(first: $first, sortKey: CREATED_AT, reverse: true, query: \"financial_status:paid\") { edges { node { id name createdAt totalPriceSet { presentmentMoney { amount } } customer { firstName lastName } } } } }";

const ORDER_QUERY: &str = "query($id: ID!) { order(id: $id) { id name email taxesIncluded totalPriceSet { presentmentMoney { amount } } billingAddress { firstName lastName address1 address2 city province zip company } shippingAddress { firstName lastName address1 address2 city province zip company } noteAttributes { name value } lineItems(first: 50) { edges { node { title sku quantity variant { id } originalUnitPriceSet { presentmentMoney { amount } } totalDiscountSet { presentmentMoney { amount } } taxLines { rate } } } } } }";

const METAFIELDS_SET_MUTATION: &str = "mutation metafieldsSet($metafields: [MetafieldsSetInput!]!) { metafieldsSet(metafields: $metafields) { metafields { id } userErrors { field message code } } }";

/// GraphQL admin API client.
#[derive(Clone)]
pub struct ShopifyOrderSource {
    client: Client,
    api_version: String,
    base_url: Option<String>,
}

impl ShopifyOrderSource {
    pub fn new(api_version: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            api_version: api_version.into(),
            base_url: None,
        })
    }

    /// Send every request to `base_url` instead of the shop's own domain.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    fn endpoint(&self, shop: &ShopConfig) -> String {
        let base = self
            .base_url
            .clone()
            .unwrap_or_else(|| format!("https://{}", shop.shop_domain));
        format!("{}/admin/api/{}/graphql.json", base, self.api_version)
    }

    async fn graphql<T: DeserializeOwned>(
        &self,
        shop: &ShopConfig,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T> {
        let response = self
            .client
            .post(self.endpoint(shop))
            .header("X-Shopify-Access-Token", shop.access_token.expose_secret())
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .context("admin API request failed")?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!("admin API returned {}: {}", status, body));
        }

        let envelope: GraphQlResponse<T> =
            serde_json::from_str(&body).context("invalid admin API response")?;
        match envelope.data {
            Some(data) => Ok(data),
            None => Err(anyhow!(
                "admin API error: {}",
                envelope
                    .errors
                    .iter()
                    .map(|e| e.message.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
        }
    }
}

#[async_trait]
impl OrderSource for ShopifyOrderSource {
    #[instrument(skip(self, shop), fields(shop = %shop.shop_domain))]
    async fn list_paid_orders(&self, shop: &ShopConfig, limit: u32) -> Result<Vec<OrderSummary>> {
        let data: OrdersData = self
            .graphql(shop, PAID_ORDERS_QUERY, json!({ "first": limit }))
            .await?;

        Ok(data
            .orders
            .edges
            .into_iter()
            .map(|edge| {
                let node = edge.node;
                OrderSummary {
                    id: short_id(&node.id).to_string(),
                    order_number: node.name,
                    total: node.total_price_set.and_then(MoneyBag::amount),
                    created_at: node.created_at,
                    customer_name: node.customer.map(|c| {
                        format!(
                            "{} {}",
                            c.first_name.unwrap_or_default(),
                            c.last_name.unwrap_or_default()
                        )
                        .trim()
                        .to_string()
                    }),
                }
            })
            .collect())
    }

    #[instrument(skip(self, shop), fields(shop = %shop.shop_domain))]
    async fn fetch_order(&self, shop: &ShopConfig, order_id: &str) -> Result<Option<Order>> {
        let data: OrderData = self
            .graphql(shop, ORDER_QUERY, json!({ "id": order_gid(order_id) }))
            .await?;
        Ok(data.order.map(|order| order.into_order(order_id)))
    }

    #[instrument(skip(self, shop, annotation), fields(shop = %shop.shop_domain, status = %annotation.status))]
    async fn annotate_invoice(
        &self,
        shop: &ShopConfig,
        order_id: &str,
        annotation: &InvoiceAnnotation,
    ) -> Result<()> {
        let data: MetafieldsSetData = self
            .graphql(
                shop,
                METAFIELDS_SET_MUTATION,
                json!({ "metafields": annotation.metafields(order_id) }),
            )
            .await?;

        let user_errors = data
            .metafields_set
            .map(|result| result.user_errors)
            .unwrap_or_default();
        if !user_errors.is_empty() {
            warn!(order_id, errors = ?user_errors, "Metafield user errors");
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Deserialize)]
struct Connection<T> {
    edges: Vec<Edge<T>>,
}

#[derive(Deserialize)]
struct Edge<T> {
    node: T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoneyBag {
    presentment_money: Option<Money>,
}

impl MoneyBag {
    fn amount(self) -> Option<Decimal> {
        self.presentment_money.map(|m| m.amount)
    }
}

#[derive(Deserialize)]
struct Money {
    amount: Decimal,
}

#[derive(Deserialize)]
struct OrdersData {
    orders: Connection<OrderNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderNode {
    id: String,
    name: String,
    created_at: Option<String>,
    total_price_set: Option<MoneyBag>,
    customer: Option<CustomerNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomerNode {
    first_name: Option<String>,
    last_name: Option<String>,
}

#[derive(Deserialize)]
struct OrderData {
    order: Option<OrderDetail>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderDetail {
    name: Option<String>,
    email: Option<String>,
    #[serde(default)]
    taxes_included: bool,
    total_price_set: Option<MoneyBag>,
    billing_address: Option<AddressNode>,
    shipping_address: Option<AddressNode>,
    #[serde(default)]
    note_attributes: Vec<NoteAttribute>,
    line_items: Connection<LineItemNode>,
}

impl OrderDetail {
    fn into_order(self, order_id: &str) -> Order {
        Order {
            id: order_id.to_string(),
            order_number: self.name.clone(),
            name: self.name,
            email: self.email,
            total_price: self.total_price_set.and_then(MoneyBag::amount),
            taxes_included: self.taxes_included,
            billing_address: self.billing_address.map(Address::from),
            shipping_address: self.shipping_address.map(Address::from),
            note_attributes: self.note_attributes,
            line_items: self
                .line_items
                .edges
                .into_iter()
                .map(|edge| edge.node.into())
                .collect(),
            ..Default::default()
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddressNode {
    first_name: Option<String>,
    last_name: Option<String>,
    address1: Option<String>,
    address2: Option<String>,
    city: Option<String>,
    province: Option<String>,
    zip: Option<String>,
    company: Option<String>,
}

impl From<AddressNode> for Address {
    fn from(node: AddressNode) -> Self {
        Address {
            first_name: node.first_name,
            last_name: node.last_name,
            company: node.company,
            address1: node.address1,
            address2: node.address2,
            city: node.city,
            province: node.province,
            zip: node.zip,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LineItemNode {
    title: Option<String>,
    sku: Option<String>,
    quantity: u32,
    variant: Option<VariantNode>,
    original_unit_price_set: Option<MoneyBag>,
    total_discount_set: Option<MoneyBag>,
    #[serde(default)]
    tax_lines: Vec<TaxLine>,
}

#[derive(Deserialize)]
struct VariantNode {
    id: String,
}

impl From<LineItemNode> for LineItem {
    fn from(node: LineItemNode) -> Self {
        LineItem {
            name: node.title.clone(),
            title: node.title,
            sku: node.sku,
            variant_id: node.variant.map(|v| short_id(&v.id).to_string()),
            quantity: node.quantity,
            price: node
                .original_unit_price_set
                .and_then(MoneyBag::amount)
                .unwrap_or_default(),
            total_discount: node.total_discount_set.and_then(MoneyBag::amount),
            tax_lines: node.tax_lines,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetafieldsSetData {
    metafields_set: Option<MetafieldsSetResult>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetafieldsSetResult {
    #[serde(default)]
    user_errors: Vec<serde_json::Value>,
}
