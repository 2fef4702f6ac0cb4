//! Order -> invoice request mapping.
//!
//! Pure and deterministic: the same order always yields the same request.

use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

use crate::models::{
    Buyer, DocumentType, InvoiceLine, InvoiceRequest, LineItem, Order, TaxIdKind,
};
use crate::services::tax_id::{digits_only, is_valid_cuit};

/// Note attribute names that may carry the buyer's CUIT, in priority order.
pub const DOCUMENT_TYPE_ALIASES: &[&str] = &["CUIT", "Documento", "DNI"];

/// Note attribute names that may carry any buyer tax id, in priority order.
pub const BUYER_TAX_ID_ALIASES: &[&str] = &["CUIT", "Documento", "DNI", "documento_numero"];

pub const FINAL_CONSUMER: &str = "Consumidor Final";
pub const DEFAULT_CITY: &str = "CABA";
pub const CAPITAL_DISTRICT: &str = "Ciudad Autonoma de Buenos Aires";
pub const MAIN_PROVINCE: &str = "Buenos Aires";
pub const DEFAULT_DESCRIPTION: &str = "Producto";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidOrder {
    #[error("order payload is not an object")]
    NotAnObject,
    #[error("order {0} has no total amount")]
    MissingTotal(String),
    #[error("malformed order: {0}")]
    Malformed(String),
}

/// Default IVA rate, percent.
pub fn default_tax_rate() -> Decimal {
    Decimal::from(21)
}

/// Map a raw webhook/API payload.
pub fn map_value(value: &serde_json::Value) -> Result<InvoiceRequest, InvalidOrder> {
    if !value.is_object() {
        return Err(InvalidOrder::NotAnObject);
    }
    let order: Order = serde_json::from_value(value.clone())
        .map_err(|e| InvalidOrder::Malformed(e.to_string()))?;
    map_order(&order)
}

pub fn map_order(order: &Order) -> Result<InvoiceRequest, InvalidOrder> {
    let order_total = order
        .total_price
        .ok_or_else(|| InvalidOrder::MissingTotal(order.id.clone()))?;

    let lines: Vec<InvoiceLine> = order
        .line_items
        .iter()
        .enumerate()
        .map(|(index, item)| map_line(order, index, item))
        .collect();
    let total = lines.iter().map(|line| line.total).sum();

    Ok(InvoiceRequest {
        document_type: document_type(order),
        buyer: buyer(order),
        lines,
        total,
        order_total: round_dp(order_total, 2),
        reference: reference(order),
        order_number: order.display_number(),
    })
}

pub fn document_type(order: &Order) -> DocumentType {
    let candidate = note_attribute(order, DOCUMENT_TYPE_ALIASES).or_else(|| {
        order
            .billing_address
            .as_ref()
            .and_then(|address| address.company.as_deref())
            .map(str::trim)
            .filter(|company| is_digits_and_dashes(company, 10, 13))
            .map(str::to_string)
    });

    match candidate.map(|value| digits_only(&value)) {
        Some(digits) if digits.len() == 11 && is_valid_cuit(&digits) => DocumentType::A,
        _ => DocumentType::B,
    }
}

/// Trimmed "first last" of the billing (or shipping) address.
pub fn buyer_name(order: &Order) -> String {
    let address = order.buyer_address();
    let first = text(address.and_then(|a| a.first_name.as_ref()));
    let last = text(address.and_then(|a| a.last_name.as_ref()));
    let name = format!("{first} {last}").trim().to_string();
    if name.is_empty() {
        FINAL_CONSUMER.to_string()
    } else {
        name
    }
}

pub fn buyer_email(order: &Order) -> Option<String> {
    [order.email.as_deref(), order.contact_email.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|email| !email.is_empty())
        .map(str::to_string)
}

fn buyer(order: &Order) -> Buyer {
    let address = order.buyer_address();

    let raw_tax_id = note_attribute(order, BUYER_TAX_ID_ALIASES).or_else(|| {
        address
            .and_then(|a| a.company.as_deref())
            .map(str::trim)
            .filter(|company| is_digits_and_dashes(company, 7, 13))
            .map(str::to_string)
    });
    let tax_id = raw_tax_id.map(|v| digits_only(&v)).unwrap_or_default();

    let street = format!(
        "{} {}",
        text(address.and_then(|a| a.address1.as_ref())),
        text(address.and_then(|a| a.address2.as_ref()))
    )
    .trim()
    .to_string();
    let city = text(address.and_then(|a| a.city.as_ref()));
    let zip = text(address.and_then(|a| a.zip.as_ref()));

    Buyer {
        name: buyer_name(order),
        tax_id_kind: TaxIdKind::from_digits(&tax_id),
        tax_id,
        address: street,
        city: if city.is_empty() {
            DEFAULT_CITY.to_string()
        } else {
            city
        },
        province: normalize_province(address.and_then(|a| a.province.as_deref())),
        zip: (!zip.is_empty()).then_some(zip),
        email: buyer_email(order),
    }
}

/// Canonicalize the capital district and main province spellings.
pub fn normalize_province(province: Option<&str>) -> String {
    let raw = province.map(str::trim).unwrap_or("");
    let upper = raw.to_uppercase();
    if upper.contains("CAPITAL") || upper.contains("CABA") || upper.contains("AUTONOMA") {
        return CAPITAL_DISTRICT.to_string();
    }
    if upper.contains("BUENOS AIRES") || upper == "BS AS" || upper == "BS.AS." {
        return MAIN_PROVINCE.to_string();
    }
    if raw.is_empty() {
        MAIN_PROVINCE.to_string()
    } else {
        raw.to_string()
    }
}

fn map_line(order: &Order, index: usize, item: &LineItem) -> InvoiceLine {
    let tax_rate = line_tax_rate(order, item);
    let quantity = item.quantity.max(1);
    let qty = Decimal::from(quantity);

    let mut unit_price = item.price;
    if order.taxes_included && tax_rate > Decimal::ZERO {
        unit_price /= Decimal::ONE + tax_rate / Decimal::ONE_HUNDRED;
    }
    let unit_price = round_dp(unit_price, 3);

    let unit_discount = round_dp(item.total_discount.unwrap_or(Decimal::ZERO) / qty, 3);
    let total = round_dp(
        unit_price * qty * (Decimal::ONE + tax_rate / Decimal::ONE_HUNDRED),
        3,
    );

    InvoiceLine {
        code: line_code(index, item),
        description: first_non_empty([item.name.as_deref(), item.title.as_deref()])
            .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
        quantity,
        unit_price,
        tax_rate,
        unit_discount,
        total,
    }
}

/// Percent rate of the line's first tax line, else the order's, else 21.
fn line_tax_rate(order: &Order, item: &LineItem) -> Decimal {
    item.tax_lines
        .first()
        .or_else(|| order.tax_lines.first())
        .map(|tax| (tax.rate * Decimal::ONE_HUNDRED).normalize())
        .unwrap_or_else(default_tax_rate)
}

fn line_code(index: usize, item: &LineItem) -> String {
    first_non_empty([item.sku.as_deref(), item.variant_id.as_deref()])
        .unwrap_or_else(|| format!("PROD-{index}"))
}

fn reference(order: &Order) -> String {
    let name = order.name.clone().unwrap_or_else(|| order.display_number());
    if name.starts_with('#') {
        format!("Orden Shopify {name}")
    } else {
        format!("Orden Shopify #{name}")
    }
}

/// First attribute matching an alias (case-insensitive, alias order wins)
/// whose value is non-blank.
fn note_attribute(order: &Order, aliases: &[&str]) -> Option<String> {
    aliases.iter().find_map(|alias| {
        order
            .note_attributes
            .iter()
            .find(|attr| attr.name.eq_ignore_ascii_case(alias))
            .and_then(|attr| attr.value.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    })
}

fn text(value: Option<&String>) -> String {
    value.map(|s| s.trim().to_string()).unwrap_or_default()
}

fn is_digits_and_dashes(value: &str, min: usize, max: usize) -> bool {
    (min..=max).contains(&value.len()) && value.chars().all(|c| c.is_ascii_digit() || c == '-')
}

fn first_non_empty<const N: usize>(values: [Option<&str>; N]) -> Option<String> {
    values
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

pub(crate) fn round_dp(value: Decimal, dp: u32) -> Decimal {
    value.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
}
