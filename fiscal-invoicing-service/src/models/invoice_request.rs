//! Provider-agnostic invoice request derived from an order.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Invoice category. `A` requires a buyer with a valid CUIT; `B` is the
/// final-consumer default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentType {
    A,
    B,
}

impl DocumentType {
    /// Provider code for the document type.
    pub fn code(&self) -> &'static str {
        match self {
            DocumentType::A => "FA",
            DocumentType::B => "FB",
        }
    }
}

/// Kind of buyer tax identifier, inferred from its digit count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxIdKind {
    Cuit,
    Dni,
    None,
}

impl TaxIdKind {
    pub fn from_digits(digits: &str) -> Self {
        match digits.len() {
            11 => TaxIdKind::Cuit,
            n if n >= 7 => TaxIdKind::Dni,
            _ => TaxIdKind::None,
        }
    }

    /// Provider document kind code.
    pub fn document_code(&self) -> u8 {
        match self {
            TaxIdKind::Cuit => 6,
            TaxIdKind::Dni => 96,
            TaxIdKind::None => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buyer {
    pub name: String,
    pub tax_id_kind: TaxIdKind,
    /// Digits only; empty for final consumers without an id.
    pub tax_id: String,
    pub address: String,
    pub city: String,
    pub province: String,
    pub zip: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub code: String,
    pub description: String,
    pub quantity: u32,
    /// Tax-exclusive unit price, 3 dp.
    pub unit_price: Decimal,
    /// Percentage, e.g. 21.
    pub tax_rate: Decimal,
    pub unit_discount: Decimal,
    pub total: Decimal,
}

impl InvoiceLine {
    pub fn net_amount(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

/// Immutable once built; serialised as the ledger's frozen payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRequest {
    pub document_type: DocumentType,
    pub buyer: Buyer,
    pub lines: Vec<InvoiceLine>,
    /// Sum of line totals. Sent to the provider.
    pub total: Decimal,
    /// Total stated on the order. Shown in the ledger.
    pub order_total: Decimal,
    pub reference: String,
    pub order_number: String,
}

impl InvoiceRequest {
    /// Sum of tax-exclusive line amounts, unrounded.
    pub fn net_total(&self) -> Decimal {
        self.lines.iter().map(InvoiceLine::net_amount).sum()
    }
}
