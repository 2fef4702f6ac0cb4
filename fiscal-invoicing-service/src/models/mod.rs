//! Domain models for fiscal-invoicing-service.

mod invoice;
mod invoice_request;
mod order;
mod shop;

pub use invoice::{
    ApplyResult, AuthorizationOutcome, ClaimResult, Invoice, InvoiceStats, InvoiceStatus,
    NewInvoice, PendingResult, RedactionTarget, REDACTED_NAME,
};
pub use invoice_request::{Buyer, DocumentType, InvoiceLine, InvoiceRequest, TaxIdKind};
pub use order::{Address, LineItem, NoteAttribute, Order, OrderSummary, TaxLine};
pub use shop::{ProviderCredentials, ShopConfig, ShopRow, ShopStatus};
