//! Services module for fiscal-invoicing-service.

pub mod database;
pub mod ledger;
pub mod mapper;
pub mod memory;
pub mod metrics;
pub mod orchestrator;
pub mod order_source;
pub mod poller;
pub mod reconciliation;
pub mod shop_store;
pub mod tax_id;

pub use database::Database;
pub use ledger::{InvoiceLedger, LedgerError};
pub use mapper::{map_order, map_value, InvalidOrder};
pub use memory::{InMemoryInvoiceLedger, InMemoryShopStore};
pub use metrics::{
    get_metrics, init_metrics, record_callback, record_error, record_provider_request,
    record_submission, record_webhook,
};
pub use orchestrator::{
    AutoInvoiceOutcome, GenerateOutcome, GenerationError, GenerationOrchestrator, OrderInput,
};
pub use order_source::{InvoiceAnnotation, OrderSource, ShopifyOrderSource};
pub use poller::AuthorizationPoller;
pub use reconciliation::{CallbackAck, CallbackPayload, ReconciliationHandler};
pub use shop_store::ShopStore;
pub use tax_id::{digits_only, is_valid_cuit};
