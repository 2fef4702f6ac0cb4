//! Provider callbacks: authorization results applied to the ledger.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use super::ledger::{InvoiceLedger, LedgerError};
use super::metrics;
use super::order_source::{InvoiceAnnotation, OrderSource};
use super::shop_store::ShopStore;
use crate::billing::ResponseParser;
use crate::models::{ApplyResult, AuthorizationOutcome, Invoice, InvoiceStatus};

pub const AUTHORIZED_STATUS: &str = "autorizado";
pub const DEFAULT_REJECTION: &str = "Rechazado";

/// Field names accepted for each callback value, highest priority first.
pub struct CallbackFields {
    pub tracking_id: &'static [&'static str],
    pub authorization_code: &'static [&'static str],
    pub document_number: &'static [&'static str],
    pub status: &'static [&'static str],
    pub errors: &'static [&'static str],
    pub message: &'static [&'static str],
}

pub const CALLBACK_FIELDS: CallbackFields = CallbackFields {
    tracking_id: &["IdComprobante", "idComprobante", "id"],
    authorization_code: &["CAE", "cae"],
    document_number: &["NumeroComprobante", "Numero"],
    status: &["Estado", "estado"],
    errors: &["Errores"],
    message: &["Mensaje", "mensaje"],
};

/// Acknowledgement returned to the provider. Callbacks are always answered
/// with 200; this only tells what happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackAck {
    Processed,
    NotFound,
    Ignored,
    Error,
}

impl CallbackAck {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackAck::Processed => "processed",
            CallbackAck::NotFound => "not_found",
            CallbackAck::Ignored => "ignored",
            CallbackAck::Error => "error",
        }
    }
}

/// Normalized callback body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackPayload {
    pub tracking_id: Option<String>,
    pub authorization_code: Option<String>,
    pub document_number: Option<String>,
    pub status: Option<String>,
    pub errors: Vec<String>,
    pub message: Option<String>,
}

impl CallbackPayload {
    /// Decode a JSON or XML body. JSON is chosen by content type, or by a
    /// leading `{` when the content type is missing.
    pub fn parse(
        body: &str,
        content_type: Option<&str>,
        parser: &dyn ResponseParser,
    ) -> Option<Self> {
        let is_json = match content_type {
            Some(ct) if ct.to_ascii_lowercase().contains("json") => true,
            Some(ct) if ct.to_ascii_lowercase().contains("xml") => false,
            _ => body.trim_start().starts_with('{'),
        };

        if is_json {
            serde_json::from_str::<Value>(body)
                .ok()
                .map(|value| Self::from_json(&value))
        } else {
            Some(Self::from_xml(body, parser))
        }
    }

    pub fn from_json(value: &Value) -> Self {
        let fields = &CALLBACK_FIELDS;
        let errors = fields
            .errors
            .iter()
            .find_map(|key| value.get(*key))
            .map(json_errors)
            .unwrap_or_default();

        Self {
            tracking_id: json_field(value, fields.tracking_id),
            authorization_code: json_field(value, fields.authorization_code),
            document_number: json_field(value, fields.document_number),
            status: json_field(value, fields.status),
            errors,
            message: json_field(value, fields.message),
        }
    }

    /// Errors inside `<Errores>` arrive as `<string>` children.
    pub fn from_xml(body: &str, parser: &dyn ResponseParser) -> Self {
        let fields = &CALLBACK_FIELDS;
        let xml_field = |aliases: &[&str]| {
            aliases
                .iter()
                .find_map(|tag| parser.extract(body, tag).filter(|v| !v.trim().is_empty()))
        };
        let errors = if fields
            .errors
            .iter()
            .any(|tag| body.contains(&format!("{tag}>")))
        {
            parser.extract_all(body, "string")
        } else {
            Vec::new()
        };

        Self {
            tracking_id: xml_field(fields.tracking_id),
            authorization_code: xml_field(fields.authorization_code),
            document_number: xml_field(fields.document_number),
            status: xml_field(fields.status),
            errors,
            message: xml_field(fields.message),
        }
    }

    /// Authorized only with the `autorizado` status and a code; anything
    /// else is a rejection.
    pub fn outcome(&self) -> AuthorizationOutcome {
        let authorized = self
            .status
            .as_deref()
            .is_some_and(|s| s.trim().eq_ignore_ascii_case(AUTHORIZED_STATUS));

        match (&self.authorization_code, authorized) {
            (Some(code), true) => AuthorizationOutcome::Authorized {
                authorization_code: Some(code.clone()),
                document_number: self.document_number.clone(),
            },
            _ => AuthorizationOutcome::Rejected {
                reason: rejection_reason(&self.errors, self.message.as_deref()),
            },
        }
    }
}

/// Errors joined with ", ", else the message, else the default.
pub fn rejection_reason(errors: &[String], message: Option<&str>) -> String {
    let joined = errors
        .iter()
        .map(|e| e.trim())
        .filter(|e| !e.is_empty())
        .collect::<Vec<_>>()
        .join(", ");
    if !joined.is_empty() {
        return joined;
    }
    match message.map(str::trim) {
        Some(m) if !m.is_empty() => m.to_string(),
        _ => DEFAULT_REJECTION.to_string(),
    }
}

fn json_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_field(value: &Value, aliases: &[&str]) -> Option<String> {
    aliases
        .iter()
        .find_map(|key| value.get(*key).and_then(json_scalar))
}

fn json_errors(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                json_scalar(item).or_else(|| {
                    item.is_object()
                        .then(|| json_field(item, CALLBACK_FIELDS.message))
                        .flatten()
                })
            })
            .collect(),
        other => json_scalar(other).into_iter().collect(),
    }
}

pub struct ReconciliationHandler {
    ledger: Arc<dyn InvoiceLedger>,
    shops: Arc<dyn ShopStore>,
    orders: Option<Arc<dyn OrderSource>>,
    parser: Arc<dyn ResponseParser>,
}

impl ReconciliationHandler {
    pub fn new(
        ledger: Arc<dyn InvoiceLedger>,
        shops: Arc<dyn ShopStore>,
        orders: Option<Arc<dyn OrderSource>>,
        parser: Arc<dyn ResponseParser>,
    ) -> Self {
        Self {
            ledger,
            shops,
            orders,
            parser,
        }
    }

    /// Handle one callback delivery. Never fails; internal errors are logged
    /// and acknowledged as [`CallbackAck::Error`].
    #[instrument(skip(self, body), fields(body_len = body.len()))]
    pub async fn reconcile(&self, body: &str, content_type: Option<&str>) -> CallbackAck {
        let ack = match CallbackPayload::parse(body, content_type, self.parser.as_ref()) {
            Some(payload) => match self.apply(&payload).await {
                Ok(ack) => ack,
                Err(e) => {
                    error!(error = %e, tracking_id = ?payload.tracking_id, "Failed to apply provider callback");
                    metrics::record_error("callback");
                    CallbackAck::Error
                }
            },
            None => {
                warn!("Unreadable provider callback body");
                CallbackAck::Ignored
            }
        };

        metrics::record_callback(ack.as_str());
        ack
    }

    /// Apply a decoded callback to the ledger.
    pub async fn apply(&self, payload: &CallbackPayload) -> Result<CallbackAck, LedgerError> {
        let Some(tracking_id) = payload.tracking_id.as_deref() else {
            return Ok(CallbackAck::Ignored);
        };

        let outcome = payload.outcome();
        match self.ledger.apply_authorization(tracking_id, &outcome).await? {
            ApplyResult::Applied(invoice) => {
                info!(
                    tracking_id,
                    order_id = %invoice.order_id,
                    status = %invoice.status,
                    "Authorization result recorded"
                );
                self.annotate(&invoice).await;
                Ok(CallbackAck::Processed)
            }
            ApplyResult::Ignored(invoice) => {
                info!(tracking_id, status = %invoice.status, "Callback for settled invoice ignored");
                Ok(CallbackAck::Processed)
            }
            ApplyResult::NotFound => {
                warn!(tracking_id, "Callback for unknown tracking id");
                Ok(CallbackAck::NotFound)
            }
        }
    }

    /// Mirror the settled invoice onto the order. Best effort.
    pub async fn annotate(&self, invoice: &Invoice) {
        let Some(orders) = &self.orders else {
            return;
        };
        let shop = match self.shops.find_by_id(invoice.shop_id).await {
            Ok(Some(shop)) => shop,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Shop lookup for metafields failed");
                return;
            }
        };

        let annotation = InvoiceAnnotation {
            status: invoice.status(),
            authorization_code: invoice.authorization_code.clone(),
            document_number: invoice.document_number.clone(),
            error: (invoice.status() == InvoiceStatus::Failed)
                .then(|| invoice.error_message.clone())
                .flatten(),
        };
        if let Err(e) = orders
            .annotate_invoice(&shop, &invoice.order_id, &annotation)
            .await
        {
            warn!(error = %e, order_id = %invoice.order_id, "Failed to set invoice metafields");
        }
    }
}
