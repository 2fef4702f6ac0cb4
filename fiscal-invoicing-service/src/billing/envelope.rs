//! SOAP 1.2 envelopes for the invoicing provider.

use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::escape::escape;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;

use crate::models::{DocumentType, InvoiceLine, InvoiceRequest, ProviderCredentials, TaxIdKind};
use crate::services::mapper::round_dp;

pub const CREATE_INVOICE_ACTION: &str = "CrearComprobante";
pub const INVOICE_DETAIL_ACTION: &str = "DetalleComprobante";

const NAMESPACES: &str = concat!(
    r#"xmlns:s="http://www.w3.org/2003/05/soap-envelope" "#,
    r#"xmlns:a="http://www.w3.org/2005/08/addressing" "#,
    r#"xmlns:fac="http://www.facturante.com.API" "#,
    r#"xmlns:fac1="http://schemas.datacontract.org/2004/07/FacturanteMVC.API" "#,
    r#"xmlns:fac2="http://schemas.datacontract.org/2004/07/FacturanteMVC.API.DTOs" "#,
    r#"xmlns:i="http://www.w3.org/2001/XMLSchema-instance""#
);

const MAX_CODE_CHARS: usize = 20;
const MAX_DESCRIPTION_CHARS: usize = 250;
const MAX_BUYER_FIELD_CHARS: usize = 100;

/// Where envelopes are addressed.
#[derive(Debug, Clone)]
pub struct EnvelopeTarget {
    pub endpoint: String,
    pub action_base: String,
}

impl EnvelopeTarget {
    /// Fully qualified SOAP action URI.
    pub fn action_uri(&self, action: &str) -> String {
        format!("{}/{}", self.action_base.trim_end_matches('/'), action)
    }

    /// HTTP content type naming the action.
    pub fn content_type(&self, action: &str) -> String {
        format!(
            r#"application/soap+xml; charset=utf-8; action="{}""#,
            self.action_uri(action)
        )
    }

    fn wrap(&self, action: &str, body: &str) -> String {
        format!(
            concat!(
                r#"<?xml version="1.0" encoding="utf-8"?>"#,
                "<s:Envelope {ns}><s:Header>",
                r#"<a:Action s:mustUnderstand="1">{action}</a:Action>"#,
                r#"<a:To s:mustUnderstand="1">{to}</a:To>"#,
                "</s:Header><s:Body>{body}</s:Body></s:Envelope>"
            ),
            ns = NAMESPACES,
            action = escape(&self.action_uri(action)),
            to = escape(&self.endpoint),
            body = body,
        )
    }
}

/// Totals as they appear in the document header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderTotals {
    pub net: Decimal,
    pub total: Decimal,
}

impl HeaderTotals {
    pub fn for_request(request: &InvoiceRequest) -> Self {
        Self {
            net: request.net_total(),
            total: request.lines.iter().map(|line| line.total).sum(),
        }
    }
}

/// `CrearComprobante` envelope.
pub fn create_invoice(
    target: &EnvelopeTarget,
    request: &InvoiceRequest,
    credentials: &ProviderCredentials,
    callback_url: Option<&str>,
    issued_at: DateTime<Utc>,
) -> String {
    let totals = HeaderTotals::for_request(request);
    let mut body = String::with_capacity(4096);

    body.push_str("<fac:CrearComprobante><fac:request>");
    body.push_str(&authentication(credentials));
    body.push_str(&customer(request));
    body.push_str(&header(request, credentials, &totals, issued_at));

    body.push_str("<fac1:Items>");
    for line in &request.lines {
        body.push_str(&item(line));
    }
    body.push_str("</fac1:Items>");

    if let Some(url) = callback_url {
        body.push_str(&format!(
            "<fac1:WebHook><fac2:Url>{}</fac2:Url></fac1:WebHook>",
            escape(url)
        ));
    }
    body.push_str("</fac:request></fac:CrearComprobante>");

    target.wrap(CREATE_INVOICE_ACTION, &body)
}

/// `DetalleComprobante` envelope used by the polling fallback.
pub fn invoice_detail(
    target: &EnvelopeTarget,
    tracking_id: &str,
    credentials: &ProviderCredentials,
) -> String {
    let body = format!(
        "<fac:DetalleComprobante><fac:request>{}<fac1:IdComprobante>{}</fac1:IdComprobante></fac:request></fac:DetalleComprobante>",
        authentication(credentials),
        escape(tracking_id)
    );
    target.wrap(INVOICE_DETAIL_ACTION, &body)
}

fn authentication(credentials: &ProviderCredentials) -> String {
    format!(
        "<fac1:Autenticacion><fac2:Empresa>{}</fac2:Empresa><fac2:Hash>{}</fac2:Hash><fac2:Usuario>{}</fac2:Usuario></fac1:Autenticacion>",
        escape(&credentials.account),
        escape(credentials.secret_hash.expose_secret()),
        escape(&credentials.username)
    )
}

/// Provider tax treatment code.
pub fn tax_treatment(document_type: DocumentType, kind: TaxIdKind) -> u8 {
    match (document_type, kind) {
        (DocumentType::A, _) => 2,
        (_, TaxIdKind::Cuit) => 1,
        _ => 3,
    }
}

fn customer(request: &InvoiceRequest) -> String {
    let buyer = &request.buyer;
    let document_number = if buyer.tax_id.is_empty() {
        "1"
    } else {
        buyer.tax_id.as_str()
    };

    let mut xml = String::from("<fac1:Cliente>");
    push_field(&mut xml, "CodigoPostal", &escape(or_dash(buyer.zip.as_deref())));
    push_field(&mut xml, "CondicionPago", "2");
    push_field(&mut xml, "Contacto", "-");
    push_field(
        &mut xml,
        "DireccionFiscal",
        &escape(&truncate(or_dash(Some(&buyer.address)), MAX_BUYER_FIELD_CHARS)),
    );
    push_field(&mut xml, "EnviarComprobante", "true");
    push_field(&mut xml, "Localidad", &escape(or_dash(Some(&buyer.city))));
    push_field(&mut xml, "MailContacto", "-");
    push_field(&mut xml, "MailFacturacion", &escape(or_dash(buyer.email.as_deref())));
    push_field(&mut xml, "NroDocumento", &escape(document_number));
    push_field(&mut xml, "PercibeIIBB", "false");
    push_field(&mut xml, "PercibeIVA", "false");
    push_field(&mut xml, "Provincia", &escape(or_dash(Some(&buyer.province))));
    push_field(
        &mut xml,
        "RazonSocial",
        &escape(&truncate(&buyer.name, MAX_BUYER_FIELD_CHARS)),
    );
    push_field(&mut xml, "Telefono", "-");
    push_field(
        &mut xml,
        "TipoDocumento",
        &buyer.tax_id_kind.document_code().to_string(),
    );
    push_field(
        &mut xml,
        "TratamientoImpositivo",
        &tax_treatment(request.document_type, buyer.tax_id_kind).to_string(),
    );
    xml.push_str("</fac1:Cliente>");
    xml
}

fn header(
    request: &InvoiceRequest,
    credentials: &ProviderCredentials,
    totals: &HeaderTotals,
    issued_at: DateTime<Utc>,
) -> String {
    let mut xml = String::from("<fac1:Encabezado>");
    push_field(&mut xml, "Bienes", "1");
    push_nil(&mut xml, "CodigoPagoElectronico");
    push_field(&mut xml, "CondicionVenta", "1");
    push_field(&mut xml, "EnviarComprobante", "true");
    push_field(
        &mut xml,
        "FechaHora",
        &issued_at.to_rfc3339_opts(SecondsFormat::Secs, true).trim_end_matches('Z').to_string(),
    );
    push_nil(&mut xml, "FechaServDesde");
    push_nil(&mut xml, "FechaServHasta");
    push_nil(&mut xml, "FechaVtoPago");
    push_field(&mut xml, "ImporteImpuestosInternos", "0");
    push_field(&mut xml, "ImportePercepcionesMunic", "0");
    push_field(&mut xml, "Moneda", "2");
    push_field(&mut xml, "Observaciones", &escape(&request.reference));
    push_nil(&mut xml, "OrdenCompra");
    push_field(&mut xml, "PercepcionIIBB", "0");
    push_field(&mut xml, "PercepcionIVA", "0");
    push_field(&mut xml, "PorcentajeIIBB", "0");
    push_field(&mut xml, "Prefijo", &escape(&credentials.point_of_sale));
    push_nil(&mut xml, "Remito");
    push_field(&mut xml, "SubTotal", &fixed(totals.net, 4));
    push_field(&mut xml, "SubTotalExcento", "0");
    push_field(&mut xml, "SubTotalNoAlcanzado", "0");
    push_field(&mut xml, "TipoComprobante", request.document_type.code());
    push_field(&mut xml, "TipoDeCambio", "1");
    push_field(&mut xml, "Total", &fixed(totals.total, 3));
    push_field(&mut xml, "TotalConDescuento", "0");
    push_field(&mut xml, "TotalNeto", &fixed(totals.net, 3));
    xml.push_str("</fac1:Encabezado>");
    xml
}

fn item(line: &InvoiceLine) -> String {
    let mut xml = String::from("<fac2:ComprobanteItem>");
    push_field(&mut xml, "Bonificacion", "0");
    push_field(&mut xml, "Cantidad", &line.quantity.to_string());
    push_field(&mut xml, "Codigo", &escape(&truncate(&line.code, MAX_CODE_CHARS)));
    push_field(
        &mut xml,
        "Detalle",
        &escape(&truncate(&line.description, MAX_DESCRIPTION_CHARS)),
    );
    push_field(&mut xml, "Gravado", "true");
    push_field(&mut xml, "IVA", &fixed(line.tax_rate, 3));
    push_field(&mut xml, "PrecioUnitario", &fixed(line.unit_price, 3));
    push_field(&mut xml, "Total", &fixed(line.total, 3));
    xml.push_str("</fac2:ComprobanteItem>");
    xml
}

/// `value` must already be escaped.
fn push_field(xml: &mut String, name: &str, value: &str) {
    xml.push_str("<fac2:");
    xml.push_str(name);
    xml.push('>');
    xml.push_str(value);
    xml.push_str("</fac2:");
    xml.push_str(name);
    xml.push('>');
}

fn push_nil(xml: &mut String, name: &str) {
    xml.push_str("<fac2:");
    xml.push_str(name);
    xml.push_str(r#" i:nil="true"/>"#);
}

fn or_dash(value: Option<&str>) -> &str {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => v,
        _ => "-",
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

/// Decimal rendered with exactly `dp` fraction digits.
pub fn fixed(value: Decimal, dp: u32) -> String {
    let mut rounded = round_dp(value, dp);
    rounded.rescale(dp);
    rounded.to_string()
}
