//! Provider response parsing.
//!
//! Responses are read through [`ResponseParser`], which only knows how to pull
//! the text of a named element. The default [`TagScanParser`] scans for the tag
//! under any namespace prefix instead of validating against a schema.

use once_cell::sync::Lazy;
use quick_xml::escape::unescape;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Compiled tag patterns, keyed by tag name.
static TAG_PATTERNS: Lazy<Mutex<HashMap<String, Regex>>> = Lazy::new(Default::default);

/// Reads the text content of named elements out of a response body.
pub trait ResponseParser: Send + Sync {
    /// Trimmed text of the first non-empty `tag` element, if any.
    fn extract(&self, body: &str, tag: &str) -> Option<String>;

    /// Text of every `tag` element, in document order.
    fn extract_all(&self, body: &str, tag: &str) -> Vec<String>;
}

/// Namespace-tolerant tag scanner.
#[derive(Debug, Default, Clone, Copy)]
pub struct TagScanParser;

impl TagScanParser {
    fn pattern(tag: &str) -> Option<Regex> {
        let mut patterns = TAG_PATTERNS.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pattern) = patterns.get(tag) {
            return Some(pattern.clone());
        }
        let pattern = Regex::new(&format!(
            r"<(?:[A-Za-z_][\w.\-]*:)?{}(\s[^>]*)?>([^<]*)<",
            regex::escape(tag)
        ))
        .ok()?;
        patterns.insert(tag.to_string(), pattern.clone());
        Some(pattern)
    }

    fn values(body: &str, tag: &str) -> Vec<String> {
        let Some(pattern) = Self::pattern(tag) else {
            return Vec::new();
        };
        pattern
            .captures_iter(body)
            .filter(|caps| {
                // `<x:Tag i:nil="true"/>` carries no text
                !caps.get(1).is_some_and(|attrs| attrs.as_str().ends_with('/'))
            })
            .filter_map(|caps| caps.get(2))
            .map(|text| {
                let raw = text.as_str().trim();
                unescape(raw)
                    .map(|s| s.into_owned())
                    .unwrap_or_else(|_| raw.to_string())
            })
            .filter(|text| !text.is_empty())
            .collect()
    }
}

impl ResponseParser for TagScanParser {
    fn extract(&self, body: &str, tag: &str) -> Option<String> {
        Self::values(body, tag).into_iter().next()
    }

    fn extract_all(&self, body: &str, tag: &str) -> Vec<String> {
        Self::values(body, tag)
    }
}

/// Synchronous answer to a `CrearComprobante` call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubmissionReply {
    pub status: Option<String>,
    pub message: Option<String>,
    pub tracking_id: Option<String>,
}

impl SubmissionReply {
    pub fn parse(parser: &dyn ResponseParser, body: &str) -> Self {
        Self {
            status: parser.extract(body, "Estado"),
            message: parser
                .extract(body, "Mensaje")
                .or_else(|| fault_message(parser, body)),
            tracking_id: parser.extract(body, "IdComprobante"),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.as_deref() == Some("OK")
    }
}

/// Answer to a `DetalleComprobante` status query.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusReply {
    pub status: Option<String>,
    pub authorization_code: Option<String>,
    pub document_number: Option<String>,
    pub message: Option<String>,
    pub errors: Vec<String>,
}

impl StatusReply {
    pub fn parse(parser: &dyn ResponseParser, body: &str) -> Self {
        Self {
            status: parser
                .extract(body, "EstadoComprobante")
                .or_else(|| parser.extract(body, "Estado")),
            authorization_code: parser.extract(body, "CAE"),
            document_number: parser
                .extract(body, "NumeroComprobante")
                .or_else(|| parser.extract(body, "Numero")),
            message: parser
                .extract(body, "Mensaje")
                .or_else(|| fault_message(parser, body)),
            errors: parser.extract_all(body, "string"),
        }
    }
}

/// SOAP fault reason, for non-2xx responses without a `Mensaje`.
fn fault_message(parser: &dyn ResponseParser, body: &str) -> Option<String> {
    parser
        .extract(body, "Text")
        .or_else(|| parser.extract(body, "faultstring"))
}
