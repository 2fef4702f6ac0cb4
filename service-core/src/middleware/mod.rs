pub mod tracing;
pub mod webhook_hmac;
