//! Client for the electronic invoicing provider.

pub mod client;
pub mod envelope;
pub mod response;
pub mod transport;

pub use client::{BillingClient, BillingError, Submission};
pub use envelope::EnvelopeTarget;
pub use response::{ResponseParser, StatusReply, SubmissionReply, TagScanParser};
pub use transport::{Delivery, HttpTransport, ProviderResponse, ProviderTransport, TransportFailure};
