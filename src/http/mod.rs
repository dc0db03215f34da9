//! HTTP plumbing: transport boundary, error classification and retry policy.

mod classify;
mod retry;
mod transport;

pub use classify::{
    MAX_EXCERPT_CHARS, classify, classify_status, extract_code, extract_details, extract_message,
};
pub use retry::{BASE_DELAY_MS, JITTER_FRACTION, MAX_DELAY_MS, MAX_RETRIES, RetryPolicy};
#[cfg(test)]
pub use transport::MockTransport;
pub use transport::{
    Method, ReqwestTransport, Transport, TransportFailure, TransportRequest, TransportResponse,
};
