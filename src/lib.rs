//! Resilient request layer for the ledgerlink API.
//!
//! [`ApiClient`] is the single entry point: it retries transient failures with
//! exponential backoff, renews the bearer token at most once per logical
//! request (sharing one refresh among concurrent callers), and reports every
//! failure as one typed [`Error`].

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod http;

pub use client::ApiClient;
pub use config::ClientConfig;
pub use error::{ApiError, Error, ErrorCategory, ErrorKind, Result, redact_secrets};
