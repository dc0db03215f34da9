//! Transport boundary: one network round trip per call, no retries.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde_json::Value;

/// HTTP verbs supported by the request layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// A single outgoing attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub method: Method,
    /// Path relative to the API base URL, e.g. `/budgets/42`.
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl TransportRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: Option<Value>) -> Self {
        self.body = body;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// A 2xx response with its raw body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// Raw failure raised by a transport before classification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportFailure {
    /// The server answered with a non-2xx status.
    #[error("{status} {status_text}")]
    Status {
        status: u16,
        status_text: String,
        body: String,
    },
    /// No response was received; only a message is available.
    #[error("{0}")]
    Message(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Executes exactly one round trip.
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportFailure>;
}

/// [`Transport`] backed by a reqwest [`Client`].
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    base_url: String,
}

impl ReqwestTransport {
    /// Wraps an existing client. `base_url` is prefixed to every request path.
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    /// Builds a client with the given user agent and overall timeout.
    pub fn build(base_url: &str, user_agent: &str, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder().user_agent(user_agent.to_string());
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("Failed to build HTTP client")?;
        Ok(Self::new(client, base_url))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, TransportFailure> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportFailure::Message(format!("Invalid header name {name}: {e}")))?;
        let mut value = HeaderValue::from_str(value)
            .map_err(|e| TransportFailure::Message(format!("Invalid header value for {name}: {e}")))?;
        if name == AUTHORIZATION {
            value.set_sensitive(true);
        }
        map.insert(name, value);
    }
    Ok(map)
}

/// Renders a reqwest send error so that connectivity failures carry a
/// recognizable phrase for the retry policy.
fn describe_send_error(error: &reqwest::Error) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    if error.is_timeout() {
        format!("Request timeout: {}", message)
    } else if error.is_connect() || error.is_request() {
        format!("Network error: {}", message)
    } else {
        message
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    #[tracing::instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportFailure> {
        let url = self.url_for(&request.path);
        debug!("{} {}...", request.method, url);

        let mut builder = self
            .client
            .request(request.method.into(), &url)
            .headers(header_map(&request.headers)?);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportFailure::Message(describe_send_error(&e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportFailure::Message(describe_send_error(&e)))?;

        if !status.is_success() {
            debug!("{} {} -> {}", request.method, url, status);
            return Err(TransportFailure::Status {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_string(),
                body,
            });
        }

        Ok(TransportResponse {
            status: status.as_u16(),
            body,
        })
    }
}
