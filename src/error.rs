//! Typed failure taxonomy for the request layer.
//!
//! Every logical request resolves with a decoded payload or exactly one
//! [`Error`]. Status-bearing failures are always an [`ApiError`]; message-only
//! transport failures that do not look like connectivity problems are
//! propagated unmodified as [`Error::Transport`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::http::TransportFailure;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Field name to message map carried by validation failures.
pub type FieldErrors = BTreeMap<String, String>;

/// Errors surfaced by [`crate::ApiClient`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Api(#[from] ApiError),

    /// A message-only transport failure that matched no retryable pattern.
    #[error("Transport failure: {0}")]
    Transport(TransportFailure),

    #[error("Failed to encode request body: {0}")]
    Encode(serde_json::Error),

    #[error("Failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Session storage error: {0:#}")]
    Storage(anyhow::Error),
}

impl Error {
    /// Returns the typed API error, if this is one.
    pub fn as_api(&self) -> Option<&ApiError> {
        match self {
            Error::Api(e) => Some(e),
            _ => None,
        }
    }

    /// Status of the failure; 0 when no HTTP status was involved.
    pub fn status(&self) -> u16 {
        self.as_api().map(ApiError::status).unwrap_or(0)
    }
}

/// Discriminant of [`ApiError`], convenient for matching and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Authentication,
    Forbidden,
    NotFound,
    Conflict,
    Server,
    Network,
    Generic,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Server => "server",
            ErrorKind::Network => "network",
            ErrorKind::Generic => "generic",
        };
        f.write_str(name)
    }
}

/// A classified API failure.
///
/// Each variant carries a human-readable message and a machine-readable
/// code. Only [`ApiError::Validation`] carries field-level details.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// HTTP 400
    #[error("{message}")]
    Validation {
        message: String,
        code: String,
        details: Option<FieldErrors>,
    },
    /// HTTP 401
    #[error("{message}")]
    Authentication { message: String, code: String },
    /// HTTP 403
    #[error("{message}")]
    Forbidden { message: String, code: String },
    /// HTTP 404
    #[error("{message}")]
    NotFound { message: String, code: String },
    /// HTTP 409
    #[error("{message}")]
    Conflict { message: String, code: String },
    /// HTTP 500, 502, 503, 504
    #[error("{message}")]
    Server {
        status: u16,
        message: String,
        code: String,
    },
    /// Transport-level failure with no HTTP status.
    #[error("{message}")]
    Network { message: String, code: String },
    /// Any other status.
    #[error("{message}")]
    Generic {
        status: u16,
        message: String,
        code: Option<String>,
    },
}

pub const VALIDATION_CODE: &str = "VALIDATION_ERROR";
pub const AUTH_REQUIRED_CODE: &str = "AUTH_REQUIRED";
pub const FORBIDDEN_CODE: &str = "FORBIDDEN";
pub const NOT_FOUND_CODE: &str = "NOT_FOUND";
pub const CONFLICT_CODE: &str = "CONFLICT";
pub const SERVER_ERROR_CODE: &str = "SERVER_ERROR";
pub const NETWORK_ERROR_CODE: &str = "NETWORK_ERROR";

impl ApiError {
    /// Builds an authentication error with the default code.
    pub fn authentication(message: impl Into<String>) -> Self {
        ApiError::Authentication {
            message: message.into(),
            code: AUTH_REQUIRED_CODE.to_string(),
        }
    }

    /// Builds a network error with the default code.
    pub fn network(message: impl Into<String>) -> Self {
        ApiError::Network {
            message: message.into(),
            code: NETWORK_ERROR_CODE.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Validation { .. } => ErrorKind::Validation,
            ApiError::Authentication { .. } => ErrorKind::Authentication,
            ApiError::Forbidden { .. } => ErrorKind::Forbidden,
            ApiError::NotFound { .. } => ErrorKind::NotFound,
            ApiError::Conflict { .. } => ErrorKind::Conflict,
            ApiError::Server { .. } => ErrorKind::Server,
            ApiError::Network { .. } => ErrorKind::Network,
            ApiError::Generic { .. } => ErrorKind::Generic,
        }
    }

    /// HTTP status of the failure, 0 for pure transport failures.
    pub fn status(&self) -> u16 {
        match self {
            ApiError::Validation { .. } => 400,
            ApiError::Authentication { .. } => 401,
            ApiError::Forbidden { .. } => 403,
            ApiError::NotFound { .. } => 404,
            ApiError::Conflict { .. } => 409,
            ApiError::Server { status, .. } | ApiError::Generic { status, .. } => *status,
            ApiError::Network { .. } => 0,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::Validation { message, .. }
            | ApiError::Authentication { message, .. }
            | ApiError::Forbidden { message, .. }
            | ApiError::NotFound { message, .. }
            | ApiError::Conflict { message, .. }
            | ApiError::Server { message, .. }
            | ApiError::Network { message, .. }
            | ApiError::Generic { message, .. } => message,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            ApiError::Validation { code, .. }
            | ApiError::Authentication { code, .. }
            | ApiError::Forbidden { code, .. }
            | ApiError::NotFound { code, .. }
            | ApiError::Conflict { code, .. }
            | ApiError::Server { code, .. }
            | ApiError::Network { code, .. } => Some(code),
            ApiError::Generic { code, .. } => code.as_deref(),
        }
    }

    /// Field-level messages; only validation failures carry them.
    pub fn details(&self) -> Option<&FieldErrors> {
        match self {
            ApiError::Validation { details, .. } => details.as_ref(),
            _ => None,
        }
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, ApiError::Authentication { .. })
    }

    /// Buckets the error for display by an error boundary.
    pub fn category(&self) -> ErrorCategory {
        match self.kind() {
            ErrorKind::Validation => ErrorCategory::Input,
            ErrorKind::Authentication => ErrorCategory::Session,
            ErrorKind::Forbidden => ErrorCategory::Permission,
            ErrorKind::NotFound => ErrorCategory::Missing,
            ErrorKind::Conflict => ErrorCategory::Conflict,
            ErrorKind::Server | ErrorKind::Network => ErrorCategory::Transient,
            ErrorKind::Generic => ErrorCategory::Unknown,
        }
    }

    /// The message with embedded secrets redacted, safe to show to a user.
    pub fn user_message(&self) -> String {
        redact_secrets(self.message())
    }
}

/// User-facing grouping of the taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Show field-level messages next to the form.
    Input,
    /// Send the user back to login.
    Session,
    /// Access denied.
    Permission,
    /// Empty or not-found state.
    Missing,
    /// Duplicate or conflicting change.
    Conflict,
    /// Outage or connectivity problem; offer a retry action.
    Transient,
    Unknown,
}

impl ErrorCategory {
    /// Whether it makes sense to offer the user a manual retry.
    pub fn is_retryable_by_user(self) -> bool {
        self == ErrorCategory::Transient
    }
}

/// Matches `name=value` pairs whose name ends in a secret-bearing word, so
/// compound names such as `refresh_token` or `client_secret` are caught too.
///
/// The pattern is a literal checked by `test_redact_secrets`; it cannot fail
/// to compile at runtime.
static SECRET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([a-z0-9_-]*(?:api_key|password|secret|token|key))=[^\s&;,]+")
        .expect("redaction pattern is a valid literal")
});

/// Replaces values of `password=`, `token=`, `key=`, `secret=` and `api_key=`
/// assignments, including prefixed names like `access_token=`, with
/// `[REDACTED]`.
pub fn redact_secrets(text: &str) -> String {
    SECRET_RE.replace_all(text, "${1}=[REDACTED]").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_per_kind() {
        assert_eq!(ApiError::authentication("x").status(), 401);
        assert_eq!(ApiError::network("x").status(), 0);
        let err = ApiError::Server {
            status: 503,
            message: "down".to_string(),
            code: SERVER_ERROR_CODE.to_string(),
        };
        assert_eq!(err.status(), 503);
        assert_eq!(err.kind(), ErrorKind::Server);
    }

    #[test]
    fn test_only_validation_carries_details() {
        let mut details = FieldErrors::new();
        details.insert("email".to_string(), "is required".to_string());
        let err = ApiError::Validation {
            message: "Invalid input".to_string(),
            code: VALIDATION_CODE.to_string(),
            details: Some(details),
        };
        assert_eq!(
            err.details().and_then(|d| d.get("email")).map(String::as_str),
            Some("is required")
        );
        assert!(ApiError::authentication("x").details().is_none());
    }

    #[test]
    fn test_generic_code_is_optional() {
        let err = ApiError::Generic {
            status: 418,
            message: "teapot".to_string(),
            code: None,
        };
        assert_eq!(err.code(), None);
        assert_eq!(err.status(), 418);
        assert_eq!(err.category(), ErrorCategory::Unknown);
    }

    #[test]
    fn test_category_buckets() {
        assert_eq!(
            ApiError::authentication("x").category(),
            ErrorCategory::Session
        );
        assert!(ApiError::network("x").category().is_retryable_by_user());
        let conflict = ApiError::Conflict {
            message: "exists".to_string(),
            code: CONFLICT_CODE.to_string(),
        };
        assert_eq!(conflict.category(), ErrorCategory::Conflict);
        assert!(!conflict.category().is_retryable_by_user());
    }

    #[test]
    fn test_redact_secrets() {
        let text = "failed: password=hunter2&token=abc123 api_key=XYZ, Secret=s3 key=k";
        let redacted = redact_secrets(text);
        assert!(!redacted.contains("hunter2"));
        assert!(!redacted.contains("abc123"));
        assert!(!redacted.contains("XYZ"));
        assert!(!redacted.contains("s3"));
        assert!(redacted.contains("password=[REDACTED]"));
        assert!(redacted.contains("api_key=[REDACTED]"));
        assert!(redacted.contains("Secret=[REDACTED]"));
        assert!(redacted.starts_with("failed: "));
    }

    #[test]
    fn test_redact_compound_secret_names() {
        let text = "GET /x?refresh_token=RT123&access_token=AT456 client_secret=CS789 private_key=PK000 x-api-key=AK111";
        let redacted = redact_secrets(text);
        for leaked in ["RT123", "AT456", "CS789", "PK000", "AK111"] {
            assert!(!redacted.contains(leaked), "{} leaked in {}", leaked, redacted);
        }
        assert_eq!(
            redacted,
            "GET /x?refresh_token=[REDACTED]&access_token=[REDACTED] client_secret=[REDACTED] \
             private_key=[REDACTED] x-api-key=[REDACTED]"
        );
    }

    #[test]
    fn test_redact_leaves_plain_text() {
        assert_eq!(redact_secrets("Budget not found"), "Budget not found");
    }

    #[test]
    fn test_user_message_is_redacted() {
        let err = ApiError::Generic {
            status: 500,
            message: "upstream said token=deadbeef".to_string(),
            code: None,
        };
        assert_eq!(err.user_message(), "upstream said token=[REDACTED]");
    }

    #[test]
    fn test_outer_error_status() {
        let err = Error::from(ApiError::authentication("x"));
        assert_eq!(err.status(), 401);
        let err = Error::Transport(TransportFailure::Message("boom".to_string()));
        assert_eq!(err.status(), 0);
        assert!(err.as_api().is_none());
    }
}
