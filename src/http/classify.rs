//! Maps raw transport failures onto the typed error taxonomy.

use serde_json::Value;

use super::retry::RetryPolicy;
use super::transport::TransportFailure;
use crate::error::{
    ApiError, AUTH_REQUIRED_CODE, CONFLICT_CODE, Error, FORBIDDEN_CODE, FieldErrors,
    NOT_FOUND_CODE, SERVER_ERROR_CODE, VALIDATION_CODE,
};

/// Longest body excerpt used as a message when the body is not JSON.
pub const MAX_EXCERPT_CHARS: usize = 500;

const MESSAGE_FIELDS: [&str; 4] = ["message", "error", "detail", "msg"];

/// Classifies a raw failure.
///
/// A status, when present, is authoritative. Message-only failures become
/// [`ApiError::Network`] only when they match a retryable phrase of `policy`;
/// anything else is returned unmodified as [`Error::Transport`].
pub fn classify(failure: TransportFailure, policy: &RetryPolicy) -> Error {
    match failure {
        TransportFailure::Status {
            status,
            status_text,
            body,
        } => Error::Api(classify_status(status, &status_text, &body)),
        TransportFailure::Message(message) => {
            if policy.is_retryable_message(&message) {
                Error::Api(ApiError::network(message))
            } else {
                Error::Transport(TransportFailure::Message(message))
            }
        }
    }
}

/// Builds the typed error for a non-2xx response.
pub fn classify_status(status: u16, status_text: &str, body: &str) -> ApiError {
    let parsed = serde_json::from_str::<Value>(body).ok();

    let message = parsed
        .as_ref()
        .and_then(extract_message)
        .unwrap_or_else(|| fallback_message(status, status_text, body, parsed.is_some()));
    let code = parsed.as_ref().and_then(extract_code);

    match status {
        400 => ApiError::Validation {
            message,
            code: code.unwrap_or_else(|| VALIDATION_CODE.to_string()),
            details: parsed.as_ref().and_then(extract_details),
        },
        401 => ApiError::Authentication {
            message,
            code: code.unwrap_or_else(|| AUTH_REQUIRED_CODE.to_string()),
        },
        403 => ApiError::Forbidden {
            message,
            code: code.unwrap_or_else(|| FORBIDDEN_CODE.to_string()),
        },
        404 => ApiError::NotFound {
            message,
            code: code.unwrap_or_else(|| NOT_FOUND_CODE.to_string()),
        },
        409 => ApiError::Conflict {
            message,
            code: code.unwrap_or_else(|| CONFLICT_CODE.to_string()),
        },
        500 | 502 | 503 | 504 => ApiError::Server {
            status,
            message,
            code: code.unwrap_or_else(|| SERVER_ERROR_CODE.to_string()),
        },
        _ => ApiError::Generic {
            status,
            message,
            code,
        },
    }
}

/// Extracts a human-readable message from a JSON body.
///
/// Tries `message`, `error`, `detail` and `msg` in that order, descending
/// into nested objects such as `{"error": {"message": ...}}`. A bare string
/// body is its own message.
pub fn extract_message(body: &Value) -> Option<String> {
    match body {
        Value::String(s) => non_empty(s),
        Value::Object(map) => MESSAGE_FIELDS.iter().find_map(|field| match map.get(*field) {
            Some(Value::String(s)) => non_empty(s),
            Some(nested @ Value::Object(_)) => extract_message(nested),
            _ => None,
        }),
        _ => None,
    }
}

/// Machine-readable `code` from the body; numeric codes are stringified.
pub fn extract_code(body: &Value) -> Option<String> {
    let code = match body {
        Value::Object(map) => map.get("code").or_else(|| {
            map.get("error")
                .and_then(Value::as_object)
                .and_then(|e| e.get("code"))
        }),
        _ => None,
    }?;

    match code {
        Value::String(s) => non_empty(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Field-level validation messages from `details` or `errors`.
///
/// Accepts `{"field": "msg"}` and `{"field": ["msg", ...]}` maps, and arrays
/// of `{"field"|"path": .., "message"|"msg": ..}` entries.
pub fn extract_details(body: &Value) -> Option<FieldErrors> {
    let map = body.as_object()?;
    let raw = map.get("details").or_else(|| map.get("errors"))?;

    let mut details = FieldErrors::new();
    match raw {
        Value::Object(fields) => {
            for (field, value) in fields {
                if let Some(message) = field_message(value) {
                    details.insert(field.clone(), message);
                }
            }
        }
        Value::Array(entries) => {
            for entry in entries {
                let field = entry
                    .get("field")
                    .or_else(|| entry.get("path"))
                    .and_then(Value::as_str);
                let message = entry
                    .get("message")
                    .or_else(|| entry.get("msg"))
                    .and_then(Value::as_str);
                if let (Some(field), Some(message)) = (field, message) {
                    details.insert(field.to_string(), message.to_string());
                }
            }
        }
        _ => return None,
    }

    if details.is_empty() {
        None
    } else {
        Some(details)
    }
}

fn field_message(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let parts: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("; "))
            }
        }
        _ => None,
    }
}

fn fallback_message(status: u16, status_text: &str, body: &str, parsed: bool) -> String {
    let text = body.trim();
    if !parsed && !text.is_empty() {
        return text.chars().take(MAX_EXCERPT_CHARS).collect();
    }
    format!("{} {}", status, status_text).trim().to_string()
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}
