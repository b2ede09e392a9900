use std::fmt;

use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;

use crate::sanitize::{self, FieldKind, ValidationError};

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

const SERVICE_UNAVAILABLE_MESSAGE: &str = "Service unavailable. Please try again later.";

/// Policy class of a failure. The executor decides retries from this alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum ErrorClass {
    /// 401/403: the credential is missing, expired, or rejected
    Unauthenticated,
    /// Any other 4xx: the request itself is wrong
    ClientError,
    /// 408, 409, 429
    RetryableClientError,
    /// 5xx, timeouts, connection failures
    ServerOrNetworkError,
    Unknown,
}

/// A failure as observed at the HTTP boundary, before classification.
#[derive(Debug)]
pub enum UpstreamFailure {
    Status {
        status: StatusCode,
        message: Option<String>,
    },
    Timeout,
    Connect(String),
    Decode(String),
    Other(String),
}

impl UpstreamFailure {
    /// Build a status failure from a non-success response body.
    ///
    /// This is the only place upstream error bodies are inspected.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        UpstreamFailure::Status {
            status,
            message: extract_message(body),
        }
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            UpstreamFailure::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn message(&self) -> Option<&str> {
        match self {
            UpstreamFailure::Status { message, .. } => message.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamFailure::Status { status, message } => match message {
                Some(message) => write!(f, "status {}: {}", status, message),
                None => write!(f, "status {}", status),
            },
            UpstreamFailure::Timeout => f.write_str("request timed out"),
            UpstreamFailure::Connect(e) => write!(f, "connection failed: {}", e),
            UpstreamFailure::Decode(e) => write!(f, "invalid response body: {}", e),
            UpstreamFailure::Other(e) => write!(f, "request failed: {}", e),
        }
    }
}

impl From<reqwest::Error> for UpstreamFailure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamFailure::Timeout
        } else if err.is_connect() {
            UpstreamFailure::Connect(err.to_string())
        } else if err.is_decode() {
            UpstreamFailure::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            UpstreamFailure::Status {
                status,
                message: None,
            }
        } else {
            UpstreamFailure::Other(err.to_string())
        }
    }
}

/// Map a failure to exactly one [`ErrorClass`].
pub fn classify(failure: &UpstreamFailure) -> ErrorClass {
    match failure {
        UpstreamFailure::Status { status, .. } => match status.as_u16() {
            401 | 403 => ErrorClass::Unauthenticated,
            408 | 409 | 429 => ErrorClass::RetryableClientError,
            400..=499 => ErrorClass::ClientError,
            500..=599 => ErrorClass::ServerOrNetworkError,
            _ => ErrorClass::Unknown,
        },
        UpstreamFailure::Timeout | UpstreamFailure::Connect(_) => ErrorClass::ServerOrNetworkError,
        UpstreamFailure::Decode(_) | UpstreamFailure::Other(_) => ErrorClass::Unknown,
    }
}

/// A field that failed input validation, with the rule it broke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: FieldKind,
    pub error: ValidationError,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field.label(), self.error)
    }
}

fn describe_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid credential issuance: {0}")]
    InvalidIssuance(String),

    #[error("Unauthenticated - session is missing, expired, or was rejected")]
    Unauthenticated,

    #[error("Request rejected ({status}): {message}")]
    ClientError { status: u16, message: String },

    #[error("Request conflicted or was throttled ({status}): {message}")]
    RetryableClientError { status: u16, message: String },

    #[error("Service unavailable: {0}")]
    ServerOrNetworkError(String),

    #[error("Unexpected upstream failure: {0}")]
    Unknown(String),

    #[error("Invalid input: {}", describe_violations(.0))]
    InputRejected(Vec<FieldViolation>),

    #[error("Request cancelled")]
    Cancelled,
}

impl ApiError {
    /// Build the surfaced error for a classified failure.
    ///
    /// Upstream messages are stripped of markup and truncated here, so
    /// nothing downstream ever holds raw upstream text.
    pub fn from_failure(class: ErrorClass, failure: UpstreamFailure) -> Self {
        let status = failure.status_code().map(|s| s.as_u16()).unwrap_or_default();
        let message = failure
            .message()
            .map(|m| truncate_body(&sanitize::strip_markup(m)))
            .unwrap_or_default();

        match class {
            ErrorClass::Unauthenticated => ApiError::Unauthenticated,
            ErrorClass::ClientError => ApiError::ClientError { status, message },
            ErrorClass::RetryableClientError => ApiError::RetryableClientError { status, message },
            ErrorClass::ServerOrNetworkError => ApiError::ServerOrNetworkError(failure.to_string()),
            ErrorClass::Unknown => ApiError::Unknown(failure.to_string()),
        }
    }

    /// Project back onto the policy classes. Local-only errors have none.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            ApiError::Unauthenticated => Some(ErrorClass::Unauthenticated),
            ApiError::ClientError { .. } => Some(ErrorClass::ClientError),
            ApiError::RetryableClientError { .. } => Some(ErrorClass::RetryableClientError),
            ApiError::ServerOrNetworkError(_) => Some(ErrorClass::ServerOrNetworkError),
            ApiError::Unknown(_) => Some(ErrorClass::Unknown),
            ApiError::InvalidIssuance(_) | ApiError::InputRejected(_) | ApiError::Cancelled => None,
        }
    }

    /// Text that is safe to show an end user.
    ///
    /// Transport details are never included; client errors carry the
    /// (already sanitized) upstream message when there is one.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::InvalidIssuance(_) => "Sign-in failed. Please try again.".to_string(),
            ApiError::Unauthenticated => "Your session has expired. Please sign in again.".to_string(),
            ApiError::ClientError { message, .. } | ApiError::RetryableClientError { message, .. } => {
                if message.trim().is_empty() {
                    "The request could not be completed.".to_string()
                } else {
                    message.clone()
                }
            }
            ApiError::ServerOrNetworkError(_) => SERVICE_UNAVAILABLE_MESSAGE.to_string(),
            ApiError::Unknown(_) => "Something went wrong. Please try again.".to_string(),
            ApiError::InputRejected(violations) => describe_violations(violations),
            ApiError::Cancelled => "Request cancelled.".to_string(),
        }
    }
}

/// Pull a human-readable message out of an error body.
///
/// Understands `{"detail": ...}` (string, or a list of `{"msg": ...}`),
/// `{"error": ...}` (string or `{"message": ...}`) and `{"message": ...}`;
/// falls back to the raw body text.
fn extract_message(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }

    let Ok(json) = serde_json::from_str::<serde_json::Value>(body) else {
        return Some(body.to_string());
    };

    let from_detail = json.get("detail").and_then(|detail| match detail {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(items) => {
            let messages: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("msg").and_then(|m| m.as_str()))
                .collect();
            (!messages.is_empty()).then(|| messages.join("; "))
        }
        _ => None,
    });

    let from_error = || {
        json.get("error").and_then(|error| match error {
            serde_json::Value::String(s) => Some(s.clone()),
            other => other.get("message").and_then(|m| m.as_str()).map(String::from),
        })
    };

    let from_message = || json.get("message").and_then(|m| m.as_str()).map(String::from);

    from_detail
        .or_else(from_error)
        .or_else(from_message)
        .filter(|m| !m.trim().is_empty())
}

/// Truncate a response body to avoid logging excessive data
fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        body.to_string()
    } else {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }
}
