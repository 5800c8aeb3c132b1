//! Upstream error shapes
//!
//! Providers report failures in different ways: a bare HTTP status, a JSON
//! object with a machine-readable `code`, or only a human-readable message
//! (in a `message`, `error` or `detail` field, or from the transport itself).
//! `UpstreamError` names each shape so the quota classifier can match them
//! exhaustively.

use serde_json::Value;

/// Longest raw body kept as a message when the body is not structured JSON.
const MAX_RAW_MESSAGE_LEN: usize = 512;

/// A failed upstream call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// Non-success HTTP response, with whatever code/message its body carried.
    #[error("upstream returned HTTP {status}: {}", .message.as_deref().unwrap_or("no message"))]
    Http {
        status: u16,
        code: Option<String>,
        message: Option<String>,
    },

    /// Error object carrying a machine-readable code.
    #[error("upstream error {code}: {}", .message.as_deref().unwrap_or("no message"))]
    Coded {
        code: String,
        message: Option<String>,
    },

    /// Error carrying only a message (including transport failures).
    #[error("{0}")]
    Message(String),
}

impl UpstreamError {
    /// Build an error from a non-success HTTP response.
    pub fn from_response(status: u16, body: &str) -> Self {
        let detail = match serde_json::from_str::<Value>(body) {
            Ok(value) => ErrorDetail::from_json(&value),
            Err(_) => ErrorDetail::from_raw(body),
        };
        UpstreamError::Http {
            status,
            code: detail.code,
            message: detail.message,
        }
    }

    /// Extract an error reported inside an otherwise successful (2xx) JSON body.
    ///
    /// Returns `None` when the body carries no non-null `error` field and no
    /// symbolic `code`. Numeric codes and `"ok"`/`"success"` are how several
    /// providers report success, so they never count as errors here.
    pub fn from_success_body(body: &Value) -> Option<Self> {
        let has_error = body.get("error").is_some_and(|e| !e.is_null())
            || body
                .get("code")
                .and_then(Value::as_str)
                .is_some_and(is_error_code);
        if !has_error {
            return None;
        }
        let detail = ErrorDetail::from_json(body);
        match (detail.code, detail.message) {
            (Some(code), message) => Some(UpstreamError::Coded { code, message }),
            (None, Some(message)) => Some(UpstreamError::Message(message)),
            (None, None) => None,
        }
    }

    /// HTTP status, when the error came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamError::Http { status, .. } => Some(*status),
            UpstreamError::Coded { .. } | UpstreamError::Message(_) => None,
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => UpstreamError::Http {
                status: status.as_u16(),
                code: None,
                message: Some(err.to_string()),
            },
            None => UpstreamError::Message(err.to_string()),
        }
    }
}

/// Code and message fields pulled out of an error body.
#[derive(Debug, Default)]
struct ErrorDetail {
    code: Option<String>,
    message: Option<String>,
}

impl ErrorDetail {
    /// Recognises `{"error": "..."}`, `{"error": {"message", "code"}}`,
    /// top-level `{"message", "code"}` and `{"detail": "..."}`.
    fn from_json(value: &Value) -> Self {
        let mut code = value.get("code").and_then(scalar_string);
        let mut messages = Vec::new();

        if let Some(message) = value.get("message").and_then(scalar_string) {
            messages.push(message);
        }
        match value.get("error") {
            Some(Value::Object(inner)) => {
                if code.is_none() {
                    code = inner
                        .get("code")
                        .and_then(scalar_string)
                        .or_else(|| inner.get("type").and_then(scalar_string));
                }
                if let Some(message) = inner.get("message").and_then(scalar_string) {
                    messages.push(message);
                }
            }
            Some(other) => {
                if let Some(message) = scalar_string(other) {
                    messages.push(message);
                }
            }
            None => {}
        }
        if let Some(detail) = value.get("detail").and_then(scalar_string) {
            messages.push(detail);
        }

        let message = if messages.is_empty() {
            None
        } else {
            Some(messages.join(": "))
        };
        Self { code, message }
    }

    fn from_raw(body: &str) -> Self {
        let trimmed = body.trim();
        let message = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.chars().take(MAX_RAW_MESSAGE_LEN).collect())
        };
        Self {
            code: None,
            message,
        }
    }
}

fn is_error_code(code: &str) -> bool {
    !code.is_empty()
        && code.parse::<i64>().is_err()
        && !code.eq_ignore_ascii_case("ok")
        && !code.eq_ignore_ascii_case("success")
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
