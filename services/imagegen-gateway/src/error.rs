//! Request-level error types and their HTTP responses
//!
//! Every failure is returned as
//! `{"error":{"type":"...","message":"...","request_id":"req_..."}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use provider::ProviderId;
use thiserror::Error;
use token_pool::RotationError;

use crate::upstream::CallSite;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{provider} has no {} endpoint configured", .site.as_str())]
    Unsupported { provider: ProviderId, site: CallSite },

    #[error(transparent)]
    Rotation(#[from] RotationError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) | ApiError::Unsupported { .. } => StatusCode::BAD_REQUEST,
            ApiError::Rotation(RotationError::NoTokensConfigured { .. }) => StatusCode::UNAUTHORIZED,
            ApiError::Rotation(RotationError::AllTokensExhausted { .. })
            | ApiError::Rotation(RotationError::MaxAttemptsReached { .. }) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ApiError::Rotation(RotationError::Upstream { source, .. }) => source
                .status()
                .filter(|s| (400..=599).contains(s))
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY),
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::Unsupported { .. } => "provider_unsupported",
            ApiError::Rotation(RotationError::NoTokensConfigured { .. }) => "no_tokens_configured",
            ApiError::Rotation(RotationError::AllTokensExhausted { .. }) => "tokens_exhausted",
            ApiError::Rotation(RotationError::Upstream { .. }) => "upstream_error",
            ApiError::Rotation(RotationError::MaxAttemptsReached { .. }) => "max_attempts_reached",
        }
    }

    pub fn to_response(&self, request_id: &str) -> Response {
        let mut body = serde_json::json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
                "request_id": request_id,
            }
        });
        if let ApiError::Rotation(RotationError::Upstream {
            all_exhausted: true,
            ..
        }) = self
        {
            body["error"]["tokens_exhausted"] = serde_json::Value::Bool(true);
        }
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
