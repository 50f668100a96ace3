//! The gateway's typed error surface and its HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("missing bearer token")]
    AuthMissing,

    #[error("invalid credentials")]
    AuthInvalid,

    #[error("no group configured for model \"{0}\"")]
    ModelNotFound(String),

    #[error("group \"{group}\" speaks protocol {expected} but request used {actual}")]
    ProtocolMismatch {
        group: String,
        expected: String,
        actual: String,
    },

    #[error("upstream \"{provider}\" returned status {status}")]
    UpstreamStatusError { provider: String, status: u16 },

    #[error("upstream \"{provider}\" transport error: {message}")]
    UpstreamTransportError { provider: String, message: String },

    #[error("upstream \"{provider}\" stream error: {message}")]
    UpstreamStreamError { provider: String, message: String },

    #[error("all candidate providers failed")]
    AllUpstreamsFailed { last_error: Option<String> },

    #[error("request body exceeds the 10MB limit")]
    BodyTooLarge,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::AuthMissing | GatewayError::AuthInvalid => StatusCode::UNAUTHORIZED,
            GatewayError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::ProtocolMismatch { .. } => StatusCode::BAD_REQUEST,
            GatewayError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::UpstreamStatusError { .. }
            | GatewayError::UpstreamTransportError { .. }
            | GatewayError::UpstreamStreamError { .. }
            | GatewayError::AllUpstreamsFailed { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match status {
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => {
                tracing::error!(error = %self, "request failed");
            }
            _ => {
                tracing::warn!(error = %self, "request rejected");
            }
        }
        let body = match &self {
            GatewayError::AllUpstreamsFailed { last_error } => {
                json!({ "error": "All providers failed", "last_error": last_error })
            }
            _ => json!({ "error": { "message": self.to_string() } }),
        };
        (status, axum::Json(body)).into_response()
    }
}
