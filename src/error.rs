use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Errors surfaced to gateway clients.
///
/// Per-candidate failures never appear here; the proxy recovers from them by
/// advancing to the next candidate.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{message}")]
    InvalidRequest {
        message: String,
        param: Option<&'static str>,
        code: &'static str,
    },

    #[error("authorization header is missing or is not a bearer token")]
    MissingCredential,

    #[error("invalid API key")]
    InvalidCredential,

    #[error("model '{0}' is not served by any known node")]
    ModelNotFound(String),

    #[error("request body too large")]
    PayloadTooLarge,

    #[error("no node for model '{model}' is currently reachable ({attempted} candidate(s) tried)")]
    Unavailable { model: String, attempted: usize },
}

impl GatewayError {
    pub fn invalid_request(message: impl Into<String>, code: &'static str) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            param: None,
            code,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::MissingCredential => StatusCode::UNAUTHORIZED,
            Self::InvalidCredential => StatusCode::FORBIDDEN,
            Self::ModelNotFound(_) => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } | Self::PayloadTooLarge | Self::ModelNotFound(_) => {
                "invalid_request_error"
            }
            Self::MissingCredential | Self::InvalidCredential => "authentication_error",
            Self::Unavailable { .. } => "server_error",
        }
    }

    fn param(&self) -> Option<&'static str> {
        match self {
            Self::InvalidRequest { param, .. } => *param,
            Self::ModelNotFound(_) | Self::Unavailable { .. } => Some("model"),
            _ => None,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest { code, .. } => *code,
            Self::MissingCredential => "missing_api_key",
            Self::InvalidCredential => "invalid_api_key",
            Self::ModelNotFound(_) => "model_not_found",
            Self::PayloadTooLarge => "request_too_large",
            Self::Unavailable { .. } => "no_available_candidates",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        openai_error_response(
            self.status(),
            self.error_type(),
            &self.to_string(),
            self.param(),
            Some(self.code()),
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenAiErrorResponse {
    pub error: OpenAiError,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenAiError {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

pub fn openai_error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    param: Option<&str>,
    code: Option<&str>,
) -> Response {
    let body = OpenAiErrorResponse {
        error: OpenAiError {
            message: message.to_string(),
            error_type: error_type.to_string(),
            param: param.map(ToString::to_string),
            code: code.map(ToString::to_string),
        },
    };
    (status, Json(body)).into_response()
}
