use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::warn;

use crate::extractor::ExtractorError;

#[derive(Debug, Serialize)]
struct ErrorBody {
    ok: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>, code: Option<&'static str>) -> Self {
        Self {
            status,
            message: message.into(),
            code,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message, None)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message, Some("NOT_FOUND"))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message, Some("NOT_READY"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message, None)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message, Some("BUSY"))
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message, Some("BAD_METADATA"))
    }

    pub fn gateway_timeout(message: impl Into<String>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, message, Some("TIMEOUT"))
    }
}

impl From<ExtractorError> for ApiError {
    fn from(error: ExtractorError) -> Self {
        match &error {
            ExtractorError::NotInstalled { .. } | ExtractorError::Io(_) => {
                warn!("extractor unavailable: {error}");
                Self::internal(error.to_string())
            }
            ExtractorError::TimedOut { .. } => Self::gateway_timeout(error.to_string()),
            ExtractorError::InvalidMetadata(_) => Self::bad_gateway(error.to_string()),
            ExtractorError::MissingOutput => Self::internal(error.to_string()),
            ExtractorError::Failed { .. } | ExtractorError::TooLarge { .. } => {
                Self::new(StatusCode::BAD_REQUEST, error.to_string(), Some("EXTRACTION_FAILED"))
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            ok: false,
            error: self.message,
            code: self.code,
        });

        (self.status, body).into_response()
    }
}
