//! Error kinds for the tile pipeline and the HTTP boundary that turns
//! them into responses. CPU stages propagate errors unchanged;
//! I/O stages retry locally and promote to [`BackendError`] (see
//! `tile_store.rs`). Responses never leak backend table names or keys.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Bad tile coordinates, unsupported projection for the route, unknown
/// `bin` mode, missing required parameter.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Unrecoverable store/search failure after retries.
#[derive(Debug, thiserror::Error)]
#[error("{context}")]
pub struct BackendError {
    pub context: String,
}

impl BackendError {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
        }
    }
}

/// Corrupt stored tile. Callers should log the offending `(table, key)`
/// themselves before propagating; the error type carries only the parse
/// failure to avoid leaking storage coordinates into the error chain.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct CodecError(pub String);

impl CodecError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Missing table name, no metastore, unknown projection/scheme at startup
/// or in a request.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ConfigurationError(pub String);

impl ConfigurationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A request exceeded its wall-clock budget (default 30s).
#[derive(Debug, thiserror::Error)]
#[error("request timed out")]
pub struct TimeoutError;

/// Internal-only: the binning engine saw zero input features. Never
/// surfaces past the Assembler, which detects empty input and returns the
/// empty tile instead.
#[derive(Debug, thiserror::Error)]
#[error("no data to bin")]
pub struct NoDataError;

/// The single error type handlers return; converts any of the above via
/// `From` impls below.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "BACKEND_ERROR", message)
    }

    pub fn gateway_timeout(message: impl Into<String>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", message)
    }
}

#[derive(Serialize)]
struct ApiErrorBody<'a> {
    code: &'a str,
    message: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            code: self.code,
            message: &self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::bad_request(e.0)
    }
}

impl From<BackendError> for ApiError {
    fn from(e: BackendError) -> Self {
        tracing::error!("backend failure: {}", e.context);
        ApiError::service_unavailable("Backend temporarily unavailable")
    }
}

impl From<CodecError> for ApiError {
    fn from(e: CodecError) -> Self {
        tracing::error!("codec failure: {}", e.0);
        ApiError::internal("Stored tile could not be decoded")
    }
}

impl From<ConfigurationError> for ApiError {
    fn from(e: ConfigurationError) -> Self {
        tracing::error!("configuration failure: {}", e.0);
        ApiError::internal("Service misconfigured")
    }
}

impl From<TimeoutError> for ApiError {
    fn from(_: TimeoutError) -> Self {
        ApiError::gateway_timeout("Request timed out")
    }
}
