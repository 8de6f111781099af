//! HTTP surface of the pipeline.

pub mod routes;
pub mod sse;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::kg::error::KgError;

pub use routes::build_router;

/// [`KgError`] rendered as `{"error": ..}` with a status per error class.
#[derive(Debug)]
pub struct ApiError(pub KgError);

impl From<KgError> for ApiError {
    fn from(err: KgError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            KgError::InvalidInput(_) | KgError::Serialization(_) => StatusCode::BAD_REQUEST,
            KgError::NotFound(_) => StatusCode::NOT_FOUND,
            e if e.is_connectivity() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
