//! Mapping from queue errors to HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

use docconv_core::Error;

/// Error returned by every handler.
///
/// Renders as `{"error": <message>, "kind": <taxonomy name>}`.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Validation(_) | Error::UnsupportedType(_) | Error::InvalidState(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Unavailable(_) | Error::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(
                subsystem = "api",
                kind = self.0.kind(),
                error = %self.0,
                "Request failed"
            );
        }

        let body = Json(serde_json::json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        }));

        (status, body).into_response()
    }
}
