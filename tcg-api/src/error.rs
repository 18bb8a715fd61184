//! Maps `CoreError` onto HTTP status codes and the `{message}` body shape.
//! Validation kinds become 400; anything else is an infrastructure failure
//! that should never reach a request handler under normal operation, so it
//! becomes 500.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tcg_common::CoreError;

use crate::dto::ErrorBody;

pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_validation_error() {
            StatusCode::BAD_REQUEST
        } else {
            tracing::error!(error = %self.0, "unhandled infrastructure error reached the HTTP boundary");
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, Json(ErrorBody { message: self.0.to_string() })).into_response()
    }
}
