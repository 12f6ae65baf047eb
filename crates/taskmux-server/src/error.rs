use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use libtaskmux::MuxError;
use taskmux_protocol::api::ErrorBody;

/// `MuxError` rendered as a status code plus `{code, message}`.
#[derive(Debug)]
pub struct ApiError(pub MuxError);

impl From<MuxError> for ApiError {
    fn from(err: MuxError) -> Self {
        ApiError(err)
    }
}

pub fn status_for(err: &MuxError) -> StatusCode {
    match err {
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        MuxError::Conflict(_) => StatusCode::CONFLICT,
        MuxError::InvalidInput(_) | MuxError::Json(_) => StatusCode::BAD_REQUEST,
        MuxError::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        MuxError::Spawn(_) => StatusCode::BAD_GATEWAY,
        MuxError::TimeoutExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(code = self.0.code(), error = %self.0, "request failed");
        }
        let body = ErrorBody {
            code: self.0.code().to_string(),
            message: self.0.public_message(),
        };
        (status, Json(body)).into_response()
    }
}
