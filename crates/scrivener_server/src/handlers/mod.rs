pub mod api;
pub mod ws;

pub use api::api_routes;
pub use ws::ws_handler;

use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use scrivener_core::ScrivenerError;

/// HTTP status for an error surfaced by a handler
pub fn error_status(err: &ScrivenerError) -> StatusCode {
    match err {
        ScrivenerError::MalformedOp(_) | ScrivenerError::StaleBase { .. } => {
            StatusCode::BAD_REQUEST
        }
        // Ownership is moving or storage is briefly down; the client retries shortly
        ScrivenerError::EmptyMembership => StatusCode::SERVICE_UNAVAILABLE,
        e if e.requires_reresolve() || e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn error_response(err: &ScrivenerError) -> Response {
    (error_status(err), Json(err.to_serializable())).into_response()
}

pub(crate) fn redirect_response(location: &str) -> Response {
    (
        StatusCode::TEMPORARY_REDIRECT,
        [(header::LOCATION, location.to_string())],
    )
        .into_response()
}
