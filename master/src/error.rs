//! Error taxonomy for the master (§7).
//!
//! `ApiError` is returned from the operator-facing REST/WebSocket surface;
//! `RpcError` is returned from the inbound worker→master RPC surface. Both
//! carry a machine-readable code and a human message and implement
//! `axum::response::IntoResponse`, the shape of the teacher's
//! `server/src/api.rs::ApiError`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Errors surfaced on the operator-facing HTTP/WebSocket API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::NotFound(_) => "not_found",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Internal(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        if let Some(e) = e.downcast_ref::<shared::SchedulerError>() {
            return ApiError::from(e);
        }
        ApiError::Internal(e.to_string())
    }
}

impl From<&shared::SchedulerError> for ApiError {
    fn from(e: &shared::SchedulerError) -> Self {
        match e {
            shared::SchedulerError::Validation(m) => ApiError::Validation(m.clone()),
            shared::SchedulerError::NotFound(m) => ApiError::NotFound(m.clone()),
            shared::SchedulerError::Unauthorized(m) => ApiError::Unauthorized(m.clone()),
            shared::SchedulerError::InsufficientResources(m) => ApiError::Validation(m.clone()),
            shared::SchedulerError::Config(m)
            | shared::SchedulerError::Database(m)
            | shared::SchedulerError::Rpc(m) => ApiError::Internal(m.clone()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "status": "error",
            "data": null,
            "error": self.to_string(),
            "code": self.code(),
        }));
        (status, body).into_response()
    }
}

/// Errors surfaced on the worker→master RPC surface (§6, §7: `RPCTransient`,
/// `NotFound`, `Unauthorized`).
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected: {0}")]
    Rejected(String),
}

impl RpcError {
    fn status(&self) -> StatusCode {
        match self {
            RpcError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            RpcError::NotFound(_) => StatusCode::NOT_FOUND,
            RpcError::Rejected(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_status_codes_match_taxonomy() {
        assert_eq!(ApiError::Validation("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::Unauthorized("x".into()).status(), StatusCode::UNAUTHORIZED);
    }
}
