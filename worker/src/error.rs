//! Error taxonomy for the worker's inbound RPC surface (§7), the
//! `master::error::RpcError` counterpart on the worker side.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RpcError {
    fn status(&self) -> StatusCode {
        match self {
            RpcError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            RpcError::NotFound(_) => StatusCode::NOT_FOUND,
            RpcError::Rejected(_) => StatusCode::BAD_REQUEST,
            RpcError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for RpcError {
    fn from(e: anyhow::Error) -> Self {
        RpcError::Internal(e.to_string())
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
    fn status_codes_match_taxonomy() {
        assert_eq!(RpcError::Unauthorized("x".into()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(RpcError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(RpcError::Rejected("x".into()).status(), StatusCode::BAD_REQUEST);
    }
}
