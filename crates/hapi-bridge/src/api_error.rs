//! HTTP API error taxonomy.
//!
//! Maps the hub's business and transport errors to the handful of
//! status codes and stable messages callers can rely on. Business
//! failures (not-found, version-mismatch, auth) are returned as typed
//! variants; unexpected internal errors are logged with full detail via
//! `tracing::error!` and reported to the caller as a sanitized phrase so
//! no secret or internal detail leaks through the response body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use hapi_core::error::StoreError;
use hapi_engine::coordinator::CoordinatorError;
use hapi_engine::rpc_client::RpcCallError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("namespace mismatch")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("{0}")]
    Conflict(String),

    #[error("coordinator not yet initialized")]
    ServiceUnavailable,

    #[error("{0}")]
    RemoteFailure(String),

    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    fn status_and_body(&self) -> (StatusCode, serde_json::Value) {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            ApiError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, json!({ "error": "unauthorized" }))
            }
            ApiError::Forbidden => (
                StatusCode::FORBIDDEN,
                json!({ "error": "namespace mismatch" }),
            ),
            ApiError::NotFound => (StatusCode::NOT_FOUND, json!({ "error": "not_found" })),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, json!({ "error": msg })),
            ApiError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "coordinator not yet initialized" }),
            ),
            ApiError::RemoteFailure(msg) => (StatusCode::BAD_GATEWAY, json!({ "error": msg })),
            ApiError::Internal(detail) => {
                tracing::error!(detail, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal error" }),
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = self.status_and_body();
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ApiError::NotFound,
            StoreError::AccessDenied => ApiError::Forbidden,
            StoreError::VersionMismatch { .. } | StoreError::Conflict(_) => {
                ApiError::Conflict(err.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::NotFound => ApiError::NotFound,
            CoordinatorError::AccessDenied => ApiError::Forbidden,
            CoordinatorError::NotAuthorized(_) => ApiError::Forbidden,
            CoordinatorError::MessageTooLarge(limit) => {
                ApiError::BadRequest(format!("message exceeds {limit} byte limit"))
            }
            CoordinatorError::HopLimitExceeded(limit) => {
                ApiError::BadRequest(format!("hop count exceeds limit of {limit}"))
            }
            CoordinatorError::Rpc(rpc) => rpc.into(),
            CoordinatorError::Store(store) => store.into(),
        }
    }
}

impl From<RpcCallError> for ApiError {
    fn from(err: RpcCallError) -> Self {
        match err {
            RpcCallError::NotRegistered(_) => {
                ApiError::RemoteFailure("RPC handler not registered".into())
            }
            RpcCallError::TimedOut(_) => ApiError::RemoteFailure("Beads command timed out".into()),
            RpcCallError::Disconnected => {
                ApiError::RemoteFailure("runner socket disconnected".into())
            }
            RpcCallError::RunnerError(msg) => ApiError::RemoteFailure(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn not_found_maps_to_404() {
        let response = ApiError::NotFound.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn internal_error_hides_detail_from_body() {
        let response = ApiError::Internal("sqlite disk full at /var/secret".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body_str = String::from_utf8(body.to_vec()).unwrap();
        assert!(!body_str.contains("sqlite"));
        assert!(body_str.contains("internal error"));
    }

    #[tokio::test]
    async fn store_not_found_converts_to_api_not_found() {
        let api_err: ApiError = StoreError::NotFound.into();
        assert!(matches!(api_err, ApiError::NotFound));
    }

    #[tokio::test]
    async fn rpc_not_registered_has_stable_message() {
        let api_err: ApiError = RpcCallError::NotRegistered("m".into()).into();
        let response = api_err.into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body_str = String::from_utf8(body.to_vec()).unwrap();
        assert!(body_str.contains("RPC handler not registered"));
    }
}
