//! Bearer-token + namespace authentication middleware for the HAPI HTTP
//! API.
//!
//! Every request must carry `Authorization: Bearer <token>[:<namespace>]`.
//! The base token is compared in constant time against the hub's
//! configured CLI API token (`hapi_harness::token::verify_header`); the
//! resolved namespace is stashed in request extensions for handlers to
//! read via [`Namespace`].

use axum::{
    body::Body,
    extract::FromRequestParts,
    http::{request::Parts, Request, Response, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

use hapi_harness::token::verify_header;

/// The namespace resolved from a request's bearer token, injected into
/// request extensions by [`AuthLayer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace(pub String);

impl<S> FromRequestParts<S> for Namespace
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Namespace>()
            .cloned()
            .ok_or((StatusCode::UNAUTHORIZED, "missing namespace"))
    }
}

// ---------------------------------------------------------------------------
// AuthLayer
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AuthLayer {
    cli_api_token: Arc<String>,
}

impl AuthLayer {
    pub fn new(cli_api_token: String) -> Self {
        Self {
            cli_api_token: Arc::new(cli_api_token),
        }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware {
            inner,
            cli_api_token: self.cli_api_token.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// AuthMiddleware
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    cli_api_token: Arc<String>,
}

impl<S> Service<Request<Body>> for AuthMiddleware<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let cli_api_token = self.cli_api_token.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let header_value = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok());

            match verify_header(header_value, &cli_api_token) {
                Ok(parsed) => {
                    req.extensions_mut().insert(Namespace(parsed.namespace));
                    inner.call(req).await
                }
                Err(err) => {
                    tracing::warn!(%err, "rejecting unauthenticated request");
                    let resp = (
                        StatusCode::UNAUTHORIZED,
                        axum::Json(serde_json::json!({"error": "unauthorized"})),
                    )
                        .into_response();
                    Ok(resp)
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn test_router(token: &str) -> Router {
        Router::new()
            .route(
                "/ping",
                get(|ns: Namespace| async move { ns.0 }),
            )
            .layer(AuthLayer::new(token.to_string()))
    }

    #[tokio::test]
    async fn valid_bearer_without_namespace_defaults() {
        let app = test_router("secret");
        let req = Request::builder()
            .uri("/ping")
            .header("Authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"default");
    }

    #[tokio::test]
    async fn valid_bearer_with_namespace_suffix() {
        let app = test_router("secret");
        let req = Request::builder()
            .uri("/ping")
            .header("Authorization", "Bearer secret:acme")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"acme");
    }

    #[tokio::test]
    async fn missing_header_returns_401() {
        let app = test_router("secret");
        let req = Request::builder().uri("/ping").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_token_returns_401() {
        let app = test_router("secret");
        let req = Request::builder()
            .uri("/ping")
            .header("Authorization", "Bearer wrong")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
