//! HTTP/WebSocket facade for the hub: exposes the engine's
//! coordinator, registry, and caches over an axum router.
//!
//! Key modules:
//! - [`routes`] — session/machine/team/preference HTTP handlers and SSE
//! - [`ws_transport`] — the `/cli` runner socket transport
//! - [`auth`] — bearer-token + namespace authentication middleware
//! - [`rate_limit_middleware`] — global/namespace/route rate limiting
//! - [`state`] — the root `AppState` injected into every handler
//! - [`api_error`] — HTTP error taxonomy

pub mod api_error;
pub mod auth;
pub mod rate_limit_middleware;
pub mod routes;
pub mod state;
pub mod ws_transport;

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::middleware::from_fn;
use axum::Router;
use tower_http::trace::TraceLayer;

use auth::AuthLayer;
use rate_limit_middleware::RateLimitLayer;
use state::AppState;

/// Assembles the full router. Layer order matters: `RateLimitLayer`
/// sits innermost so it can read the `Namespace` `AuthLayer` attaches;
/// `SetResponseHeaderLayer` wraps both so the protocol-version header
/// lands on every response, including 401s and 429s the inner layers
/// short-circuit; the telemetry middlewares and `TraceLayer` wrap
/// everything so they see the whole request, success or failure.
pub fn app(state: Arc<AppState>, cli_api_token: String) -> Router {
    let protocol_version = HeaderValue::from_static(state.protocol_version);

    routes::router(state.clone())
        .layer(RateLimitLayer::new(state.rate_limiter.clone()))
        .layer(AuthLayer::new(cli_api_token))
        .layer(tower_http::set_header::SetResponseHeaderLayer::if_not_present(
            axum::http::HeaderName::from_static("x-hapi-protocol-version"),
            protocol_version,
        ))
        .layer(from_fn(hapi_telemetry::middleware::metrics_middleware))
        .layer(from_fn(hapi_telemetry::tracing_setup::request_id_middleware))
        .layer(TraceLayer::new_for_http())
}
