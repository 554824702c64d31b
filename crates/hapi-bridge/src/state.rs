//! Shared application state injected into every HTTP/WS handler.

use std::sync::Arc;

use hapi_core::store::Store;
use hapi_engine::bead_service::BeadService;
use hapi_engine::coordinator::Coordinator;
use hapi_engine::event_publisher::EventPublisher;
use hapi_engine::rpc_registry::RpcRegistry;
use hapi_engine::session_cache::SessionCache;
use hapi_harness::rate_limiter::MultiKeyRateLimiter;

use crate::ws_transport::WsRpcClient;

/// The hub's root object set, injected explicitly into handlers rather
/// than reached for as module-level singletons.
pub struct AppState {
    pub store: Arc<Store>,
    pub registry: Arc<RpcRegistry>,
    pub session_cache: Arc<SessionCache>,
    pub publisher: Arc<EventPublisher>,
    pub bead_service: Arc<BeadService>,
    pub coordinator: Arc<Coordinator>,
    pub ws_client: Arc<WsRpcClient>,
    pub rate_limiter: Arc<MultiKeyRateLimiter>,
    pub protocol_version: &'static str,
}

impl AppState {
    pub fn new(store: Arc<Store>, rate_limiter: Arc<MultiKeyRateLimiter>) -> Self {
        Self {
            store,
            registry: Arc::new(RpcRegistry::new()),
            session_cache: Arc::new(SessionCache::new()),
            publisher: Arc::new(EventPublisher::new()),
            bead_service: Arc::new(BeadService::new()),
            coordinator: Arc::new(Coordinator::new()),
            ws_client: Arc::new(WsRpcClient::new()),
            rate_limiter,
            protocol_version: "3",
        }
    }
}
