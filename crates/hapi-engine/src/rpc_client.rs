//! The outbound half of runner RPC dispatch: given a socket id owning
//! a method (per [`crate::rpc_registry::RpcRegistry`]), actually issue
//! the call and await the ack.
//!
//! The engine only depends on this trait; `hapi-bridge` provides the
//! real implementation over its WebSocket transport (the
//! `socket.timeout(ms).emitWithAck(payload)` idiom from spec.md §6),
//! which keeps the engine free of any transport/socket dependency.

use std::time::Duration;

use async_trait::async_trait;

use crate::rpc_registry::SocketId;

#[derive(Debug, thiserror::Error)]
pub enum RpcCallError {
    #[error("no socket is registered for method `{0}`")]
    NotRegistered(String),
    #[error("RPC call timed out after {0:?}")]
    TimedOut(Duration),
    #[error("runner socket disconnected before responding")]
    Disconnected,
    #[error("runner returned an error: {0}")]
    RunnerError(String),
}

#[async_trait]
pub trait RunnerRpcClient: Send + Sync {
    async fn call(
        &self,
        socket: SocketId,
        method: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, RpcCallError>;
}
