//! The runner-facing WebSocket transport: implements
//! [`RunnerRpcClient`] over real sockets, and dispatches inbound
//! frames (registrations, heartbeats, RPC acks, permission requests
//! and their resolutions) to the engine's registry/cache/coordinator.
//!
//! Grounded on `at-bridge/src/transport.rs`'s socket-map-plus-pending-
//! calls shape, replacing its bespoke event names with a single
//! `{id, method, payload}` / `{id, result}` envelope mirroring
//! `socket.timeout(ms).emitWithAck` from spec.md §6.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use hapi_core::error::StoreError;
use hapi_core::store::Store;
use hapi_core::types::PermissionResolution;
use hapi_engine::coordinator::Coordinator;
use hapi_engine::event_publisher::EventPublisher;
use hapi_engine::rpc_client::{RpcCallError, RunnerRpcClient};
use hapi_engine::rpc_registry::{RegisterOutcome, RpcRegistry, SocketId};
use hapi_engine::session_cache::SessionCache;
use hapi_types::rpc::{PermissionPromptRequest, PermissionResolutionRequest};

/// Outbound call envelope, sent to the socket that owns `method`.
#[derive(Debug, Serialize)]
struct OutboundCall {
    #[serde(rename = "type")]
    kind: &'static str,
    id: Uuid,
    method: String,
    payload: Value,
}

/// Inbound frames a runner socket may send. Untagged variants are
/// tried in order; `#[serde(tag = "type")]` keeps dispatch a single
/// match rather than a chain of `if let Ok(..) = serde_json::from...`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundFrame {
    Register { method: String },
    Unregister { method: String },
    Ack { id: Uuid, #[serde(default)] result: Option<Value>, #[serde(default)] error: Option<String> },
    SessionAlive {
        session_id: Uuid,
        namespace: String,
        thinking: bool,
        #[serde(default)]
        thinking_activity: Option<String>,
    },
    SessionEnd { session_id: Uuid, namespace: String },
    PermissionResolution(PermissionResolutionRequest),
    /// A runner reports a tool call that its current permission mode
    /// does not auto-approve. The hub records the pending request and
    /// pushes a [`PermissionPromptRequest`] back down this same socket
    /// for the holder of the call to resolve.
    RequestPermission {
        session_id: Uuid,
        namespace: String,
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    /// A cancellation signal on a tool call aborts its pending prompt.
    CancelPermissionRequest { session_id: Uuid, tool_call_id: String },
}

/// Outbound wrapper adding the envelope's `type` tag to a
/// [`PermissionPromptRequest`] before it's written to the socket.
#[derive(Debug, Serialize)]
struct OutboundPermissionPrompt {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    prompt: PermissionPromptRequest,
}

struct PendingCall {
    sender: oneshot::Sender<Result<Value, RpcCallError>>,
}

/// Implements [`RunnerRpcClient`] by writing a framed call to the
/// owning socket's outbound channel and awaiting its `Ack` via a
/// correlation-id-keyed oneshot, bounded by the caller's timeout.
#[derive(Default)]
pub struct WsRpcClient {
    connections: DashMap<SocketId, mpsc::UnboundedSender<Message>>,
    pending: DashMap<Uuid, PendingCall>,
}

impl WsRpcClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a socket's outbound sender so calls can reach it.
    /// Returns the `SocketId` the caller should track for
    /// registry/cache cleanup on disconnect.
    pub fn add_connection(&self, socket: SocketId, sender: mpsc::UnboundedSender<Message>) {
        self.connections.insert(socket, sender);
    }

    pub fn remove_connection(&self, socket: SocketId) {
        self.connections.remove(&socket);
    }

    /// Writes a one-way frame to `socket` with no Ack expected. Used
    /// for pushing [`PermissionPromptRequest`]s and their terminal
    /// errors, which are resolved by a later, independently-dispatched
    /// inbound frame rather than by awaiting this call's response.
    fn send_text(&self, socket: SocketId, text: String) -> bool {
        let Some(sender) = self.connections.get(&socket).map(|entry| entry.clone()) else {
            return false;
        };
        sender.send(Message::Text(text.into())).is_ok()
    }

    fn resolve_ack(&self, id: Uuid, result: Option<Value>, error: Option<String>) {
        if let Some((_, pending)) = self.pending.remove(&id) {
            let outcome = match error {
                Some(message) => Err(RpcCallError::RunnerError(message)),
                None => Ok(result.unwrap_or(Value::Null)),
            };
            let _ = pending.sender.send(outcome);
        }
    }
}

#[async_trait]
impl RunnerRpcClient for WsRpcClient {
    async fn call(
        &self,
        socket: SocketId,
        method: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, RpcCallError> {
        let Some(sender) = self.connections.get(&socket).map(|entry| entry.clone()) else {
            return Err(RpcCallError::Disconnected);
        };

        let call_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(call_id, PendingCall { sender: tx });

        let frame = OutboundCall { kind: "rpc_call", id: call_id, method: method.to_string(), payload };
        let text = serde_json::to_string(&frame).map_err(|e| RpcCallError::RunnerError(e.to_string()))?;
        if sender.send(Message::Text(text.into())).is_err() {
            self.pending.remove(&call_id);
            return Err(RpcCallError::Disconnected);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcCallError::Disconnected),
            Err(_) => {
                self.pending.remove(&call_id);
                Err(RpcCallError::TimedOut(timeout))
            }
        }
    }
}

/// Dispatches a single inbound text frame. Errors are swallowed into
/// a log line rather than propagated: a malformed frame from one
/// runner socket must not tear down its connection loop.
#[allow(clippy::too_many_arguments)]
pub async fn handle_inbound_frame(
    text: &str,
    socket: SocketId,
    store: &Arc<Store>,
    publisher: &Arc<EventPublisher>,
    registry: &Arc<RpcRegistry>,
    session_cache: &Arc<SessionCache>,
    coordinator: &Arc<Coordinator>,
    ws_client: &Arc<WsRpcClient>,
) -> Result<(), StoreError> {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!(%err, socket = %socket, "ignoring malformed inbound frame");
            return Ok(());
        }
    };

    match frame {
        InboundFrame::Register { method } => {
            match registry.register(socket, &method) {
                RegisterOutcome::Registered => tracing::info!(socket = %socket, method, "registered rpc method"),
                RegisterOutcome::AlreadyOwner => {}
                RegisterOutcome::OwnedByOther => {
                    tracing::warn!(socket = %socket, method, "registration rejected, method already owned")
                }
            }
        }
        InboundFrame::Unregister { method } => {
            registry.unregister(socket, &method);
        }
        InboundFrame::Ack { id, result, error } => {
            ws_client.resolve_ack(id, result, error);
        }
        InboundFrame::SessionAlive { session_id, namespace, thinking, thinking_activity } => {
            session_cache
                .on_heartbeat(
                    store,
                    publisher,
                    session_id,
                    &namespace,
                    chrono::Utc::now(),
                    thinking,
                    thinking_activity,
                )
                .await?;
        }
        InboundFrame::SessionEnd { session_id, namespace } => {
            session_cache.on_session_end(store, publisher, session_id, &namespace, chrono::Utc::now()).await?;
        }
        InboundFrame::PermissionResolution(PermissionResolutionRequest { session_id, tool_call_id, resolution }) => {
            if !coordinator.permission_prompts.resolve(session_id, &tool_call_id, resolution) {
                tracing::debug!(session_id = %session_id, tool_call_id, "permission resolution had no pending prompt");
            }
        }
        InboundFrame::RequestPermission { session_id, namespace, tool_call_id, tool_name, input } => {
            let outbound = OutboundPermissionPrompt {
                kind: "permission_prompt",
                prompt: PermissionPromptRequest {
                    session_id,
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    input: input.clone(),
                },
            };
            match serde_json::to_string(&outbound) {
                Ok(text) => {
                    if !ws_client.send_text(socket, text) {
                        tracing::warn!(session_id = %session_id, "failed to push permission prompt, socket gone");
                    }
                }
                Err(err) => tracing::warn!(%err, "failed to serialize permission prompt"),
            }

            let store = store.clone();
            let publisher = publisher.clone();
            let coordinator = coordinator.clone();
            let ws_client = ws_client.clone();
            tokio::spawn(async move {
                let resolution = coordinator
                    .request_permission(&store, &publisher, &namespace, session_id, tool_call_id.clone(), tool_name, input)
                    .await;
                if let Ok(PermissionResolution::Aborted) = resolution {
                    let error_frame = serde_json::json!({
                        "type": "permission_resolution_error",
                        "session_id": session_id,
                        "tool_call_id": tool_call_id,
                        "error": "Permission request aborted",
                    });
                    ws_client.send_text(socket, error_frame.to_string());
                } else if let Err(err) = resolution {
                    tracing::warn!(%err, session_id = %session_id, "permission request failed");
                }
            });
        }
        InboundFrame::CancelPermissionRequest { session_id, tool_call_id } => {
            if !coordinator.permission_prompts.abort(session_id, &tool_call_id) {
                tracing::debug!(session_id = %session_id, tool_call_id, "abort had no pending prompt");
            }
        }
    }
    Ok(())
}

/// Drives one accepted `/cli` WebSocket connection end to end: reads
/// frames until the socket closes or errors, then releases everything
/// this socket owned in the registry and transport connection map.
/// The outbound half is a plain channel pump so `call()` can write
/// from any task without holding the socket itself.
pub async fn run_connection(
    socket: WebSocket,
    socket_id: SocketId,
    store: Arc<Store>,
    publisher: Arc<EventPublisher>,
    registry: Arc<RpcRegistry>,
    session_cache: Arc<SessionCache>,
    coordinator: Arc<Coordinator>,
    ws_client: Arc<WsRpcClient>,
) {
    use futures_util::{SinkExt, StreamExt};

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    ws_client.add_connection(socket_id, tx);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        if let Err(err) =
            handle_inbound_frame(&text, socket_id, &store, &publisher, &registry, &session_cache, &coordinator, &ws_client)
                .await
        {
            tracing::warn!(%err, socket = %socket_id, "error applying inbound frame");
        }
    }

    writer.abort();
    ws_client.remove_connection(socket_id);
    registry.unregister_all(socket_id);
    tracing::info!(socket = %socket_id, "runner socket disconnected, released owned methods");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_against_unknown_socket_fails_disconnected() {
        let client = WsRpcClient::new();
        let err = client
            .call(Uuid::new_v4(), "m", serde_json::json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcCallError::Disconnected));
    }

    #[tokio::test]
    async fn call_times_out_when_no_ack_arrives() {
        let client = WsRpcClient::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let socket = Uuid::new_v4();
        client.add_connection(socket, tx);

        let err = client.call(socket, "m", serde_json::json!({}), Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, RpcCallError::TimedOut(_)));
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn ack_resolves_matching_pending_call() {
        let client = WsRpcClient::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let socket = Uuid::new_v4();
        client.add_connection(socket, tx);

        let client = Arc::new(client);
        let client2 = client.clone();
        let handle = tokio::spawn(async move {
            client2.call(socket, "m", serde_json::json!({"x": 1}), Duration::from_secs(5)).await
        });

        let sent = rx.recv().await.unwrap();
        let Message::Text(text) = sent else { panic!("expected text frame") };
        let parsed: Value = serde_json::from_str(&text).unwrap();
        let call_id: Uuid = parsed["id"].as_str().unwrap().parse().unwrap();

        client.resolve_ack(call_id, Some(serde_json::json!({"ok": true})), None);

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn ack_with_error_resolves_as_runner_error() {
        let client = Arc::new(WsRpcClient::new());
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let socket = Uuid::new_v4();
        client.add_connection(socket, tx);

        let client2 = client.clone();
        let handle = tokio::spawn(async move {
            client2.call(socket, "m", serde_json::json!({}), Duration::from_secs(5)).await
        });

        let sent = rx.recv().await.unwrap();
        let Message::Text(text) = sent else { panic!("expected text frame") };
        let parsed: Value = serde_json::from_str(&text).unwrap();
        let call_id: Uuid = parsed["id"].as_str().unwrap().parse().unwrap();

        client.resolve_ack(call_id, None, Some("boom".to_string()));

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcCallError::RunnerError(msg) if msg == "boom"));
    }

    #[tokio::test]
    async fn register_frame_claims_method_ownership() {
        let registry = Arc::new(RpcRegistry::new());
        let socket = Uuid::new_v4();
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let publisher = Arc::new(EventPublisher::new());
        let session_cache = Arc::new(SessionCache::new());
        let coordinator = Arc::new(Coordinator::new());
        let ws_client = Arc::new(WsRpcClient::new());

        handle_inbound_frame(
            r#"{"type":"register","method":"m1:spawn-happy-session"}"#,
            socket,
            &store,
            &publisher,
            &registry,
            &session_cache,
            &coordinator,
            &ws_client,
        )
        .await
        .unwrap();

        assert_eq!(registry.get_socket_for_method("m1:spawn-happy-session"), Some(socket));
    }

    #[tokio::test]
    async fn malformed_frame_is_ignored_not_propagated() {
        let registry = Arc::new(RpcRegistry::new());
        let socket = Uuid::new_v4();
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let publisher = Arc::new(EventPublisher::new());
        let session_cache = Arc::new(SessionCache::new());
        let coordinator = Arc::new(Coordinator::new());
        let ws_client = Arc::new(WsRpcClient::new());

        let result = handle_inbound_frame(
            "not json",
            socket,
            &store,
            &publisher,
            &registry,
            &session_cache,
            &coordinator,
            &ws_client,
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn permission_resolution_frame_wakes_pending_prompt() {
        let registry = Arc::new(RpcRegistry::new());
        let socket = Uuid::new_v4();
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let publisher = Arc::new(EventPublisher::new());
        let session_cache = Arc::new(SessionCache::new());
        let coordinator = Arc::new(Coordinator::new());
        let ws_client = Arc::new(WsRpcClient::new());
        let session_id = Uuid::new_v4();

        let coordinator2 = coordinator.clone();
        let receiver = coordinator2.permission_prompts.create(session_id, "call-1".to_string());

        let frame = serde_json::json!({
            "type": "permission_resolution",
            "session_id": session_id,
            "tool_call_id": "call-1",
            "resolution": "approved",
        });
        handle_inbound_frame(
            &frame.to_string(),
            socket,
            &store,
            &publisher,
            &registry,
            &session_cache,
            &coordinator,
            &ws_client,
        )
        .await
        .unwrap();

        assert_eq!(receiver.await.unwrap(), PermissionResolution::Approved);
    }

    #[tokio::test]
    async fn request_permission_frame_pushes_prompt_and_records_pending_request() {
        let registry = Arc::new(RpcRegistry::new());
        let socket = Uuid::new_v4();
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let publisher = Arc::new(EventPublisher::new());
        let session_cache = Arc::new(SessionCache::new());
        let coordinator = Arc::new(Coordinator::new());
        let ws_client = Arc::new(WsRpcClient::new());
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        ws_client.add_connection(socket, tx);

        let session = store.get_or_create_session("tag", "ns", None, None, None).await.unwrap();

        let frame = serde_json::json!({
            "type": "request_permission",
            "session_id": session.id,
            "namespace": "ns",
            "tool_call_id": "call-1",
            "tool_name": "Bash",
            "input": {},
        });
        handle_inbound_frame(
            &frame.to_string(),
            socket,
            &store,
            &publisher,
            &registry,
            &session_cache,
            &coordinator,
            &ws_client,
        )
        .await
        .unwrap();

        let sent = rx.recv().await.unwrap();
        let Message::Text(text) = sent else { panic!("expected text frame") };
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["type"], "permission_prompt");
        assert_eq!(parsed["tool_call_id"], "call-1");

        let stored = store.get_session(session.id, "ns").await.unwrap();
        assert_eq!(stored.agent_state["requests"].as_array().unwrap().len(), 1);

        assert!(coordinator.permission_prompts.resolve(session.id, "call-1", PermissionResolution::Approved));
    }

    #[tokio::test]
    async fn cancel_permission_request_frame_aborts_pending_prompt() {
        let registry = Arc::new(RpcRegistry::new());
        let socket = Uuid::new_v4();
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let publisher = Arc::new(EventPublisher::new());
        let session_cache = Arc::new(SessionCache::new());
        let coordinator = Arc::new(Coordinator::new());
        let ws_client = Arc::new(WsRpcClient::new());
        let session_id = Uuid::new_v4();

        let receiver = coordinator.permission_prompts.create(session_id, "call-1".to_string());

        let frame = serde_json::json!({
            "type": "cancel_permission_request",
            "session_id": session_id,
            "tool_call_id": "call-1",
        });
        handle_inbound_frame(
            &frame.to_string(),
            socket,
            &store,
            &publisher,
            &registry,
            &session_cache,
            &coordinator,
            &ws_client,
        )
        .await
        .unwrap();

        assert_eq!(receiver.await.unwrap(), PermissionResolution::Aborted);
    }
}
