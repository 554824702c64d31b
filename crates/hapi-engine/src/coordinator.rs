//! Cross-cutting request handlers that couple the store, the RPC
//! registry, and the session cache: spawn, inter-agent messaging,
//! restart, and permission-mode resolution.
//!
//! Grounded on `at-bridge/src/ipc.rs`'s dispatch-and-publish handler
//! shape (read shared state, mutate, emit an event) generalized from
//! its fixed `BridgeMessage` match arms to the RPC-backed operations
//! this hub exposes.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use hapi_core::store::Store;
use hapi_core::types::{PendingPermissionRequest, PermissionResolution, Session};
use hapi_types::rpc::{
    InitialPromptDelivery, MessageDeliveryStatus, RestartSessionResult, RestartSessionsRequest,
    SpawnHappySessionRpcArgs, SpawnSessionRequest, SpawnSessionResult,
};
use hapi_types::Event;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::bead_service::BeadService;
use crate::event_publisher::EventPublisher;
use crate::rpc_client::{RpcCallError, RunnerRpcClient};
use crate::rpc_registry::RpcRegistry;
use crate::session_cache::SessionCache;

const SPAWN_RPC_TIMEOUT: Duration = Duration::from_secs(30);
const RESTART_RPC_TIMEOUT: Duration = Duration::from_secs(10);
/// How long `spawnSession` waits for the new session's first
/// `session-alive` before reporting `initial_prompt_delivery: timed_out`.
const INITIAL_PROMPT_WAIT: Duration = Duration::from_secs(10);
const INITIAL_PROMPT_POLL: Duration = Duration::from_millis(200);

const MAX_MESSAGE_BYTES: usize = 100 * 1024;
const MAX_HOP_COUNT: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("entity not found")]
    NotFound,
    #[error("entity belongs to a different namespace")]
    AccessDenied,
    #[error("{0}")]
    NotAuthorized(&'static str),
    #[error("message body exceeds {0} bytes")]
    MessageTooLarge(usize),
    #[error("hop count exceeds {0}")]
    HopLimitExceeded(u32),
    #[error(transparent)]
    Rpc(#[from] RpcCallError),
    #[error(transparent)]
    Store(#[from] hapi_core::error::StoreError),
}

/// A permission prompt awaiting resolution. Holding the sender here
/// (rather than just in `agentState.requests`) is what lets
/// `resolve_permission`/`abort_permission` wake the coordinator call
/// that is blocked awaiting a runner's tool-call decision.
struct PendingPrompt {
    sender: oneshot::Sender<PermissionResolution>,
}

#[derive(Default)]
pub struct PermissionPrompts {
    pending: Mutex<HashMap<(Uuid, String), PendingPrompt>>,
}

impl PermissionPrompts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new prompt and returns the receiver the caller
    /// awaits for its resolution.
    pub fn create(&self, session_id: Uuid, tool_call_id: String) -> oneshot::Receiver<PermissionResolution> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert((session_id, tool_call_id), PendingPrompt { sender: tx });
        rx
    }

    /// Resolves a pending prompt (approve or deny). Returns `false` if
    /// no such prompt is outstanding (already resolved or unknown).
    pub fn resolve(&self, session_id: Uuid, tool_call_id: &str, resolution: PermissionResolution) -> bool {
        let prompt = self.pending.lock().unwrap().remove(&(session_id, tool_call_id.to_string()));
        match prompt {
            Some(p) => p.sender.send(resolution).is_ok(),
            None => false,
        }
    }

    /// A cancellation signal on the tool call aborts its pending
    /// prompt, equivalent to `resolve(.., Aborted)`.
    pub fn abort(&self, session_id: Uuid, tool_call_id: &str) -> bool {
        self.resolve(session_id, tool_call_id, PermissionResolution::Aborted)
    }
}

pub struct Coordinator {
    pub permission_prompts: PermissionPrompts,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        Self { permission_prompts: PermissionPrompts::new() }
    }

    /// `resolveSessionAccess`: maps a session lookup to the
    /// ok/access-denied/not-found trichotomy routes rely on for their
    /// HTTP status mapping.
    pub async fn resolve_session_access(&self, store: &Store, id: Uuid, namespace: &str) -> Result<Session, CoordinatorError> {
        store.get_session(id, namespace).await.map_err(|e| match e {
            hapi_core::error::StoreError::NotFound => CoordinatorError::NotFound,
            hapi_core::error::StoreError::AccessDenied => CoordinatorError::AccessDenied,
            other => CoordinatorError::Store(other),
        })
    }

    /// Resolves the target machine, issues `spawn-happy-session`, and
    /// on success waits (bounded) for the new session to report alive
    /// before delivering `initialPrompt` as a `meta.sentFrom='spawn'`
    /// user message. An empty/whitespace prompt is treated as omitted.
    #[allow(clippy::too_many_arguments)]
    pub async fn spawn_session(
        &self,
        store: &Store,
        publisher: &EventPublisher,
        registry: &RpcRegistry,
        session_cache: &SessionCache,
        client: &dyn RunnerRpcClient,
        namespace: &str,
        machine_id: Uuid,
        request: SpawnSessionRequest,
    ) -> Result<SpawnSessionResult, CoordinatorError> {
        // Namespace-scope the machine before issuing anything against it.
        store.get_machine(machine_id, namespace).await.map_err(|e| match e {
            hapi_core::error::StoreError::NotFound => CoordinatorError::NotFound,
            hapi_core::error::StoreError::AccessDenied => CoordinatorError::AccessDenied,
            other => CoordinatorError::Store(other),
        })?;

        let method = format!("{machine_id}:spawn-happy-session");
        let Some(socket) = registry.get_socket_for_method(&method) else {
            return Ok(SpawnSessionResult::Error {
                code: "rpc_handler_not_registered".into(),
                message: "RPC handler not registered".into(),
            });
        };

        let rpc_args = SpawnHappySessionRpcArgs {
            directory: request.directory,
            agent: request.agent,
            model: request.model,
            yolo: request.yolo,
            session_type: request.session_type,
            worktree_name: request.worktree_name,
            worktree_branch: request.worktree_branch,
        };
        let payload = serde_json::to_value(&rpc_args).map_err(|e| RpcCallError::RunnerError(e.to_string()))?;
        let response = client.call(socket, &method, payload, SPAWN_RPC_TIMEOUT).await?;
        let result: SpawnSessionResult =
            serde_json::from_value(response).map_err(|e| RpcCallError::RunnerError(e.to_string()))?;

        let session_id = match result {
            SpawnSessionResult::Success { session_id, .. } => session_id,
            SpawnSessionResult::Error { .. } => return Ok(result),
        };
        store.set_session_machine(session_id, namespace, machine_id).await?;

        let trimmed_prompt = request.initial_prompt.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let Some(prompt) = trimmed_prompt else {
            return Ok(SpawnSessionResult::Success { session_id, initial_prompt_delivery: None });
        };

        let delivery = self.await_session_alive_and_deliver(store, publisher, session_cache, namespace, session_id, prompt).await?;
        Ok(SpawnSessionResult::Success { session_id, initial_prompt_delivery: Some(delivery) })
    }

    async fn await_session_alive_and_deliver(
        &self,
        store: &Store,
        publisher: &EventPublisher,
        session_cache: &SessionCache,
        namespace: &str,
        session_id: Uuid,
        prompt: &str,
    ) -> Result<InitialPromptDelivery, CoordinatorError> {
        let deadline = tokio::time::Instant::now() + INITIAL_PROMPT_WAIT;
        while tokio::time::Instant::now() < deadline {
            if session_cache.is_active(session_id) {
                let message = store
                    .add_message(
                        session_id,
                        serde_json::json!({"role": "user", "text": prompt, "meta": {"sentFrom": "spawn"}}),
                        None,
                    )
                    .await?;
                publisher.publish(Event::MessageAdded {
                    namespace: namespace.to_string(),
                    session_id,
                    message: Box::new(message),
                });
                return Ok(InitialPromptDelivery::Delivered);
            }
            tokio::time::sleep(INITIAL_PROMPT_POLL).await;
        }
        Ok(InitialPromptDelivery::TimedOut)
    }

    /// Allowed topologies: parent<->child only, or target opted in via
    /// `acceptAllMessages`.
    pub async fn send_inter_agent_message(
        &self,
        store: &Store,
        publisher: &EventPublisher,
        session_cache: &SessionCache,
        namespace: &str,
        sender_session_id: Uuid,
        target_session_id: Uuid,
        content: serde_json::Value,
        hop_count: u32,
    ) -> Result<MessageDeliveryStatus, CoordinatorError> {
        if hop_count > MAX_HOP_COUNT {
            return Err(CoordinatorError::HopLimitExceeded(MAX_HOP_COUNT));
        }
        let size = serde_json::to_vec(&content).map(|v| v.len()).unwrap_or(0);
        if size > MAX_MESSAGE_BYTES {
            return Err(CoordinatorError::MessageTooLarge(MAX_MESSAGE_BYTES));
        }

        let sender = self.resolve_session_access(store, sender_session_id, namespace).await?;
        let target = self.resolve_session_access(store, target_session_id, namespace).await?;

        let authorized = target.parent_session_id == Some(sender.id)
            || sender.parent_session_id == Some(target.id)
            || target.accept_all_messages;
        if !authorized {
            return Err(CoordinatorError::NotAuthorized("not_authorized"));
        }

        let message = store
            .add_message(
                target.id,
                serde_json::json!({"role": "user", "senderSessionId": sender.id, "content": content, "hopCount": hop_count}),
                None,
            )
            .await?;
        publisher.publish(Event::MessageAdded {
            namespace: namespace.to_string(),
            session_id: target.id,
            message: Box::new(message),
        });

        Ok(if session_cache.is_active(target.id) {
            MessageDeliveryStatus::Delivered
        } else {
            MessageDeliveryStatus::Queued
        })
    }

    /// Re-issues start RPCs for the requested session ids, or every
    /// session belonging to `machineId`, aggregating per-session
    /// results rather than failing the whole batch on one error.
    pub async fn restart_sessions(
        &self,
        store: &Store,
        registry: &RpcRegistry,
        client: &dyn RunnerRpcClient,
        namespace: &str,
        request: RestartSessionsRequest,
    ) -> Result<Vec<RestartSessionResult>, CoordinatorError> {
        let targets: Vec<Session> = if let Some(ids) = request.session_ids {
            let mut sessions = Vec::with_capacity(ids.len());
            for id in ids {
                if let Ok(session) = store.get_session(id, namespace).await {
                    sessions.push(session);
                }
            }
            sessions
        } else if let Some(machine_id) = request.machine_id {
            store
                .list_sessions(namespace, false)
                .await?
                .into_iter()
                .filter(|s| s.machine_id == Some(machine_id))
                .collect()
        } else {
            Vec::new()
        };

        let mut results = Vec::with_capacity(targets.len());
        for session in targets {
            let Some(machine_id) = session.machine_id else {
                results.push(RestartSessionResult {
                    session_id: session.id,
                    success: false,
                    error: Some("session has no associated machine".into()),
                });
                continue;
            };
            let method = format!("{machine_id}:restart-session");
            let outcome = match registry.get_socket_for_method(&method) {
                Some(socket) => client
                    .call(socket, &method, serde_json::json!({"sessionId": session.id}), RESTART_RPC_TIMEOUT)
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string()),
                None => Err("RPC handler not registered".to_string()),
            };
            results.push(RestartSessionResult {
                session_id: session.id,
                success: outcome.is_ok(),
                error: outcome.err(),
            });
        }
        Ok(results)
    }

    /// Records a tool-call permission prompt, driving `pendingRequestsCount`
    /// via `agentState.requests`, and awaits its resolution. Called from
    /// `ws_transport`'s `RequestPermission` inbound frame, which pushes the
    /// matching `PermissionPromptRequest` down the originating socket
    /// before this future is spawned.
    pub async fn request_permission(
        &self,
        store: &Store,
        publisher: &EventPublisher,
        namespace: &str,
        session_id: Uuid,
        tool_call_id: String,
        tool_name: String,
        input: serde_json::Value,
    ) -> Result<PermissionResolution, CoordinatorError> {
        let request = PendingPermissionRequest {
            tool_call_id: tool_call_id.clone(),
            tool_name,
            input,
            requested_at: Utc::now(),
        };
        self.add_pending_request(store, publisher, namespace, session_id, &request).await?;

        let receiver = self.permission_prompts.create(session_id, tool_call_id.clone());
        let resolution = receiver.await.unwrap_or(PermissionResolution::Aborted);
        self.remove_pending_request(store, publisher, namespace, session_id, &tool_call_id).await?;
        Ok(resolution)
    }

    async fn add_pending_request(
        &self,
        store: &Store,
        publisher: &EventPublisher,
        namespace: &str,
        session_id: Uuid,
        request: &PendingPermissionRequest,
    ) -> Result<(), CoordinatorError> {
        self.mutate_requests(store, publisher, namespace, session_id, |requests| {
            requests.push(serde_json::to_value(request).unwrap());
        })
        .await
    }

    async fn remove_pending_request(
        &self,
        store: &Store,
        publisher: &EventPublisher,
        namespace: &str,
        session_id: Uuid,
        tool_call_id: &str,
    ) -> Result<(), CoordinatorError> {
        self.mutate_requests(store, publisher, namespace, session_id, |requests| {
            requests.retain(|r| r.get("tool_call_id").and_then(|v| v.as_str()) != Some(tool_call_id));
        })
        .await
    }

    async fn mutate_requests(
        &self,
        store: &Store,
        publisher: &EventPublisher,
        namespace: &str,
        session_id: Uuid,
        f: impl FnOnce(&mut Vec<serde_json::Value>),
    ) -> Result<(), CoordinatorError> {
        let session = self.resolve_session_access(store, session_id, namespace).await?;
        let mut agent_state = session.agent_state.clone();
        let mut requests: Vec<serde_json::Value> = agent_state
            .get("requests")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        f(&mut requests);
        agent_state["requests"] = serde_json::Value::Array(requests);

        use hapi_core::store::{SessionVersionedField, VersionedUpdateOutcome};
        let outcome = store
            .update_session_versioned_field(
                session_id,
                namespace,
                SessionVersionedField::AgentState,
                agent_state,
                session.agent_state_version,
            )
            .await?;
        if let VersionedUpdateOutcome::Success { .. } = outcome {
            let updated = store.get_session(session_id, namespace).await?;
            publisher.publish(Event::SessionUpdated { namespace: namespace.to_string(), session: Box::new(updated) });
        }
        Ok(())
    }

    /// Called by `linkBead` to satisfy the "immediate non-jittered
    /// refresh on link" invariant.
    pub async fn on_bead_linked(
        &self,
        store: &Store,
        publisher: &EventPublisher,
        registry: &RpcRegistry,
        client: &dyn RunnerRpcClient,
        bead_service: &BeadService,
        namespace: &str,
        session_id: Uuid,
    ) -> Result<(), CoordinatorError> {
        bead_service
            .refresh_session_group(store, publisher, registry, client, namespace, session_id)
            .await?;
        Ok(())
    }
}
