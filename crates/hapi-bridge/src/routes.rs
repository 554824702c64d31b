//! HTTP route handlers: sessions, machines, teams, preferences, and
//! the runner-restart/permission-mode operations, all namespace-scoped
//! via the [`Namespace`] extractor `AuthLayer` attaches to the request.
//!
//! Grounded on `at-bridge/src/http_api/sessions.rs`'s handler shape
//! (state extraction, `Result<Json<T>, ApiError>` returns, `?` through
//! `From` impls) generalized from Kanban/task entities to HAPI's
//! session/machine/team/preference entities.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use hapi_core::store::{SessionVersionedField, VersionedUpdateOutcome};
use hapi_core::types::{PermissionMode, TeamGroupStyle};
use hapi_types::rpc::{MessageDeliveryStatus, RestartSessionsRequest, SpawnSessionRequest};

use crate::api_error::ApiError;
use crate::auth::Namespace;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/messages", get(get_messages))
        .route("/sessions/{id}/message", post(send_message))
        .route("/sessions/{id}/accept-all-messages", post(set_accept_all_messages))
        .route("/sessions/{id}/permission-mode", post(set_permission_mode))
        .route("/machines", post(create_machine).get(list_machines))
        .route("/machines/{id}", get(get_machine))
        .route("/machines/{id}/spawn", post(spawn_session))
        .route("/restart-sessions", post(restart_sessions))
        .route("/teams", post(create_team).get(list_teams))
        .route("/teams/{id}", axum::routing::put(update_team).delete(delete_team))
        .route("/teams/{id}/members", post(add_team_member))
        .route("/teams/{id}/members/{session_id}", axum::routing::delete(remove_team_member))
        .route("/preferences", get(get_preferences).put(update_preferences))
        .route("/events", get(stream_events))
        .route("/cli", get(cli_socket_upgrade))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Runner socket
// ---------------------------------------------------------------------------

/// Upgrades an authenticated `/cli` request to the runner socket
/// transport. The namespace resolved by `AuthLayer` is not threaded
/// further here: the registry's method ownership is keyed by machine
/// id, not namespace, matching `hapi_engine::coordinator`'s RPC method
/// naming (`"{machineId}:{method}"`).
async fn cli_socket_upgrade(
    State(state): State<Arc<AppState>>,
    _namespace: Namespace,
    ws: axum::extract::ws::WebSocketUpgrade,
) -> axum::response::Response {
    ws.on_upgrade(move |socket| async move {
        let socket_id = Uuid::new_v4();
        crate::ws_transport::run_connection(
            socket,
            socket_id,
            state.store.clone(),
            state.publisher.clone(),
            state.registry.clone(),
            state.session_cache.clone(),
            state.coordinator.clone(),
            state.ws_client.clone(),
        )
        .await;
    })
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    tag: String,
    metadata: Option<serde_json::Value>,
    agent_state: Option<serde_json::Value>,
    parent_session_id: Option<Uuid>,
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Namespace(namespace): Namespace,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .store
        .get_or_create_session(&req.tag, &namespace, req.metadata, req.agent_state, req.parent_session_id)
        .await?;
    Ok(Json(json!({ "session": session })))
}

#[derive(Debug, Deserialize)]
struct ListSessionsQuery {
    #[serde(default)]
    active: bool,
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Namespace(namespace): Namespace,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut sessions = state.store.list_sessions(&namespace, query.active).await?;
    for session in &mut sessions {
        state.session_cache.overlay(session);
    }
    let sessions: Vec<_> = sessions
        .into_iter()
        .map(|s| {
            let status = s.status();
            json!({ "session": s, "status": status })
        })
        .collect();
    Ok(Json(json!({ "sessions": sessions })))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Namespace(namespace): Namespace,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut session = state.coordinator.resolve_session_access(&state.store, id, &namespace).await?;
    state.session_cache.overlay(&mut session);
    let status = session.status();
    Ok(Json(json!({ "session": session, "status": status })))
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    #[serde(default)]
    after_seq: i64,
    #[serde(default = "default_message_limit")]
    limit: i64,
}

fn default_message_limit() -> i64 {
    200
}

async fn get_messages(
    State(state): State<Arc<AppState>>,
    Namespace(namespace): Namespace,
    Path(id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // resolve_session_access enforces namespace scoping before we ever
    // touch the messages table.
    state.coordinator.resolve_session_access(&state.store, id, &namespace).await?;
    let messages = state.store.get_messages(id, query.after_seq, query.limit).await?;
    Ok(Json(json!({ "messages": messages })))
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    sender_session_id: Uuid,
    content: serde_json::Value,
    #[serde(default)]
    hop_count: u32,
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Namespace(namespace): Namespace,
    Path(target_session_id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status: MessageDeliveryStatus = state
        .coordinator
        .send_inter_agent_message(
            &state.store,
            &state.publisher,
            &state.session_cache,
            &namespace,
            req.sender_session_id,
            target_session_id,
            req.content,
            req.hop_count,
        )
        .await?;
    Ok(Json(json!({ "status": status })))
}

#[derive(Debug, Deserialize)]
struct AcceptAllMessagesRequest {
    #[serde(default = "default_true")]
    accept_all_messages: bool,
}

fn default_true() -> bool {
    true
}

async fn set_accept_all_messages(
    State(state): State<Arc<AppState>>,
    Namespace(namespace): Namespace,
    Path(id): Path<Uuid>,
    Json(req): Json<AcceptAllMessagesRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.coordinator.resolve_session_access(&state.store, id, &namespace).await?;
    state.store.set_accept_all_messages(id, &namespace, req.accept_all_messages).await?;
    let session = state.store.get_session(id, &namespace).await?;
    Ok(Json(json!({ "session": session })))
}

#[derive(Debug, Deserialize)]
struct PermissionModeRequest {
    mode: PermissionMode,
}

/// Retries the compare-and-swap against `agent_state.permissionMode` a
/// bounded number of times before giving up — under normal load a
/// losing CAS means a concurrent write landed between read and write,
/// not a stuck session.
const PERMISSION_MODE_CAS_RETRIES: usize = 5;

async fn set_permission_mode(
    State(state): State<Arc<AppState>>,
    Namespace(namespace): Namespace,
    Path(id): Path<Uuid>,
    Json(req): Json<PermissionModeRequest>,
) -> axum::response::Response {
    use axum::response::IntoResponse;

    for _ in 0..PERMISSION_MODE_CAS_RETRIES {
        let session = match state.coordinator.resolve_session_access(&state.store, id, &namespace).await {
            Ok(s) => s,
            Err(err) => return ApiError::from(err).into_response(),
        };
        let mut agent_state = session.agent_state.clone();
        agent_state["permissionMode"] = serde_json::to_value(req.mode).unwrap();

        let outcome = state
            .store
            .update_session_versioned_field(
                id,
                &namespace,
                SessionVersionedField::AgentState,
                agent_state,
                session.agent_state_version,
            )
            .await;

        match outcome {
            Ok(VersionedUpdateOutcome::Success { .. }) => {
                let updated = match state.store.get_session(id, &namespace).await {
                    Ok(s) => s,
                    Err(_) => return permission_mode_failure(),
                };
                state.publisher.publish(hapi_types::Event::SessionUpdated {
                    namespace: namespace.clone(),
                    session: Box::new(updated.clone()),
                });
                return Json(json!({ "session": updated })).into_response();
            }
            Ok(VersionedUpdateOutcome::VersionMismatch { .. }) => continue,
            Ok(VersionedUpdateOutcome::NotFoundOrDenied) => return ApiError::NotFound.into_response(),
            Err(_) => return permission_mode_failure(),
        }
    }
    permission_mode_failure()
}

fn permission_mode_failure() -> axum::response::Response {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "Failed to apply permission mode" }))).into_response()
}

// ---------------------------------------------------------------------------
// Machines
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateMachineRequest {
    id: Uuid,
    #[serde(default)]
    metadata: serde_json::Value,
    #[serde(default)]
    runner_state: serde_json::Value,
}

async fn create_machine(
    State(state): State<Arc<AppState>>,
    Namespace(namespace): Namespace,
    Json(req): Json<CreateMachineRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let machine = state.store.get_or_create_machine(req.id, &namespace, req.metadata, req.runner_state).await?;
    Ok(Json(json!({ "machine": machine })))
}

async fn list_machines(
    State(state): State<Arc<AppState>>,
    Namespace(namespace): Namespace,
) -> Result<Json<serde_json::Value>, ApiError> {
    let machines = state.store.list_machines(&namespace).await?;
    Ok(Json(json!({ "machines": machines })))
}

async fn get_machine(
    State(state): State<Arc<AppState>>,
    Namespace(namespace): Namespace,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let machine = state.store.get_machine(id, &namespace).await?;
    Ok(Json(json!({ "machine": machine })))
}

async fn spawn_session(
    State(state): State<Arc<AppState>>,
    Namespace(namespace): Namespace,
    Path(machine_id): Path<Uuid>,
    Json(req): Json<SpawnSessionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let result = state
        .coordinator
        .spawn_session(
            &state.store,
            &state.publisher,
            &state.registry,
            &state.session_cache,
            state.ws_client.as_ref(),
            &namespace,
            machine_id,
            req,
        )
        .await?;
    Ok(Json(serde_json::to_value(result).unwrap()))
}

async fn restart_sessions(
    State(state): State<Arc<AppState>>,
    Namespace(namespace): Namespace,
    Json(req): Json<RestartSessionsRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let results = state
        .coordinator
        .restart_sessions(&state.store, &state.registry, state.ws_client.as_ref(), &namespace, req)
        .await?;
    Ok(Json(json!({ "results": results })))
}

// ---------------------------------------------------------------------------
// Teams
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateTeamRequest {
    name: String,
    color: Option<String>,
    ttl_seconds: Option<i64>,
    created_by: Option<String>,
}

async fn create_team(
    State(state): State<Arc<AppState>>,
    Namespace(namespace): Namespace,
    Json(req): Json<CreateTeamRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let team = state.store.create_team(&namespace, req.name, req.color, req.ttl_seconds, req.created_by).await?;
    Ok(Json(json!({ "team": team })))
}

async fn list_teams(
    State(state): State<Arc<AppState>>,
    Namespace(namespace): Namespace,
) -> Result<Json<serde_json::Value>, ApiError> {
    let teams = state.store.list_teams(&namespace).await?;
    Ok(Json(json!({ "teams": teams })))
}

#[derive(Debug, Deserialize)]
struct UpdateTeamRequest {
    name: Option<String>,
    color: Option<String>,
}

async fn update_team(
    State(state): State<Arc<AppState>>,
    Namespace(namespace): Namespace,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateTeamRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let team = state.store.update_team(id, &namespace, req.name, req.color).await?;
    Ok(Json(json!({ "team": team })))
}

async fn delete_team(
    State(state): State<Arc<AppState>>,
    Namespace(namespace): Namespace,
    Path(id): Path<Uuid>,
) -> Result<axum::http::StatusCode, ApiError> {
    state.store.delete_team(id, &namespace).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn add_team_member(
    State(state): State<Arc<AppState>>,
    Namespace(namespace): Namespace,
    Path(team_id): Path<Uuid>,
    Json(req): Json<AddTeamMemberRequest>,
) -> Result<axum::http::StatusCode, ApiError> {
    // Validates the team and session both live in this namespace
    // before allowing membership to cross them.
    state.store.get_team(team_id, &namespace).await?;
    state.coordinator.resolve_session_access(&state.store, req.session_id, &namespace).await?;
    state.store.add_team_member(team_id, req.session_id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct AddTeamMemberRequest {
    session_id: Uuid,
}

async fn remove_team_member(
    State(state): State<Arc<AppState>>,
    Namespace(namespace): Namespace,
    Path((team_id, session_id)): Path<(Uuid, Uuid)>,
) -> Result<axum::http::StatusCode, ApiError> {
    state.store.get_team(team_id, &namespace).await?;
    state.store.remove_team_member(team_id, session_id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Preferences
// ---------------------------------------------------------------------------

async fn get_preferences(
    State(state): State<Arc<AppState>>,
    Namespace(namespace): Namespace,
) -> Result<Json<serde_json::Value>, ApiError> {
    let preferences = state.store.get_preferences(&namespace).await?;
    Ok(Json(json!({ "preferences": preferences })))
}

#[derive(Debug, Deserialize)]
struct UpdatePreferencesRequest {
    ready_announcements: Option<bool>,
    permission_notifications: Option<bool>,
    error_notifications: Option<bool>,
    team_group_style: Option<TeamGroupStyle>,
}

async fn update_preferences(
    State(state): State<Arc<AppState>>,
    Namespace(namespace): Namespace,
    Json(req): Json<UpdatePreferencesRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let preferences = state
        .store
        .update_preferences(
            &namespace,
            req.ready_announcements,
            req.permission_notifications,
            req.error_notifications,
            req.team_group_style,
        )
        .await?;
    state.publisher.publish(hapi_types::Event::PreferencesUpdated {
        namespace: namespace.clone(),
        preferences: Box::new(preferences.clone()),
    });
    Ok(Json(json!({ "preferences": preferences })))
}

// ---------------------------------------------------------------------------
// SSE
// ---------------------------------------------------------------------------

/// Streams this namespace's events for as long as the client stays
/// connected. The subscription is marked invisible (not torn down) the
/// moment the stream future is dropped, matching the visibility-flag
/// idiom `EventPublisher` uses for backgrounded/minimized clients —
/// here we go straight from visible to unsubscribed since HTTP gives
/// us no intermediate "backgrounded" signal.
/// Releases the subscription (so `EventPublisher::publish` stops
/// considering it) once the SSE stream is dropped — the disconnect
/// signal axum otherwise gives no hook for.
struct UnsubscribeGuard {
    publisher: Arc<hapi_engine::event_publisher::EventPublisher>,
    id: Uuid,
}

impl Drop for UnsubscribeGuard {
    fn drop(&mut self) {
        self.publisher.unsubscribe(self.id);
    }
}

async fn stream_events(
    State(state): State<Arc<AppState>>,
    Namespace(namespace): Namespace,
) -> Sse<impl Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let handle = state.publisher.subscribe(namespace);
    let guard = UnsubscribeGuard { publisher: state.publisher.clone(), id: handle.id };

    let stream = stream::unfold((handle, guard), |(handle, guard)| async move {
        let event = handle.queue.next().await;
        Some((event, (handle, guard)))
    })
    .map(|event| {
        let sse = SseEvent::default().event(event.kind()).json_data(&event).unwrap_or_else(|_| SseEvent::default());
        Ok(sse)
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
