//! Wire schemas for the RPCs the hub issues to runner sockets and the
//! heartbeats/events runners emit back.
//!
//! Grounded on `at-bridge/src/protocol.rs`'s request/response payload
//! structs (`StatusPayload`, `KpiPayload`) and `at-bridge/src/ipc.rs`'s
//! request/response pairing, replacing duck-typed JSON bodies with
//! explicit schemas per SPEC_FULL.md §9's "duck-typed payloads" note —
//! unknown fields pass through only where bead summaries are concerned.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `POST /machines/:id/spawn` body, unified to a single named record
/// per SPEC_FULL.md §9 Open Question (a) (the teacher's call sites
/// disagreed on positional vs. named-object argument order).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnSessionRequest {
    pub directory: String,
    pub agent: Option<String>,
    pub model: Option<String>,
    pub yolo: Option<bool>,
    pub session_type: Option<String>,
    pub worktree_name: Option<String>,
    pub worktree_branch: Option<String>,
    /// Capped at 100,000 chars; oversized values are rejected with 400
    /// by the facade before this type is ever constructed.
    pub initial_prompt: Option<String>,
    pub team_id: Option<Uuid>,
}

/// The RPC payload sent to a runner's `<machineId>:spawn-happy-session`
/// handler — a subset of [`SpawnSessionRequest`] without the routing
/// fields the hub itself consumes (`team_id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnHappySessionRpcArgs {
    pub directory: String,
    pub agent: Option<String>,
    pub model: Option<String>,
    pub yolo: Option<bool>,
    pub session_type: Option<String>,
    pub worktree_name: Option<String>,
    pub worktree_branch: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialPromptDelivery {
    Delivered,
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SpawnSessionResult {
    Success {
        session_id: Uuid,
        initial_prompt_delivery: Option<InitialPromptDelivery>,
    },
    Error {
        code: String,
        message: String,
    },
}

/// `POST /sessions/:id/message` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterAgentMessageRequest {
    pub sender_session_id: Uuid,
    pub content: serde_json::Value,
    pub hop_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDeliveryStatus {
    Delivered,
    Queued,
}

/// `POST /restart-sessions` body — exactly one of the two fields is
/// expected, but both being absent/empty is treated as "no targets".
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RestartSessionsRequest {
    pub session_ids: Option<Vec<Uuid>>,
    pub machine_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartSessionResult {
    pub session_id: Uuid,
    pub success: bool,
    pub error: Option<String>,
}

/// Runner → hub presence heartbeat, emitted on the `/cli` socket
/// namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAliveHeartbeat {
    pub sid: Uuid,
    pub time: chrono::DateTime<chrono::Utc>,
    pub thinking: Option<bool>,
    pub thinking_activity: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEndEvent {
    pub sid: Uuid,
    pub time: chrono::DateTime<chrono::Utc>,
}

/// RPC args for `show-session-beads` / `show-machine-beads`. Bead
/// content itself is intentionally left as an opaque map — unknown
/// fields pass through by design, per SPEC_FULL.md's duck-typed note.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShowBeadsRpcArgs {
    pub session_id: Uuid,
    pub bead_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeadSummary {
    pub bead_id: String,
    #[serde(flatten)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShowBeadsRpcResult {
    pub beads: Vec<BeadSummary>,
}

/// Hub → client RPC asking the holder of a pending tool call to
/// resolve it. Issued when a runner reports a tool call under a
/// permission mode that does not auto-approve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionPromptRequest {
    pub session_id: Uuid,
    pub tool_call_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionResolutionRequest {
    pub session_id: Uuid,
    pub tool_call_id: String,
    pub resolution: hapi_core::types::PermissionResolution,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_result_success_serializes_as_tagged_variant() {
        let result = SpawnSessionResult::Success {
            session_id: Uuid::nil(),
            initial_prompt_delivery: Some(InitialPromptDelivery::Delivered),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["type"], "success");
        assert_eq!(json["initial_prompt_delivery"], "delivered");
    }

    #[test]
    fn bead_summary_flattens_unknown_fields() {
        let raw = serde_json::json!({"bead_id": "hapi-1", "title": "fix bug", "priority": 2});
        let summary: BeadSummary = serde_json::from_value(raw).unwrap();
        assert_eq!(summary.bead_id, "hapi-1");
        assert_eq!(summary.data.get("title").unwrap(), "fix bug");
    }

    #[test]
    fn restart_sessions_request_defaults_to_no_targets() {
        let req: RestartSessionsRequest = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(req.session_ids.is_none());
        assert!(req.machine_id.is_none());
    }
}
