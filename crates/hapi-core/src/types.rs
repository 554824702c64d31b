//! Domain entities persisted by the [`crate::store::Store`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A long-lived record of one agent interaction on one working directory.
///
/// `thinking`/`thinking_activity` are presence-derived and never
/// persisted to the `sessions` table; the Store always constructs them
/// as `false`/`None`, and `hapi_engine::session_cache::SessionCache`
/// overlays the live values before a `Session` reaches an event or an
/// HTTP response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: Uuid,
    pub tag: String,
    pub namespace: String,
    pub machine_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
    pub metadata_version: i64,
    pub agent_state: serde_json::Value,
    pub agent_state_version: i64,
    pub todos: serde_json::Value,
    pub todos_updated_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub active_at: Option<DateTime<Utc>>,
    pub seq: i64,
    pub sort_order: String,
    pub parent_session_id: Option<Uuid>,
    pub accept_all_messages: bool,
    #[serde(default)]
    pub thinking: bool,
    #[serde(default)]
    pub thinking_activity: Option<String>,
}

impl Session {
    /// The derived status every UI client renders, per
    /// [`SessionStatus::derive`]'s priority rule. Pending-request count
    /// comes straight from `agent_state.requests`, the same array
    /// `Coordinator::request_permission` pushes onto and pops from.
    pub fn status(&self) -> SessionStatus {
        let pending_requests_count = self
            .agent_state
            .get("requests")
            .and_then(|v| v.as_array())
            .map(|a| a.len() as u32)
            .unwrap_or(0);
        SessionStatus::derive(self.active, self.thinking, pending_requests_count)
    }
}

/// A remote process that supervises agents and exposes RPC methods.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Machine {
    pub id: Uuid,
    pub namespace: String,
    pub metadata: serde_json::Value,
    pub metadata_version: i64,
    pub runner_state: serde_json::Value,
    pub runner_state_version: i64,
    pub active: bool,
    pub active_at: Option<DateTime<Utc>>,
    pub seq: i64,
}

/// A single message recorded against a session, dense-`seq`-numbered
/// per session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub session_id: Uuid,
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub seq: i64,
    pub local_id: Option<String>,
}

/// Links a session to an externally-fetched work item ("bead").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionBeadLink {
    pub session_id: Uuid,
    pub bead_id: String,
    pub linked_at: DateTime<Utc>,
    pub linked_by: Option<String>,
}

/// Most recently fetched payload for one `(session, bead)` pair.
///
/// Stored per-session (not globally per-bead) so two sessions linked to
/// the same bead never observe each other's snapshot contents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BeadSnapshot {
    pub session_id: Uuid,
    pub bead_id: String,
    pub data: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
}

/// A named grouping of sessions within a namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Team {
    pub id: Uuid,
    pub namespace: String,
    pub name: String,
    pub color: Option<String>,
    /// Persistent teams (the seeded `always-on` team) are never
    /// expired by `getExpiredTemporaryTeams` and refuse rename/delete.
    pub persistent: bool,
    pub ttl_seconds: Option<i64>,
    pub sort_order: String,
    pub last_active_member_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Name reserved for the persistent, always-present team seeded on
/// first schema creation.
pub const ALWAYS_ON_TEAM_NAME: &str = "always-on";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamMember {
    pub team_id: Uuid,
    pub session_id: Uuid,
    pub added_at: DateTime<Utc>,
}

/// One row per namespace holding the namespace's notification/grouping
/// preferences.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserPreferences {
    pub namespace: String,
    pub ready_announcements: bool,
    pub permission_notifications: bool,
    pub error_notifications: bool,
    pub team_group_style: TeamGroupStyle,
    pub updated_at: DateTime<Utc>,
}

impl UserPreferences {
    pub fn defaults(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ready_announcements: true,
            permission_notifications: true,
            error_notifications: true,
            team_group_style: TeamGroupStyle::Flat,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TeamGroupStyle {
    Flat,
    Grouped,
}

/// Permission mode a runner resolves live (per tool call, never cached
/// at turn start) from a session's `agentState`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    Default,
    Plan,
    AcceptEdits,
    BypassPermissions,
}

/// Tool names that `acceptEdits` mode auto-approves without prompting.
pub const AUTO_APPROVED_EDIT_TOOLS: &[&str] =
    &["Edit", "Write", "MultiEdit", "NotebookEdit", "Update"];

impl PermissionMode {
    /// Whether a call to `tool` should be auto-approved without a
    /// pending-request round trip, under this mode.
    pub fn auto_approves(&self, tool: &str) -> bool {
        match self {
            PermissionMode::BypassPermissions => true,
            PermissionMode::AcceptEdits => AUTO_APPROVED_EDIT_TOOLS.contains(&tool),
            PermissionMode::Default | PermissionMode::Plan => false,
        }
    }
}

/// A tool-call permission prompt awaiting resolution, keyed by tool-call
/// id inside `Session::agent_state.requests`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingPermissionRequest {
    pub tool_call_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
    pub requested_at: DateTime<Utc>,
}

/// Result of resolving a pending permission request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PermissionResolution {
    Approved,
    Denied,
    Aborted,
}

/// The single authoritative derived status for a session, consumed by
/// every UI client. Priority: `waiting-for-permission > thinking > idle
/// > offline`; `active == false` always yields `Offline`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Offline,
    WaitingForPermission,
    Thinking,
    Idle,
}

impl SessionStatus {
    pub fn derive(active: bool, thinking: bool, pending_requests_count: u32) -> Self {
        if !active {
            return SessionStatus::Offline;
        }
        if pending_requests_count > 0 {
            SessionStatus::WaitingForPermission
        } else if thinking {
            SessionStatus::Thinking
        } else {
            SessionStatus::Idle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_priority_waiting_beats_thinking() {
        assert_eq!(
            SessionStatus::derive(true, true, 1),
            SessionStatus::WaitingForPermission
        );
    }

    #[test]
    fn status_offline_overrides_everything() {
        assert_eq!(SessionStatus::derive(false, true, 5), SessionStatus::Offline);
    }

    #[test]
    fn status_idle_when_nothing_pending() {
        assert_eq!(SessionStatus::derive(true, false, 0), SessionStatus::Idle);
    }

    #[test]
    fn accept_edits_auto_approves_only_edit_set() {
        assert!(PermissionMode::AcceptEdits.auto_approves("Write"));
        assert!(!PermissionMode::AcceptEdits.auto_approves("Bash"));
    }

    #[test]
    fn bypass_auto_approves_anything() {
        assert!(PermissionMode::BypassPermissions.auto_approves("Bash"));
    }
}
