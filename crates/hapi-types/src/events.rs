//! The event sum type fanned out by `hapi_engine`'s `EventPublisher` to
//! socket and SSE subscribers.
//!
//! Grounded on `at-bridge/src/protocol.rs`'s `BridgeMessage`
//! (`#[serde(tag = "type", content = "payload")]`), replaced with the
//! single discriminated union SPEC_FULL.md §9 calls for in place of a
//! string-tagged record envelope: every subscriber pattern-matches
//! exhaustively instead of branching on a free-form `event_type` field.

use hapi_core::types::{Machine, Message, Session, Team, UserPreferences};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "kebab-case")]
pub enum Event {
    SessionUpdated {
        namespace: String,
        session: Box<Session>,
    },
    SessionRemoved {
        namespace: String,
        session_id: Uuid,
    },
    MessageAdded {
        namespace: String,
        session_id: Uuid,
        message: Box<Message>,
    },
    BeadsUpdated {
        namespace: String,
        session_id: Uuid,
        version: u64,
    },
    MachineUpdated {
        namespace: String,
        machine: Box<Machine>,
    },
    TeamUpdated {
        namespace: String,
        team: Box<Team>,
    },
    TeamRemoved {
        namespace: String,
        team_id: Uuid,
    },
    PreferencesUpdated {
        namespace: String,
        preferences: Box<UserPreferences>,
    },
}

impl Event {
    /// Every event carries the namespace it is scoped to — SSEManager
    /// uses this to filter subscribers without matching on variant.
    pub fn namespace(&self) -> &str {
        match self {
            Event::SessionUpdated { namespace, .. }
            | Event::SessionRemoved { namespace, .. }
            | Event::MessageAdded { namespace, .. }
            | Event::BeadsUpdated { namespace, .. }
            | Event::MachineUpdated { namespace, .. }
            | Event::TeamUpdated { namespace, .. }
            | Event::TeamRemoved { namespace, .. }
            | Event::PreferencesUpdated { namespace, .. } => namespace,
        }
    }

    /// The session this event should coalesce on for back-pressure
    /// purposes, if any (`SessionUpdated` is the only variant the
    /// spec requires coalescing for — stale spinner states are the
    /// risk, not stale messages or bead snapshots).
    pub fn coalesce_key(&self) -> Option<Uuid> {
        match self {
            Event::SessionUpdated { session, .. } => Some(session.id),
            _ => None,
        }
    }

    /// SSE wire event name, used as the `event:` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::SessionUpdated { .. } => "session-updated",
            Event::SessionRemoved { .. } => "session-removed",
            Event::MessageAdded { .. } => "message-added",
            Event::BeadsUpdated { .. } => "beads-updated",
            Event::MachineUpdated { .. } => "machine-updated",
            Event::TeamUpdated { .. } => "team-updated",
            Event::TeamRemoved { .. } => "team-removed",
            Event::PreferencesUpdated { .. } => "preferences-updated",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_session(namespace: &str) -> Session {
        Session {
            id: Uuid::new_v4(),
            tag: "tag".into(),
            namespace: namespace.into(),
            machine_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            metadata: serde_json::json!({}),
            metadata_version: 0,
            agent_state: serde_json::json!({}),
            agent_state_version: 0,
            todos: serde_json::json!([]),
            todos_updated_at: None,
            active: true,
            active_at: None,
            seq: 1,
            sort_order: "V".into(),
            parent_session_id: None,
            accept_all_messages: false,
            thinking: false,
            thinking_activity: None,
        }
    }

    #[test]
    fn namespace_accessor_covers_every_variant() {
        let event = Event::SessionUpdated {
            namespace: "acme".into(),
            session: Box::new(sample_session("acme")),
        };
        assert_eq!(event.namespace(), "acme");
        assert_eq!(event.kind(), "session-updated");
    }

    #[test]
    fn session_updated_coalesces_on_session_id() {
        let session = sample_session("acme");
        let id = session.id;
        let event = Event::SessionUpdated { namespace: "acme".into(), session: Box::new(session) };
        assert_eq!(event.coalesce_key(), Some(id));
    }

    #[test]
    fn message_added_does_not_coalesce() {
        let event = Event::MessageAdded {
            namespace: "acme".into(),
            session_id: Uuid::new_v4(),
            message: Box::new(Message {
                id: Uuid::new_v4(),
                session_id: Uuid::new_v4(),
                content: serde_json::json!({"text": "hi"}),
                created_at: Utc::now(),
                seq: 1,
                local_id: None,
            }),
        };
        assert_eq!(event.coalesce_key(), None);
    }

    #[test]
    fn serializes_with_tag_and_payload_envelope() {
        let event = Event::SessionRemoved { namespace: "acme".into(), session_id: Uuid::new_v4() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "session-removed");
        assert!(json["payload"]["session_id"].is_string());
    }
}
