//! Durable, namespace-scoped, versioned persistence for sessions,
//! machines, messages, session-bead links/snapshots, teams, and
//! per-namespace preferences.
//!
//! Grounded on the connection/row-mapping idiom already used for the
//! teacher's bead/agent cache (`tokio_rusqlite::Connection`, `.call(move
//! |conn| {...}).await`, explicit row-to-struct mappers), generalized
//! with namespace guards, optimistic-concurrency version columns, and
//! `user_version`-keyed schema migrations.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::fractional_index;
use crate::types::{
    BeadSnapshot, Machine, Message, Session, SessionBeadLink, Team, TeamGroupStyle, TeamMember,
    UserPreferences, ALWAYS_ON_TEAM_NAME,
};

/// The maximum number of bead links a single session may hold
/// (spec.md §3 invariant on `SessionBeadLink`).
pub const MAX_BEAD_LINKS_PER_SESSION: usize = 10;

/// The schema version this build understands. A database whose
/// `user_version` exceeds this refuses to open (spec.md §3 invariant 8).
pub const CURRENT_SCHEMA_VERSION: i64 = 3;

pub struct Store {
    conn: Connection,
}

// ---------------------------------------------------------------------------
// Construction and migrations
// ---------------------------------------------------------------------------

impl Store {
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
            }
        }
        let fresh = !path.exists();
        let conn = Connection::open(path).await?;
        let store = Self { conn };
        store.migrate().await?;
        if fresh {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
            }
        }
        Ok(store)
    }

    pub async fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        let user_version: i64 = self
            .conn
            .call(|conn| Ok(conn.query_row("PRAGMA user_version", [], |r| r.get(0))?))
            .await?;

        if user_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::SchemaTooNew {
                found: user_version,
                expected: CURRENT_SCHEMA_VERSION,
            });
        }

        self.conn
            .call(move |conn| {
                conn.execute_batch(
                    "PRAGMA journal_mode=WAL;
                     PRAGMA synchronous=NORMAL;
                     PRAGMA busy_timeout=5000;
                     PRAGMA foreign_keys=ON;",
                )?;

                if user_version == 0 {
                    let has_legacy_tables: bool = conn
                        .query_row(
                            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='daemon_state')",
                            [],
                            |r| r.get(0),
                        )?;
                    let tx = conn.transaction()?;
                    if has_legacy_tables {
                        rename_legacy_daemon_state_tables(&tx)?;
                    }
                    create_current_schema(&tx)?;
                    ensure_always_on_team(&tx, "default")?;
                    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
                    tx.commit()?;
                } else {
                    for (from_version, step) in MIGRATIONS.iter() {
                        if user_version <= *from_version {
                            let tx = conn.transaction()?;
                            step(&tx).map_err(|e| {
                                rusqlite::Error::SqliteFailure(
                                    rusqlite::ffi::Error::new(1),
                                    Some(format!("migration from v{from_version} failed: {e}")),
                                )
                            })?;
                            tx.pragma_update(None, "user_version", from_version + 1)?;
                            tx.commit()?;
                        }
                    }
                }
                Ok(())
            })
            .await?;
        Ok(())
    }
}

type MigrationStep = fn(&rusqlite::Transaction) -> rusqlite::Result<()>;

/// One function per version step, keyed by the version migrated
/// *from*. The V2->V3 step is an intentional no-op, kept only for
/// version-number continuity (spec.md §9 Open Question (b)).
static MIGRATIONS: &[(i64, MigrationStep)] = &[(1, migrate_v1_to_v2), (2, migrate_v2_to_v3)];

fn migrate_v1_to_v2(tx: &rusqlite::Transaction) -> rusqlite::Result<()> {
    tx.execute_batch(
        "ALTER TABLE sessions ADD COLUMN accept_all_messages INTEGER NOT NULL DEFAULT 0;",
    )
}

fn migrate_v2_to_v3(_tx: &rusqlite::Transaction) -> rusqlite::Result<()> {
    Ok(())
}

fn rename_legacy_daemon_state_tables(tx: &rusqlite::Transaction) -> rusqlite::Result<()> {
    let names: Vec<String> = {
        let mut stmt = tx.prepare(
            "SELECT name FROM sqlite_master WHERE type='table' AND name LIKE 'daemon_state%'",
        )?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };
    for name in names {
        let new_name = name.replacen("daemon_state", "runner_state", 1);
        tx.execute(&format!("ALTER TABLE {name} RENAME TO {new_name}"), [])?;
    }
    Ok(())
}

fn create_current_schema(tx: &rusqlite::Transaction) -> rusqlite::Result<()> {
    tx.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sessions (
            id                   TEXT PRIMARY KEY,
            tag                  TEXT NOT NULL,
            namespace            TEXT NOT NULL,
            machine_id           TEXT,
            created_at           TEXT NOT NULL,
            updated_at           TEXT NOT NULL,
            metadata             TEXT NOT NULL,
            metadata_version     INTEGER NOT NULL DEFAULT 0,
            agent_state          TEXT NOT NULL,
            agent_state_version  INTEGER NOT NULL DEFAULT 0,
            todos                TEXT NOT NULL,
            todos_updated_at     TEXT,
            active               INTEGER NOT NULL DEFAULT 0,
            active_at            TEXT,
            seq                  INTEGER NOT NULL DEFAULT 0,
            sort_order           TEXT NOT NULL,
            parent_session_id    TEXT,
            accept_all_messages  INTEGER NOT NULL DEFAULT 0,
            UNIQUE(tag, namespace)
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_namespace ON sessions(namespace);
        CREATE INDEX IF NOT EXISTS idx_sessions_machine ON sessions(machine_id);

        CREATE TABLE IF NOT EXISTS machines (
            id                     TEXT PRIMARY KEY,
            namespace              TEXT NOT NULL,
            metadata               TEXT NOT NULL,
            metadata_version       INTEGER NOT NULL DEFAULT 0,
            runner_state           TEXT NOT NULL,
            runner_state_version   INTEGER NOT NULL DEFAULT 0,
            active                 INTEGER NOT NULL DEFAULT 0,
            active_at              TEXT,
            seq                    INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_machines_namespace ON machines(namespace);

        CREATE TABLE IF NOT EXISTS messages (
            id          TEXT PRIMARY KEY,
            session_id  TEXT NOT NULL,
            content     TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            seq         INTEGER NOT NULL,
            local_id    TEXT,
            UNIQUE(session_id, local_id)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, seq);

        CREATE TABLE IF NOT EXISTS session_bead_links (
            session_id TEXT NOT NULL,
            bead_id    TEXT NOT NULL,
            linked_at  TEXT NOT NULL,
            linked_by  TEXT,
            PRIMARY KEY (session_id, bead_id)
        );

        CREATE TABLE IF NOT EXISTS bead_snapshots (
            session_id TEXT NOT NULL,
            bead_id    TEXT NOT NULL,
            data       TEXT NOT NULL,
            fetched_at TEXT NOT NULL,
            PRIMARY KEY (session_id, bead_id)
        );

        CREATE TABLE IF NOT EXISTS teams (
            id                      TEXT PRIMARY KEY,
            namespace               TEXT NOT NULL,
            name                    TEXT NOT NULL,
            color                   TEXT,
            persistent              INTEGER NOT NULL DEFAULT 0,
            ttl_seconds             INTEGER,
            sort_order              TEXT NOT NULL,
            last_active_member_at   TEXT,
            created_by              TEXT,
            created_at              TEXT NOT NULL,
            UNIQUE(name, namespace)
        );
        CREATE INDEX IF NOT EXISTS idx_teams_namespace ON teams(namespace);

        CREATE TABLE IF NOT EXISTS team_members (
            team_id    TEXT NOT NULL,
            session_id TEXT NOT NULL UNIQUE,
            added_at   TEXT NOT NULL,
            PRIMARY KEY (team_id, session_id)
        );

        CREATE TABLE IF NOT EXISTS user_preferences (
            namespace                TEXT PRIMARY KEY,
            ready_announcements      INTEGER NOT NULL DEFAULT 1,
            permission_notifications INTEGER NOT NULL DEFAULT 1,
            error_notifications      INTEGER NOT NULL DEFAULT 1,
            team_group_style         TEXT NOT NULL DEFAULT 'flat',
            updated_at               TEXT NOT NULL
        );
        ",
    )
}

/// Every namespace must have exactly one always-on team (spec.md §3).
/// Called both at migration time (for the `"default"` namespace, which
/// exists before any session/machine ever does) and on first touch of
/// any other namespace in `get_or_create_session`/`get_or_create_machine`
/// — `INSERT OR IGNORE` against `teams`' `UNIQUE(name, namespace)`
/// constraint makes repeat calls for an already-seeded namespace free.
fn ensure_always_on_team(conn: &rusqlite::Connection, namespace: &str) -> rusqlite::Result<()> {
    let now = Utc::now().to_rfc3339();
    let id = Uuid::new_v4().to_string();
    let sort_order = fractional_index::key_between(None, None);
    conn.execute(
        "INSERT OR IGNORE INTO teams (id, namespace, name, color, persistent, ttl_seconds,
            sort_order, last_active_member_at, created_by, created_at)
         VALUES (?1, ?2, ?3, NULL, 1, NULL, ?4, NULL, NULL, ?5)",
        rusqlite::params![id, namespace, ALWAYS_ON_TEAM_NAME, sort_order, now],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

impl Store {
    pub async fn get_or_create_session(
        &self,
        tag: &str,
        namespace: &str,
        metadata: Option<serde_json::Value>,
        agent_state: Option<serde_json::Value>,
        parent_session_id: Option<Uuid>,
    ) -> StoreResult<Session> {
        let tag = tag.to_string();
        let namespace = namespace.to_string();
        let metadata = metadata.unwrap_or(serde_json::json!({}));
        let agent_state = agent_state.unwrap_or(serde_json::json!({}));
        self.conn
            .call(move |conn| {
                if let Some(existing) = find_session_by_tag(conn, &tag, &namespace)? {
                    return Ok(existing);
                }
                ensure_always_on_team(conn, &namespace)?;
                let id = Uuid::new_v4();
                let now = Utc::now();
                let top_key: Option<String> = conn
                    .query_row(
                        "SELECT sort_order FROM sessions WHERE namespace = ?1 ORDER BY sort_order ASC LIMIT 1",
                        rusqlite::params![namespace],
                        |r| r.get(0),
                    )
                    .optional()?;
                let sort_order = fractional_index::key_between(None, top_key.as_deref());
                conn.execute(
                    "INSERT INTO sessions (id, tag, namespace, machine_id, created_at, updated_at,
                        metadata, metadata_version, agent_state, agent_state_version, todos,
                        todos_updated_at, active, active_at, seq, sort_order, parent_session_id,
                        accept_all_messages)
                     VALUES (?1,?2,?3,NULL,?4,?4,?5,0,?6,0,'[]',NULL,0,NULL,0,?7,?8,0)",
                    rusqlite::params![
                        id.to_string(),
                        tag,
                        namespace,
                        now.to_rfc3339(),
                        metadata.to_string(),
                        agent_state.to_string(),
                        sort_order,
                        parent_session_id.map(|p| p.to_string()),
                    ],
                )?;
                find_session_by_id(conn, id, None)?.ok_or_else(|| {
                    rusqlite::Error::QueryReturnedNoRows
                })
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn get_session(&self, id: Uuid, namespace: &str) -> StoreResult<Session> {
        let namespace = namespace.to_string();
        self.conn
            .call(move |conn| match find_session_by_id(conn, id, Some(&namespace))? {
                Some(s) => Ok(Ok(s)),
                None => Ok(Err(session_not_found_or_denied(conn, id, &namespace)?)),
            })
            .await?
            .map_err(StoreError::from)
            .and_then(|r| r)
    }

    pub async fn list_sessions(&self, namespace: &str, active_only: bool) -> StoreResult<Vec<Session>> {
        let namespace = namespace.to_string();
        self.conn
            .call(move |conn| {
                let sql = if active_only {
                    format!("{SESSION_COLUMNS} FROM sessions WHERE namespace = ?1 AND active = 1 ORDER BY sort_order ASC")
                } else {
                    format!("{SESSION_COLUMNS} FROM sessions WHERE namespace = ?1 ORDER BY sort_order ASC")
                };
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params![namespace], row_to_session)?;
                rows.collect()
            })
            .await
            .map_err(StoreError::from)
    }

    /// `updateSessionMetadata` / `updateSessionAgentState`. `field` is
    /// `"metadata"` or `"agent_state"`.
    pub async fn update_session_versioned_field(
        &self,
        id: Uuid,
        namespace: &str,
        field: SessionVersionedField,
        value: serde_json::Value,
        expected_version: i64,
    ) -> StoreResult<VersionedUpdateOutcome> {
        let namespace = namespace.to_string();
        self.conn
            .call(move |conn| {
                let (column, version_column) = field.columns();
                let current: Option<(String, i64)> = conn
                    .query_row(
                        &format!("SELECT {column}, {version_column} FROM sessions WHERE id = ?1 AND namespace = ?2"),
                        rusqlite::params![id.to_string(), namespace],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .optional()?;
                let Some((current_raw, current_version)) = current else {
                    return Ok(VersionedUpdateOutcome::NotFoundOrDenied);
                };
                if current_version != expected_version {
                    let current_value: serde_json::Value =
                        serde_json::from_str(&current_raw).unwrap_or(serde_json::Value::Null);
                    return Ok(VersionedUpdateOutcome::VersionMismatch {
                        current_version,
                        current_value,
                    });
                }
                let new_version = current_version + 1;
                let now = Utc::now().to_rfc3339();
                conn.execute(
                    &format!(
                        "UPDATE sessions SET {column} = ?1, {version_column} = ?2, updated_at = ?3, seq = seq + 1
                         WHERE id = ?4 AND namespace = ?5 AND {version_column} = ?6"
                    ),
                    rusqlite::params![
                        value.to_string(),
                        new_version,
                        now,
                        id.to_string(),
                        namespace,
                        expected_version,
                    ],
                )?;
                Ok(VersionedUpdateOutcome::Success { version: new_version })
            })
            .await
            .map_err(StoreError::from)
    }

    /// Rejects strictly-older-or-equal timestamps; bumps `seq` on success.
    pub async fn set_session_todos(
        &self,
        id: Uuid,
        namespace: &str,
        todos: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let namespace = namespace.to_string();
        self.conn
            .call(move |conn| {
                let current: Option<Option<String>> = conn
                    .query_row(
                        "SELECT todos_updated_at FROM sessions WHERE id = ?1 AND namespace = ?2",
                        rusqlite::params![id.to_string(), namespace],
                        |r| r.get(0),
                    )
                    .optional()?;
                let Some(current_ts) = current else {
                    return Ok(false);
                };
                if let Some(ts) = current_ts {
                    let existing = DateTime::parse_from_rfc3339(&ts).expect("valid date").with_timezone(&Utc);
                    if timestamp <= existing {
                        return Ok(false);
                    }
                }
                conn.execute(
                    "UPDATE sessions SET todos = ?1, todos_updated_at = ?2, seq = seq + 1
                     WHERE id = ?3 AND namespace = ?4",
                    rusqlite::params![todos.to_string(), timestamp.to_rfc3339(), id.to_string(), namespace],
                )?;
                Ok(true)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Does NOT bump `updated_at` — reordering is a UI concern, not a
    /// content change.
    pub async fn update_session_sort_order(
        &self,
        id: Uuid,
        namespace: &str,
        sort_order: String,
    ) -> StoreResult<bool> {
        let namespace = namespace.to_string();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE sessions SET sort_order = ?1 WHERE id = ?2 AND namespace = ?3",
                    rusqlite::params![sort_order, id.to_string(), namespace],
                )?;
                Ok(n > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn set_parent_session_id(
        &self,
        id: Uuid,
        namespace: &str,
        parent: Option<Uuid>,
    ) -> StoreResult<bool> {
        let namespace = namespace.to_string();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE sessions SET parent_session_id = ?1 WHERE id = ?2 AND namespace = ?3",
                    rusqlite::params![parent.map(|p| p.to_string()), id.to_string(), namespace],
                )?;
                Ok(n > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Associates a session with the machine whose runner spawned it.
    /// Called once by the Coordinator right after a successful
    /// `spawn-happy-session` RPC; never reassigned afterwards.
    pub async fn set_session_machine(
        &self,
        id: Uuid,
        namespace: &str,
        machine_id: Uuid,
    ) -> StoreResult<bool> {
        let namespace = namespace.to_string();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE sessions SET machine_id = ?1 WHERE id = ?2 AND namespace = ?3",
                    rusqlite::params![machine_id.to_string(), id.to_string(), namespace],
                )?;
                Ok(n > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn set_accept_all_messages(
        &self,
        id: Uuid,
        namespace: &str,
        accept: bool,
    ) -> StoreResult<bool> {
        let namespace = namespace.to_string();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE sessions SET accept_all_messages = ?1 WHERE id = ?2 AND namespace = ?3",
                    rusqlite::params![accept, id.to_string(), namespace],
                )?;
                Ok(n > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Marks a session active/inactive, updating `active_at`
    /// appropriately. Used by `SessionCache` transitions.
    pub async fn set_session_active(
        &self,
        id: Uuid,
        namespace: &str,
        active: bool,
    ) -> StoreResult<bool> {
        let namespace = namespace.to_string();
        self.conn
            .call(move |conn| {
                let n = if active {
                    conn.execute(
                        "UPDATE sessions SET active = 1, active_at = ?1, seq = seq + 1
                         WHERE id = ?2 AND namespace = ?3",
                        rusqlite::params![Utc::now().to_rfc3339(), id.to_string(), namespace],
                    )?
                } else {
                    conn.execute(
                        "UPDATE sessions SET active = 0, seq = seq + 1 WHERE id = ?1 AND namespace = ?2",
                        rusqlite::params![id.to_string(), namespace],
                    )?
                };
                Ok(n > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// A session can only be deleted when inactive; deletion cascades
    /// to messages and bead data.
    pub async fn delete_session(&self, id: Uuid, namespace: &str) -> StoreResult<()> {
        let namespace = namespace.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                delete_one_session(&tx, id, &namespace)?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Atomic: either every id is deleted or none are.
    pub async fn delete_session_batch(&self, ids: Vec<Uuid>, namespace: &str) -> StoreResult<usize> {
        let namespace = namespace.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut deleted = 0;
                for id in &ids {
                    delete_one_session(&tx, *id, &namespace)?;
                    deleted += 1;
                }
                tx.commit()?;
                Ok(deleted)
            })
            .await
            .map_err(StoreError::from)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SessionVersionedField {
    Metadata,
    AgentState,
}

impl SessionVersionedField {
    fn columns(&self) -> (&'static str, &'static str) {
        match self {
            SessionVersionedField::Metadata => ("metadata", "metadata_version"),
            SessionVersionedField::AgentState => ("agent_state", "agent_state_version"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum VersionedUpdateOutcome {
    Success { version: i64 },
    VersionMismatch { current_version: i64, current_value: serde_json::Value },
    NotFoundOrDenied,
}

fn delete_one_session(tx: &rusqlite::Transaction, id: Uuid, namespace: &str) -> rusqlite::Result<()> {
    let id_str = id.to_string();
    tx.execute(
        "DELETE FROM messages WHERE session_id = ?1 AND session_id IN
            (SELECT id FROM sessions WHERE id = ?1 AND namespace = ?2)",
        rusqlite::params![id_str, namespace],
    )?;
    tx.execute(
        "DELETE FROM session_bead_links WHERE session_id = ?1",
        rusqlite::params![id_str],
    )?;
    tx.execute(
        "DELETE FROM bead_snapshots WHERE session_id = ?1",
        rusqlite::params![id_str],
    )?;
    tx.execute(
        "DELETE FROM team_members WHERE session_id = ?1",
        rusqlite::params![id_str],
    )?;
    tx.execute(
        "DELETE FROM sessions WHERE id = ?1 AND namespace = ?2 AND active = 0",
        rusqlite::params![id_str, namespace],
    )?;
    Ok(())
}

const SESSION_COLUMNS: &str = "SELECT id, tag, namespace, machine_id, created_at, updated_at,
    metadata, metadata_version, agent_state, agent_state_version, todos, todos_updated_at,
    active, active_at, seq, sort_order, parent_session_id, accept_all_messages";

fn find_session_by_tag(conn: &rusqlite::Connection, tag: &str, namespace: &str) -> rusqlite::Result<Option<Session>> {
    conn.query_row(
        &format!("{SESSION_COLUMNS} FROM sessions WHERE tag = ?1 AND namespace = ?2"),
        rusqlite::params![tag, namespace],
        row_to_session,
    )
    .optional()
}

fn find_session_by_id(conn: &rusqlite::Connection, id: Uuid, namespace: Option<&str>) -> rusqlite::Result<Option<Session>> {
    match namespace {
        Some(ns) => conn
            .query_row(
                &format!("{SESSION_COLUMNS} FROM sessions WHERE id = ?1 AND namespace = ?2"),
                rusqlite::params![id.to_string(), ns],
                row_to_session,
            )
            .optional(),
        None => conn
            .query_row(
                &format!("{SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                rusqlite::params![id.to_string()],
                row_to_session,
            )
            .optional(),
    }
}

/// Distinguishes `not-found` (absent in any namespace) from
/// `access-denied` (present, but in a different namespace) — spec.md
/// §7 requires the HTTP facade tell these apart.
fn session_not_found_or_denied(conn: &rusqlite::Connection, id: Uuid, namespace: &str) -> rusqlite::Result<StoreError> {
    let exists_elsewhere: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?1 AND namespace != ?2)",
        rusqlite::params![id.to_string(), namespace],
        |r| r.get(0),
    )?;
    Ok(if exists_elsewhere {
        StoreError::AccessDenied
    } else {
        StoreError::NotFound
    })
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    let id: String = row.get(0)?;
    let machine_id: Option<String> = row.get(3)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    let metadata: String = row.get(6)?;
    let agent_state: String = row.get(8)?;
    let todos: String = row.get(10)?;
    let todos_updated_at: Option<String> = row.get(11)?;
    let active_at: Option<String> = row.get(13)?;
    let parent_session_id: Option<String> = row.get(16)?;
    Ok(Session {
        id: Uuid::parse_str(&id).expect("valid uuid"),
        tag: row.get(1)?,
        namespace: row.get(2)?,
        machine_id: machine_id.map(|s| Uuid::parse_str(&s).expect("valid uuid")),
        created_at: parse_rfc3339(&created_at),
        updated_at: parse_rfc3339(&updated_at),
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        metadata_version: row.get(7)?,
        agent_state: serde_json::from_str(&agent_state).unwrap_or(serde_json::Value::Null),
        agent_state_version: row.get(9)?,
        todos: serde_json::from_str(&todos).unwrap_or(serde_json::Value::Array(vec![])),
        todos_updated_at: todos_updated_at.map(|s| parse_rfc3339(&s)),
        active: row.get::<_, i64>(12)? != 0,
        active_at: active_at.map(|s| parse_rfc3339(&s)),
        seq: row.get(14)?,
        sort_order: row.get(15)?,
        parent_session_id: parent_session_id.map(|s| Uuid::parse_str(&s).expect("valid uuid")),
        accept_all_messages: row.get::<_, i64>(17)? != 0,
        thinking: false,
        thinking_activity: None,
    })
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).expect("valid date").with_timezone(&Utc)
}

// ---------------------------------------------------------------------------
// Machines
// ---------------------------------------------------------------------------

const MACHINE_COLUMNS: &str = "SELECT id, namespace, metadata, metadata_version, runner_state,
    runner_state_version, active, active_at, seq";

impl Store {
    pub async fn get_or_create_machine(
        &self,
        id: Uuid,
        namespace: &str,
        metadata: serde_json::Value,
        runner_state: serde_json::Value,
    ) -> StoreResult<Machine> {
        let namespace = namespace.to_string();
        self.conn
            .call(move |conn| {
                if let Some(existing) = find_machine(conn, id, None)? {
                    if existing.namespace != namespace {
                        return Ok(Err(StoreError::AccessDenied));
                    }
                    return Ok(Ok(existing));
                }
                ensure_always_on_team(conn, &namespace)?;
                conn.execute(
                    "INSERT INTO machines (id, namespace, metadata, metadata_version, runner_state,
                        runner_state_version, active, active_at, seq)
                     VALUES (?1,?2,?3,0,?4,0,0,NULL,0)",
                    rusqlite::params![id.to_string(), namespace, metadata.to_string(), runner_state.to_string()],
                )?;
                Ok(Ok(find_machine(conn, id, Some(&namespace))?.expect("just inserted")))
            })
            .await?
            .map_err(Into::into)
    }

    pub async fn get_machine(&self, id: Uuid, namespace: &str) -> StoreResult<Machine> {
        let namespace = namespace.to_string();
        self.conn
            .call(move |conn| match find_machine(conn, id, Some(&namespace))? {
                Some(m) => Ok(Ok(m)),
                None => {
                    let exists_elsewhere: bool = conn.query_row(
                        "SELECT EXISTS(SELECT 1 FROM machines WHERE id = ?1 AND namespace != ?2)",
                        rusqlite::params![id.to_string(), namespace],
                        |r| r.get(0),
                    )?;
                    Ok(Err(if exists_elsewhere { StoreError::AccessDenied } else { StoreError::NotFound }))
                }
            })
            .await?
            .map_err(Into::into)
    }

    pub async fn list_machines(&self, namespace: &str) -> StoreResult<Vec<Machine>> {
        let namespace = namespace.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{MACHINE_COLUMNS} FROM machines WHERE namespace = ?1"))?;
                let rows = stmt.query_map(rusqlite::params![namespace], row_to_machine)?;
                rows.collect()
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn update_machine_runner_state(
        &self,
        id: Uuid,
        namespace: &str,
        value: serde_json::Value,
        expected_version: i64,
    ) -> StoreResult<VersionedUpdateOutcome> {
        let namespace = namespace.to_string();
        self.conn
            .call(move |conn| {
                let current: Option<(String, i64)> = conn
                    .query_row(
                        "SELECT runner_state, runner_state_version FROM machines WHERE id = ?1 AND namespace = ?2",
                        rusqlite::params![id.to_string(), namespace],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .optional()?;
                let Some((current_raw, current_version)) = current else {
                    return Ok(VersionedUpdateOutcome::NotFoundOrDenied);
                };
                if current_version != expected_version {
                    let current_value: serde_json::Value =
                        serde_json::from_str(&current_raw).unwrap_or(serde_json::Value::Null);
                    return Ok(VersionedUpdateOutcome::VersionMismatch { current_version, current_value });
                }
                let new_version = current_version + 1;
                conn.execute(
                    "UPDATE machines SET runner_state = ?1, runner_state_version = ?2, seq = seq + 1
                     WHERE id = ?3 AND namespace = ?4 AND runner_state_version = ?5",
                    rusqlite::params![value.to_string(), new_version, id.to_string(), namespace, expected_version],
                )?;
                Ok(VersionedUpdateOutcome::Success { version: new_version })
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn set_machine_active(&self, id: Uuid, namespace: &str, active: bool) -> StoreResult<bool> {
        let namespace = namespace.to_string();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE machines SET active = ?1, active_at = ?2, seq = seq + 1 WHERE id = ?3 AND namespace = ?4",
                    rusqlite::params![active, Utc::now().to_rfc3339(), id.to_string(), namespace],
                )?;
                Ok(n > 0)
            })
            .await
            .map_err(StoreError::from)
    }
}

fn find_machine(conn: &rusqlite::Connection, id: Uuid, namespace: Option<&str>) -> rusqlite::Result<Option<Machine>> {
    match namespace {
        Some(ns) => conn
            .query_row(&format!("{MACHINE_COLUMNS} FROM machines WHERE id = ?1 AND namespace = ?2"), rusqlite::params![id.to_string(), ns], row_to_machine)
            .optional(),
        None => conn
            .query_row(&format!("{MACHINE_COLUMNS} FROM machines WHERE id = ?1"), rusqlite::params![id.to_string()], row_to_machine)
            .optional(),
    }
}

fn row_to_machine(row: &rusqlite::Row) -> rusqlite::Result<Machine> {
    let id: String = row.get(0)?;
    let metadata: String = row.get(2)?;
    let runner_state: String = row.get(4)?;
    let active_at: Option<String> = row.get(7)?;
    Ok(Machine {
        id: Uuid::parse_str(&id).expect("valid uuid"),
        namespace: row.get(1)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        metadata_version: row.get(3)?,
        runner_state: serde_json::from_str(&runner_state).unwrap_or(serde_json::Value::Null),
        runner_state_version: row.get(5)?,
        active: row.get::<_, i64>(6)? != 0,
        active_at: active_at.map(|s| parse_rfc3339(&s)),
        seq: row.get(8)?,
    })
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

impl Store {
    /// Idempotent on `local_id`: a repeat insert with the same
    /// `(session_id, local_id)` returns the original row unchanged.
    pub async fn add_message(
        &self,
        session_id: Uuid,
        content: serde_json::Value,
        local_id: Option<String>,
    ) -> StoreResult<Message> {
        self.conn
            .call(move |conn| {
                if let Some(ref lid) = local_id {
                    if let Some(existing) = conn
                        .query_row(
                            "SELECT id, session_id, content, created_at, seq, local_id
                             FROM messages WHERE session_id = ?1 AND local_id = ?2",
                            rusqlite::params![session_id.to_string(), lid],
                            row_to_message,
                        )
                        .optional()?
                    {
                        return Ok(existing);
                    }
                }
                let next_seq: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE session_id = ?1",
                    rusqlite::params![session_id.to_string()],
                    |r| r.get(0),
                )?;
                let id = Uuid::new_v4();
                let now = Utc::now();
                conn.execute(
                    "INSERT INTO messages (id, session_id, content, created_at, seq, local_id)
                     VALUES (?1,?2,?3,?4,?5,?6)",
                    rusqlite::params![id.to_string(), session_id.to_string(), content.to_string(), now.to_rfc3339(), next_seq, local_id],
                )?;
                conn.execute("UPDATE sessions SET seq = seq + 1 WHERE id = ?1", rusqlite::params![session_id.to_string()])?;
                Ok(Message { id, session_id, content, created_at: now, seq: next_seq, local_id })
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn get_messages(&self, session_id: Uuid, after_seq: i64, limit: i64) -> StoreResult<Vec<Message>> {
        let limit = limit.clamp(1, 200);
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, session_id, content, created_at, seq, local_id
                     FROM messages WHERE session_id = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3",
                )?;
                let rows = stmt.query_map(rusqlite::params![session_id.to_string(), after_seq, limit], row_to_message)?;
                rows.collect()
            })
            .await
            .map_err(StoreError::from)
    }

    /// Moves every message from `from` into `to` with contiguous `seq`
    /// continuing `to`'s current max; collided `local_id`s in the
    /// moved set become NULL.
    pub async fn merge_session_messages(&self, from: Uuid, to: Uuid) -> StoreResult<MergeMessagesResult> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let old_max_seq: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(seq), 0) FROM messages WHERE session_id = ?1",
                    rusqlite::params![to.to_string()],
                    |r| r.get(0),
                )?;
                let moving: Vec<(String, Option<String>)> = {
                    let mut stmt = tx.prepare(
                        "SELECT id, local_id FROM messages WHERE session_id = ?1 ORDER BY seq ASC",
                    )?;
                    let rows = stmt.query_map(rusqlite::params![from.to_string()], |r| Ok((r.get(0)?, r.get(1)?)))?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                };
                let mut moved = 0usize;
                let mut next_seq = old_max_seq;
                for (msg_id, local_id) in &moving {
                    next_seq += 1;
                    let collides = if let Some(lid) = local_id {
                        let exists: bool = tx.query_row(
                            "SELECT EXISTS(SELECT 1 FROM messages WHERE session_id = ?1 AND local_id = ?2)",
                            rusqlite::params![to.to_string(), lid],
                            |r| r.get(0),
                        )?;
                        exists
                    } else {
                        false
                    };
                    if collides {
                        tx.execute(
                            "UPDATE messages SET session_id = ?1, seq = ?2, local_id = NULL WHERE id = ?3",
                            rusqlite::params![to.to_string(), next_seq, msg_id],
                        )?;
                    } else {
                        tx.execute(
                            "UPDATE messages SET session_id = ?1, seq = ?2 WHERE id = ?3",
                            rusqlite::params![to.to_string(), next_seq, msg_id],
                        )?;
                    }
                    moved += 1;
                }
                tx.commit()?;
                Ok(MergeMessagesResult { moved, old_max_seq, new_max_seq: next_seq })
            })
            .await
            .map_err(StoreError::from)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MergeMessagesResult {
    pub moved: usize,
    pub old_max_seq: i64,
    pub new_max_seq: i64,
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let id: String = row.get(0)?;
    let session_id: String = row.get(1)?;
    let content: String = row.get(2)?;
    let created_at: String = row.get(3)?;
    Ok(Message {
        id: Uuid::parse_str(&id).expect("valid uuid"),
        session_id: Uuid::parse_str(&session_id).expect("valid uuid"),
        content: serde_json::from_str(&content).unwrap_or(serde_json::Value::Null),
        created_at: parse_rfc3339(&created_at),
        seq: row.get(4)?,
        local_id: row.get(5)?,
    })
}

// ---------------------------------------------------------------------------
// Session <-> Bead links and snapshots
// ---------------------------------------------------------------------------

impl Store {
    pub async fn link_bead(&self, session_id: Uuid, bead_id: String, linked_by: Option<String>) -> StoreResult<()> {
        self.conn
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM session_bead_links WHERE session_id = ?1",
                    rusqlite::params![session_id.to_string()],
                    |r| r.get(0),
                )?;
                if count as usize >= MAX_BEAD_LINKS_PER_SESSION {
                    return Ok(Err(StoreError::Conflict("session already has the maximum number of linked beads".into())));
                }
                conn.execute(
                    "INSERT OR IGNORE INTO session_bead_links (session_id, bead_id, linked_at, linked_by)
                     VALUES (?1,?2,?3,?4)",
                    rusqlite::params![session_id.to_string(), bead_id, Utc::now().to_rfc3339(), linked_by],
                )?;
                Ok(Ok(()))
            })
            .await?
            .map_err(Into::into)
    }

    /// Unlinking also removes the session's snapshot of that bead.
    pub async fn unlink_bead(&self, session_id: Uuid, bead_id: String) -> StoreResult<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM session_bead_links WHERE session_id = ?1 AND bead_id = ?2",
                    rusqlite::params![session_id.to_string(), bead_id],
                )?;
                tx.execute(
                    "DELETE FROM bead_snapshots WHERE session_id = ?1 AND bead_id = ?2",
                    rusqlite::params![session_id.to_string(), bead_id],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn list_session_beads(&self, session_id: Uuid) -> StoreResult<Vec<SessionBeadLink>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, bead_id, linked_at, linked_by FROM session_bead_links WHERE session_id = ?1",
                )?;
                let rows = stmt.query_map(rusqlite::params![session_id.to_string()], row_to_bead_link)?;
                rows.collect()
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn get_bead_snapshots(&self, session_id: Uuid) -> StoreResult<Vec<BeadSnapshot>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, bead_id, data, fetched_at FROM bead_snapshots WHERE session_id = ?1",
                )?;
                let rows = stmt.query_map(rusqlite::params![session_id.to_string()], row_to_bead_snapshot)?;
                rows.collect()
            })
            .await
            .map_err(StoreError::from)
    }

    /// Returns `true` iff the payload actually changed; an identical
    /// payload only refreshes `fetched_at` and returns `false`.
    pub async fn save_snapshot(&self, session_id: Uuid, bead_id: String, data: serde_json::Value) -> StoreResult<bool> {
        self.conn
            .call(move |conn| {
                let existing: Option<String> = conn
                    .query_row(
                        "SELECT data FROM bead_snapshots WHERE session_id = ?1 AND bead_id = ?2",
                        rusqlite::params![session_id.to_string(), bead_id],
                        |r| r.get(0),
                    )
                    .optional()?;
                let data_str = data.to_string();
                let changed = existing.as_deref() != Some(data_str.as_str());
                conn.execute(
                    "INSERT INTO bead_snapshots (session_id, bead_id, data, fetched_at)
                     VALUES (?1,?2,?3,?4)
                     ON CONFLICT(session_id, bead_id) DO UPDATE SET
                        data = excluded.data, fetched_at = excluded.fetched_at",
                    rusqlite::params![session_id.to_string(), bead_id, data_str, Utc::now().to_rfc3339()],
                )?;
                Ok(changed)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Collision-safe: links/snapshots already on `to` are preserved;
    /// only `from`'s links that don't already exist on `to` are moved.
    pub async fn reassign_session_beads(&self, from: Uuid, to: Uuid) -> StoreResult<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT OR IGNORE INTO session_bead_links (session_id, bead_id, linked_at, linked_by)
                     SELECT ?1, bead_id, linked_at, linked_by FROM session_bead_links WHERE session_id = ?2",
                    rusqlite::params![to.to_string(), from.to_string()],
                )?;
                tx.execute(
                    "INSERT OR IGNORE INTO bead_snapshots (session_id, bead_id, data, fetched_at)
                     SELECT ?1, bead_id, data, fetched_at FROM bead_snapshots WHERE session_id = ?2",
                    rusqlite::params![to.to_string(), from.to_string()],
                )?;
                tx.execute("DELETE FROM session_bead_links WHERE session_id = ?1", rusqlite::params![from.to_string()])?;
                tx.execute("DELETE FROM bead_snapshots WHERE session_id = ?1", rusqlite::params![from.to_string()])?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }
}

fn row_to_bead_link(row: &rusqlite::Row) -> rusqlite::Result<SessionBeadLink> {
    let session_id: String = row.get(0)?;
    let linked_at: String = row.get(2)?;
    Ok(SessionBeadLink {
        session_id: Uuid::parse_str(&session_id).expect("valid uuid"),
        bead_id: row.get(1)?,
        linked_at: parse_rfc3339(&linked_at),
        linked_by: row.get(3)?,
    })
}

fn row_to_bead_snapshot(row: &rusqlite::Row) -> rusqlite::Result<BeadSnapshot> {
    let session_id: String = row.get(0)?;
    let data: String = row.get(2)?;
    let fetched_at: String = row.get(3)?;
    Ok(BeadSnapshot {
        session_id: Uuid::parse_str(&session_id).expect("valid uuid"),
        bead_id: row.get(1)?,
        data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
        fetched_at: parse_rfc3339(&fetched_at),
    })
}

// ---------------------------------------------------------------------------
// Teams
// ---------------------------------------------------------------------------

const TEAM_COLUMNS: &str = "SELECT id, namespace, name, color, persistent, ttl_seconds,
    sort_order, last_active_member_at, created_by, created_at";

impl Store {
    pub async fn create_team(
        &self,
        namespace: &str,
        name: String,
        color: Option<String>,
        ttl_seconds: Option<i64>,
        created_by: Option<String>,
    ) -> StoreResult<Team> {
        let namespace = namespace.to_string();
        self.conn
            .call(move |conn| {
                let bottom_key: Option<String> = conn
                    .query_row(
                        "SELECT sort_order FROM teams WHERE namespace = ?1 ORDER BY sort_order DESC LIMIT 1",
                        rusqlite::params![namespace],
                        |r| r.get(0),
                    )
                    .optional()?;
                let sort_order = fractional_index::key_between(bottom_key.as_deref(), None);
                let id = Uuid::new_v4();
                let now = Utc::now().to_rfc3339();
                let inserted = conn.execute(
                    "INSERT INTO teams (id, namespace, name, color, persistent, ttl_seconds,
                        sort_order, last_active_member_at, created_by, created_at)
                     VALUES (?1,?2,?3,?4,0,?5,?6,NULL,?7,?8)",
                    rusqlite::params![id.to_string(), namespace, name, color, ttl_seconds, sort_order, created_by, now],
                );
                match inserted {
                    Ok(_) => Ok(Ok(find_team(conn, id, Some(&namespace))?.expect("just inserted"))),
                    Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
                        Ok(Err(StoreError::Conflict(format!("team name '{name}' already exists in this namespace"))))
                    }
                    Err(e) => Err(e),
                }
            })
            .await?
            .map_err(Into::into)
    }

    pub async fn get_team(&self, id: Uuid, namespace: &str) -> StoreResult<Team> {
        let namespace = namespace.to_string();
        self.conn
            .call(move |conn| find_team(conn, id, Some(&namespace)))
            .await?
            .ok_or(StoreError::NotFound)
    }

    pub async fn list_teams(&self, namespace: &str) -> StoreResult<Vec<Team>> {
        let namespace = namespace.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{TEAM_COLUMNS} FROM teams WHERE namespace = ?1 ORDER BY sort_order ASC"))?;
                let rows = stmt.query_map(rusqlite::params![namespace], row_to_team)?;
                rows.collect()
            })
            .await
            .map_err(StoreError::from)
    }

    /// Renaming/deleting the persistent `always-on` team always fails.
    pub async fn update_team(&self, id: Uuid, namespace: &str, name: Option<String>, color: Option<String>) -> StoreResult<Team> {
        let namespace = namespace.to_string();
        self.conn
            .call(move |conn| {
                let team = find_team(conn, id, Some(&namespace))?.ok_or(rusqlite::Error::QueryReturnedNoRows);
                let team = match team {
                    Ok(t) => t,
                    Err(_) => return Ok(Err(StoreError::NotFound)),
                };
                if team.persistent && name.is_some() {
                    return Ok(Err(StoreError::Conflict("the always-on team cannot be renamed".into())));
                }
                let new_name = name.unwrap_or(team.name);
                let new_color = color.or(team.color);
                conn.execute(
                    "UPDATE teams SET name = ?1, color = ?2 WHERE id = ?3 AND namespace = ?4",
                    rusqlite::params![new_name, new_color, id.to_string(), namespace],
                )?;
                Ok(Ok(find_team(conn, id, Some(&namespace))?.expect("just updated")))
            })
            .await?
            .map_err(Into::into)
    }

    pub async fn delete_team(&self, id: Uuid, namespace: &str) -> StoreResult<()> {
        let namespace = namespace.to_string();
        self.conn
            .call(move |conn| {
                let team = find_team(conn, id, Some(&namespace))?;
                match team {
                    None => Ok(Err(StoreError::NotFound)),
                    Some(t) if t.persistent => Ok(Err(StoreError::Conflict("the always-on team cannot be deleted".into()))),
                    Some(_) => {
                        let tx = conn.transaction()?;
                        tx.execute("DELETE FROM team_members WHERE team_id = ?1", rusqlite::params![id.to_string()])?;
                        tx.execute("DELETE FROM teams WHERE id = ?1 AND namespace = ?2", rusqlite::params![id.to_string(), namespace])?;
                        tx.commit()?;
                        Ok(Ok(()))
                    }
                }
            })
            .await?
            .map_err(Into::into)
    }

    /// Fails if the session is already in any team.
    pub async fn add_team_member(&self, team_id: Uuid, session_id: Uuid) -> StoreResult<()> {
        self.conn
            .call(move |conn| {
                let already_in_team: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM team_members WHERE session_id = ?1)",
                    rusqlite::params![session_id.to_string()],
                    |r| r.get(0),
                )?;
                if already_in_team {
                    return Ok(Err(StoreError::Conflict("session already belongs to a team".into())));
                }
                conn.execute(
                    "INSERT INTO team_members (team_id, session_id, added_at) VALUES (?1,?2,?3)",
                    rusqlite::params![team_id.to_string(), session_id.to_string(), Utc::now().to_rfc3339()],
                )?;
                conn.execute(
                    "UPDATE teams SET last_active_member_at = ?1 WHERE id = ?2",
                    rusqlite::params![Utc::now().to_rfc3339(), team_id.to_string()],
                )?;
                Ok(Ok(()))
            })
            .await?
            .map_err(Into::into)
    }

    pub async fn remove_team_member(&self, team_id: Uuid, session_id: Uuid) -> StoreResult<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM team_members WHERE team_id = ?1 AND session_id = ?2",
                    rusqlite::params![team_id.to_string(), session_id.to_string()],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Non-persistent teams whose `last_active_member_at + ttl` is in
    /// the past, within `namespace`.
    pub async fn get_expired_temporary_teams(&self, namespace: &str, now: DateTime<Utc>) -> StoreResult<Vec<Team>> {
        let namespace = namespace.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{TEAM_COLUMNS} FROM teams WHERE namespace = ?1 AND persistent = 0
                     AND ttl_seconds IS NOT NULL AND last_active_member_at IS NOT NULL"
                ))?;
                let rows = stmt.query_map(rusqlite::params![namespace], row_to_team)?;
                let teams = rows.collect::<rusqlite::Result<Vec<Team>>>()?;
                Ok(teams
                    .into_iter()
                    .filter(|t| {
                        let last_active = t.last_active_member_at.unwrap();
                        let ttl = chrono::Duration::seconds(t.ttl_seconds.unwrap());
                        last_active + ttl < now
                    })
                    .collect::<Vec<_>>())
            })
            .await
            .map_err(StoreError::from)
    }
}

fn find_team(conn: &rusqlite::Connection, id: Uuid, namespace: Option<&str>) -> rusqlite::Result<Option<Team>> {
    match namespace {
        Some(ns) => conn
            .query_row(&format!("{TEAM_COLUMNS} FROM teams WHERE id = ?1 AND namespace = ?2"), rusqlite::params![id.to_string(), ns], row_to_team)
            .optional(),
        None => conn
            .query_row(&format!("{TEAM_COLUMNS} FROM teams WHERE id = ?1"), rusqlite::params![id.to_string()], row_to_team)
            .optional(),
    }
}

fn row_to_team(row: &rusqlite::Row) -> rusqlite::Result<Team> {
    let id: String = row.get(0)?;
    let last_active_member_at: Option<String> = row.get(7)?;
    let created_at: String = row.get(9)?;
    Ok(Team {
        id: Uuid::parse_str(&id).expect("valid uuid"),
        namespace: row.get(1)?,
        name: row.get(2)?,
        color: row.get(3)?,
        persistent: row.get::<_, i64>(4)? != 0,
        ttl_seconds: row.get(5)?,
        sort_order: row.get(6)?,
        last_active_member_at: last_active_member_at.map(|s| parse_rfc3339(&s)),
        created_by: row.get(8)?,
        created_at: parse_rfc3339(&created_at),
    })
}

// ---------------------------------------------------------------------------
// Preferences
// ---------------------------------------------------------------------------

impl Store {
    pub async fn get_preferences(&self, namespace: &str) -> StoreResult<UserPreferences> {
        let namespace = namespace.to_string();
        self.conn
            .call(move |conn| {
                let found = conn
                    .query_row(
                        "SELECT namespace, ready_announcements, permission_notifications,
                            error_notifications, team_group_style, updated_at
                         FROM user_preferences WHERE namespace = ?1",
                        rusqlite::params![namespace],
                        row_to_preferences,
                    )
                    .optional()?;
                Ok(found.unwrap_or_else(|| UserPreferences::defaults(namespace.clone())))
            })
            .await
            .map_err(StoreError::from)
    }

    /// Upsert merges provided fields with current values.
    pub async fn update_preferences(
        &self,
        namespace: &str,
        ready_announcements: Option<bool>,
        permission_notifications: Option<bool>,
        error_notifications: Option<bool>,
        team_group_style: Option<TeamGroupStyle>,
    ) -> StoreResult<UserPreferences> {
        let namespace = namespace.to_string();
        self.conn
            .call(move |conn| {
                let current = conn
                    .query_row(
                        "SELECT namespace, ready_announcements, permission_notifications,
                            error_notifications, team_group_style, updated_at
                         FROM user_preferences WHERE namespace = ?1",
                        rusqlite::params![namespace],
                        row_to_preferences,
                    )
                    .optional()?
                    .unwrap_or_else(|| UserPreferences::defaults(namespace.clone()));
                let merged = UserPreferences {
                    namespace: namespace.clone(),
                    ready_announcements: ready_announcements.unwrap_or(current.ready_announcements),
                    permission_notifications: permission_notifications.unwrap_or(current.permission_notifications),
                    error_notifications: error_notifications.unwrap_or(current.error_notifications),
                    team_group_style: team_group_style.unwrap_or(current.team_group_style),
                    updated_at: Utc::now(),
                };
                let style_str = serde_json::to_string(&merged.team_group_style).unwrap().trim_matches('"').to_string();
                conn.execute(
                    "INSERT INTO user_preferences (namespace, ready_announcements, permission_notifications,
                        error_notifications, team_group_style, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6)
                     ON CONFLICT(namespace) DO UPDATE SET
                        ready_announcements = excluded.ready_announcements,
                        permission_notifications = excluded.permission_notifications,
                        error_notifications = excluded.error_notifications,
                        team_group_style = excluded.team_group_style,
                        updated_at = excluded.updated_at",
                    rusqlite::params![
                        merged.namespace, merged.ready_announcements, merged.permission_notifications,
                        merged.error_notifications, style_str, merged.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(merged)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Every namespace with at least one session or machine. Used by
    /// the hub's background sweep loops, which run per-namespace.
    pub async fn list_namespaces(&self) -> StoreResult<Vec<String>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT namespace FROM sessions
                     UNION
                     SELECT namespace FROM machines",
                )?;
                let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
                rows.collect()
            })
            .await
            .map_err(StoreError::from)
    }
}

fn row_to_preferences(row: &rusqlite::Row) -> rusqlite::Result<UserPreferences> {
    let style_str: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    Ok(UserPreferences {
        namespace: row.get(0)?,
        ready_announcements: row.get::<_, i64>(1)? != 0,
        permission_notifications: row.get::<_, i64>(2)? != 0,
        error_notifications: row.get::<_, i64>(3)? != 0,
        team_group_style: serde_json::from_str(&format!("\"{style_str}\"")).unwrap_or(TeamGroupStyle::Flat),
        updated_at: parse_rfc3339(&updated_at),
    })
}

#[allow(dead_code)]
fn unused_team_member_type_anchor(_m: TeamMember) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_session_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        let a = store.get_or_create_session("tag", "ns", None, None, None).await.unwrap();
        let b = store.get_or_create_session("tag", "ns", None, None, None).await.unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn namespace_isolation_same_tag_different_namespace() {
        let store = Store::open_in_memory().await.unwrap();
        let alpha = store.get_or_create_session("shared-tag", "alpha", None, None, None).await.unwrap();
        let beta = store.get_or_create_session("shared-tag", "beta", None, None, None).await.unwrap();
        assert_ne!(alpha.id, beta.id);

        let outcome = store
            .update_session_versioned_field(alpha.id, "beta", SessionVersionedField::Metadata, serde_json::json!({"x":1}), 0)
            .await
            .unwrap();
        assert!(matches!(outcome, VersionedUpdateOutcome::NotFoundOrDenied));
    }

    #[tokio::test]
    async fn set_session_machine_associates_and_is_namespace_scoped() {
        let store = Store::open_in_memory().await.unwrap();
        let session = store.get_or_create_session("tag", "ns", None, None, None).await.unwrap();
        let machine = store
            .get_or_create_machine(Uuid::new_v4(), "ns", serde_json::json!({}), serde_json::json!({}))
            .await
            .unwrap();

        let updated = store.set_session_machine(session.id, "ns", machine.id).await.unwrap();
        assert!(updated);
        let fetched = store.get_session(session.id, "ns").await.unwrap();
        assert_eq!(fetched.machine_id, Some(machine.id));

        let wrong_namespace = store.set_session_machine(session.id, "other-ns", machine.id).await.unwrap();
        assert!(!wrong_namespace);
    }

    #[tokio::test]
    async fn version_mismatch_reports_current_value() {
        let store = Store::open_in_memory().await.unwrap();
        let s = store.get_or_create_session("tag", "ns", None, None, None).await.unwrap();
        let stale = store
            .update_session_versioned_field(s.id, "ns", SessionVersionedField::Metadata, serde_json::json!({"a":1}), 5)
            .await
            .unwrap();
        assert!(matches!(stale, VersionedUpdateOutcome::VersionMismatch { current_version: 0, .. }));
    }

    #[tokio::test]
    async fn new_session_sorts_before_existing_siblings() {
        let store = Store::open_in_memory().await.unwrap();
        let first = store.get_or_create_session("a", "ns", None, None, None).await.unwrap();
        let second = store.get_or_create_session("b", "ns", None, None, None).await.unwrap();
        assert!(second.sort_order < first.sort_order);
    }

    #[tokio::test]
    async fn add_message_idempotent_on_local_id() {
        let store = Store::open_in_memory().await.unwrap();
        let s = store.get_or_create_session("tag", "ns", None, None, None).await.unwrap();
        let m1 = store.add_message(s.id, serde_json::json!({"text":"hi"}), Some("L1".into())).await.unwrap();
        let m2 = store.add_message(s.id, serde_json::json!({"text":"different"}), Some("L1".into())).await.unwrap();
        assert_eq!(m1.id, m2.id);
        assert_eq!(m1.seq, m2.seq);
        assert_eq!(m1.content, m2.content);
    }

    #[tokio::test]
    async fn get_messages_clamps_limit() {
        let store = Store::open_in_memory().await.unwrap();
        let s = store.get_or_create_session("tag", "ns", None, None, None).await.unwrap();
        for i in 0..3 {
            store.add_message(s.id, serde_json::json!({"i": i}), None).await.unwrap();
        }
        assert_eq!(store.get_messages(s.id, 0, 0).await.unwrap().len(), 1);
        let all = store.get_messages(s.id, 0, 999).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn save_snapshot_returns_false_when_unchanged() {
        let store = Store::open_in_memory().await.unwrap();
        let s = store.get_or_create_session("tag", "ns", None, None, None).await.unwrap();
        let data = serde_json::json!({"title": "fix bug"});
        assert!(store.save_snapshot(s.id, "hapi-1".into(), data.clone()).await.unwrap());
        assert!(!store.save_snapshot(s.id, "hapi-1".into(), data).await.unwrap());
    }

    #[tokio::test]
    async fn linking_more_than_ten_beads_rejects() {
        let store = Store::open_in_memory().await.unwrap();
        let s = store.get_or_create_session("tag", "ns", None, None, None).await.unwrap();
        for i in 0..MAX_BEAD_LINKS_PER_SESSION {
            store.link_bead(s.id, format!("hapi-{i}"), None).await.unwrap();
        }
        let result = store.link_bead(s.id, "hapi-overflow".into(), None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn set_session_todos_rejects_stale_or_equal_timestamp() {
        let store = Store::open_in_memory().await.unwrap();
        let s = store.get_or_create_session("tag", "ns", None, None, None).await.unwrap();
        let t1 = Utc::now();
        assert!(store.set_session_todos(s.id, "ns", serde_json::json!(["a"]), t1).await.unwrap());
        assert!(!store.set_session_todos(s.id, "ns", serde_json::json!(["b"]), t1).await.unwrap());
        let t0 = t1 - chrono::Duration::seconds(1);
        assert!(!store.set_session_todos(s.id, "ns", serde_json::json!(["c"]), t0).await.unwrap());
    }

    #[tokio::test]
    async fn always_on_team_is_seeded_and_immutable() {
        let store = Store::open_in_memory().await.unwrap();
        let teams = store.list_teams("default").await.unwrap();
        let always_on = teams.iter().find(|t| t.name == ALWAYS_ON_TEAM_NAME).unwrap();
        assert!(always_on.persistent);
        let rename = store.update_team(always_on.id, "default", Some("renamed".into()), None).await;
        assert!(rename.is_err());
        let delete = store.delete_team(always_on.id, "default").await;
        assert!(delete.is_err());
    }

    #[tokio::test]
    async fn always_on_team_is_seeded_for_non_default_namespaces() {
        let store = Store::open_in_memory().await.unwrap();
        store.get_or_create_session("a", "acme", None, None, None).await.unwrap();
        let teams = store.list_teams("acme").await.unwrap();
        assert!(teams.iter().any(|t| t.name == ALWAYS_ON_TEAM_NAME && t.persistent));

        // A second session in the same namespace must not create a duplicate.
        store.get_or_create_session("b", "acme", None, None, None).await.unwrap();
        let teams = store.list_teams("acme").await.unwrap();
        assert_eq!(teams.iter().filter(|t| t.name == ALWAYS_ON_TEAM_NAME).count(), 1);
    }

    #[tokio::test]
    async fn reassign_session_beads_is_collision_safe() {
        let store = Store::open_in_memory().await.unwrap();
        let a = store.get_or_create_session("a", "ns", None, None, None).await.unwrap();
        let b = store.get_or_create_session("b", "ns", None, None, None).await.unwrap();
        store.link_bead(a.id, "hapi-1".into(), None).await.unwrap();
        store.link_bead(b.id, "hapi-1".into(), None).await.unwrap();
        store.save_snapshot(b.id, "hapi-1".into(), serde_json::json!({"keep": true})).await.unwrap();
        store.reassign_session_beads(a.id, b.id).await.unwrap();
        let snapshots = store.get_bead_snapshots(b.id).await.unwrap();
        assert_eq!(snapshots[0].data, serde_json::json!({"keep": true}));
        assert!(store.list_session_beads(a.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_session_batch_is_atomic() {
        let store = Store::open_in_memory().await.unwrap();
        let a = store.get_or_create_session("a", "ns", None, None, None).await.unwrap();
        let b = store.get_or_create_session("b", "ns", None, None, None).await.unwrap();
        let deleted = store.delete_session_batch(vec![a.id, b.id], "ns").await.unwrap();
        assert_eq!(deleted, 2);
    }
}
