//! Presence-driven view of active sessions, driven by runner
//! `session-alive` heartbeats and `session-end` notifications.
//!
//! Grounded on `at-daemon/src/daemon.rs`'s interval-sweep structure
//! (an inactivity timeout swept on its own timer rather than per-read)
//! and `hapi-core::types::SessionStatus` for the derived-status
//! priority rule.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use hapi_core::store::Store;
use hapi_core::types::Session;
use hapi_types::Event;
use uuid::Uuid;

use crate::event_publisher::EventPublisher;

/// Window after which a session with no heartbeat is considered
/// offline by the sweep.
pub const ALIVE_TIMEOUT: chrono::Duration = chrono::Duration::seconds(30);

#[derive(Debug, Clone, PartialEq)]
struct PresenceState {
    thinking: bool,
    thinking_activity: Option<String>,
    last_alive: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    presence: HashMap<Uuid, PresenceState>,
}

pub struct SessionCache {
    inner: Mutex<Inner>,
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionCache {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }

    pub fn thinking(&self, session_id: Uuid) -> bool {
        self.inner
            .lock()
            .unwrap()
            .presence
            .get(&session_id)
            .map(|s| s.thinking)
            .unwrap_or(false)
    }

    pub fn is_active(&self, session_id: Uuid) -> bool {
        self.inner.lock().unwrap().presence.contains_key(&session_id)
    }

    /// Stamps `session.thinking`/`session.thinking_activity` with this
    /// cache's live presence state for `session.id`. `Store` never
    /// populates these two fields (they aren't persisted), so every
    /// call site that hands a freshly-fetched `Session` to an event or
    /// an HTTP response overlays it through here first.
    pub fn overlay(&self, session: &mut Session) {
        let inner = self.inner.lock().unwrap();
        if let Some(state) = inner.presence.get(&session.id) {
            session.thinking = state.thinking;
            session.thinking_activity = state.thinking_activity.clone();
        } else {
            session.thinking = false;
            session.thinking_activity = None;
        }
    }

    /// Applies a `session-alive` heartbeat: activates the session in
    /// the Store if it was offline, or updates `thinking`/
    /// `thinking_activity` and broadcasts `session-updated` if either
    /// changed. `now` is passed in (rather than read with `Utc::now()`
    /// here) so callers control the clock in tests.
    pub async fn on_heartbeat(
        &self,
        store: &Store,
        publisher: &EventPublisher,
        session_id: Uuid,
        namespace: &str,
        now: DateTime<Utc>,
        thinking: bool,
        thinking_activity: Option<String>,
    ) -> Result<(), hapi_core::error::StoreError> {
        let previous = {
            let mut inner = self.inner.lock().unwrap();
            let previous = inner.presence.get(&session_id).cloned();
            inner.presence.insert(
                session_id,
                PresenceState { thinking, thinking_activity: thinking_activity.clone(), last_alive: now },
            );
            previous
        };

        let became_active = previous.is_none();
        let thinking_changed = previous
            .map(|p| p.thinking != thinking || p.thinking_activity != thinking_activity)
            .unwrap_or(false);

        if became_active {
            store.set_session_active(session_id, namespace, true).await?;
        }

        if became_active || thinking_changed {
            let mut session = store.get_session(session_id, namespace).await?;
            self.overlay(&mut session);
            publisher.publish(Event::SessionUpdated {
                namespace: namespace.to_string(),
                session: Box::new(session),
            });
        }
        Ok(())
    }

    /// Applies a `session-end` notification: forces the session
    /// offline and `thinking=false` immediately, regardless of the
    /// sweep timer.
    pub async fn on_session_end(
        &self,
        store: &Store,
        publisher: &EventPublisher,
        session_id: Uuid,
        namespace: &str,
        now: DateTime<Utc>,
    ) -> Result<(), hapi_core::error::StoreError> {
        let _ = now;
        self.inner.lock().unwrap().presence.remove(&session_id);
        store.set_session_active(session_id, namespace, false).await?;
        let mut session = store.get_session(session_id, namespace).await?;
        self.overlay(&mut session);
        publisher.publish(Event::SessionUpdated {
            namespace: namespace.to_string(),
            session: Box::new(session),
        });
        Ok(())
    }

    /// Sweeps every tracked session, marking offline any whose last
    /// heartbeat predates `now - ALIVE_TIMEOUT`. Caller supplies each
    /// session's namespace via `namespace_of` since the cache itself
    /// holds no namespace data — only presence.
    pub async fn sweep_expired<F>(
        &self,
        store: &Store,
        publisher: &EventPublisher,
        now: DateTime<Utc>,
        namespace_of: F,
    ) -> Result<(), hapi_core::error::StoreError>
    where
        F: Fn(Uuid) -> Option<String>,
    {
        let expired: Vec<Uuid> = {
            let inner = self.inner.lock().unwrap();
            inner
                .presence
                .iter()
                .filter(|(_, state)| now - state.last_alive > ALIVE_TIMEOUT)
                .map(|(id, _)| *id)
                .collect()
        };

        for session_id in expired {
            self.inner.lock().unwrap().presence.remove(&session_id);
            let Some(namespace) = namespace_of(session_id) else { continue };
            store.set_session_active(session_id, &namespace, false).await?;
            let mut session = store.get_session(session_id, &namespace).await?;
            self.overlay(&mut session);
            publisher.publish(Event::SessionUpdated {
                namespace: namespace.clone(),
                session: Box::new(session),
            });
        }
        Ok(())
    }

    /// Deletes every session in `namespace` that is inactive (per the
    /// Store, not this cache) and whose `updated_at` is older than
    /// `now - max_age`. Emits one `session-removed` event per deletion.
    /// Rolls back and returns nothing deleted if the batch delete
    /// fails partway.
    pub async fn clear_inactive_sessions(
        &self,
        store: &Store,
        publisher: &EventPublisher,
        namespace: &str,
        now: DateTime<Utc>,
        max_age: chrono::Duration,
    ) -> Result<Vec<Uuid>, hapi_core::error::StoreError> {
        let candidates: Vec<Uuid> = store
            .list_sessions(namespace, false)
            .await?
            .into_iter()
            .filter(|s| !s.active && now - s.updated_at > max_age)
            .map(|s| s.id)
            .collect();

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        store.delete_session_batch(candidates.clone(), namespace).await?;
        for session_id in &candidates {
            publisher.publish(Event::SessionRemoved {
                namespace: namespace.to_string(),
                session_id: *session_id,
            });
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hapi_core::store::Store;

    async fn open_store() -> Store {
        Store::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn heartbeat_activates_offline_session_and_broadcasts() {
        let store = open_store().await;
        let publisher = EventPublisher::new();
        let sub = publisher.subscribe("ns");
        let session = store.get_or_create_session("tag", "ns", None, None, None).await.unwrap();
        let cache = SessionCache::new();

        cache
            .on_heartbeat(&store, &publisher, session.id, "ns", Utc::now(), false, None)
            .await
            .unwrap();

        assert!(cache.is_active(session.id));
        let event = sub.queue.try_next().unwrap();
        matches!(event, Event::SessionUpdated { .. });
    }

    #[tokio::test]
    async fn thinking_change_broadcasts_again() {
        let store = open_store().await;
        let publisher = EventPublisher::new();
        let sub = publisher.subscribe("ns");
        let session = store.get_or_create_session("tag", "ns", None, None, None).await.unwrap();
        let cache = SessionCache::new();

        cache.on_heartbeat(&store, &publisher, session.id, "ns", Utc::now(), false, None).await.unwrap();
        sub.queue.try_next();
        cache.on_heartbeat(&store, &publisher, session.id, "ns", Utc::now(), true, None).await.unwrap();

        assert!(cache.thinking(session.id));
        assert!(sub.queue.try_next().is_some());
    }

    #[tokio::test]
    async fn thinking_activity_change_broadcasts_again_even_if_thinking_unchanged() {
        let store = open_store().await;
        let publisher = EventPublisher::new();
        let sub = publisher.subscribe("ns");
        let session = store.get_or_create_session("tag", "ns", None, None, None).await.unwrap();
        let cache = SessionCache::new();

        cache
            .on_heartbeat(&store, &publisher, session.id, "ns", Utc::now(), true, Some("reading".into()))
            .await
            .unwrap();
        sub.queue.try_next();
        cache
            .on_heartbeat(&store, &publisher, session.id, "ns", Utc::now(), true, Some("writing".into()))
            .await
            .unwrap();

        let event = sub.queue.try_next().unwrap();
        match event {
            Event::SessionUpdated { session, .. } => {
                assert_eq!(session.thinking_activity.as_deref(), Some("writing"));
            }
            _ => panic!("expected SessionUpdated"),
        }
    }

    #[tokio::test]
    async fn session_end_forces_offline_and_clears_thinking() {
        let store = open_store().await;
        let publisher = EventPublisher::new();
        let session = store.get_or_create_session("tag", "ns", None, None, None).await.unwrap();
        let cache = SessionCache::new();
        cache.on_heartbeat(&store, &publisher, session.id, "ns", Utc::now(), true, None).await.unwrap();

        cache.on_session_end(&store, &publisher, session.id, "ns", Utc::now()).await.unwrap();

        assert!(!cache.is_active(session.id));
        let stored = store.get_session(session.id, "ns").await.unwrap();
        assert!(!stored.active);
    }

    #[tokio::test]
    async fn sweep_marks_stale_heartbeat_offline() {
        let store = open_store().await;
        let publisher = EventPublisher::new();
        let session = store.get_or_create_session("tag", "ns", None, None, None).await.unwrap();
        let cache = SessionCache::new();
        let long_ago = Utc::now() - chrono::Duration::seconds(60);
        cache.on_heartbeat(&store, &publisher, session.id, "ns", long_ago, false, None).await.unwrap();

        cache
            .sweep_expired(&store, &publisher, Utc::now(), |_| Some("ns".to_string()))
            .await
            .unwrap();

        assert!(!cache.is_active(session.id));
        let stored = store.get_session(session.id, "ns").await.unwrap();
        assert!(!stored.active);
    }

    #[tokio::test]
    async fn clear_inactive_sessions_deletes_stale_and_emits_removed() {
        let store = open_store().await;
        let publisher = EventPublisher::new();
        let sub = publisher.subscribe("ns");
        let session = store.get_or_create_session("tag", "ns", None, None, None).await.unwrap();
        store.set_session_active(session.id, "ns", false).await.unwrap();
        let cache = SessionCache::new();

        let deleted = cache
            .clear_inactive_sessions(&store, &publisher, "ns", Utc::now(), chrono::Duration::seconds(-1))
            .await
            .unwrap();

        assert_eq!(deleted, vec![session.id]);
        assert!(store.get_session(session.id, "ns").await.is_err());
        let event = sub.queue.try_next().unwrap();
        match event {
            Event::SessionRemoved { session_id, .. } => assert_eq!(session_id, session.id),
            _ => panic!("expected SessionRemoved"),
        }
    }
}
