//! Periodic and opportunistic refresh of bead snapshots linked to
//! active sessions.
//!
//! Grounded on `at-daemon/src/daemon.rs`'s periodic-loop structure
//! (own timer, jittered) and `hapi_harness::circuit_breaker`'s
//! per-repo breaker, reused here via `CircuitBreakerRegistry` keyed on
//! `(machineId, repoPath)` rather than rolling a second failure
//! counter on top of it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use hapi_core::store::Store;
use hapi_core::types::Session;
use hapi_harness::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry};
use hapi_types::rpc::ShowBeadsRpcResult;
use hapi_types::Event;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::event_publisher::EventPublisher;
use crate::rpc_client::{RpcCallError, RunnerRpcClient};
use crate::rpc_registry::RpcRegistry;

pub const POLL_INTERVAL: Duration = Duration::from_secs(15);
pub const POLL_JITTER: Duration = Duration::from_secs(5);
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

fn bead_circuit_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 3,
        success_threshold: 1,
        timeout: Duration::from_secs(60),
        call_timeout: RPC_TIMEOUT,
    }
}

/// One coalesced unit of work: every active session sharing a
/// `(machineId, repoPath)` pair is refreshed by a single RPC.
#[derive(Debug, Clone)]
struct BeadGroup {
    machine_id: Uuid,
    repo_path: String,
    /// The session whose socket is used for the first-attempt
    /// `show-session-beads` RPC.
    representative_session: Uuid,
    sessions: Vec<(Uuid, Vec<String>)>,
}

fn group_key(machine_id: Uuid, repo_path: &str) -> (String, String) {
    (machine_id.to_string(), repo_path.to_string())
}

pub struct BeadService {
    circuit_breakers: CircuitBreakerRegistry,
    in_flight: DashMap<(String, String), Arc<AsyncMutex<()>>>,
    versions: DashMap<Uuid, u64>,
    stale: DashMap<Uuid, bool>,
}

impl Default for BeadService {
    fn default() -> Self {
        Self::new()
    }
}

impl BeadService {
    pub fn new() -> Self {
        Self {
            circuit_breakers: CircuitBreakerRegistry::new(bead_circuit_config()),
            in_flight: DashMap::new(),
            versions: DashMap::new(),
            stale: DashMap::new(),
        }
    }

    pub fn is_stale(&self, session_id: Uuid) -> bool {
        self.stale.get(&session_id).map(|v| *v).unwrap_or(false)
    }

    fn group_lock(&self, key: &(String, String)) -> Arc<AsyncMutex<()>> {
        self.in_flight.entry(key.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Builds `(machineId, repoPath)` groups from every active session
    /// that has >=1 linked bead and a known machine. Sessions without
    /// a `machine_id` or without a `metadata.repoPath` string cannot
    /// be polled and are skipped.
    async fn collect_groups(&self, store: &Store, namespace: &str) -> Result<Vec<BeadGroup>, hapi_core::error::StoreError> {
        let sessions: Vec<Session> = store.list_sessions(namespace, true).await?;
        let mut groups: HashMap<(String, String), BeadGroup> = HashMap::new();

        for session in sessions {
            let Some(machine_id) = session.machine_id else { continue };
            let Some(repo_path) = session.metadata.get("repoPath").and_then(|v| v.as_str()) else { continue };
            let links = store.list_session_beads(session.id).await?;
            if links.is_empty() {
                continue;
            }
            let bead_ids: Vec<String> = links.into_iter().map(|l| l.bead_id).collect();
            let key = group_key(machine_id, repo_path);
            let group = groups.entry(key).or_insert_with(|| BeadGroup {
                machine_id,
                repo_path: repo_path.to_string(),
                representative_session: session.id,
                sessions: Vec::new(),
            });
            group.sessions.push((session.id, bead_ids));
        }

        Ok(groups.into_values().collect())
    }

    /// One full sweep across `namespace`: skips groups that are
    /// already in-flight or whose breaker is open, refreshes the rest.
    pub async fn poll_namespace(
        &self,
        store: &Store,
        publisher: &EventPublisher,
        registry: &RpcRegistry,
        client: &dyn RunnerRpcClient,
        namespace: &str,
    ) -> Result<(), hapi_core::error::StoreError> {
        let groups = self.collect_groups(store, namespace).await?;
        for group in groups {
            let key = group_key(group.machine_id, &group.repo_path);
            let lock = self.group_lock(&key);
            let Ok(_guard) = lock.try_lock() else {
                continue;
            };
            self.refresh_group(store, publisher, registry, client, namespace, &group).await?;
        }
        Ok(())
    }

    /// Refreshes a single session's group immediately, bypassing
    /// jitter. Used both for `linkBead`'s immediate-refresh
    /// requirement and `getSessionBeads`'s opportunistic trigger.
    /// Overlapping callers for the same group await the in-flight
    /// refresh rather than racing a second RPC.
    pub async fn refresh_session_group(
        &self,
        store: &Store,
        publisher: &EventPublisher,
        registry: &RpcRegistry,
        client: &dyn RunnerRpcClient,
        namespace: &str,
        session_id: Uuid,
    ) -> Result<(), hapi_core::error::StoreError> {
        let session = store.get_session(session_id, namespace).await?;
        let Some(machine_id) = session.machine_id else { return Ok(()) };
        let Some(repo_path) = session.metadata.get("repoPath").and_then(|v| v.as_str()).map(str::to_string) else {
            return Ok(());
        };

        let groups = self.collect_groups(store, namespace).await?;
        let Some(group) = groups.into_iter().find(|g| g.machine_id == machine_id && g.repo_path == repo_path) else {
            return Ok(());
        };

        let key = group_key(group.machine_id, &group.repo_path);
        let lock = self.group_lock(&key);
        let _guard = lock.lock().await;
        self.refresh_group(store, publisher, registry, client, namespace, &group).await
    }

    /// Returns the currently stored snapshots for `sessionId`, after
    /// opportunistically kicking off a refresh for active sessions
    /// (fire-and-forget is not appropriate here since we have no
    /// background executor handle; callers await the refresh so the
    /// returned snapshots reflect it when possible).
    pub async fn get_session_beads(
        &self,
        store: &Store,
        publisher: &EventPublisher,
        registry: &RpcRegistry,
        client: &dyn RunnerRpcClient,
        namespace: &str,
        session_id: Uuid,
    ) -> Result<(Vec<hapi_core::types::BeadSnapshot>, bool), hapi_core::error::StoreError> {
        let session = store.get_session(session_id, namespace).await?;
        if session.active {
            let _ = self.refresh_session_group(store, publisher, registry, client, namespace, session_id).await;
        }
        let snapshots = store.get_bead_snapshots(session_id).await?;
        Ok((snapshots, self.is_stale(session_id)))
    }

    async fn refresh_group(
        &self,
        store: &Store,
        publisher: &EventPublisher,
        registry: &RpcRegistry,
        client: &dyn RunnerRpcClient,
        namespace: &str,
        group: &BeadGroup,
    ) -> Result<(), hapi_core::error::StoreError> {
        let breaker = self.circuit_breakers.get(&group.machine_id.to_string(), &group.repo_path);
        let bead_ids: Vec<String> =
            group.sessions.iter().flat_map(|(_, ids)| ids.iter().cloned()).collect();

        let result = breaker
            .call(|| self.fetch_beads(registry, client, group, &bead_ids))
            .await;

        match result {
            Ok(summaries) => {
                self.apply_success(store, publisher, namespace, group, summaries).await?;
            }
            Err(CircuitBreakerError::Open) => {
                // Skipped per the cooldown window; not a fresh failure.
            }
            Err(_) => {
                self.mark_group_stale(group);
            }
        }
        Ok(())
    }

    async fn fetch_beads(
        &self,
        registry: &RpcRegistry,
        client: &dyn RunnerRpcClient,
        group: &BeadGroup,
        bead_ids: &[String],
    ) -> Result<Vec<hapi_types::rpc::BeadSummary>, RpcCallError> {
        let session_method = format!("{}:show-session-beads", group.machine_id);
        let args = hapi_types::rpc::ShowBeadsRpcArgs {
            session_id: group.representative_session,
            bead_ids: bead_ids.to_vec(),
        };
        let payload = serde_json::to_value(&args).map_err(|e| RpcCallError::RunnerError(e.to_string()))?;

        if let Some(socket) = registry.get_socket_for_method(&session_method) {
            if let Ok(value) = client.call(socket, &session_method, payload.clone(), RPC_TIMEOUT).await {
                return parse_beads_result(value);
            }
        }

        let machine_method = format!("{}:show-machine-beads", group.machine_id);
        let Some(socket) = registry.get_socket_for_method(&machine_method) else {
            return Err(RpcCallError::NotRegistered(machine_method));
        };
        let value = client.call(socket, &machine_method, payload, RPC_TIMEOUT).await?;
        parse_beads_result(value)
    }

    async fn apply_success(
        &self,
        store: &Store,
        publisher: &EventPublisher,
        namespace: &str,
        group: &BeadGroup,
        summaries: Vec<hapi_types::rpc::BeadSummary>,
    ) -> Result<(), hapi_core::error::StoreError> {
        let mut by_bead: HashMap<String, serde_json::Value> = HashMap::new();
        for summary in summaries {
            let value = serde_json::to_value(&summary.data).unwrap_or(serde_json::json!({}));
            by_bead.insert(summary.bead_id, value);
        }

        for (session_id, bead_ids) in &group.sessions {
            let mut changed = false;
            for bead_id in bead_ids {
                if let Some(data) = by_bead.get(bead_id) {
                    if store.save_snapshot(*session_id, bead_id.clone(), data.clone()).await? {
                        changed = true;
                    }
                }
            }
            self.stale.insert(*session_id, false);
            if changed {
                let version = {
                    let mut entry = self.versions.entry(*session_id).or_insert(0);
                    *entry += 1;
                    *entry
                };
                publisher.publish(Event::BeadsUpdated {
                    namespace: namespace.to_string(),
                    session_id: *session_id,
                    version,
                });
            }
        }
        Ok(())
    }

    fn mark_group_stale(&self, group: &BeadGroup) {
        for (session_id, _) in &group.sessions {
            self.stale.insert(*session_id, true);
        }
    }
}

fn parse_beads_result(value: serde_json::Value) -> Result<Vec<hapi_types::rpc::BeadSummary>, RpcCallError> {
    let parsed: ShowBeadsRpcResult =
        serde_json::from_value(value).map_err(|e| RpcCallError::RunnerError(e.to_string()))?;
    Ok(parsed.beads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hapi_core::store::Store;
    use hapi_types::rpc::BeadSummary;

    struct FakeRunner {
        response: serde_json::Value,
    }

    #[async_trait]
    impl RunnerRpcClient for FakeRunner {
        async fn call(
            &self,
            _socket: Uuid,
            _method: &str,
            _payload: serde_json::Value,
            _timeout: Duration,
        ) -> Result<serde_json::Value, RpcCallError> {
            Ok(self.response.clone())
        }
    }

    fn success_response(bead_id: &str, extra: serde_json::Value) -> serde_json::Value {
        let mut data = serde_json::Map::new();
        if let serde_json::Value::Object(map) = extra {
            data = map;
        }
        let summary = BeadSummary { bead_id: bead_id.to_string(), data };
        serde_json::json!({ "beads": [summary] })
    }

    #[tokio::test]
    async fn refresh_persists_snapshot_and_emits_beads_updated() {
        let store = Store::open_in_memory().await.unwrap();
        let session = store.get_or_create_session("tag", "ns", None, None, None).await.unwrap();
        store
            .update_session_versioned_field(
                session.id,
                "ns",
                hapi_core::store::SessionVersionedField::Metadata,
                serde_json::json!({"repoPath": "/repo"}),
                session.metadata_version,
            )
            .await
            .unwrap();
        let machine = store
            .get_or_create_machine(Uuid::new_v4(), "ns", serde_json::json!({}), serde_json::json!({}))
            .await
            .unwrap();
        store.set_session_machine(session.id, "ns", machine.id).await.unwrap();
        store.set_session_active(session.id, "ns", true).await.unwrap();
        let session = store.get_session(session.id, "ns").await.unwrap();
        store.link_bead(session.id, "bead-1".into(), None).await.unwrap();

        let registry = RpcRegistry::new();
        let socket = Uuid::new_v4();
        registry.register(socket, &format!("{}:show-session-beads", machine.id));
        let client = FakeRunner { response: success_response("bead-1", serde_json::json!({"title": "hi"})) };
        let publisher = EventPublisher::new();
        let sub = publisher.subscribe("ns");
        let service = BeadService::new();

        service
            .refresh_session_group(&store, &publisher, &registry, &client, "ns", session.id)
            .await
            .unwrap();

        let snapshots = store.get_bead_snapshots(session.id).await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert!(!service.is_stale(session.id));
        assert!(sub.queue.try_next().is_some());
    }

    #[tokio::test]
    async fn failed_fetch_marks_sessions_stale() {
        let store = Store::open_in_memory().await.unwrap();
        let session = store.get_or_create_session("tag", "ns", None, None, None).await.unwrap();
        store
            .update_session_versioned_field(
                session.id,
                "ns",
                hapi_core::store::SessionVersionedField::Metadata,
                serde_json::json!({"repoPath": "/repo"}),
                session.metadata_version,
            )
            .await
            .unwrap();
        let machine = store
            .get_or_create_machine(Uuid::new_v4(), "ns", serde_json::json!({}), serde_json::json!({}))
            .await
            .unwrap();
        store.set_session_machine(session.id, "ns", machine.id).await.unwrap();
        store.set_session_active(session.id, "ns", true).await.unwrap();
        let session = store.get_session(session.id, "ns").await.unwrap();
        store.link_bead(session.id, "bead-1".into(), None).await.unwrap();

        let registry = RpcRegistry::new();
        // No method registered at all: NotRegistered on both attempts.
        let client = FakeRunner { response: serde_json::json!({"beads": []}) };
        let publisher = EventPublisher::new();
        let service = BeadService::new();

        service
            .refresh_session_group(&store, &publisher, &registry, &client, "ns", session.id)
            .await
            .unwrap();

        assert!(service.is_stale(session.id));
    }
}
