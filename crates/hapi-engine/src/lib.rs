//! The coordination core of the HAPI hub: the in-memory registries and
//! services that sit between the durable [`hapi_core::store::Store`]
//! and the HTTP/socket facade (`hapi-bridge`).
//!
//! - [`rpc_registry`] — (method -> owning socket) ownership table.
//! - [`rpc_client`] — the transport-agnostic seam `hapi-bridge` fills
//!   in with a real WebSocket-backed RPC client.
//! - [`session_cache`] — presence-driven active/thinking state machine.
//! - [`event_publisher`] — namespace-scoped event fan-out with
//!   back-pressure coalescing.
//! - [`bead_service`] — periodic and opportunistic bead snapshot
//!   refresh, grouped and circuit-broken per `(machineId, repoPath)`.
//! - [`coordinator`] — cross-cutting request handlers (spawn,
//!   inter-agent message, restart, permission resolution).

pub mod bead_service;
pub mod coordinator;
pub mod event_publisher;
pub mod rpc_client;
pub mod rpc_registry;
pub mod session_cache;
