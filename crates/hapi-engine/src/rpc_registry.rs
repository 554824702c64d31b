//! (method -> owning socket) ownership table used to dispatch CLI/HTTP
//! originated RPCs to the runner socket that registered them.
//!
//! Grounded on `at-bridge/src/command_registry.rs`'s registration-table
//! idiom, narrowed to a single-owner-per-method mapping plus its
//! inverse (socket -> owned methods) for O(1) cleanup on disconnect.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use uuid::Uuid;

pub type SocketId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    AlreadyOwner,
    OwnedByOther,
}

#[derive(Default)]
struct Inner {
    method_owner: HashMap<String, SocketId>,
    socket_methods: HashMap<SocketId, HashSet<String>>,
}

/// Invariant: at most one owner per method at any instant; ownership
/// transfer requires the current owner to release first.
pub struct RpcRegistry {
    inner: RwLock<Inner>,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self { inner: RwLock::new(Inner::default()) }
    }

    pub fn register(&self, socket: SocketId, method: &str) -> RegisterOutcome {
        let mut inner = self.inner.write().unwrap();
        match inner.method_owner.get(method).copied() {
            Some(owner) if owner == socket => RegisterOutcome::AlreadyOwner,
            Some(other) => {
                tracing::warn!(method, owner = %other, attempted_by = %socket, "rejected RPC method registration: already owned");
                RegisterOutcome::OwnedByOther
            }
            None => {
                inner.method_owner.insert(method.to_string(), socket);
                inner.socket_methods.entry(socket).or_default().insert(method.to_string());
                RegisterOutcome::Registered
            }
        }
    }

    /// Releases ownership only if `socket` is the current owner.
    pub fn unregister(&self, socket: SocketId, method: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.method_owner.get(method).copied() {
            Some(owner) if owner == socket => {
                inner.method_owner.remove(method);
                if let Some(methods) = inner.socket_methods.get_mut(&socket) {
                    methods.remove(method);
                }
                true
            }
            _ => false,
        }
    }

    /// Releases every method this socket owns. Must be called on
    /// socket disconnect — races safely with an inbound `register`
    /// from a reconnecting client since only the current owner can
    /// release its own entries.
    pub fn unregister_all(&self, socket: SocketId) {
        let mut inner = self.inner.write().unwrap();
        if let Some(methods) = inner.socket_methods.remove(&socket) {
            for method in methods {
                if inner.method_owner.get(&method).copied() == Some(socket) {
                    inner.method_owner.remove(&method);
                }
            }
        }
    }

    pub fn get_socket_for_method(&self, method: &str) -> Option<SocketId> {
        self.inner.read().unwrap().method_owner.get(method).copied()
    }
}

impl Default for RpcRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_registrant_owns_the_method() {
        let registry = RpcRegistry::new();
        let socket = Uuid::new_v4();
        assert_eq!(registry.register(socket, "machine-1:spawn-happy-session"), RegisterOutcome::Registered);
        assert_eq!(registry.get_socket_for_method("machine-1:spawn-happy-session"), Some(socket));
    }

    #[test]
    fn repeat_registration_by_owner_is_idempotent() {
        let registry = RpcRegistry::new();
        let socket = Uuid::new_v4();
        registry.register(socket, "m");
        assert_eq!(registry.register(socket, "m"), RegisterOutcome::AlreadyOwner);
    }

    #[test]
    fn registration_by_a_different_socket_is_rejected() {
        let registry = RpcRegistry::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        registry.register(first, "m");
        assert_eq!(registry.register(second, "m"), RegisterOutcome::OwnedByOther);
        assert_eq!(registry.get_socket_for_method("m"), Some(first));
    }

    #[test]
    fn unregister_only_releases_if_caller_is_owner() {
        let registry = RpcRegistry::new();
        let owner = Uuid::new_v4();
        let impostor = Uuid::new_v4();
        registry.register(owner, "m");
        assert!(!registry.unregister(impostor, "m"));
        assert!(registry.unregister(owner, "m"));
        assert_eq!(registry.get_socket_for_method("m"), None);
    }

    #[test]
    fn unregister_all_releases_every_owned_method_and_allows_takeover() {
        let registry = RpcRegistry::new();
        let socket = Uuid::new_v4();
        registry.register(socket, "a");
        registry.register(socket, "b");
        registry.unregister_all(socket);
        assert_eq!(registry.get_socket_for_method("a"), None);
        assert_eq!(registry.get_socket_for_method("b"), None);

        let reconnected = Uuid::new_v4();
        assert_eq!(registry.register(reconnected, "a"), RegisterOutcome::Registered);
    }
}
