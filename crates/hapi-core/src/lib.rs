//! Core library for the HAPI coordination hub.
//!
//! Provides the durable, namespace-scoped domain store, the domain
//! types it persists, fractional-indexing key generation for
//! client-ordered lists, and the hub's configuration layer.

pub mod config;
pub mod error;
pub mod fractional_index;
pub mod store;
pub mod types;

pub use error::StoreError;
pub use store::Store;
