//! Process bootstrap and background-loop host for the hub.
//!
//! `hapi-hub` owns nothing the other crates don't already define — it
//! loads config, opens the store, builds the root object set, hands
//! the router to axum, and keeps the inactive-session sweep, bead
//! poll, team-expiry, and CPU-sample loops turning until shutdown.

pub mod cpu_sampler;
pub mod daemon;
