//! Wire types shared between `hapi-engine` and `hapi-bridge`: the
//! event sum type fanned out over the socket/SSE transports, and the
//! RPC request/response schemas exchanged with runner sockets.

pub mod events;
pub mod rpc;

pub use events::Event;
