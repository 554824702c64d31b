//! Reliability and security primitives shared by the HAPI hub: circuit
//! breaking for flaky bead RPCs, cooperative shutdown coordination,
//! token-bucket rate limiting, and bearer-token verification.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod shutdown;
pub mod token;
