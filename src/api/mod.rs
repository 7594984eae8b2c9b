//! The ambient HTTP surface: process liveness, a read-only view of the
//! account pool, recent switch/rate-limit events, and the host integration
//! route that drives the Fetch Orchestrator.

mod routes;
mod types;

pub use routes::serve;
