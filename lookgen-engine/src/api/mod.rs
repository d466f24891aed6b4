//! HTTP API for lookgen-engine

mod health;
mod runs;
mod sse;

pub use health::health_routes;
pub use runs::run_routes;
pub use sse::event_stream;
