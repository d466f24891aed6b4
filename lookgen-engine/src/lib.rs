//! lookgen-engine library interface
//!
//! Exposes public APIs for integration testing

pub mod api;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod planner;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use lookgen_common::events::EventBus;

use crate::engine::{ActiveBatches, EngineContext, GenerationService};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Generation service client
    pub generator: Arc<dyn GenerationService>,
    /// Loop handles for batches currently in flight
    pub active_batches: ActiveBatches,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(db: SqlitePool, event_bus: EventBus, generator: Arc<dyn GenerationService>) -> Self {
        Self {
            db,
            event_bus,
            generator,
            active_batches: Arc::new(RwLock::new(HashMap::new())),
            startup_time: Utc::now(),
        }
    }

    /// View of this state the engine operations take
    pub fn context(&self) -> EngineContext {
        EngineContext {
            db: self.db.clone(),
            event_bus: self.event_bus.clone(),
            generator: Arc::clone(&self.generator),
            active_batches: Arc::clone(&self.active_batches),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::run_routes())
        .route("/events", get(api::event_stream))
        .merge(api::health_routes())
        .with_state(state)
}
