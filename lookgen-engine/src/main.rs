//! lookgen-engine - Generation Planning & Reconciliation Engine
//!
//! **Module Identity:**
//! - Name: lookgen-engine
//! - Port: 5810 (default)
//!
//! Plans AI image-variant generation work for fashion Looks, reconciles the
//! plan against the Job/Output store, and drives the generation service
//! until every required variant exists.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lookgen_common::config;
use lookgen_common::events::EventBus;
use lookgen_engine::engine::{self, HttpGenerationService};
use lookgen_engine::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let toml_config = config::load_config(&config::config_path())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&toml_config.logging.level)),
        )
        .init();

    info!("Starting lookgen-engine");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let db_path = config::resolve_database_path(&toml_config);
    info!("Database: {}", db_path.display());
    let db_pool = lookgen_engine::db::init_database_pool(&db_path).await?;
    info!("Database connection established");

    let endpoint =
        lookgen_engine::config::resolve_generation_endpoint(&db_pool, &toml_config).await?;
    info!("Generation service: {}", endpoint.url);
    let generator = Arc::new(HttpGenerationService::new(endpoint.url, endpoint.api_key));

    let event_bus = EventBus::new(100); // 100 event capacity
    let state = AppState::new(db_pool, event_bus, generator);

    // Reattach loops to batches that were in flight at last shutdown.
    let resumed = engine::resume_active(&state.context()).await?;
    if !resumed.is_empty() {
        info!(count = resumed.len(), "Resumed in-flight batches");
    }

    let app = lookgen_engine::build_router(state);

    let port = config::resolve_listen_port(&toml_config);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    info!("Listening on http://127.0.0.1:{}", port);
    info!("Health check: http://127.0.0.1:{}/health", port);

    axum::serve(listener, app).await?;

    Ok(())
}
