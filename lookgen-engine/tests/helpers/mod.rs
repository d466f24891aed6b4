//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use lookgen_common::events::EventBus;
use lookgen_engine::db;
use lookgen_engine::engine::{
    EngineContext, GenerationError, GenerationOutcome, GenerationRequest, GenerationService,
};
use lookgen_engine::models::{BatchState, Look, View, ViewKind};

/// Scripted generation service
///
/// Completes everything by default; views listed in `fail_views` fail
/// instead. Tracks total calls and the peak number of concurrent calls.
pub struct MockGenerationService {
    pub latency: Duration,
    pub fail_views: Vec<ViewKind>,
    pub calls: AtomicUsize,
    current: AtomicUsize,
    pub max_concurrent: AtomicUsize,
}

impl MockGenerationService {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            fail_views: Vec::new(),
            calls: AtomicUsize::new(0),
            current: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        }
    }

    pub fn failing_views(latency: Duration, fail_views: Vec<ViewKind>) -> Self {
        Self {
            fail_views,
            ..Self::new(latency)
        }
    }
}

#[async_trait]
impl GenerationService for MockGenerationService {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutcome, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.latency).await;
        self.current.fetch_sub(1, Ordering::SeqCst);

        if self.fail_views.contains(&request.view) {
            Ok(GenerationOutcome::Failed {
                reason: "render rejected".to_string(),
            })
        } else {
            Ok(GenerationOutcome::Completed {
                artifact_url: format!("https://cdn.test/{}.png", request.output_id),
            })
        }
    }
}

/// Fresh in-memory context around the given service
pub async fn test_context(generator: Arc<dyn GenerationService>) -> EngineContext {
    let pool = db::init_memory_pool().await.unwrap();
    EngineContext {
        db: pool,
        event_bus: EventBus::new(64),
        generator,
        active_batches: Arc::new(RwLock::new(HashMap::new())),
    }
}

/// Speed the loops up so batches settle within a test timeout
pub async fn fast_loop_settings(ctx: &EngineContext) {
    db::settings::set_setting(&ctx.db, "engine.dispatch_interval_ms", "100")
        .await
        .unwrap();
    db::settings::set_setting(&ctx.db, "engine.progress_interval_ms", "100")
        .await
        .unwrap();
}

/// Park the dispatch loop so store state can be inspected undisturbed
pub async fn frozen_dispatch_settings(ctx: &EngineContext) {
    db::settings::set_setting(&ctx.db, "engine.dispatch_interval_ms", "600000")
        .await
        .unwrap();
    db::settings::set_setting(&ctx.db, "engine.progress_interval_ms", "600000")
        .await
        .unwrap();
}

/// Seed a Look whose views all pass the prerequisite gate
pub async fn seed_ready_look(ctx: &EngineContext, name: &str, kinds: &[ViewKind]) -> Look {
    let look = Look {
        look_id: Uuid::new_v4(),
        name: name.to_string(),
        talent_ref: Some("talent-1".to_string()),
        first_seen_at: Utc::now(),
    };
    db::looks::save_look(&ctx.db, &look).await.unwrap();

    for kind in kinds {
        db::looks::save_view(
            &ctx.db,
            &View {
                view_id: Uuid::new_v4(),
                look_id: look.look_id,
                kind: *kind,
                reference_image_url: format!("https://cdn.test/{}/{}.jpg", name, kind),
                has_crop: true,
                has_match: true,
            },
        )
        .await
        .unwrap();
    }

    look
}

/// Poll the store until the batch reaches a terminal state
pub async fn wait_for_terminal(ctx: &EngineContext, batch_id: Uuid, timeout: Duration) -> BatchState {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let batch = db::batches::load_batch(&ctx.db, batch_id)
            .await
            .unwrap()
            .expect("batch exists");
        if batch.is_terminal() {
            return batch.state;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("batch {} did not settle within {:?}", batch_id, timeout);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
