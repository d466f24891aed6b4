//! Run controller integration tests
//!
//! Exercise the full plan → start → loops → settle path against an
//! in-memory store and a scripted generation service.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use lookgen_common::Error;
use lookgen_engine::db;
use lookgen_engine::engine;
use lookgen_engine::models::{BatchState, JobStatus, OutputStatus, ViewKind};
use lookgen_engine::planner::BlockReason;

use helpers::{
    fast_loop_settings, frozen_dispatch_settings, seed_ready_look, test_context,
    wait_for_terminal, MockGenerationService,
};

#[tokio::test]
async fn run_completes_and_reinvocation_is_a_safe_noop() {
    let service = Arc::new(MockGenerationService::new(Duration::from_millis(20)));
    let ctx = test_context(service.clone()).await;
    fast_loop_settings(&ctx).await;

    // Front and side views resolve to hero, profile, and the detail
    // fallback: three pairings, six outputs at required=2.
    let look = seed_ready_look(&ctx, "FW26-001", &[ViewKind::Front, ViewKind::Side]).await;

    let started = engine::start_run(&ctx, vec![look.look_id], 2, false)
        .await
        .unwrap();
    assert_eq!(started.plan.summary.total_outputs, 6);
    assert_eq!(started.batch.progress.total, 6);

    let state = wait_for_terminal(&ctx, started.batch.batch_id, Duration::from_secs(15)).await;
    assert_eq!(state, BatchState::Completed);

    let jobs = db::jobs::list_for_batch(&ctx.db, started.batch.batch_id)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Completed);

    let counts = db::outputs::aggregate_counts(&ctx.db, &[jobs[0].job_id])
        .await
        .unwrap();
    assert_eq!(counts.completed, 6);
    assert_eq!(counts.failed, 0);

    // Same selection again: the plan finds nothing missing, nothing mutates.
    let err = engine::start_run(&ctx, vec![look.look_id], 2, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert!(err.to_string().contains("already satisfied"));
    assert!(db::batches::list_active(&ctx.db).await.unwrap().is_empty());
}

#[tokio::test]
async fn starting_over_an_in_flight_selection_creates_no_duplicate_work() {
    let service = Arc::new(MockGenerationService::new(Duration::from_millis(10)));
    let ctx = test_context(service).await;
    frozen_dispatch_settings(&ctx).await;

    // A side view resolves to the profile slot only.
    let look = seed_ready_look(&ctx, "FW26-010", &[ViewKind::Side]).await;
    let started = engine::start_run(&ctx, vec![look.look_id], 2, false)
        .await
        .unwrap();
    assert_eq!(started.batch.progress.total, 2);

    // Open outputs count toward the target, so the same selection again
    // plans nothing and persists nothing while the first run is in flight.
    let err = engine::start_run(&ctx, vec![look.look_id], 2, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let batches = db::batches::list_active(&ctx.db).await.unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].batch_id, started.batch.batch_id);

    let jobs = db::jobs::list_for_batch(&ctx.db, started.batch.batch_id)
        .await
        .unwrap();
    let counts = db::outputs::aggregate_counts(&ctx.db, &[jobs[0].job_id])
        .await
        .unwrap();
    assert_eq!(counts.pending, 2);
    assert_eq!(counts.total(), 2);
}

#[tokio::test]
async fn blocked_selection_fails_fast_with_classified_reasons() {
    let service = Arc::new(MockGenerationService::new(Duration::from_millis(10)));
    let ctx = test_context(service).await;

    // One look whose only view lacks a crop.
    let look = seed_ready_look(&ctx, "FW26-002", &[]).await;
    db::looks::save_view(
        &ctx.db,
        &lookgen_engine::models::View {
            view_id: uuid::Uuid::new_v4(),
            look_id: look.look_id,
            kind: ViewKind::Front,
            reference_image_url: "https://cdn.test/uncropped.jpg".to_string(),
            has_crop: false,
            has_match: true,
        },
    )
    .await
    .unwrap();

    let plan = engine::compute_plan(&ctx, &[look.look_id], 2, false)
        .await
        .unwrap();
    assert_eq!(plan.summary.total_outputs, 0);
    assert_eq!(plan.blocked.len(), 1);
    assert_eq!(plan.blocked[0].reason, BlockReason::MissingCrop);

    let err = engine::start_run(&ctx, vec![look.look_id], 2, false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("missing-crop"));
    // Nothing persisted by the failed start.
    assert!(db::batches::list_active(&ctx.db).await.unwrap().is_empty());
}

#[tokio::test]
async fn zero_required_options_is_rejected() {
    let service = Arc::new(MockGenerationService::new(Duration::from_millis(10)));
    let ctx = test_context(service).await;
    let look = seed_ready_look(&ctx, "FW26-003", &[ViewKind::Front]).await;

    let err = engine::start_run(&ctx, vec![look.look_id], 0, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn cancel_deletes_open_outputs_and_keeps_terminal_ones() {
    // Slow service so outputs are still open when the cancel lands.
    let service = Arc::new(MockGenerationService::new(Duration::from_secs(30)));
    let ctx = test_context(service).await;
    fast_loop_settings(&ctx).await;

    let look = seed_ready_look(&ctx, "FW26-004", &[ViewKind::Front, ViewKind::Side]).await;
    let started = engine::start_run(&ctx, vec![look.look_id], 2, false)
        .await
        .unwrap();

    // Let the dispatch loop pick some work up first.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let batch = engine::cancel_run(&ctx, started.batch.batch_id).await.unwrap();
    assert_eq!(batch.state, BatchState::Cancelled);
    assert!(batch.ended_at.is_some());

    let jobs = db::jobs::list_for_batch(&ctx.db, started.batch.batch_id)
        .await
        .unwrap();
    assert!(jobs.iter().all(|j| j.status == JobStatus::Canceled));

    let job_ids: Vec<uuid::Uuid> = jobs.iter().map(|j| j.job_id).collect();
    let counts = db::outputs::aggregate_counts(&ctx.db, &job_ids).await.unwrap();
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.generating, 0);

    // Cancelling again is an explicit error, not a silent repeat.
    let err = engine::cancel_run(&ctx, started.batch.batch_id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn retry_recreates_failed_outputs_at_fresh_attempt_indexes() {
    let service = Arc::new(MockGenerationService::failing_views(
        Duration::from_millis(10),
        vec![ViewKind::Front],
    ));
    let ctx = test_context(service).await;
    fast_loop_settings(&ctx).await;

    // A lone front view feeds both the hero slot and the detail fallback,
    // so required=2 makes four outputs, all failing.
    let look = seed_ready_look(&ctx, "FW26-005", &[ViewKind::Front]).await;
    let started = engine::start_run(&ctx, vec![look.look_id], 2, false)
        .await
        .unwrap();
    let state = wait_for_terminal(&ctx, started.batch.batch_id, Duration::from_secs(15)).await;
    assert_eq!(state, BatchState::Failed);

    let failed = db::outputs::list_failed_for_batch(&ctx.db, started.batch.batch_id)
        .await
        .unwrap();
    assert_eq!(failed.len(), 4);

    // Park the loops so the recreated rows stay inspectable.
    frozen_dispatch_settings(&ctx).await;
    let recreated = engine::retry_failed(&ctx, started.batch.batch_id)
        .await
        .unwrap();
    assert_eq!(recreated, 4);

    let batch = db::batches::load_batch(&ctx.db, started.batch.batch_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(batch.state, BatchState::Dispatching);
    assert!(batch.ended_at.is_none());

    let jobs = db::jobs::list_for_batch(&ctx.db, started.batch.batch_id)
        .await
        .unwrap();
    assert_eq!(jobs[0].status, JobStatus::Pending);

    // Old failed rows are gone; replacements sit above the old indexes.
    let pending = db::outputs::list_pending(&ctx.db, &[jobs[0].job_id], 10)
        .await
        .unwrap();
    assert_eq!(pending.len(), 4);
    assert!(pending.iter().all(|o| o.attempt_index >= 2));
    assert!(db::outputs::list_failed_for_batch(&ctx.db, started.batch.batch_id)
        .await
        .unwrap()
        .is_empty());

    // Nothing failed: a second retry is rejected.
    let err = engine::retry_failed(&ctx, started.batch.batch_id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn fill_missing_tops_up_an_active_job_without_duplicating_open_work() {
    let service = Arc::new(MockGenerationService::new(Duration::from_millis(10)));
    let ctx = test_context(service).await;
    frozen_dispatch_settings(&ctx).await;

    // Front feeds hero plus the detail fallback: two outputs at required=1.
    let look = seed_ready_look(&ctx, "FW26-006", &[ViewKind::Front]).await;
    let started = engine::start_run(&ctx, vec![look.look_id], 1, false)
        .await
        .unwrap();
    assert_eq!(started.batch.progress.total, 2);

    // Raise the target to 3: one output per pairing is already on its way,
    // so only two more per pairing are appended to the existing job.
    let outcome = engine::fill_missing(&ctx, None, 3).await.unwrap();
    assert_eq!(outcome.outputs_added, 4);
    assert_eq!(outcome.jobs_reused, 1);
    assert!(outcome.batch.is_none());

    let jobs = db::jobs::list_for_batch(&ctx.db, started.batch.batch_id)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].total, 6);

    // Re-running the same fill finds no deficit.
    let outcome = engine::fill_missing(&ctx, None, 3).await.unwrap();
    assert_eq!(outcome.outputs_added, 0);
    assert_eq!(outcome.jobs_reused, 0);
    assert!(outcome.batch.is_none());
}

#[tokio::test]
async fn fill_missing_opens_a_new_batch_for_looks_without_an_active_job() {
    let service = Arc::new(MockGenerationService::new(Duration::from_millis(10)));
    let ctx = test_context(service).await;
    fast_loop_settings(&ctx).await;

    // Run to completion at required=1.
    let look = seed_ready_look(&ctx, "FW26-007", &[ViewKind::Front]).await;
    let started = engine::start_run(&ctx, vec![look.look_id], 1, false)
        .await
        .unwrap();
    wait_for_terminal(&ctx, started.batch.batch_id, Duration::from_secs(15)).await;

    // Target raised to 2; the old job is terminal, so a new batch carries
    // the one extra output per pairing (hero and the detail fallback).
    frozen_dispatch_settings(&ctx).await;
    let outcome = engine::fill_missing(&ctx, None, 2).await.unwrap();
    assert_eq!(outcome.outputs_added, 0);
    assert_eq!(outcome.jobs_reused, 0);
    let batch = outcome.batch.expect("new batch created");
    assert_eq!(batch.progress.total, 2);
    assert_eq!(batch.state, BatchState::Dispatching);
}

#[tokio::test]
async fn resume_reattaches_loops_after_a_restart() {
    let service = Arc::new(MockGenerationService::new(Duration::from_millis(10)));
    let ctx = test_context(service.clone()).await;
    frozen_dispatch_settings(&ctx).await;

    let look = seed_ready_look(&ctx, "FW26-008", &[ViewKind::Front]).await;
    let started = engine::start_run(&ctx, vec![look.look_id], 2, false)
        .await
        .unwrap();

    // Fresh context over the same store: what startup sees after a crash.
    let restarted = lookgen_engine::engine::EngineContext {
        db: ctx.db.clone(),
        event_bus: lookgen_common::events::EventBus::new(16),
        generator: service,
        active_batches: std::sync::Arc::new(tokio::sync::RwLock::new(
            std::collections::HashMap::new(),
        )),
    };
    fast_loop_settings(&restarted).await;

    let resumed = engine::resume_active(&restarted).await.unwrap();
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].batch_id, started.batch.batch_id);
    assert!(restarted
        .active_batches
        .read()
        .await
        .contains_key(&started.batch.batch_id));

    // The resumed loops drive the batch to completion.
    let state = wait_for_terminal(&restarted, started.batch.batch_id, Duration::from_secs(15)).await;
    assert_eq!(state, BatchState::Completed);
}

#[tokio::test]
async fn stalled_outputs_are_reported_and_failed_only_by_operator_action() {
    let service = Arc::new(MockGenerationService::new(Duration::from_millis(10)));
    let ctx = test_context(service).await;
    frozen_dispatch_settings(&ctx).await;

    let look = seed_ready_look(&ctx, "FW26-009", &[ViewKind::Front]).await;
    let started = engine::start_run(&ctx, vec![look.look_id], 1, false)
        .await
        .unwrap();

    // Simulate an output stuck in GENERATING (e.g. orphaned by a crash).
    let jobs = db::jobs::list_for_batch(&ctx.db, started.batch.batch_id)
        .await
        .unwrap();
    let output = db::outputs::list_pending(&ctx.db, &[jobs[0].job_id], 1)
        .await
        .unwrap()
        .remove(0);
    db::outputs::mark_generating(&ctx.db, output.output_id)
        .await
        .unwrap();

    // Zero threshold: the row counts as stalled immediately.
    db::settings::set_setting(&ctx.db, "engine.stall_threshold_secs", "0")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = engine::get_progress(&ctx, started.batch.batch_id)
        .await
        .unwrap();
    assert_eq!(report.stalled.len(), 1);
    assert_eq!(report.stalled[0].output_id, output.output_id);

    // Still GENERATING: detection alone changes nothing.
    let counts = db::outputs::aggregate_counts(&ctx.db, &[jobs[0].job_id])
        .await
        .unwrap();
    assert_eq!(counts.generating, 1);

    let failed = engine::fail_stalled(&ctx, started.batch.batch_id)
        .await
        .unwrap();
    assert_eq!(failed, 1);

    let after = engine::get_progress(&ctx, started.batch.batch_id)
        .await
        .unwrap();
    assert!(after.stalled.is_empty());
    let failed_rows = db::outputs::list_failed_for_batch(&ctx.db, started.batch.batch_id)
        .await
        .unwrap();
    assert_eq!(failed_rows.len(), 1);
    assert_eq!(failed_rows[0].status, OutputStatus::Failed);
    assert_eq!(failed_rows[0].error.as_deref(), Some("timeout"));
}
