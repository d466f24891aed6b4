//! Dispatch loop
//!
//! **[GEN-DS-010]** One loop per active batch. Every tick it reads pending
//! Outputs from the store, skips any (Look, View) already in flight, and
//! hands at most `max_concurrency − active` of them to the generation
//! service as spawned tasks. The store is the only scheduling input, so a
//! crashed process resumes cleanly by just starting a new loop.
//!
//! **[GEN-DS-020]** At most one in-flight generation per (Look, View) key:
//! concurrent generations from the same reference image degrade variant
//! diversity. The key set lives in memory; the status claim in the store
//! (`mark_generating`) backstops it across loops.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use lookgen_common::{EngineEvent, EventBus, Result};

use crate::db::{self, settings::EngineSettings};
use crate::engine::generation::{GenerationError, GenerationOutcome, GenerationRequest, GenerationService};
use crate::models::OutputStatus;

/// In-flight dedup key: one generation per (Look, View) at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct WorkKey {
    look_id: Uuid,
    view: crate::models::ViewKind,
}

/// Pending rows scanned per tick; more than we can ever dispatch at once
const PENDING_SCAN_LIMIT: usize = 100;

pub struct DispatchLoop {
    db: sqlx::SqlitePool,
    generator: Arc<dyn GenerationService>,
    event_bus: EventBus,
    batch_id: Uuid,
    max_concurrency: usize,
    interval: Duration,
    max_dispatch_attempts: u32,
    active: Arc<Mutex<HashSet<WorkKey>>>,
    cancel: CancellationToken,
}

impl DispatchLoop {
    pub fn new(
        db: sqlx::SqlitePool,
        generator: Arc<dyn GenerationService>,
        event_bus: EventBus,
        batch_id: Uuid,
        settings: &EngineSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            db,
            generator,
            event_bus,
            batch_id,
            max_concurrency: settings.max_concurrency,
            interval: Duration::from_millis(settings.dispatch_interval_ms),
            max_dispatch_attempts: settings.max_dispatch_attempts,
            active: Arc::new(Mutex::new(HashSet::new())),
            cancel,
        }
    }

    /// Run until cancelled
    ///
    /// Tick errors are logged and retried on the next interval; the loop
    /// itself only stops on cancellation. In-flight tasks are aborted on
    /// cancel; their late store writes are no-ops because cancellation
    /// deletes the non-terminal rows first.
    pub async fn run(self) {
        tracing::info!(
            batch_id = %self.batch_id,
            max_concurrency = self.max_concurrency,
            interval_ms = self.interval.as_millis() as u64,
            "Dispatch loop started"
        );

        // First tick one full interval after spawn, not immediately.
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tasks.shutdown().await;
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(&mut tasks).await {
                        tracing::error!(
                            batch_id = %self.batch_id,
                            error = %e,
                            "Dispatch tick failed, retrying next interval"
                        );
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!(
                                batch_id = %self.batch_id,
                                error = %e,
                                "Dispatch task panicked"
                            );
                        }
                    }
                }
            }
        }

        tracing::info!(batch_id = %self.batch_id, "Dispatch loop stopped");
    }

    async fn tick(&self, tasks: &mut JoinSet<()>) -> Result<()> {
        let job_ids = db::jobs::job_ids_for_batch(&self.db, self.batch_id).await?;
        if job_ids.is_empty() {
            return Ok(());
        }

        let pending = db::outputs::list_pending(&self.db, &job_ids, PENDING_SCAN_LIMIT).await?;
        if pending.is_empty() {
            return Ok(());
        }

        // Selection happens under the lock so the active set can never
        // exceed max_concurrency: tasks only ever remove keys.
        let mut selected = Vec::new();
        {
            let mut active = self.active.lock().await;
            let available = self.max_concurrency.saturating_sub(active.len());

            for output in pending {
                if selected.len() >= available {
                    break;
                }
                let key = WorkKey {
                    look_id: output.look_id,
                    view: output.view,
                };
                if active.contains(&key) {
                    continue;
                }
                active.insert(key);
                selected.push((key, output));
            }
        }

        for (key, output) in selected {
            tracing::debug!(
                batch_id = %self.batch_id,
                output_id = %output.output_id,
                look_id = %output.look_id,
                view = %output.view,
                slot = %output.slot,
                "Dispatching output"
            );

            let db = self.db.clone();
            let generator = Arc::clone(&self.generator);
            let event_bus = self.event_bus.clone();
            let active = Arc::clone(&self.active);
            let batch_id = self.batch_id;
            let max_attempts = self.max_dispatch_attempts;

            tasks.spawn(async move {
                if let Err(e) =
                    dispatch_one(&db, generator.as_ref(), &event_bus, batch_id, &output, max_attempts)
                        .await
                {
                    tracing::warn!(
                        batch_id = %batch_id,
                        output_id = %output.output_id,
                        error = %e,
                        "Dispatch failed; output left for a later tick"
                    );
                }
                active.lock().await.remove(&key);
            });
        }

        Ok(())
    }
}

/// Drive one Output through a single generation call
///
/// Late settlement after cancellation is harmless: the status writes below
/// match zero rows once the Output has been deleted.
async fn dispatch_one(
    db: &sqlx::SqlitePool,
    generator: &dyn GenerationService,
    event_bus: &EventBus,
    batch_id: Uuid,
    output: &crate::models::Output,
    max_dispatch_attempts: u32,
) -> Result<()> {
    let attempts = db::outputs::record_dispatch(db, output.output_id).await?;
    if attempts > max_dispatch_attempts {
        let affected = db::outputs::update_status(
            db,
            output.output_id,
            OutputStatus::Failed,
            None,
            Some("transport-exhausted"),
        )
        .await?;
        if affected {
            tracing::warn!(
                output_id = %output.output_id,
                attempts,
                "Output exhausted its dispatch attempts"
            );
            event_bus.emit(EngineEvent::OutputFailed {
                batch_id,
                output_id: output.output_id,
                look_id: output.look_id,
                view: output.view.to_string(),
                error: "transport-exhausted".to_string(),
                timestamp: Utc::now(),
            });
        }
        return Ok(());
    }

    // Claim the row; a miss means it was cancelled or already picked up.
    if !db::outputs::mark_generating(db, output.output_id).await? {
        return Ok(());
    }

    let view = match db::looks::view_for(db, output.look_id, output.view).await? {
        Some(view) => view,
        None => {
            // Catalog changed under us; nothing to generate from.
            db::outputs::update_status(
                db,
                output.output_id,
                OutputStatus::Failed,
                None,
                Some("reference view missing"),
            )
            .await?;
            return Ok(());
        }
    };

    let request = GenerationRequest {
        output_id: output.output_id,
        look_id: output.look_id,
        view: output.view,
        slot: output.slot,
        reference_image_url: view.reference_image_url,
    };

    match generator.generate(&request).await {
        Ok(GenerationOutcome::Completed { artifact_url }) => {
            let affected = db::outputs::update_status(
                db,
                output.output_id,
                OutputStatus::Completed,
                Some(&artifact_url),
                None,
            )
            .await?;
            if affected {
                event_bus.emit(EngineEvent::OutputCompleted {
                    batch_id,
                    output_id: output.output_id,
                    look_id: output.look_id,
                    view: output.view.to_string(),
                    timestamp: Utc::now(),
                });
            } else {
                tracing::debug!(
                    output_id = %output.output_id,
                    "Late completion for a deleted output, ignored"
                );
            }
        }
        Ok(GenerationOutcome::Failed { reason }) => {
            let affected = db::outputs::update_status(
                db,
                output.output_id,
                OutputStatus::Failed,
                None,
                Some(&reason),
            )
            .await?;
            if affected {
                tracing::warn!(
                    output_id = %output.output_id,
                    reason = %reason,
                    "Generation failed"
                );
                event_bus.emit(EngineEvent::OutputFailed {
                    batch_id,
                    output_id: output.output_id,
                    look_id: output.look_id,
                    view: output.view.to_string(),
                    error: reason,
                    timestamp: Utc::now(),
                });
            }
        }
        Err(GenerationError::Transport(e)) => {
            // Back to pending; the dispatch counter caps how often.
            tracing::warn!(
                output_id = %output.output_id,
                error = %e,
                "Transport failure, returning output to the queue"
            );
            db::outputs::update_status(db, output.output_id, OutputStatus::Pending, None, None)
                .await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory_pool, jobs, outputs};
    use crate::models::{Job, Slot, ViewKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct AlwaysCompletes;

    #[async_trait]
    impl GenerationService for AlwaysCompletes {
        async fn generate(
            &self,
            request: &GenerationRequest,
        ) -> std::result::Result<GenerationOutcome, GenerationError> {
            Ok(GenerationOutcome::Completed {
                artifact_url: format!("https://cdn.test/{}.png", request.output_id),
            })
        }
    }

    struct AlwaysTransportError {
        calls: AtomicU32,
    }

    #[async_trait]
    impl GenerationService for AlwaysTransportError {
        async fn generate(
            &self,
            _request: &GenerationRequest,
        ) -> std::result::Result<GenerationOutcome, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(GenerationError::Transport("connection refused".to_string()))
        }
    }

    async fn seed_output(pool: &sqlx::SqlitePool) -> (Job, crate::models::Output) {
        let look = crate::models::Look {
            look_id: Uuid::new_v4(),
            name: "SS26-001".to_string(),
            talent_ref: None,
            first_seen_at: Utc::now(),
        };
        db::looks::save_look(pool, &look).await.unwrap();
        db::looks::save_view(
            pool,
            &crate::models::View {
                view_id: Uuid::new_v4(),
                look_id: look.look_id,
                kind: ViewKind::Front,
                reference_image_url: "https://cdn.test/front.jpg".to_string(),
                has_crop: true,
                has_match: true,
            },
        )
        .await
        .unwrap();

        let job = Job::new(Uuid::new_v4(), look.look_id, 1);
        jobs::create_job(pool, &job).await.unwrap();
        outputs::create_outputs(
            pool,
            job.job_id,
            job.look_id,
            &[outputs::OutputSpec {
                view: ViewKind::Front,
                slot: Slot::Hero,
                attempt_index: 0,
            }],
        )
        .await
        .unwrap();
        let output = outputs::list_pending(pool, &[job.job_id], 1)
            .await
            .unwrap()
            .remove(0);
        (job, output)
    }

    #[tokio::test]
    async fn successful_dispatch_completes_the_output() {
        let pool = init_memory_pool().await.unwrap();
        let (job, output) = seed_output(&pool).await;
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();

        dispatch_one(&pool, &AlwaysCompletes, &bus, job.batch_id, &output, 20)
            .await
            .unwrap();

        let counts = outputs::aggregate_counts(&pool, &[job.job_id]).await.unwrap();
        assert_eq!(counts.completed, 1);
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::OutputCompleted { .. }
        ));
    }

    #[tokio::test]
    async fn transport_failure_returns_output_to_pending() {
        let pool = init_memory_pool().await.unwrap();
        let (job, output) = seed_output(&pool).await;
        let bus = EventBus::new(10);
        let service = AlwaysTransportError {
            calls: AtomicU32::new(0),
        };

        dispatch_one(&pool, &service, &bus, job.batch_id, &output, 20)
            .await
            .unwrap();

        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        let counts = outputs::aggregate_counts(&pool, &[job.job_id]).await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.failed, 0);
    }

    #[tokio::test]
    async fn exhausted_dispatch_attempts_fail_the_output() {
        let pool = init_memory_pool().await.unwrap();
        let (job, output) = seed_output(&pool).await;
        let bus = EventBus::new(10);

        // max_dispatch_attempts = 1: the first dispatch consumes it, the
        // second one fails the row without calling the service.
        let service = AlwaysTransportError {
            calls: AtomicU32::new(0),
        };
        dispatch_one(&pool, &service, &bus, job.batch_id, &output, 1)
            .await
            .unwrap();
        dispatch_one(&pool, &service, &bus, job.batch_id, &output, 1)
            .await
            .unwrap();

        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        let counts = outputs::aggregate_counts(&pool, &[job.job_id]).await.unwrap();
        assert_eq!(counts.failed, 1);
    }

    #[tokio::test]
    async fn late_settlement_after_deletion_is_a_noop() {
        let pool = init_memory_pool().await.unwrap();
        let (job, output) = seed_output(&pool).await;
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();

        outputs::delete_by_ids(&pool, &[output.output_id]).await.unwrap();
        dispatch_one(&pool, &AlwaysCompletes, &bus, job.batch_id, &output, 20)
            .await
            .unwrap();

        let counts = outputs::aggregate_counts(&pool, &[job.job_id]).await.unwrap();
        assert_eq!(counts.total(), 0);
        assert!(rx.try_recv().is_err());
    }
}
