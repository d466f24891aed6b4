//! Progress tracker
//!
//! **[GEN-PR-010]** One tracker per active batch. Every tick it aggregates
//! Output counts per Job, rolls derived Job statuses forward, persists the
//! batch counters, and emits a progress event. When every Job is terminal
//! it stamps the batch with the worst Job state, emits a single completion
//! event, cancels the shared token (stopping the dispatch loop) and exits.
//!
//! **[GEN-PR-020]** Stall detection is advisory: a GENERATING Output older
//! than the threshold is flagged once and left alone. Only the operator's
//! fail-stalled action moves it to failed.

use chrono::Utc;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use lookgen_common::{EngineEvent, EventBus, Result};

use crate::db::{self, settings::EngineSettings};
use crate::models::{BatchProgress, BatchState, JobStatus, StatusCounts};

pub struct ProgressTracker {
    db: sqlx::SqlitePool,
    event_bus: EventBus,
    batch_id: Uuid,
    interval: Duration,
    stall_threshold_secs: i64,
    cancel: CancellationToken,
    /// Outputs already flagged stalled; one event per Output per process
    flagged_stalls: HashSet<Uuid>,
}

impl ProgressTracker {
    pub fn new(
        db: sqlx::SqlitePool,
        event_bus: EventBus,
        batch_id: Uuid,
        settings: &EngineSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            db,
            event_bus,
            batch_id,
            interval: Duration::from_millis(settings.progress_interval_ms),
            stall_threshold_secs: settings.stall_threshold_secs,
            cancel,
            flagged_stalls: HashSet::new(),
        }
    }

    /// Run until the batch settles or the token is cancelled
    pub async fn run(mut self) {
        tracing::info!(batch_id = %self.batch_id, "Progress tracker started");

        // First tick one full interval after spawn, not immediately.
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(true) => {
                            // Batch settled; stop the dispatch loop too.
                            self.cancel.cancel();
                            break;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            tracing::error!(
                                batch_id = %self.batch_id,
                                error = %e,
                                "Progress tick failed, retrying next interval"
                            );
                        }
                    }
                }
            }
        }

        tracing::info!(batch_id = %self.batch_id, "Progress tracker stopped");
    }

    /// One aggregation pass; returns true when the batch is settled
    async fn tick(&mut self) -> Result<bool> {
        let mut batch = match db::batches::load_batch(&self.db, self.batch_id).await? {
            Some(batch) => batch,
            None => {
                tracing::warn!(batch_id = %self.batch_id, "Tracked batch vanished from the store");
                return Ok(true);
            }
        };
        if batch.is_terminal() {
            return Ok(true);
        }

        let jobs = db::jobs::list_for_batch(&self.db, self.batch_id).await?;
        if jobs.is_empty() {
            return Ok(false);
        }
        let job_ids: Vec<Uuid> = jobs.iter().map(|j| j.job_id).collect();
        let by_job = db::outputs::aggregate_counts_by_job(&self.db, &job_ids).await?;

        let mut totals = StatusCounts::default();
        let mut statuses = Vec::with_capacity(jobs.len());
        for job in &jobs {
            let counts = by_job.get(&job.job_id).copied().unwrap_or_default();
            totals.pending += counts.pending;
            totals.generating += counts.generating;
            totals.completed += counts.completed;
            totals.failed += counts.failed;

            let status = if job.status == JobStatus::Canceled {
                JobStatus::Canceled
            } else {
                match counts.derive_job_status() {
                    Some(derived) => {
                        if derived != job.status {
                            tracing::debug!(
                                job_id = %job.job_id,
                                old_status = %job.status,
                                new_status = %derived,
                                "Job status derived from output counts"
                            );
                            db::jobs::update_status(&self.db, job.job_id, derived).await?;
                        }
                        derived
                    }
                    None => job.status,
                }
            };
            statuses.push(status);
        }

        batch.progress = BatchProgress {
            queued: totals.pending,
            running: totals.generating,
            done: totals.completed,
            failed: totals.failed,
            total: batch.progress.total.max(totals.total()),
        };

        self.flag_stalls().await?;

        if statuses.iter().all(JobStatus::is_terminal) {
            let state = terminal_batch_state(&statuses);
            batch.transition_to(state);
            db::batches::save_batch(&self.db, &batch).await?;

            tracing::info!(
                batch_id = %self.batch_id,
                state = state.as_str(),
                done = batch.progress.done,
                failed = batch.progress.failed,
                "Batch settled"
            );
            self.event_bus.emit(EngineEvent::BatchCompleted {
                batch_id: self.batch_id,
                state: state.as_str().to_string(),
                timestamp: Utc::now(),
            });
            return Ok(true);
        }

        db::batches::save_batch(&self.db, &batch).await?;
        self.event_bus.emit(EngineEvent::BatchProgress {
            batch_id: self.batch_id,
            queued: batch.progress.queued,
            running: batch.progress.running,
            done: batch.progress.done,
            failed: batch.progress.failed,
            timestamp: Utc::now(),
        });

        Ok(false)
    }

    async fn flag_stalls(&mut self) -> Result<()> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.stall_threshold_secs);
        let stalled = db::outputs::list_stalled_for_batch(&self.db, self.batch_id, cutoff).await?;

        for output in stalled {
            if self.flagged_stalls.insert(output.output_id) {
                let age_seconds = (Utc::now() - output.updated_at).num_seconds();
                tracing::warn!(
                    batch_id = %self.batch_id,
                    output_id = %output.output_id,
                    look_id = %output.look_id,
                    age_seconds,
                    "Output stalled in GENERATING"
                );
                self.event_bus.emit(EngineEvent::StallDetected {
                    batch_id: self.batch_id,
                    output_id: output.output_id,
                    look_id: output.look_id,
                    view: output.view.to_string(),
                    age_seconds,
                    timestamp: Utc::now(),
                });
            }
        }

        Ok(())
    }
}

/// Worst terminal Job state wins: FAILED < PARTIAL < COMPLETED
///
/// Cancelled Jobs are ignored here; an operator cancellation stamps the
/// batch CANCELLED directly and the tracker never reaches this point.
fn terminal_batch_state(statuses: &[JobStatus]) -> BatchState {
    let relevant: Vec<&JobStatus> = statuses
        .iter()
        .filter(|s| **s != JobStatus::Canceled)
        .collect();
    if relevant.is_empty() {
        return BatchState::Cancelled;
    }
    if relevant.iter().all(|s| **s == JobStatus::Completed) {
        BatchState::Completed
    } else if relevant.iter().all(|s| **s == JobStatus::Failed) {
        BatchState::Failed
    } else {
        BatchState::Partial
    }
}
