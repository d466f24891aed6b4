//! Run controller
//!
//! **[GEN-RC-010]** Orchestrates the batch lifecycle: plan preview, run
//! start, cancellation, retry of failed Outputs, fill-missing top-ups,
//! operator handling of stalled Outputs, and reattachment to batches that
//! were in flight when the process last stopped. Every operation is a diff
//! against the store, so invoking one twice creates no duplicate work.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use lookgen_common::{EngineEvent, Error, EventBus, Result};

use crate::db::{self, outputs::OutputSpec};
use crate::engine::dispatch::DispatchLoop;
use crate::engine::generation::GenerationService;
use crate::engine::tracker::ProgressTracker;
use crate::models::{
    BatchState, Job, JobStatus, OutputStatus, RunBatch, StatusCounts, Slot, ViewKind,
};
use crate::planner::{
    self, default_rules, filter_ready, resolve_pairings, BlockedCandidate, LookPlan, PlanSummary,
};

/// Loop handles for one in-flight batch
///
/// Cancelling the token stops both loops; the tracker also cancels it when
/// the batch settles on its own.
pub struct BatchHandle {
    pub cancel: CancellationToken,
}

/// In-memory registry of batches with loops attached
pub type ActiveBatches = Arc<RwLock<HashMap<Uuid, BatchHandle>>>;

/// Everything the controller operations need
#[derive(Clone)]
pub struct EngineContext {
    pub db: sqlx::SqlitePool,
    pub event_bus: EventBus,
    pub generator: Arc<dyn GenerationService>,
    pub active_batches: ActiveBatches,
}

/// Plan preview: what a run would create, and what is blocked
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub summary: PlanSummary,
    pub blocked: Vec<BlockedCandidate>,
}

/// Result of starting a run
#[derive(Debug, Clone, Serialize)]
pub struct StartedRun {
    pub batch: RunBatch,
    pub plan: PlanReport,
}

/// Result of a fill-missing pass
#[derive(Debug, Clone, Serialize)]
pub struct FillOutcome {
    /// Batch created for Looks without an active Job, if any were needed
    pub batch: Option<RunBatch>,
    /// Outputs appended to already-active Jobs
    pub outputs_added: u32,
    /// Active Jobs that were topped up instead of duplicated
    pub jobs_reused: usize,
}

/// Per-Job slice of a progress report
#[derive(Debug, Clone, Serialize)]
pub struct JobProgress {
    pub job_id: Uuid,
    pub look_id: Uuid,
    pub status: JobStatus,
    pub counts: StatusCounts,
}

/// An Output generating beyond the stall threshold
#[derive(Debug, Clone, Serialize)]
pub struct StalledOutput {
    pub output_id: Uuid,
    pub look_id: Uuid,
    pub view: ViewKind,
    pub slot: Slot,
    pub age_seconds: i64,
}

/// Fresh progress snapshot for one batch
///
/// Recomputed from the store on every request rather than served from the
/// tracker's cache, so it is accurate even between tracker ticks.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressReport {
    pub batch: RunBatch,
    pub jobs: Vec<JobProgress>,
    pub stalled: Vec<StalledOutput>,
}

/// Compute the plan for a Look selection without touching the store
pub async fn compute_plan(
    ctx: &EngineContext,
    look_ids: &[Uuid],
    required_options: u32,
    force_regenerate: bool,
) -> Result<PlanReport> {
    if required_options == 0 {
        return Err(Error::InvalidInput(
            "required_options must be at least 1".to_string(),
        ));
    }
    if look_ids.is_empty() {
        return Err(Error::InvalidInput("no looks selected".to_string()));
    }

    let looks = db::looks::list_looks(&ctx.db, look_ids).await?;
    if looks.len() != look_ids.len() {
        let found: std::collections::HashSet<Uuid> = looks.iter().map(|l| l.look_id).collect();
        let missing: Vec<String> = look_ids
            .iter()
            .filter(|id| !found.contains(id))
            .map(|id| id.to_string())
            .collect();
        return Err(Error::NotFound(format!(
            "unknown looks: {}",
            missing.join(", ")
        )));
    }

    let views_by_look = db::looks::views_for_looks(&ctx.db, look_ids).await?;
    let capacity = db::settings::slot_capacity(&ctx.db).await?;
    let rules = default_rules();
    let last_run = db::batches::latest_started_at(&ctx.db).await?;

    let mut plans = Vec::with_capacity(looks.len());
    let mut blocked = Vec::new();
    for look in &looks {
        let empty = Vec::new();
        let views = views_by_look.get(&look.look_id).unwrap_or(&empty);
        let pairings = resolve_pairings(views, &rules, &capacity);
        let gate = filter_ready(look.look_id, views, &pairings);
        blocked.extend(gate.blocked);

        let mut satisfied = db::outputs::completed_counts_for_look(&ctx.db, look.look_id).await?;
        if !force_regenerate {
            // Outputs already pending or generating count toward the target,
            // so starting over an in-flight selection plans no duplicates.
            let open = db::outputs::open_counts_for_look(&ctx.db, look.look_id).await?;
            for (key, n) in open {
                *satisfied.entry(key).or_default() += n;
            }
        }
        let new_since = match last_run {
            Some(at) => look.is_new_since(at),
            None => true,
        };
        plans.push(planner::compute_look_plan(
            look.look_id,
            &gate.ready,
            &satisfied,
            required_options,
            force_regenerate,
            new_since,
        ));
    }

    Ok(PlanReport {
        summary: planner::summarize(plans),
        blocked,
    })
}

/// Start a reconciliation run over a Look selection
///
/// Fails synchronously, with nothing persisted, when the plan contains no
/// work; re-invoking with the same selection is always safe.
pub async fn start_run(
    ctx: &EngineContext,
    look_ids: Vec<Uuid>,
    required_options: u32,
    force_regenerate: bool,
) -> Result<StartedRun> {
    let plan = compute_plan(ctx, &look_ids, required_options, force_regenerate).await?;

    if plan.summary.total_outputs == 0 {
        return Err(no_work_error(&plan));
    }

    let mut batch = RunBatch::new(look_ids, required_options, force_regenerate);
    batch.warnings = plan.blocked.clone();
    db::batches::save_batch(&ctx.db, &batch).await?;

    let total = create_jobs_for_plans(&ctx.db, batch.batch_id, &plan.summary.looks).await?;
    batch.progress.total = total;
    batch.transition_to(BatchState::Dispatching);
    db::batches::save_batch(&ctx.db, &batch).await?;

    spawn_loops(ctx, batch.batch_id).await?;

    tracing::info!(
        batch_id = %batch.batch_id,
        looks = plan.summary.looks_with_work,
        total_outputs = total,
        force_regenerate,
        "Run started"
    );
    ctx.event_bus.emit(EngineEvent::BatchStarted {
        batch_id: batch.batch_id,
        look_count: plan.summary.looks_with_work,
        total_outputs: total,
        timestamp: Utc::now(),
    });

    Ok(StartedRun { batch, plan })
}

fn no_work_error(plan: &PlanReport) -> Error {
    if plan.summary.looks.iter().all(|l| l.units.is_empty()) {
        let mut reasons: HashMap<String, usize> = HashMap::new();
        for candidate in &plan.blocked {
            *reasons.entry(candidate.reason.to_string()).or_default() += 1;
        }
        let mut parts: Vec<String> = reasons
            .into_iter()
            .map(|(reason, n)| format!("{} x{}", reason, n))
            .collect();
        parts.sort();
        Error::InvalidInput(format!(
            "no look in the selection is ready to generate ({})",
            parts.join(", ")
        ))
    } else {
        Error::InvalidInput(
            "selection is already satisfied or in flight; nothing to generate".to_string(),
        )
    }
}

/// Create a Job plus pending Outputs per Look that has outstanding work
async fn create_jobs_for_plans(
    pool: &sqlx::SqlitePool,
    batch_id: Uuid,
    plans: &[LookPlan],
) -> Result<u32> {
    let mut total = 0u32;

    for plan in plans {
        if plan.total_missing == 0 {
            continue;
        }
        let job = Job::new(batch_id, plan.look_id, plan.total_missing);
        db::jobs::create_job(pool, &job).await?;

        let mut specs = Vec::with_capacity(plan.total_missing as usize);
        for unit in &plan.units {
            for attempt in 0..unit.missing {
                specs.push(OutputSpec {
                    view: unit.view,
                    slot: unit.slot,
                    attempt_index: attempt,
                });
            }
        }
        total += db::outputs::create_outputs(pool, job.job_id, plan.look_id, &specs).await?;
    }

    Ok(total)
}

/// Attach dispatch and tracker loops to a batch
///
/// Idempotent: a batch that already has loops keeps them.
pub async fn spawn_loops(ctx: &EngineContext, batch_id: Uuid) -> Result<()> {
    let settings = db::settings::engine_settings(&ctx.db).await?;

    let cancel = CancellationToken::new();
    {
        let mut handles = ctx.active_batches.write().await;
        if handles.contains_key(&batch_id) {
            return Ok(());
        }
        handles.insert(
            batch_id,
            BatchHandle {
                cancel: cancel.clone(),
            },
        );
    }

    let dispatch = DispatchLoop::new(
        ctx.db.clone(),
        Arc::clone(&ctx.generator),
        ctx.event_bus.clone(),
        batch_id,
        &settings,
        cancel.clone(),
    );
    tokio::spawn(dispatch.run());

    let tracker = ProgressTracker::new(
        ctx.db.clone(),
        ctx.event_bus.clone(),
        batch_id,
        &settings,
        cancel,
    );
    let handles = Arc::clone(&ctx.active_batches);
    tokio::spawn(async move {
        tracker.run().await;
        handles.write().await.remove(&batch_id);
    });

    Ok(())
}

/// Cancel an in-flight batch
///
/// Stops the loops, deletes every non-terminal Output (completed and failed
/// rows are kept), marks the Jobs canceled and the batch CANCELLED. Any
/// generation still settling afterwards writes into the void.
pub async fn cancel_run(ctx: &EngineContext, batch_id: Uuid) -> Result<RunBatch> {
    let mut batch = db::batches::load_batch(&ctx.db, batch_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("batch {} not found", batch_id)))?;
    if batch.is_terminal() {
        return Err(Error::InvalidInput(format!(
            "batch {} is already {}",
            batch_id,
            batch.state.as_str()
        )));
    }

    if let Some(handle) = ctx.active_batches.write().await.remove(&batch_id) {
        handle.cancel.cancel();
    }

    let deleted = db::outputs::delete_non_terminal_for_batch(&ctx.db, batch_id).await?;
    db::jobs::set_status_for_batch(&ctx.db, batch_id, JobStatus::Canceled).await?;

    batch.progress.queued = 0;
    batch.progress.running = 0;
    batch.transition_to(BatchState::Cancelled);
    db::batches::save_batch(&ctx.db, &batch).await?;

    tracing::info!(batch_id = %batch_id, outputs_deleted = deleted, "Run cancelled");
    ctx.event_bus.emit(EngineEvent::BatchCancelled {
        batch_id,
        outputs_deleted: deleted,
        timestamp: Utc::now(),
    });

    Ok(batch)
}

/// Recreate every failed Output of a batch as a fresh pending attempt
///
/// Failed rows are deleted and replaced at the next free attempt indexes,
/// their Jobs reset to pending, and the loops restarted if the batch had
/// already settled. Returns the number of Outputs recreated.
pub async fn retry_failed(ctx: &EngineContext, batch_id: Uuid) -> Result<u32> {
    let mut batch = db::batches::load_batch(&ctx.db, batch_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("batch {} not found", batch_id)))?;

    let failed = db::outputs::list_failed_for_batch(&ctx.db, batch_id).await?;
    if failed.is_empty() {
        return Err(Error::InvalidInput(format!(
            "batch {} has no failed outputs",
            batch_id
        )));
    }

    // Group failures per (Job, View, Slot) so replacements take attempt
    // indexes above everything that job has seen.
    let mut groups: HashMap<(Uuid, Uuid, ViewKind, Slot), u32> = HashMap::new();
    for output in &failed {
        *groups
            .entry((output.job_id, output.look_id, output.view, output.slot))
            .or_default() += 1;
    }

    // Bases come from the indexes the job has seen, so they are read before
    // the failed rows are deleted.
    let mut bases: HashMap<(Uuid, Uuid, ViewKind, Slot), u32> = HashMap::new();
    for key in groups.keys() {
        let (job_id, _, view, slot) = *key;
        let base = db::outputs::max_attempt_index(&ctx.db, job_id, view, slot)
            .await?
            .map(|max| max + 1)
            .unwrap_or(0);
        bases.insert(*key, base);
    }

    let failed_ids: Vec<Uuid> = failed.iter().map(|o| o.output_id).collect();
    db::outputs::delete_by_ids(&ctx.db, &failed_ids).await?;

    let mut recreated = 0u32;
    let mut touched_jobs = std::collections::HashSet::new();
    for ((job_id, look_id, view, slot), count) in groups {
        let base = bases[&(job_id, look_id, view, slot)];
        let specs: Vec<OutputSpec> = (0..count)
            .map(|i| OutputSpec {
                view,
                slot,
                attempt_index: base + i,
            })
            .collect();
        recreated += db::outputs::create_outputs(&ctx.db, job_id, look_id, &specs).await?;
        touched_jobs.insert(job_id);
    }

    for job_id in touched_jobs {
        db::jobs::update_status(&ctx.db, job_id, JobStatus::Pending).await?;
    }

    // A settled batch reopens; the tracker re-settles it when done.
    if batch.is_terminal() {
        batch.state = BatchState::Dispatching;
        batch.ended_at = None;
        db::batches::save_batch(&ctx.db, &batch).await?;
    }
    spawn_loops(ctx, batch_id).await?;

    tracing::info!(batch_id = %batch_id, recreated, "Failed outputs queued for retry");
    Ok(recreated)
}

/// Reattach loops to every non-terminal batch (startup recovery)
///
/// Outputs left GENERATING by a crash stay as they are; the stall detector
/// flags them once they age past the threshold.
pub async fn resume_active(ctx: &EngineContext) -> Result<Vec<RunBatch>> {
    let batches = db::batches::list_active(&ctx.db).await?;

    for batch in &batches {
        tracing::info!(
            batch_id = %batch.batch_id,
            state = batch.state.as_str(),
            "Resuming batch"
        );
        spawn_loops(ctx, batch.batch_id).await?;
    }

    if batches.is_empty() {
        tracing::info!("No batches to resume");
    }

    Ok(batches)
}

/// Top up Looks whose completed Outputs undershoot the required count
///
/// Looks with an active Job get extra Outputs appended to it; the rest go
/// into one new batch. With no explicit selection, every Look that has ever
/// had a Job is examined.
pub async fn fill_missing(
    ctx: &EngineContext,
    look_ids: Option<Vec<Uuid>>,
    required_options: u32,
) -> Result<FillOutcome> {
    let scope = match look_ids {
        Some(ids) if !ids.is_empty() => ids,
        _ => db::jobs::look_ids_with_jobs(&ctx.db).await?,
    };
    if scope.is_empty() {
        return Err(Error::InvalidInput(
            "no looks have jobs to fill".to_string(),
        ));
    }

    let plan = compute_plan(ctx, &scope, required_options, false).await?;

    let mut outputs_added = 0u32;
    let mut reused_jobs = std::collections::HashSet::new();
    let mut new_plans = Vec::new();

    for look_plan in &plan.summary.looks {
        if look_plan.total_missing == 0 {
            continue;
        }
        match db::jobs::active_job_for_look(&ctx.db, look_plan.look_id).await? {
            Some(job) => {
                // The plan already counted open work toward the target, so
                // each unit's missing count is the exact deficit to append.
                let mut added = 0u32;
                for unit in &look_plan.units {
                    if unit.missing == 0 {
                        continue;
                    }
                    let base = db::outputs::max_attempt_index(&ctx.db, job.job_id, unit.view, unit.slot)
                        .await?
                        .map(|max| max + 1)
                        .unwrap_or(0);
                    let specs: Vec<OutputSpec> = (0..unit.missing)
                        .map(|i| OutputSpec {
                            view: unit.view,
                            slot: unit.slot,
                            attempt_index: base + i,
                        })
                        .collect();
                    added +=
                        db::outputs::create_outputs(&ctx.db, job.job_id, job.look_id, &specs).await?;
                }
                if added > 0 {
                    db::jobs::increase_total(&ctx.db, job.job_id, added).await?;
                    reused_jobs.insert(job.job_id);
                    outputs_added += added;
                    // Make sure the job's batch has loops running.
                    spawn_loops(ctx, job.batch_id).await?;
                }
            }
            None => new_plans.push(look_plan.clone()),
        }
    }

    let batch = if new_plans.iter().any(|p| p.total_missing > 0) {
        let look_ids: Vec<Uuid> = new_plans.iter().map(|p| p.look_id).collect();
        let mut batch = RunBatch::new(look_ids, required_options, false);
        db::batches::save_batch(&ctx.db, &batch).await?;
        let total = create_jobs_for_plans(&ctx.db, batch.batch_id, &new_plans).await?;
        batch.progress.total = total;
        batch.transition_to(BatchState::Dispatching);
        db::batches::save_batch(&ctx.db, &batch).await?;
        spawn_loops(ctx, batch.batch_id).await?;

        ctx.event_bus.emit(EngineEvent::BatchStarted {
            batch_id: batch.batch_id,
            look_count: new_plans.len(),
            total_outputs: total,
            timestamp: Utc::now(),
        });
        Some(batch)
    } else {
        None
    };

    tracing::info!(
        outputs_added,
        jobs_reused = reused_jobs.len(),
        new_batch = batch.as_ref().map(|b| b.batch_id.to_string()),
        "Fill-missing pass complete"
    );

    Ok(FillOutcome {
        batch,
        outputs_added,
        jobs_reused: reused_jobs.len(),
    })
}

/// Fresh progress snapshot for one batch
pub async fn get_progress(ctx: &EngineContext, batch_id: Uuid) -> Result<ProgressReport> {
    let batch = db::batches::load_batch(&ctx.db, batch_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("batch {} not found", batch_id)))?;

    let jobs = db::jobs::list_for_batch(&ctx.db, batch_id).await?;
    let job_ids: Vec<Uuid> = jobs.iter().map(|j| j.job_id).collect();
    let by_job = db::outputs::aggregate_counts_by_job(&ctx.db, &job_ids).await?;

    let job_progress = jobs
        .into_iter()
        .map(|job| {
            let counts = by_job.get(&job.job_id).copied().unwrap_or_default();
            JobProgress {
                job_id: job.job_id,
                look_id: job.look_id,
                status: job.status,
                counts,
            }
        })
        .collect();

    let settings = db::settings::engine_settings(&ctx.db).await?;
    let cutoff = Utc::now() - chrono::Duration::seconds(settings.stall_threshold_secs);
    let stalled = db::outputs::list_stalled_for_batch(&ctx.db, batch_id, cutoff)
        .await?
        .into_iter()
        .map(|o| StalledOutput {
            output_id: o.output_id,
            look_id: o.look_id,
            view: o.view,
            slot: o.slot,
            age_seconds: (Utc::now() - o.updated_at).num_seconds(),
        })
        .collect();

    Ok(ProgressReport {
        batch,
        jobs: job_progress,
        stalled,
    })
}

/// Fail every stalled Output of a batch (operator action)
///
/// The stall detector only flags; this is the explicit step that moves
/// stalled rows to FAILED with a timeout reason. Returns how many moved.
pub async fn fail_stalled(ctx: &EngineContext, batch_id: Uuid) -> Result<u32> {
    db::batches::load_batch(&ctx.db, batch_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("batch {} not found", batch_id)))?;

    let settings = db::settings::engine_settings(&ctx.db).await?;
    let cutoff = Utc::now() - chrono::Duration::seconds(settings.stall_threshold_secs);
    let stalled = db::outputs::list_stalled_for_batch(&ctx.db, batch_id, cutoff).await?;

    let mut failed = 0u32;
    for output in stalled {
        let affected = db::outputs::update_status(
            &ctx.db,
            output.output_id,
            OutputStatus::Failed,
            None,
            Some("timeout"),
        )
        .await?;
        if affected {
            failed += 1;
            ctx.event_bus.emit(EngineEvent::OutputFailed {
                batch_id,
                output_id: output.output_id,
                look_id: output.look_id,
                view: output.view.to_string(),
                error: "timeout".to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    tracing::info!(batch_id = %batch_id, failed, "Stalled outputs failed by operator");
    Ok(failed)
}
