//! Generation engine: dispatch, progress tracking, run control
//!
//! The store is the single source of truth; the loops in this module are
//! stateless apart from in-flight dedup keys and stall flags, so a process
//! restart loses nothing.

pub mod controller;
pub mod dispatch;
pub mod generation;
pub mod tracker;

pub use controller::{
    cancel_run, compute_plan, fail_stalled, fill_missing, get_progress, resume_active,
    retry_failed, spawn_loops, start_run, ActiveBatches, BatchHandle, EngineContext, FillOutcome,
    JobProgress, PlanReport, ProgressReport, StalledOutput, StartedRun,
};
pub use dispatch::DispatchLoop;
pub use generation::{
    GenerationError, GenerationOutcome, GenerationRequest, GenerationService,
    HttpGenerationService,
};
pub use tracker::ProgressTracker;
