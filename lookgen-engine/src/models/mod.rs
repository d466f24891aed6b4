//! Data model for the generation planning engine

mod batch;
mod job;
mod look;

pub use batch::{BatchProgress, BatchState, RunBatch};
pub use job::{Job, JobStatus, Output, OutputStatus, StatusCounts};
pub use look::{Look, Slot, View, ViewKind};
