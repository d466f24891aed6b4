//! Job and Output records
//!
//! **[GEN-DM-020]** Jobs and Outputs are the persisted truth for "what has
//! actually been requested/produced". Jobs are created once per
//! reconciliation decision and are immutable except for status; Outputs are
//! the only rows the dispatch loop and progress tracker touch at fine grain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{Slot, ViewKind};

/// Status of a dispatched batch of work for one Look
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    /// Created, nothing dispatched yet
    Pending,
    /// At least one child Output has been dispatched
    Running,
    /// Every child Output completed
    Completed,
    /// Every child Output failed
    Failed,
    /// Mix of completed and failed children, none still in flight
    Partial,
    /// Cancelled by operator action
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Partial | JobStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Partial => "PARTIAL",
            JobStatus::Canceled => "CANCELED",
        }
    }
}

impl FromStr for JobStatus {
    type Err = lookgen_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            "PARTIAL" => Ok(JobStatus::Partial),
            "CANCELED" => Ok(JobStatus::Canceled),
            other => Err(lookgen_common::Error::Internal(format!(
                "Unknown job status: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one concrete generation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutputStatus {
    /// Waiting for the dispatch loop
    Pending,
    /// Handed to the generation service
    Generating,
    /// Artifact produced
    Completed,
    /// Generation failed (or operator failed a stalled row)
    Failed,
}

impl OutputStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutputStatus::Completed | OutputStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStatus::Pending => "PENDING",
            OutputStatus::Generating => "GENERATING",
            OutputStatus::Completed => "COMPLETED",
            OutputStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for OutputStatus {
    type Err = lookgen_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OutputStatus::Pending),
            "GENERATING" => Ok(OutputStatus::Generating),
            "COMPLETED" => Ok(OutputStatus::Completed),
            "FAILED" => Ok(OutputStatus::Failed),
            other => Err(lookgen_common::Error::Internal(format!(
                "Unknown output status: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for OutputStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted batch of generation work scoped to one Look
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub batch_id: Uuid,
    pub look_id: Uuid,
    pub status: JobStatus,
    /// Expected child Outputs; never decreases after creation
    pub total: u32,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(batch_id: Uuid, look_id: Uuid, total: u32) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            batch_id,
            look_id,
            status: JobStatus::Pending,
            total,
            created_at: Utc::now(),
        }
    }
}

/// One concrete generation attempt belonging to a Job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Output {
    pub output_id: Uuid,
    pub job_id: Uuid,
    pub look_id: Uuid,
    pub view: ViewKind,
    pub slot: Slot,
    pub attempt_index: u32,
    pub status: OutputStatus,
    /// Set only when status is COMPLETED
    pub artifact_url: Option<String>,
    /// Failure reason when status is FAILED
    pub error: Option<String>,
    /// Times the dispatch loop has picked this row up
    pub dispatch_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate Output status counts for a Job id set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u32,
    pub generating: u32,
    pub completed: u32,
    pub failed: u32,
}

impl StatusCounts {
    pub fn total(&self) -> u32 {
        self.pending + self.generating + self.completed + self.failed
    }

    pub fn in_flight(&self) -> u32 {
        self.pending + self.generating
    }

    /// Derive the Job status these counts imply
    ///
    /// Returns None for an empty count set (e.g. a Job whose non-terminal
    /// Outputs were deleted by cancellation); the caller leaves the stored
    /// status alone in that case.
    pub fn derive_job_status(&self) -> Option<JobStatus> {
        if self.total() == 0 {
            return None;
        }
        if self.in_flight() > 0 {
            if self.generating > 0 || self.completed > 0 || self.failed > 0 {
                return Some(JobStatus::Running);
            }
            return Some(JobStatus::Pending);
        }
        // All terminal
        Some(if self.failed == 0 {
            JobStatus::Completed
        } else if self.completed == 0 {
            JobStatus::Failed
        } else {
            JobStatus::Partial
        })
    }
}
