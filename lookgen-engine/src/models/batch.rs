//! Reconciliation batch state machine
//!
//! **[GEN-WF-010]** A RunBatch tracks one reconciliation run across a
//! selection of Looks: PLANNING → DISPATCHING → COMPLETED/PARTIAL/FAILED,
//! or CANCELLED from any non-terminal state. Batch status always reflects
//! the worst known terminal state of its Jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::planner::BlockedCandidate;

/// Batch lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BatchState {
    /// Plan computed, Jobs/Outputs being created
    Planning,
    /// Dispatch and progress loops active
    Dispatching,
    /// Every Output succeeded
    Completed,
    /// Mix of completed and failed Outputs
    Partial,
    /// Every Output failed
    Failed,
    /// Cancelled by operator
    Cancelled,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchState::Completed | BatchState::Partial | BatchState::Failed | BatchState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Planning => "PLANNING",
            BatchState::Dispatching => "DISPATCHING",
            BatchState::Completed => "COMPLETED",
            BatchState::Partial => "PARTIAL",
            BatchState::Failed => "FAILED",
            BatchState::Cancelled => "CANCELLED",
        }
    }
}

/// Aggregate progress counters for a batch
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BatchProgress {
    /// Outputs waiting for dispatch
    pub queued: u32,
    /// Outputs currently generating
    pub running: u32,
    /// Outputs completed
    pub done: u32,
    /// Outputs failed
    pub failed: u32,
    /// Total Outputs created for the batch
    pub total: u32,
}

/// One reconciliation run (persisted)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunBatch {
    pub batch_id: Uuid,
    pub state: BatchState,
    /// Looks selected for this run
    pub look_ids: Vec<Uuid>,
    /// Desired completed variants per (View, Slot)
    pub required_options: u32,
    pub force_regenerate: bool,
    /// Prerequisite-blocked candidates surfaced at plan time (non-fatal)
    pub warnings: Vec<BlockedCandidate>,
    pub progress: BatchProgress,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl RunBatch {
    pub fn new(look_ids: Vec<Uuid>, required_options: u32, force_regenerate: bool) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            state: BatchState::Planning,
            look_ids,
            required_options,
            force_regenerate,
            warnings: Vec::new(),
            progress: BatchProgress::default(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Transition to a new state, stamping `ended_at` on terminal states
    pub fn transition_to(&mut self, new_state: BatchState) {
        tracing::debug!(
            batch_id = %self.batch_id,
            old_state = ?self.state,
            new_state = ?new_state,
            "Batch state transition"
        );
        self.state = new_state;
        if new_state.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
