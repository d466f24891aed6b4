//! Generation planning: pairing resolution, plan calculation, prerequisite gate
//!
//! Everything in this module is pure (no store access, no side effects),
//! so the reconciliation math is unit-testable in isolation. The run
//! controller feeds it catalog rows and completed-output counts and turns
//! the result into Jobs and Outputs.

mod gate;
mod pairing;
mod plan;

pub use gate::{filter_ready, BlockReason, BlockedCandidate, GateOutcome};
pub use pairing::{default_rules, resolve_pairings, Pairing, PairingRule, SlotCapacity};
pub use plan::{compute_look_plan, summarize, LookPlan, PlanSummary, WorkUnit};
