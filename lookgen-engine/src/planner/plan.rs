//! Plan Calculator
//!
//! **[GEN-PL-020]** Diff of desired vs. actual: for each resolved
//! (View, Slot) pairing of a Look,
//! `missing = force ? required : max(0, required - satisfied)`.
//! Callers count completed Outputs (plus any still pending or generating)
//! as satisfied; failed attempts never count, so a failed Output is
//! re-planned until enough successes exist. Idempotent by construction:
//! unchanged store state yields identical missing counts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::Pairing;
use crate::models::{Slot, ViewKind};

/// Outstanding work for one resolved pairing of a Look
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub view: ViewKind,
    pub slot: Slot,
    /// Outputs already counting toward the target
    pub satisfied: u32,
    /// Outputs still to create
    pub missing: u32,
}

/// Plan for a single Look
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookPlan {
    pub look_id: Uuid,
    pub units: Vec<WorkUnit>,
    /// Sum of missing counts across units
    pub total_missing: u32,
    /// False when the Look resolved zero pairings (not yet generatable)
    pub generatable: bool,
    /// Look first seen after the reference timestamp supplied by the caller
    pub new_since_last_run: bool,
}

/// Aggregate across a selected set of Looks
///
/// Backs the "you are about to generate K outputs across L looks" summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSummary {
    pub looks: Vec<LookPlan>,
    /// Total Outputs the plan would create
    pub total_outputs: u32,
    /// Looks contributing at least one Output
    pub looks_with_work: usize,
    /// Looks with zero resolved pairings
    pub not_generatable: Vec<Uuid>,
}

/// Compute the outstanding work for one Look
///
/// `satisfied` maps (View, Slot) to the count of Outputs already counting
/// toward the target (completed, plus open rows when the caller wants
/// re-invocation to be a no-op). Callers must reject `required == 0` before
/// getting here.
pub fn compute_look_plan(
    look_id: Uuid,
    pairings: &[Pairing],
    satisfied: &HashMap<(ViewKind, Slot), u32>,
    required: u32,
    force_regenerate: bool,
    new_since_last_run: bool,
) -> LookPlan {
    let units: Vec<WorkUnit> = pairings
        .iter()
        .map(|p| {
            let have = satisfied.get(&(p.view, p.slot)).copied().unwrap_or(0);
            let missing = if force_regenerate {
                required
            } else {
                required.saturating_sub(have)
            };
            WorkUnit {
                view: p.view,
                slot: p.slot,
                satisfied: have,
                missing,
            }
        })
        .collect();

    let total_missing = units.iter().map(|u| u.missing).sum();

    LookPlan {
        look_id,
        generatable: !units.is_empty(),
        new_since_last_run,
        units,
        total_missing,
    }
}

/// Aggregate per-Look plans into a batch summary
pub fn summarize(looks: Vec<LookPlan>) -> PlanSummary {
    let total_outputs = looks.iter().map(|l| l.total_missing).sum();
    let looks_with_work = looks.iter().filter(|l| l.total_missing > 0).count();
    let not_generatable = looks
        .iter()
        .filter(|l| !l.generatable)
        .map(|l| l.look_id)
        .collect();

    PlanSummary {
        looks,
        total_outputs,
        looks_with_work,
        not_generatable,
    }
}
