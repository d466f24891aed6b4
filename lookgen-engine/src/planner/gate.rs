//! Prerequisite Gate
//!
//! **[GEN-PL-030]** Filters resolved pairings down to those whose upstream
//! prerequisites hold (cropped reference, matched identity). Blocked
//! candidates are surfaced with a classified reason so the operator can act
//! upstream; they are warnings, not errors, unless nothing at all is ready.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::Pairing;
use crate::models::{View, ViewKind};

/// Why a (Look, View) candidate was excluded from the plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockReason {
    /// Reference image has not been cropped yet
    MissingCrop,
    /// No identity reference assigned
    MissingMatch,
    /// The Look resolved zero pairings
    NoPairings,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BlockReason::MissingCrop => "missing-crop",
            BlockReason::MissingMatch => "missing-match",
            BlockReason::NoPairings => "no-pairings",
        };
        f.write_str(s)
    }
}

/// A candidate excluded by the gate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedCandidate {
    pub look_id: Uuid,
    /// None when the whole Look is blocked (no pairings)
    pub view: Option<ViewKind>,
    pub reason: BlockReason,
}

/// Gate result for one Look
#[derive(Debug, Clone)]
pub struct GateOutcome {
    /// Pairings whose prerequisites all hold
    pub ready: Vec<Pairing>,
    pub blocked: Vec<BlockedCandidate>,
}

/// Filter a Look's resolved pairings by prerequisite flags
///
/// A pairing is ready only when its View has both a crop and an identity
/// match. Crop is checked first; one reason per blocked View.
pub fn filter_ready(look_id: Uuid, views: &[View], pairings: &[Pairing]) -> GateOutcome {
    if pairings.is_empty() {
        return GateOutcome {
            ready: Vec::new(),
            blocked: vec![BlockedCandidate {
                look_id,
                view: None,
                reason: BlockReason::NoPairings,
            }],
        };
    }

    let mut ready = Vec::new();
    let mut blocked = Vec::new();
    let mut blocked_views = std::collections::HashSet::new();

    for pairing in pairings {
        let view = views.iter().find(|v| v.kind == pairing.view);
        let reason = match view {
            Some(v) if !v.has_crop => Some(BlockReason::MissingCrop),
            Some(v) if !v.has_match => Some(BlockReason::MissingMatch),
            Some(_) => None,
            // Pairings come from these views; a miss means caller error,
            // treat as blocked rather than panic.
            None => Some(BlockReason::NoPairings),
        };

        match reason {
            None => ready.push(*pairing),
            Some(reason) => {
                // One warning per View even if it feeds several Slots
                if blocked_views.insert((pairing.view, reason)) {
                    blocked.push(BlockedCandidate {
                        look_id,
                        view: Some(pairing.view),
                        reason,
                    });
                }
            }
        }
    }

    GateOutcome { ready, blocked }
}
