//! Pairing Resolver
//!
//! **[GEN-PL-010]** Pure mapping from a Look's available Views to the output
//! Slots they feed. Rules are either primary or fallback: a fallback rule
//! only applies when no primary rule produced a pairing for the same Slot
//! (e.g. a front View fills the detail Slot only when no detail View
//! exists). A Slot with zero available pose templates under the active
//! filter is never paired.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::models::{Slot, View, ViewKind};

/// One routing rule: View kind → candidate Slot
#[derive(Debug, Clone, Copy)]
pub struct PairingRule {
    pub kind: ViewKind,
    pub slot: Slot,
    /// Applies only when no primary rule matched the same Slot
    pub fallback: bool,
}

/// Static rule table used in production
///
/// detail → detail overrides the front → detail fallback.
pub fn default_rules() -> Vec<PairingRule> {
    vec![
        PairingRule {
            kind: ViewKind::Front,
            slot: Slot::Hero,
            fallback: false,
        },
        PairingRule {
            kind: ViewKind::Side,
            slot: Slot::Profile,
            fallback: false,
        },
        PairingRule {
            kind: ViewKind::Back,
            slot: Slot::Reverse,
            fallback: false,
        },
        PairingRule {
            kind: ViewKind::Detail,
            slot: Slot::Detail,
            fallback: false,
        },
        PairingRule {
            kind: ViewKind::Front,
            slot: Slot::Detail,
            fallback: true,
        },
    ]
}

/// Available pose-template count per Slot under the active filter
#[derive(Debug, Clone)]
pub struct SlotCapacity {
    templates: HashMap<Slot, u32>,
}

impl SlotCapacity {
    /// Same template count for every Slot
    pub fn uniform(count: u32) -> Self {
        Self {
            templates: Slot::ALL.iter().map(|s| (*s, count)).collect(),
        }
    }

    /// Override the count for one Slot
    pub fn with(mut self, slot: Slot, count: u32) -> Self {
        self.templates.insert(slot, count);
        self
    }

    pub fn available(&self, slot: Slot) -> u32 {
        self.templates.get(&slot).copied().unwrap_or(0)
    }
}

/// A resolved (View kind, Slot) work pairing for one Look
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pairing {
    pub view: ViewKind,
    pub slot: Slot,
}

/// Resolve which Slots each available View feeds
///
/// Deterministic: same Views, rules, and capacities always produce the same
/// pairings, in rule-table order (primary rules before fallbacks). Views of
/// the same kind collapse to one pairing per (kind, Slot).
pub fn resolve_pairings(
    views: &[View],
    rules: &[PairingRule],
    capacity: &SlotCapacity,
) -> Vec<Pairing> {
    let available_kinds: HashSet<ViewKind> = views.iter().map(|v| v.kind).collect();

    let mut pairings = Vec::new();
    let mut claimed_slots = HashSet::new();
    let mut seen = HashSet::new();

    // Primary rules claim their Slots first
    for rule in rules.iter().filter(|r| !r.fallback) {
        if !available_kinds.contains(&rule.kind) || capacity.available(rule.slot) == 0 {
            continue;
        }
        let pairing = Pairing {
            view: rule.kind,
            slot: rule.slot,
        };
        if seen.insert(pairing) {
            claimed_slots.insert(rule.slot);
            pairings.push(pairing);
        }
    }

    // Fallback rules fill only unclaimed Slots
    for rule in rules.iter().filter(|r| r.fallback) {
        if !available_kinds.contains(&rule.kind)
            || claimed_slots.contains(&rule.slot)
            || capacity.available(rule.slot) == 0
        {
            continue;
        }
        let pairing = Pairing {
            view: rule.kind,
            slot: rule.slot,
        };
        if seen.insert(pairing) {
            pairings.push(pairing);
        }
    }

    pairings
}
