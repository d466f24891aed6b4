//! Catalog entities consumed by the planner
//!
//! Looks and Views are created by upstream catalog workflows; the engine
//! only reads them. Slots are the output categories Views are routed into
//! by the pairing rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Named perspective of a Look's reference imagery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewKind {
    Front,
    Back,
    Side,
    Detail,
}

impl ViewKind {
    pub const ALL: [ViewKind; 4] = [
        ViewKind::Front,
        ViewKind::Back,
        ViewKind::Side,
        ViewKind::Detail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ViewKind::Front => "front",
            ViewKind::Back => "back",
            ViewKind::Side => "side",
            ViewKind::Detail => "detail",
        }
    }
}

impl FromStr for ViewKind {
    type Err = lookgen_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "front" => Ok(ViewKind::Front),
            "back" => Ok(ViewKind::Back),
            "side" => Ok(ViewKind::Side),
            "detail" => Ok(ViewKind::Detail),
            other => Err(lookgen_common::Error::InvalidInput(format!(
                "Unknown view kind: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ViewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output category a View can be routed into via pairing rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    /// Primary front-facing variant
    Hero,
    /// Side-profile variant
    Profile,
    /// Back-facing variant
    Reverse,
    /// Close-up variant
    Detail,
}

impl Slot {
    pub const ALL: [Slot; 4] = [Slot::Hero, Slot::Profile, Slot::Reverse, Slot::Detail];

    pub fn as_str(&self) -> &'static str {
        match self {
            Slot::Hero => "hero",
            Slot::Profile => "profile",
            Slot::Reverse => "reverse",
            Slot::Detail => "detail",
        }
    }
}

impl FromStr for Slot {
    type Err = lookgen_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hero" => Ok(Slot::Hero),
            "profile" => Ok(Slot::Profile),
            "reverse" => Ok(Slot::Reverse),
            "detail" => Ok(Slot::Detail),
            other => Err(lookgen_common::Error::InvalidInput(format!(
                "Unknown slot: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One talent+outfit identity with its reference Views
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Look {
    pub look_id: Uuid,
    pub name: String,
    /// Matched identity reference for face application, when assigned
    pub talent_ref: Option<String>,
    /// Classifies the Look as new-since-last-run in plan summaries
    pub first_seen_at: DateTime<Utc>,
}

impl Look {
    /// Whether this Look appeared after the given run timestamp
    pub fn is_new_since(&self, since: DateTime<Utc>) -> bool {
        self.first_seen_at > since
    }
}

/// One reference image of a Look, with its prerequisite flags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct View {
    pub view_id: Uuid,
    pub look_id: Uuid,
    pub kind: ViewKind,
    pub reference_image_url: String,
    /// Reference image has been cropped upstream
    pub has_crop: bool,
    /// Identity reference has been matched upstream
    pub has_match: bool,
}
