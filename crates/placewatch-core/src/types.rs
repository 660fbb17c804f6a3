//! Core types for placewatch
//!
//! Vocabulary shared by the surface adapter, the desired-state scan and the
//! reconciliation engine.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============ Entity Identity ============

/// Stable identity of the place currently shown by the surface.
///
/// Derived from the location string; equality defines "same place". Two
/// consecutive observations with an equal id never start a new cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(name: impl Into<String>) -> Self {
        EntityId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============ Missing Details ============

/// Detail categories the engine tracks. A place can be incomplete in ways
/// outside this set; those are ignored entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingDetail {
    Hours,
    Phone,
    Website,
    Photo,
}

impl MissingDetail {
    pub const ALL: [MissingDetail; 4] = [
        MissingDetail::Hours,
        MissingDetail::Phone,
        MissingDetail::Website,
        MissingDetail::Photo,
    ];

    /// Saved-list label used for this category.
    pub fn label(&self) -> &'static str {
        match self {
            MissingDetail::Hours => "Missing hours",
            MissingDetail::Phone => "Missing phone number",
            MissingDetail::Website => "Missing website",
            MissingDetail::Photo => "Missing photo",
        }
    }

    /// Inverse of [`MissingDetail::label`]. Exact match only; a list that
    /// merely shares a prefix with a recognized label stays unrecognized.
    pub fn from_label(s: &str) -> Option<Self> {
        match s {
            "Missing hours" => Some(MissingDetail::Hours),
            "Missing phone number" => Some(MissingDetail::Phone),
            "Missing website" => Some(MissingDetail::Website),
            "Missing photo" => Some(MissingDetail::Photo),
            _ => None,
        }
    }

    /// Map a suggestion chip's text to a category. Substring match: the
    /// chip text line carries surrounding copy around the call to action.
    pub fn from_suggestion(text: &str) -> Option<Self> {
        if text.contains("Add hours") {
            Some(MissingDetail::Hours)
        } else if text.contains("Add place's phone number") {
            Some(MissingDetail::Phone)
        } else if text.contains("Add website") {
            Some(MissingDetail::Website)
        } else if text.contains("Add photo") {
            Some(MissingDetail::Photo)
        } else {
            None
        }
    }
}

// ============ Desired State ============

/// What the saved lists should look like for the current place.
///
/// Recomputed from the live page at the start of every cycle; retries of the
/// same cycle reuse it, a new place never does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredState {
    /// True iff the page shows no completeness affordance at all.
    pub complete: bool,
    pub required: BTreeSet<MissingDetail>,
}

impl DesiredState {
    pub fn from_missing(details: impl IntoIterator<Item = MissingDetail>) -> Self {
        let required: BTreeSet<MissingDetail> = details.into_iter().collect();
        DesiredState { complete: required.is_empty(), required }
    }

    /// Verdict reported to the visual layer for this state.
    pub fn status(&self) -> EntityStatus {
        if self.complete {
            EntityStatus::Pass
        } else {
            EntityStatus::Fail
        }
    }
}

// ============ Reconcile Ops ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpAction {
    Add,
    Remove,
}

impl OpAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpAction::Add => "add",
            OpAction::Remove => "remove",
        }
    }
}

/// One planned toggle against the saved lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOp {
    pub action: OpAction,
    pub detail: MissingDetail,
}

impl ReconcileOp {
    pub fn add(detail: MissingDetail) -> Self {
        ReconcileOp { action: OpAction::Add, detail }
    }

    pub fn remove(detail: MissingDetail) -> Self {
        ReconcileOp { action: OpAction::Remove, detail }
    }

    pub fn label(&self) -> &'static str {
        self.detail.label()
    }
}

// ============ Entity Status ============

/// Completeness verdict for the current place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Pass,
    NotChecked,
    Fail,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Pass => "pass",
            EntityStatus::NotChecked => "not_checked",
            EntityStatus::Fail => "fail",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pass" => Some(EntityStatus::Pass),
            "not_checked" => Some(EntityStatus::NotChecked),
            "fail" => Some(EntityStatus::Fail),
            _ => None,
        }
    }
}

// ============ Errors ============

/// Engine-level failures. Everything here is caught at the cycle boundary
/// and routed to the retry driver; nothing escapes to a user-visible surface.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Element did not appear within the bounded wait.
    #[error("surface element {selector:?} not found within {waited:?}")]
    SurfaceTimeout { selector: String, waited: Duration },

    /// Panel or dialog sequencing broke: failed to open, expand or close.
    #[error("dialog protocol failure: {0}")]
    DialogProtocol(String),

    /// The membership dialog has no entry with the requested label.
    #[error("no saved-list entry labeled {0:?}")]
    TargetNotFound(String),

    /// The operation token was invalidated by a newer navigation.
    #[error("operation superseded")]
    Superseded,
}

impl EngineError {
    pub fn timeout(selector: impl Into<String>, waited: Duration) -> Self {
        EngineError::SurfaceTimeout { selector: selector.into(), waited }
    }
}
