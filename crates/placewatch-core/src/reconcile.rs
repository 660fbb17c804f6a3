//! Reconciliation
//!
//! Turns a desired state and the current membership set into a minimal op
//! sequence and applies it through the saved-lists protocol, checking
//! operation liveness at every suspension point.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::membership::SavedLists;
use crate::token::{OpToken, TokenManager};
use crate::types::{DesiredState, EngineError, MissingDetail, ReconcileOp};

// ============ Phases ============

/// Where a cycle currently stands. `Retrying` and `Abandoned` belong to the
/// retry driver; the rest advance inside [`Reconciler::run_cycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilePhase {
    Idle,
    Reading,
    Diffing,
    Applying,
    Collapsing,
    Done,
    Retrying,
    Abandoned,
}

impl ReconcilePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcilePhase::Idle => "idle",
            ReconcilePhase::Reading => "reading",
            ReconcilePhase::Diffing => "diffing",
            ReconcilePhase::Applying => "applying",
            ReconcilePhase::Collapsing => "collapsing",
            ReconcilePhase::Done => "done",
            ReconcilePhase::Retrying => "retrying",
            ReconcilePhase::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReconcilePhase::Done | ReconcilePhase::Abandoned)
    }
}

// ============ Diff ============

/// Plan the toggles that move `current` to `desired`.
///
/// Only recognized labels participate; anything else in `current` is
/// invisible here and never touched. Adds come first so an interrupted
/// cycle never leaves fewer correct memberships than it found.
pub fn compute_ops(desired: &DesiredState, current: &HashSet<String>) -> Vec<ReconcileOp> {
    let recognized: BTreeSet<MissingDetail> = current
        .iter()
        .filter_map(|label| MissingDetail::from_label(label))
        .collect();

    let mut ops: Vec<ReconcileOp> = desired
        .required
        .difference(&recognized)
        .map(|d| ReconcileOp::add(*d))
        .collect();
    ops.extend(
        recognized
            .difference(&desired.required)
            .map(|d| ReconcileOp::remove(*d)),
    );
    ops
}

// ============ Cycle Execution ============

/// What one completed cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub applied: Vec<ReconcileOp>,
    /// Ops whose dialog entry was missing; logged and skipped.
    pub skipped: Vec<ReconcileOp>,
}

/// Drives one reconciliation cycle against the saved lists.
///
/// Cancellation is cooperative: the token's liveness is polled before every
/// externally visible step, and an in-flight toggle is never interrupted.
pub struct Reconciler {
    lists: SavedLists,
    tokens: TokenManager,
    settle: Duration,
    on_phase: Option<Box<dyn Fn(ReconcilePhase) + Send + Sync>>,
    on_op: Option<Box<dyn Fn(ReconcileOp) + Send + Sync>>,
}

impl Reconciler {
    pub fn new(lists: SavedLists, tokens: TokenManager, settle: Duration) -> Self {
        Self { lists, tokens, settle, on_phase: None, on_op: None }
    }

    /// Observe phase changes as the cycle advances.
    pub fn with_phase_listener(
        mut self,
        listener: impl Fn(ReconcilePhase) + Send + Sync + 'static,
    ) -> Self {
        self.on_phase = Some(Box::new(listener));
        self
    }

    /// Observe each op the moment it lands.
    pub fn with_op_listener(
        mut self,
        listener: impl Fn(ReconcileOp) + Send + Sync + 'static,
    ) -> Self {
        self.on_op = Some(Box::new(listener));
        self
    }

    fn phase(&self, phase: ReconcilePhase) {
        debug!(phase = phase.as_str(), "cycle phase");
        if let Some(listener) = &self.on_phase {
            listener(phase);
        }
    }

    async fn ensure_live(&self, token: &OpToken) -> Result<(), EngineError> {
        if self.tokens.is_live(token).await {
            Ok(())
        } else {
            debug!(token = %token.id(), "token superseded, stopping cycle");
            Err(EngineError::Superseded)
        }
    }

    /// Run one cycle: read, diff, apply adds then removes, collapse.
    ///
    /// Errors are reported to the caller unconsumed so the retry driver can
    /// decide; `Superseded` means a newer navigation took over.
    pub async fn run_cycle(
        &self,
        desired: &DesiredState,
        token: &OpToken,
    ) -> Result<CycleReport, EngineError> {
        self.ensure_live(token).await?;
        self.phase(ReconcilePhase::Reading);
        let current = self.lists.read().await?;
        self.ensure_live(token).await?;

        self.phase(ReconcilePhase::Diffing);
        let ops = compute_ops(desired, &current);
        debug!(ops = ops.len(), current = current.len(), "planned cycle ops");

        let mut report = CycleReport::default();
        if !ops.is_empty() {
            self.phase(ReconcilePhase::Applying);
            for op in &ops {
                self.ensure_live(token).await?;
                match self.lists.toggle(op.label()).await {
                    Ok(()) => {
                        info!(action = op.action.as_str(), label = op.label(), "applied op");
                        report.applied.push(*op);
                        if let Some(listener) = &self.on_op {
                            listener(*op);
                        }
                        sleep(self.settle).await;
                    }
                    Err(EngineError::TargetNotFound(label)) => {
                        warn!(label = %label, "no dialog entry for label, skipping op");
                        report.skipped.push(*op);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        self.ensure_live(token).await?;
        self.phase(ReconcilePhase::Collapsing);
        self.lists.collapse().await?;
        self.phase(ReconcilePhase::Done);
        Ok(report)
    }
}
