//! Place monitor
//!
//! Wires the engine together: watches the surface's mutation feed for
//! navigations, computes the desired state for each new place, and drives
//! reconciliation cycles under fresh operation tokens with bounded retry.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::desired::compute_desired;
use crate::identity::{EntityTracker, EntityTransition};
use crate::membership::SavedLists;
use crate::reconcile::{ReconcilePhase, Reconciler};
use crate::surface::{Surface, SurfaceSelectors, SurfaceTiming};
use crate::token::{OpToken, RetryState, TokenManager};
use crate::types::{DesiredState, EngineError, EntityId, EntityStatus, ReconcileOp};

/// Monitor options
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub selectors: SurfaceSelectors,
    pub timing: SurfaceTiming,
    /// Delay between a detected navigation and the cycle start (ms), default 2000.
    /// The page keeps rendering well after the location settles.
    pub settle_before_cycle_ms: u64,
    /// Max cycle attempts per navigation, default 3.
    pub retry_ceiling: u32,
    /// Fixed delay between attempts (ms), default 1500.
    pub retry_backoff_ms: u64,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            selectors: SurfaceSelectors::default(),
            timing: SurfaceTiming::default(),
            settle_before_cycle_ms: 2000,
            retry_ceiling: 3,
            retry_backoff_ms: 1500,
        }
    }
}

/// Monitor events
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// Displayed entity changed. None means outside the entity view.
    EntityChanged {
        previous: Option<EntityId>,
        next: Option<EntityId>,
    },
    /// Verdict for the visual layer: `not_checked` at cycle start, then
    /// exactly one `pass`/`fail` once the page has been scanned.
    StatusChanged {
        entity: EntityId,
        status: EntityStatus,
    },
    CycleStarted {
        entity: EntityId,
        attempt: u32,
    },
    PhaseChanged {
        entity: EntityId,
        phase: ReconcilePhase,
    },
    OpApplied {
        entity: EntityId,
        op: ReconcileOp,
    },
    CycleCompleted {
        entity: EntityId,
        attempt: u32,
        applied: Vec<ReconcileOp>,
        skipped: Vec<ReconcileOp>,
    },
    CycleAttemptFailed {
        entity: EntityId,
        attempt: u32,
        error: String,
    },
    CycleAbandoned {
        entity: EntityId,
        attempts: u32,
    },
}

/// Shared mutable state of the pipeline: the current entity, the live
/// tokens and the desired state cached for same-cycle retries. Owned by
/// the monitor, passed by reference, never global.
struct ReconcileContext {
    tokens: TokenManager,
    current_entity: RwLock<Option<EntityId>>,
    cached_desired: RwLock<Option<DesiredState>>,
}

impl ReconcileContext {
    fn new() -> Self {
        Self {
            tokens: TokenManager::new(),
            current_entity: RwLock::new(None),
            cached_desired: RwLock::new(None),
        }
    }
}

/// Place monitor
pub struct PlaceMonitor {
    surface: Arc<dyn Surface>,
    options: MonitorOptions,
    ctx: Arc<ReconcileContext>,
    event_tx: broadcast::Sender<MonitorEvent>,
    started: Arc<RwLock<bool>>,
    /// Bumped on every start and stop; a watcher loop exits once the
    /// generation it was spawned under is no longer current.
    generation: Arc<RwLock<u64>>,
}

impl PlaceMonitor {
    pub fn new(surface: Arc<dyn Surface>, options: MonitorOptions) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            surface,
            options,
            ctx: Arc::new(ReconcileContext::new()),
            event_tx,
            started: Arc::new(RwLock::new(false)),
            generation: Arc::new(RwLock::new(0)),
        }
    }

    /// Subscribe to monitor events
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.event_tx.subscribe()
    }

    /// Handle to the live-token registry.
    pub fn tokens(&self) -> TokenManager {
        self.ctx.tokens.clone()
    }

    pub async fn current_entity(&self) -> Option<EntityId> {
        self.ctx.current_entity.read().await.clone()
    }

    /// Start watching the mutation feed.
    pub async fn start(&self) -> anyhow::Result<()> {
        let spawn_generation = {
            let mut started = self.started.write().await;
            if *started {
                return Ok(());
            }
            *started = true;
            let mut generation = self.generation.write().await;
            *generation += 1;
            *generation
        };

        info!("Starting PlaceMonitor");

        let surface = self.surface.clone();
        let options = self.options.clone();
        let ctx = self.ctx.clone();
        let event_tx = self.event_tx.clone();
        let generation = self.generation.clone();

        tokio::spawn(async move {
            let mut tracker = EntityTracker::new();
            let mut rx = surface.subscribe();

            if *generation.read().await != spawn_generation {
                return;
            }

            // The page may already be on a place when we attach.
            let initial = surface.current_location().await;
            if let Some(transition) = tracker.observe(&initial) {
                Self::handle_transition(&surface, &options, &ctx, &event_tx, transition).await;
            }

            loop {
                let recv = rx.recv().await;
                if *generation.read().await != spawn_generation {
                    break;
                }
                match recv {
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "mutation feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }

                // Notifications carry no payload; re-sample the location
                // and let the tracker debounce.
                let location = surface.current_location().await;
                if let Some(transition) = tracker.observe(&location) {
                    Self::handle_transition(&surface, &options, &ctx, &event_tx, transition).await;
                }
            }
        });

        info!("PlaceMonitor started");
        Ok(())
    }

    /// Stop watching. In-flight cycles notice at their next liveness poll.
    pub async fn stop(&self) {
        {
            let mut started = self.started.write().await;
            if !*started {
                return;
            }
            *started = false;
            *self.generation.write().await += 1;
        }

        self.ctx.tokens.invalidate_all().await;
        *self.ctx.current_entity.write().await = None;
        *self.ctx.cached_desired.write().await = None;

        info!("PlaceMonitor stopped");
    }

    async fn handle_transition(
        surface: &Arc<dyn Surface>,
        options: &MonitorOptions,
        ctx: &Arc<ReconcileContext>,
        event_tx: &broadcast::Sender<MonitorEvent>,
        transition: EntityTransition,
    ) {
        info!(
            previous = transition.previous.as_ref().map(EntityId::as_str).unwrap_or("-"),
            next = transition.next.as_ref().map(EntityId::as_str).unwrap_or("-"),
            "entity transition"
        );

        *ctx.current_entity.write().await = transition.next.clone();
        *ctx.cached_desired.write().await = None;

        let _ = event_tx.send(MonitorEvent::EntityChanged {
            previous: transition.previous.clone(),
            next: transition.next.clone(),
        });

        let entity = match transition.next {
            Some(entity) => entity,
            None => {
                // Left the entity view: whatever is in flight stops at its
                // next liveness poll.
                ctx.tokens.invalidate_all().await;
                return;
            }
        };

        let token = ctx.tokens.mint().await;
        let surface = surface.clone();
        let options = options.clone();
        let ctx = ctx.clone();
        let event_tx = event_tx.clone();

        tokio::spawn(async move {
            Self::run_entity_cycle(surface, options, ctx, event_tx, entity, token).await;
        });
    }

    async fn run_entity_cycle(
        surface: Arc<dyn Surface>,
        options: MonitorOptions,
        ctx: Arc<ReconcileContext>,
        event_tx: broadcast::Sender<MonitorEvent>,
        entity: EntityId,
        token: OpToken,
    ) {
        // Let the render animation finish before reading anything.
        sleep(Duration::from_millis(options.settle_before_cycle_ms)).await;
        if !ctx.tokens.is_live(&token).await {
            return;
        }

        let _ = event_tx.send(MonitorEvent::StatusChanged {
            entity: entity.clone(),
            status: EntityStatus::NotChecked,
        });

        let desired = compute_desired(surface.as_ref(), &options.selectors).await;
        if !ctx.tokens.is_live(&token).await {
            return;
        }
        *ctx.cached_desired.write().await = Some(desired.clone());

        info!(
            entity = %entity,
            status = desired.status().as_str(),
            missing = desired.required.len(),
            "computed desired state"
        );
        let _ = event_tx.send(MonitorEvent::StatusChanged {
            entity: entity.clone(),
            status: desired.status(),
        });

        let lists = SavedLists::new(
            surface.clone(),
            options.selectors.clone(),
            options.timing.clone(),
        );
        let phase_tx = event_tx.clone();
        let phase_entity = entity.clone();
        let op_tx = event_tx.clone();
        let op_entity = entity.clone();
        let reconciler = Reconciler::new(lists, ctx.tokens.clone(), options.timing.settle())
            .with_phase_listener(move |phase| {
                let _ = phase_tx.send(MonitorEvent::PhaseChanged {
                    entity: phase_entity.clone(),
                    phase,
                });
            })
            .with_op_listener(move |op| {
                let _ = op_tx.send(MonitorEvent::OpApplied { entity: op_entity.clone(), op });
            });

        let mut retry = RetryState::new(options.retry_ceiling);
        loop {
            if !ctx.tokens.is_live(&token).await {
                return;
            }
            if !retry.can_attempt() {
                warn!(entity = %entity, attempts = retry.attempt(), "retry ceiling reached, abandoning cycle");
                ctx.tokens.retire(&token).await;
                let _ = event_tx.send(MonitorEvent::PhaseChanged {
                    entity: entity.clone(),
                    phase: ReconcilePhase::Abandoned,
                });
                let _ = event_tx.send(MonitorEvent::CycleAbandoned {
                    entity: entity.clone(),
                    attempts: retry.attempt(),
                });
                return;
            }

            retry.record_attempt();
            let attempt = retry.attempt();
            let _ = event_tx.send(MonitorEvent::CycleStarted { entity: entity.clone(), attempt });

            // Retries reuse the state computed at cycle start. A cleared
            // cache means a navigation got here first.
            let desired = match ctx.cached_desired.read().await.clone() {
                Some(desired) => desired,
                None => return,
            };

            match reconciler.run_cycle(&desired, &token).await {
                Ok(report) => {
                    ctx.tokens.retire(&token).await;
                    info!(
                        entity = %entity,
                        attempt,
                        applied = report.applied.len(),
                        skipped = report.skipped.len(),
                        "cycle converged"
                    );
                    let _ = event_tx.send(MonitorEvent::CycleCompleted {
                        entity: entity.clone(),
                        attempt,
                        applied: report.applied,
                        skipped: report.skipped,
                    });
                    return;
                }
                Err(EngineError::Superseded) => {
                    debug!(entity = %entity, attempt, "cycle superseded");
                    return;
                }
                Err(e) => {
                    warn!(entity = %entity, attempt, error = %e, "cycle attempt failed");
                    let _ = event_tx.send(MonitorEvent::CycleAttemptFailed {
                        entity: entity.clone(),
                        attempt,
                        error: e.to_string(),
                    });
                    if retry.can_attempt() {
                        let _ = event_tx.send(MonitorEvent::PhaseChanged {
                            entity: entity.clone(),
                            phase: ReconcilePhase::Retrying,
                        });
                        sleep(Duration::from_millis(options.retry_backoff_ms)).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::ScriptedSurface;
    use crate::types::MissingDetail;

    const CAFE: &str = "https://www.google.com/maps/place/Summer+Cafe/@40.71,-74.0,17z";
    const BOOKS: &str = "https://www.google.com/maps/place/Harbor+Books/@40.72,-74.1,17z";
    const SEARCH: &str = "https://www.google.com/maps/search/coffee/@40.71,-74.0";

    fn chip(text: &str) -> String {
        format!("edit\n{text}")
    }

    fn all_labels() -> Vec<String> {
        let mut lists: Vec<String> =
            MissingDetail::ALL.iter().map(|d| d.label().to_string()).collect();
        lists.push("Favorites".to_string());
        lists
    }

    fn fast_options() -> MonitorOptions {
        MonitorOptions {
            timing: SurfaceTiming::immediate(),
            settle_before_cycle_ms: 0,
            retry_ceiling: 3,
            retry_backoff_ms: 0,
            ..MonitorOptions::default()
        }
    }

    /// Collect events until one matches, with a hard timeout.
    async fn drain_until(
        rx: &mut broadcast::Receiver<MonitorEvent>,
        pred: impl Fn(&MonitorEvent) -> bool,
    ) -> Vec<MonitorEvent> {
        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let done = pred(&event);
                        seen.push(event);
                        if done {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for monitor event");
        seen
    }

    fn index_of(events: &[MonitorEvent], pred: impl Fn(&MonitorEvent) -> bool) -> usize {
        events.iter().position(pred).expect("expected event missing")
    }

    #[tokio::test]
    async fn test_monitor_reconciles_on_navigation() {
        let surface = Arc::new(ScriptedSurface::new());
        surface.set_lists(all_labels()).await;
        surface.set_saved(["Missing hours".to_string(), "Summer Cafe".to_string()]).await;
        surface.set_suggestions(vec![chip("Add website")]).await;

        let monitor = PlaceMonitor::new(surface.clone(), fast_options());
        let mut rx = monitor.subscribe();
        monitor.start().await.unwrap();

        surface.set_location(CAFE).await;
        let events = drain_until(&mut rx, |e| matches!(e, MonitorEvent::CycleCompleted { .. })).await;

        let saved = surface.saved().await;
        assert!(saved.contains("Missing website"));
        assert!(!saved.contains("Missing hours"));
        assert!(saved.contains("Summer Cafe"));
        assert!(!surface.panel_expanded().await);
        assert_eq!(monitor.tokens().live_count().await, 0);

        // not_checked first, verdict second, and only then the read phase.
        let not_checked = index_of(&events, |e| {
            matches!(e, MonitorEvent::StatusChanged { status: EntityStatus::NotChecked, .. })
        });
        let verdict = index_of(&events, |e| {
            matches!(e, MonitorEvent::StatusChanged { status: EntityStatus::Fail, .. })
        });
        let reading = index_of(&events, |e| {
            matches!(e, MonitorEvent::PhaseChanged { phase: ReconcilePhase::Reading, .. })
        });
        assert!(not_checked < verdict);
        assert!(verdict < reading);

        match events.last().unwrap() {
            MonitorEvent::CycleCompleted { entity, applied, .. } => {
                assert_eq!(entity.as_str(), "Summer Cafe");
                assert_eq!(
                    applied.as_slice(),
                    [
                        ReconcileOp::add(MissingDetail::Website),
                        ReconcileOp::remove(MissingDetail::Hours),
                    ]
                );
            }
            other => panic!("unexpected terminal event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_monitor_complete_page_reports_pass_and_cleans_up() {
        let surface = Arc::new(ScriptedSurface::new());
        surface.set_lists(all_labels()).await;
        surface.set_saved(["Missing hours".to_string()]).await;

        let monitor = PlaceMonitor::new(surface.clone(), fast_options());
        let mut rx = monitor.subscribe();
        monitor.start().await.unwrap();

        surface.set_location(CAFE).await;
        let events = drain_until(&mut rx, |e| matches!(e, MonitorEvent::CycleCompleted { .. })).await;

        assert!(events.iter().any(|e| {
            matches!(e, MonitorEvent::StatusChanged { status: EntityStatus::Pass, .. })
        }));
        assert!(surface.saved().await.is_empty());

        let applied = events
            .iter()
            .find_map(|e| match e {
                MonitorEvent::OpApplied { op, .. } => Some(*op),
                _ => None,
            })
            .unwrap();
        assert_eq!(applied, ReconcileOp::remove(MissingDetail::Hours));
    }

    #[tokio::test]
    async fn test_monitor_retries_to_ceiling_then_abandons() {
        let surface = Arc::new(ScriptedSurface::new());
        surface.set_panel_present(false).await;
        surface.set_suggestions(vec![chip("Add hours")]).await;

        let monitor = PlaceMonitor::new(surface.clone(), fast_options());
        let mut rx = monitor.subscribe();
        monitor.start().await.unwrap();

        surface.set_location(CAFE).await;
        let events = drain_until(&mut rx, |e| matches!(e, MonitorEvent::CycleAbandoned { .. })).await;

        let starts = events
            .iter()
            .filter(|e| matches!(e, MonitorEvent::CycleStarted { .. }))
            .count();
        let failures = events
            .iter()
            .filter(|e| matches!(e, MonitorEvent::CycleAttemptFailed { .. }))
            .count();
        assert_eq!(starts, 3);
        assert_eq!(failures, 3);

        match events.last().unwrap() {
            MonitorEvent::CycleAbandoned { attempts, .. } => assert_eq!(*attempts, 3),
            other => panic!("unexpected terminal event: {other:?}"),
        }
        // No live-token leak after abandonment.
        assert_eq!(monitor.tokens().live_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_quick_navigation_supersedes_first_cycle() {
        let surface = Arc::new(ScriptedSurface::new());
        surface.set_lists(all_labels()).await;
        surface.set_suggestions(vec![chip("Add website")]).await;

        let mut options = fast_options();
        // Long settle so the second navigation lands before the first
        // cycle starts working.
        options.settle_before_cycle_ms = 5_000;

        let monitor = PlaceMonitor::new(surface.clone(), options);
        let mut rx = monitor.subscribe();
        monitor.start().await.unwrap();

        surface.set_location(CAFE).await;
        surface.set_location(BOOKS).await;

        let events = drain_until(&mut rx, |e| matches!(e, MonitorEvent::CycleCompleted { .. })).await;

        let completed: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                MonitorEvent::CycleCompleted { entity, .. } => Some(entity.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(completed, ["Harbor Books"]);
        assert_eq!(monitor.tokens().live_count().await, 0);
    }

    #[tokio::test]
    async fn test_monitor_leaving_view_cancels_and_clears() {
        let surface = Arc::new(ScriptedSurface::new());
        surface.set_lists(all_labels()).await;

        let monitor = PlaceMonitor::new(surface.clone(), fast_options());
        let mut rx = monitor.subscribe();
        monitor.start().await.unwrap();

        surface.set_location(CAFE).await;
        drain_until(&mut rx, |e| matches!(e, MonitorEvent::CycleCompleted { .. })).await;
        assert_eq!(monitor.current_entity().await.as_ref().map(EntityId::as_str), Some("Summer Cafe"));

        surface.set_location(SEARCH).await;
        let events = drain_until(&mut rx, |e| {
            matches!(e, MonitorEvent::EntityChanged { next: None, .. })
        })
        .await;

        assert!(events.iter().any(|e| {
            matches!(e, MonitorEvent::EntityChanged { next: None, .. })
        }));
        assert_eq!(monitor.current_entity().await, None);
        assert_eq!(monitor.tokens().live_count().await, 0);
    }

    #[tokio::test]
    async fn test_monitor_start_is_idempotent() {
        let surface = Arc::new(ScriptedSurface::new());
        surface.set_lists(all_labels()).await;

        let monitor = PlaceMonitor::new(surface.clone(), fast_options());
        let mut rx = monitor.subscribe();
        monitor.start().await.unwrap();
        monitor.start().await.unwrap();

        surface.set_location(CAFE).await;
        let events = drain_until(&mut rx, |e| matches!(e, MonitorEvent::CycleCompleted { .. })).await;

        let transitions = events
            .iter()
            .filter(|e| matches!(e, MonitorEvent::EntityChanged { .. }))
            .count();
        assert_eq!(transitions, 1);
    }

    #[tokio::test]
    async fn test_monitor_stop_invalidates_everything() {
        let surface = Arc::new(ScriptedSurface::new());
        surface.set_lists(all_labels()).await;

        let monitor = PlaceMonitor::new(surface.clone(), fast_options());
        let mut rx = monitor.subscribe();
        monitor.start().await.unwrap();

        surface.set_location(CAFE).await;
        drain_until(&mut rx, |e| matches!(e, MonitorEvent::CycleCompleted { .. })).await;

        monitor.stop().await;
        assert_eq!(monitor.current_entity().await, None);
        assert_eq!(monitor.tokens().live_count().await, 0);

        // Second stop is a no-op.
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_monitor_restart_runs_single_watcher() {
        let surface = Arc::new(ScriptedSurface::new());
        surface.set_lists(all_labels()).await;

        let monitor = PlaceMonitor::new(surface.clone(), fast_options());
        monitor.start().await.unwrap();
        monitor.stop().await;

        // The watcher loop from the first round exits on restart; one
        // navigation yields exactly one transition.
        let mut rx = monitor.subscribe();
        monitor.start().await.unwrap();

        surface.set_location(CAFE).await;
        let events = drain_until(&mut rx, |e| matches!(e, MonitorEvent::CycleCompleted { .. })).await;

        let transitions = events
            .iter()
            .filter(|e| matches!(e, MonitorEvent::EntityChanged { .. }))
            .count();
        assert_eq!(transitions, 1);
    }
}
