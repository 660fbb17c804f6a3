//! placewatch-core - place-page completeness engine
//!
//! Watches a Google-Maps-style place page through a [`Surface`] adapter,
//! derives which "Missing ..." bookkeeping lists the place should belong to,
//! and reconciles the actual list memberships toward that state.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use placewatch_core::{MonitorOptions, PlaceMonitor, ScriptedSurface};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let surface = Arc::new(ScriptedSurface::new());
//!     let monitor = PlaceMonitor::new(surface.clone(), MonitorOptions::default());
//!
//!     let mut events = monitor.subscribe();
//!     monitor.start().await?;
//!
//!     surface
//!         .set_location("https://www.google.com/maps/place/Summer+Cafe/@40.71,-74.0,17z")
//!         .await;
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

mod desired;
mod identity;
mod membership;
mod monitor;
mod reconcile;
mod surface;
mod token;
mod types;

pub use desired::compute_desired;
pub use identity::{entity_from_location, EntityTracker, EntityTransition};
pub use membership::{parse_row_labels, SavedLists};
pub use monitor::{MonitorEvent, MonitorOptions, PlaceMonitor};
pub use reconcile::{compute_ops, CycleReport, ReconcilePhase, Reconciler};
pub use surface::{
    ClickHook, ScriptedSurface, Surface, SurfaceElement, SurfaceMutation, SurfaceSelectors,
    SurfaceTiming,
};
pub use token::{OpToken, RetryState, TokenManager};
pub use types::*;
