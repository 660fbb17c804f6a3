//! UI Surface Adapter
//!
//! Everything the engine knows about the page goes through the [`Surface`]
//! trait: bounded element lookup, text and attribute reads, clicks, and a
//! mutation feed. Production wires a real browser surface; tests and the
//! replay harness use [`ScriptedSurface`].

mod scripted;

pub use scripted::{ClickHook, ScriptedSurface};

use std::time::Duration;

use tokio::sync::broadcast;

use crate::types::EngineError;

// ============ Elements & Mutations ============

/// Opaque handle to an element on the surface.
///
/// Handles are only meaningful to the surface that produced them and can go
/// stale after a re-render; callers re-find rather than hold them long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceElement {
    pub id: u64,
}

/// A structural change notification. Carries no payload: observers re-read
/// whatever they care about.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceMutation {
    pub timestamp: i64,
}

// ============ Configuration ============

/// Where the engine looks for things. Injectable; defaults match the
/// production page markup.
#[derive(Debug, Clone)]
pub struct SurfaceSelectors {
    /// "Add missing information" banner.
    pub banner: String,
    /// Per-detail suggestion chips.
    pub suggestion: String,
    /// Saved-lists panel header; carries the expansion-state attribute.
    pub saved_panel: String,
    /// Membership rows inside the expanded panel.
    pub saved_row: String,
    /// Save action that opens the membership dialog.
    pub save_action: String,
    /// Membership dialog container.
    pub dialog: String,
    /// Selectable list entries inside the dialog.
    pub dialog_entry: String,
    /// Dialog close button.
    pub dialog_close: String,
    /// Dialog cancel button, fallback dismiss.
    pub dialog_cancel: String,
    /// Attribute on `saved_panel` that reports expansion state.
    pub expanded_attr: String,
}

impl Default for SurfaceSelectors {
    fn default() -> Self {
        Self {
            banner: ".zSdcRe".to_string(),
            suggestion: ".MngOvd.fontBodyMedium.Hk4XGb.zWArOe".to_string(),
            saved_panel: ".PtQMbf".to_string(),
            saved_row: ".WkJbTe".to_string(),
            save_action: ".RWPxGd button".to_string(),
            dialog: ".ZswDgf".to_string(),
            dialog_entry: ".yKvBne".to_string(),
            dialog_close: ".fxNQSd".to_string(),
            dialog_cancel: ".VfPpkd-LgbsSe".to_string(),
            expanded_attr: "aria-expanded".to_string(),
        }
    }
}

/// Wait and settle tuning. The page animates, so every mutating step is
/// followed by a short settle before the next read.
#[derive(Debug, Clone)]
pub struct SurfaceTiming {
    /// Bounded wait for a single element to appear (ms), default 3000.
    pub element_wait_ms: u64,
    /// Bounded wait for the panel or dialog to change state (ms), default 2000.
    pub dialog_wait_ms: u64,
    /// Settle delay after a mutating click (ms), default 300.
    pub settle_ms: u64,
}

impl Default for SurfaceTiming {
    fn default() -> Self {
        Self {
            element_wait_ms: 3000,
            dialog_wait_ms: 2000,
            settle_ms: 300,
        }
    }
}

impl SurfaceTiming {
    /// All-zero timing for scripted surfaces, which render synchronously.
    pub fn immediate() -> Self {
        Self {
            element_wait_ms: 0,
            dialog_wait_ms: 0,
            settle_ms: 0,
        }
    }

    pub fn element_wait(&self) -> Duration {
        Duration::from_millis(self.element_wait_ms)
    }

    pub fn dialog_wait(&self) -> Duration {
        Duration::from_millis(self.dialog_wait_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

// ============ Surface Trait ============

/// Async view of the external page.
///
/// All lookups reflect the page as currently rendered; the surface owns no
/// engine state and performs no retries of its own.
#[async_trait::async_trait]
pub trait Surface: Send + Sync {
    /// Wait for the first element matching `selector`, up to `wait`.
    async fn find_element(
        &self,
        selector: &str,
        wait: Duration,
    ) -> Result<SurfaceElement, EngineError>;

    /// All elements currently matching `selector`. Empty when none, never an error.
    async fn find_all(&self, selector: &str) -> Vec<SurfaceElement>;

    /// Visible text of an element. Stale handles read as empty.
    async fn text_of(&self, element: &SurfaceElement) -> String;

    /// Attribute value, or None when the attribute is absent or the handle
    /// is stale.
    async fn attr_of(&self, element: &SurfaceElement, name: &str) -> Option<String>;

    /// Click an element.
    async fn click(&self, element: &SurfaceElement) -> Result<(), EngineError>;

    /// Subscribe to structural change notifications.
    fn subscribe(&self) -> broadcast::Receiver<SurfaceMutation>;

    /// Current location string.
    async fn current_location(&self) -> String;
}
