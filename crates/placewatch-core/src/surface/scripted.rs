//! Scripted in-memory surface
//!
//! Simulates the page the engine drives in production: a place header, the
//! "add missing information" affordances, the saved-lists panel and the
//! membership dialog. State is mutated through test/replay knobs; clicks
//! apply the same semantics the real page has (panel expansion toggles,
//! dialog entries toggle membership). Every state change emits a mutation
//! notification.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};

use super::{Surface, SurfaceElement, SurfaceMutation, SurfaceSelectors};
use crate::types::EngineError;

/// How often a bounded find re-checks the simulated page (ms).
const POLL_MS: u64 = 10;

/// Async observer invoked after every click with a short target description
/// (e.g. `dialog_entry:Missing hours`). Lets tests inject state changes at
/// exact protocol points without sleeping.
pub type ClickHook =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ElementKind {
    Banner,
    Suggestion(usize),
    SavedPanel,
    SavedRow(usize),
    SaveAction,
    Dialog,
    DialogEntry(usize),
    DialogClose,
    DialogCancel,
}

struct ScriptedState {
    location: String,
    banner_text: Option<String>,
    suggestions: Vec<String>,
    /// Lists offered by the membership dialog, in render order.
    lists: Vec<String>,
    /// Lists the place is currently saved to. This is the external store.
    saved: BTreeSet<String>,
    /// Extra raw rows appended to the panel, for parser edge cases.
    extra_rows: Vec<String>,
    panel_present: bool,
    panel_expanded: bool,
    dialog_enabled: bool,
    dialog_open: bool,
    next_id: u64,
    handles: HashMap<u64, ElementKind>,
    /// Reverse map so repeated finds hand out the same id per element.
    ids: HashMap<ElementKind, u64>,
    clicks: Vec<String>,
}

impl Default for ScriptedState {
    fn default() -> Self {
        Self {
            location: String::new(),
            banner_text: None,
            suggestions: Vec::new(),
            lists: Vec::new(),
            saved: BTreeSet::new(),
            extra_rows: Vec::new(),
            panel_present: true,
            panel_expanded: false,
            dialog_enabled: true,
            dialog_open: false,
            next_id: 1,
            handles: HashMap::new(),
            ids: HashMap::new(),
            clicks: Vec::new(),
        }
    }
}

/// In-memory [`Surface`] driven by explicit state knobs.
pub struct ScriptedSurface {
    selectors: SurfaceSelectors,
    state: Arc<RwLock<ScriptedState>>,
    mutation_tx: broadcast::Sender<SurfaceMutation>,
    click_hook: Arc<RwLock<Option<ClickHook>>>,
}

impl ScriptedSurface {
    pub fn new() -> Self {
        Self::with_selectors(SurfaceSelectors::default())
    }

    pub fn with_selectors(selectors: SurfaceSelectors) -> Self {
        let (mutation_tx, _) = broadcast::channel(100);
        Self {
            selectors,
            state: Arc::new(RwLock::new(ScriptedState::default())),
            mutation_tx,
            click_hook: Arc::new(RwLock::new(None)),
        }
    }

    // ============ Knobs ============

    pub async fn set_location(&self, location: impl Into<String>) {
        self.state.write().await.location = location.into();
        self.emit();
    }

    /// Show or hide the incomplete-profile banner. The engine reads the
    /// leading text line.
    pub async fn set_banner(&self, text: Option<String>) {
        self.state.write().await.banner_text = text;
        self.emit();
    }

    /// Replace the suggestion chips. Each string is the chip's full text;
    /// the engine reads the second line.
    pub async fn set_suggestions(&self, suggestions: Vec<String>) {
        self.state.write().await.suggestions = suggestions;
        self.emit();
    }

    /// Replace the lists offered by the membership dialog.
    pub async fn set_lists(&self, lists: Vec<String>) {
        self.state.write().await.lists = lists;
        self.emit();
    }

    /// Replace the set of lists the place is saved to.
    pub async fn set_saved(&self, saved: impl IntoIterator<Item = String>) {
        self.state.write().await.saved = saved.into_iter().collect();
        self.emit();
    }

    /// Append raw rows to the panel rendering, after the computed ones.
    pub async fn set_extra_rows(&self, rows: Vec<String>) {
        self.state.write().await.extra_rows = rows;
        self.emit();
    }

    /// Remove (or restore) the saved-lists panel entirely.
    pub async fn set_panel_present(&self, present: bool) {
        self.state.write().await.panel_present = present;
        self.emit();
    }

    /// When disabled, the save action stops opening the dialog.
    pub async fn set_dialog_enabled(&self, enabled: bool) {
        self.state.write().await.dialog_enabled = enabled;
    }

    /// Observe clicks as they land. See [`ClickHook`].
    pub async fn set_click_hook(&self, hook: ClickHook) {
        *self.click_hook.write().await = Some(hook);
    }

    // ============ Inspection ============

    pub async fn saved(&self) -> BTreeSet<String> {
        self.state.read().await.saved.clone()
    }

    pub async fn panel_expanded(&self) -> bool {
        self.state.read().await.panel_expanded
    }

    pub async fn dialog_open(&self) -> bool {
        self.state.read().await.dialog_open
    }

    pub async fn clicks(&self) -> Vec<String> {
        self.state.read().await.clicks.clone()
    }

    // ============ Internals ============

    fn emit(&self) {
        let _ = self.mutation_tx.send(SurfaceMutation {
            timestamp: chrono::Utc::now().timestamp_millis(),
        });
    }

    fn rendered_rows(state: &ScriptedState) -> Vec<String> {
        let mut rows: Vec<String> = state
            .lists
            .iter()
            .filter(|name| state.saved.contains(*name))
            .map(|name| format!("Saved to {name}"))
            .collect();
        for name in &state.saved {
            if !state.lists.contains(name) {
                rows.push(format!("Saved to {name}"));
            }
        }
        if !rows.is_empty() {
            let n = rows.len();
            rows.push(format!("{} {}", n, if n == 1 { "list" } else { "lists" }));
        }
        rows.extend(state.extra_rows.iter().cloned());
        rows
    }

    fn visible_kinds(state: &ScriptedState, selectors: &SurfaceSelectors, selector: &str) -> Vec<ElementKind> {
        if selector == selectors.banner {
            return state.banner_text.iter().map(|_| ElementKind::Banner).collect();
        }
        if selector == selectors.suggestion {
            return (0..state.suggestions.len()).map(ElementKind::Suggestion).collect();
        }
        if selector == selectors.saved_panel {
            return if state.panel_present { vec![ElementKind::SavedPanel] } else { vec![] };
        }
        if selector == selectors.saved_row {
            if state.panel_present && state.panel_expanded {
                return (0..Self::rendered_rows(state).len()).map(ElementKind::SavedRow).collect();
            }
            return vec![];
        }
        if selector == selectors.save_action {
            return vec![ElementKind::SaveAction];
        }
        if selector == selectors.dialog {
            return if state.dialog_open { vec![ElementKind::Dialog] } else { vec![] };
        }
        if selector == selectors.dialog_entry {
            if state.dialog_open {
                return (0..state.lists.len()).map(ElementKind::DialogEntry).collect();
            }
            return vec![];
        }
        if selector == selectors.dialog_close {
            return if state.dialog_open { vec![ElementKind::DialogClose] } else { vec![] };
        }
        if selector == selectors.dialog_cancel {
            return if state.dialog_open { vec![ElementKind::DialogCancel] } else { vec![] };
        }
        vec![]
    }

    async fn mint_all(&self, selector: &str) -> Vec<SurfaceElement> {
        let mut state = self.state.write().await;
        let kinds = Self::visible_kinds(&state, &self.selectors, selector);
        kinds
            .into_iter()
            .map(|kind| {
                let id = match state.ids.get(&kind).copied() {
                    Some(id) => id,
                    None => {
                        let id = state.next_id;
                        state.next_id += 1;
                        state.ids.insert(kind, id);
                        state.handles.insert(id, kind);
                        id
                    }
                };
                SurfaceElement { id }
            })
            .collect()
    }
}

impl Default for ScriptedSurface {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Surface for ScriptedSurface {
    async fn find_element(
        &self,
        selector: &str,
        wait: Duration,
    ) -> Result<SurfaceElement, EngineError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(el) = self.mint_all(selector).await.into_iter().next() {
                return Ok(el);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::timeout(selector, wait));
            }
            tokio::time::sleep(Duration::from_millis(POLL_MS)).await;
        }
    }

    async fn find_all(&self, selector: &str) -> Vec<SurfaceElement> {
        self.mint_all(selector).await
    }

    async fn text_of(&self, element: &SurfaceElement) -> String {
        let state = self.state.read().await;
        let kind = match state.handles.get(&element.id) {
            Some(k) => *k,
            None => return String::new(),
        };
        match kind {
            ElementKind::Banner => state.banner_text.clone().unwrap_or_default(),
            ElementKind::Suggestion(i) => state.suggestions.get(i).cloned().unwrap_or_default(),
            ElementKind::SavedPanel => "Saved lists".to_string(),
            ElementKind::SavedRow(i) => {
                Self::rendered_rows(&state).get(i).cloned().unwrap_or_default()
            }
            ElementKind::SaveAction => "Save".to_string(),
            ElementKind::Dialog => "Save to list".to_string(),
            // Icon ligature line first, list name last.
            ElementKind::DialogEntry(i) => state
                .lists
                .get(i)
                .map(|name| format!("bookmark\n{name}"))
                .unwrap_or_default(),
            ElementKind::DialogClose => "Close".to_string(),
            ElementKind::DialogCancel => "Cancel".to_string(),
        }
    }

    async fn attr_of(&self, element: &SurfaceElement, name: &str) -> Option<String> {
        let state = self.state.read().await;
        match state.handles.get(&element.id) {
            Some(ElementKind::SavedPanel) if name == self.selectors.expanded_attr => {
                Some(state.panel_expanded.to_string())
            }
            _ => None,
        }
    }

    async fn click(&self, element: &SurfaceElement) -> Result<(), EngineError> {
        let (desc, changed) = {
            let mut state = self.state.write().await;
            let kind = match state.handles.get(&element.id) {
                Some(k) => *k,
                None => {
                    return Err(EngineError::DialogProtocol(format!(
                        "click on detached element {}",
                        element.id
                    )))
                }
            };
            let (desc, changed) = match kind {
                ElementKind::Banner => ("banner".to_string(), false),
                ElementKind::Suggestion(i) => (format!("suggestion:{i}"), false),
                ElementKind::SavedPanel => {
                    state.panel_expanded = !state.panel_expanded;
                    ("saved_panel".to_string(), true)
                }
                ElementKind::SavedRow(i) => (format!("saved_row:{i}"), false),
                ElementKind::SaveAction => {
                    if state.dialog_enabled && !state.dialog_open {
                        state.dialog_open = true;
                        ("save_action".to_string(), true)
                    } else {
                        ("save_action".to_string(), false)
                    }
                }
                ElementKind::Dialog => ("dialog".to_string(), false),
                ElementKind::DialogEntry(i) => match state.lists.get(i).cloned() {
                    Some(name) => {
                        if !state.saved.remove(&name) {
                            state.saved.insert(name.clone());
                        }
                        (format!("dialog_entry:{name}"), true)
                    }
                    None => (format!("dialog_entry:{i}"), false),
                },
                ElementKind::DialogClose => {
                    state.dialog_open = false;
                    ("dialog_close".to_string(), true)
                }
                ElementKind::DialogCancel => {
                    state.dialog_open = false;
                    ("dialog_cancel".to_string(), true)
                }
            };
            state.clicks.push(desc.clone());
            (desc, changed)
        };

        if changed {
            self.emit();
        }

        let hook = self.click_hook.read().await.clone();
        if let Some(hook) = hook {
            hook(desc).await;
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SurfaceMutation> {
        self.mutation_tx.subscribe()
    }

    async fn current_location(&self) -> String {
        self.state.read().await.location.clone()
    }
}
