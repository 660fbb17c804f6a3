//! Saved-lists protocol
//!
//! Reader and writer for the membership store. The store has no API:
//! reading goes through the saved-lists panel (expand, scrape rows,
//! collapse) and writing through the modal save dialog (open, click entry,
//! close). Both animate, so every step is bounded and settled.

use std::collections::HashSet;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::surface::{Surface, SurfaceElement, SurfaceSelectors, SurfaceTiming};
use crate::types::EngineError;

/// How often the expansion attribute is re-read while waiting (ms).
const POLL_MS: u64 = 25;

/// Membership rows start with one of these prefixes.
static SAVED_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Saved (?:to|in)\s+").unwrap());

/// Aggregate fragments like `3 lists` or `2 more lists`.
static LIST_COUNT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+\s+(?:more\s+)?lists?$").unwrap());

/// Rows carrying this marker describe non-membership.
const NOT_SAVED_MARKER: &str = "Not saved";

/// Parse the label(s) out of one panel row.
///
/// `Saved to Favorites, Want to go & Missing hours` yields all three.
/// Non-membership rows and aggregate count rows yield nothing.
pub fn parse_row_labels(row: &str) -> Vec<String> {
    let row = row.trim();
    if row.is_empty() || row.contains(NOT_SAVED_MARKER) {
        return Vec::new();
    }
    let stripped = SAVED_PREFIX.replace(row, "");
    stripped
        .split(|c| c == ',' || c == '&')
        .map(str::trim)
        .filter(|part| !part.is_empty() && !LIST_COUNT.is_match(part))
        .map(str::to_string)
        .collect()
}

/// Reader/writer for the saved-lists store.
///
/// Stateless between calls; every operation re-finds its elements because
/// the page re-renders freely.
pub struct SavedLists {
    surface: Arc<dyn Surface>,
    selectors: SurfaceSelectors,
    timing: SurfaceTiming,
}

impl SavedLists {
    pub fn new(surface: Arc<dyn Surface>, selectors: SurfaceSelectors, timing: SurfaceTiming) -> Self {
        Self { surface, selectors, timing }
    }

    /// Read the current membership set.
    ///
    /// Expands the panel first when needed. Failing to find or expand the
    /// panel is an error; an expanded panel with no rows is an empty set.
    /// The two must stay distinguishable.
    pub async fn read(&self) -> Result<HashSet<String>, EngineError> {
        self.ensure_expanded().await?;

        let mut labels = HashSet::new();
        for row in self.surface.find_all(&self.selectors.saved_row).await {
            let text = self.surface.text_of(&row).await;
            for label in parse_row_labels(&text) {
                labels.insert(label);
            }
        }
        debug!(count = labels.len(), "read saved lists");
        Ok(labels)
    }

    /// Toggle membership in the list labeled `label`.
    ///
    /// Opens the dialog when needed and clicks the entry whose trailing
    /// text line equals `label` exactly. The close attempt always runs
    /// before this returns, whatever happened in between.
    pub async fn toggle(&self, label: &str) -> Result<(), EngineError> {
        let result = match self.ensure_dialog_open().await {
            Ok(()) => self.click_entry(label).await,
            Err(e) => Err(e),
        };
        let closed = self.close_dialog().await;
        result.and(closed)
    }

    /// Collapse the panel if it is expanded. Leaves the page the way users
    /// expect to find it after a cycle.
    pub async fn collapse(&self) -> Result<(), EngineError> {
        let panel = self
            .surface
            .find_element(&self.selectors.saved_panel, self.timing.element_wait())
            .await?;
        if !self.is_expanded(&panel).await {
            return Ok(());
        }
        self.surface.click(&panel).await?;
        self.await_expansion(false).await
    }

    /// Ensure the panel reports expanded. Idempotent: the expansion
    /// attribute is read first and the toggle is only clicked on mismatch.
    async fn ensure_expanded(&self) -> Result<(), EngineError> {
        let panel = self
            .surface
            .find_element(&self.selectors.saved_panel, self.timing.element_wait())
            .await?;
        if self.is_expanded(&panel).await {
            return Ok(());
        }
        self.surface.click(&panel).await?;
        self.await_expansion(true).await
    }

    async fn is_expanded(&self, panel: &SurfaceElement) -> bool {
        self.surface
            .attr_of(panel, &self.selectors.expanded_attr)
            .await
            .as_deref()
            == Some("true")
    }

    /// Wait until the panel's expansion attribute reads `expanded`.
    async fn await_expansion(&self, expanded: bool) -> Result<(), EngineError> {
        let deadline = tokio::time::Instant::now() + self.timing.dialog_wait();
        loop {
            let panel = self
                .surface
                .find_element(&self.selectors.saved_panel, self.timing.element_wait())
                .await?;
            if self.is_expanded(&panel).await == expanded {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::DialogProtocol(format!(
                    "panel did not reach expanded={expanded}"
                )));
            }
            sleep(std::time::Duration::from_millis(POLL_MS)).await;
        }
    }

    async fn ensure_dialog_open(&self) -> Result<(), EngineError> {
        if self.find_dialog_now().await.is_some() {
            return Ok(());
        }
        let opener = self
            .surface
            .find_element(&self.selectors.save_action, self.timing.element_wait())
            .await?;
        self.surface.click(&opener).await?;
        match self
            .surface
            .find_element(&self.selectors.dialog, self.timing.dialog_wait())
            .await
        {
            Ok(_) => Ok(()),
            Err(_) => Err(EngineError::DialogProtocol(
                "membership dialog did not open".to_string(),
            )),
        }
    }

    async fn find_dialog_now(&self) -> Option<SurfaceElement> {
        self.surface.find_all(&self.selectors.dialog).await.into_iter().next()
    }

    async fn click_entry(&self, label: &str) -> Result<(), EngineError> {
        for entry in self.surface.find_all(&self.selectors.dialog_entry).await {
            let text = self.surface.text_of(&entry).await;
            let name = text
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .map(str::trim)
                .unwrap_or("");
            if name == label {
                self.surface.click(&entry).await?;
                sleep(self.timing.settle()).await;
                return Ok(());
            }
        }
        Err(EngineError::TargetNotFound(label.to_string()))
    }

    /// Close via the dedicated button, falling back to cancel. No-op when
    /// the dialog is already gone.
    async fn close_dialog(&self) -> Result<(), EngineError> {
        if self.find_dialog_now().await.is_none() {
            return Ok(());
        }
        let dismiss = match self
            .surface
            .find_element(&self.selectors.dialog_close, self.timing.dialog_wait())
            .await
        {
            Ok(el) => el,
            Err(_) => {
                warn!("dialog close button missing, trying cancel");
                self.surface
                    .find_element(&self.selectors.dialog_cancel, self.timing.dialog_wait())
                    .await
                    .map_err(|_| {
                        EngineError::DialogProtocol("no dismiss affordance on dialog".to_string())
                    })?
            }
        };
        self.surface.click(&dismiss).await?;
        sleep(self.timing.settle()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::ScriptedSurface;
    use std::time::Duration;

    fn make_lists(surface: &Arc<ScriptedSurface>) -> SavedLists {
        SavedLists::new(
            surface.clone(),
            SurfaceSelectors::default(),
            SurfaceTiming::immediate(),
        )
    }

    #[test]
    fn test_parse_row_prefixes() {
        assert_eq!(parse_row_labels("Saved to Favorites"), vec!["Favorites"]);
        assert_eq!(parse_row_labels("Saved in Missing hours"), vec!["Missing hours"]);
        assert_eq!(parse_row_labels("  Saved to Road trip  "), vec!["Road trip"]);
    }

    #[test]
    fn test_parse_row_separators_and_dedupe_input() {
        assert_eq!(
            parse_row_labels("Saved to Favorites, Want to go & Missing hours"),
            vec!["Favorites", "Want to go", "Missing hours"]
        );
    }

    #[test]
    fn test_parse_row_excludes_not_saved() {
        assert!(parse_row_labels("Not saved").is_empty());
        assert!(parse_row_labels("Not saved · Save this place").is_empty());
    }

    #[test]
    fn test_parse_row_excludes_counts() {
        assert!(parse_row_labels("Saved in 3 lists").is_empty());
        assert!(parse_row_labels("1 list").is_empty());
        assert_eq!(
            parse_row_labels("Saved to Favorites & 2 more lists"),
            vec!["Favorites"]
        );
    }

    #[test]
    fn test_parse_row_without_prefix_keeps_label() {
        assert_eq!(parse_row_labels("Favorites"), vec!["Favorites"]);
    }

    #[tokio::test]
    async fn test_read_expands_collapsed_panel() {
        let surface = Arc::new(ScriptedSurface::new());
        surface.set_saved(["Missing hours".to_string(), "Summer Cafe".to_string()]).await;

        let lists = make_lists(&surface);
        let read = lists.read().await.unwrap();

        assert!(surface.panel_expanded().await);
        assert!(read.contains("Missing hours"));
        assert!(read.contains("Summer Cafe"));
        // The summary row must not leak into the set.
        assert_eq!(read.len(), 2);
    }

    #[tokio::test]
    async fn test_read_ignores_noise_rows() {
        let surface = Arc::new(ScriptedSurface::new());
        surface.set_saved(["Favorites".to_string()]).await;
        surface
            .set_extra_rows(vec![
                "Not saved · Save this place".to_string(),
                "   ".to_string(),
            ])
            .await;

        let lists = make_lists(&surface);
        let read = lists.read().await.unwrap();
        assert_eq!(read.len(), 1);
        assert!(read.contains("Favorites"));
    }

    #[tokio::test]
    async fn test_read_leaves_expanded_panel_alone() {
        let surface = Arc::new(ScriptedSurface::new());
        let sel = SurfaceSelectors::default();
        let panel = surface.find_element(&sel.saved_panel, Duration::ZERO).await.unwrap();
        surface.click(&panel).await.unwrap();

        let lists = make_lists(&surface);
        lists.read().await.unwrap();

        let toggles = surface
            .clicks()
            .await
            .iter()
            .filter(|c| c.as_str() == "saved_panel")
            .count();
        assert_eq!(toggles, 1);
    }

    #[tokio::test]
    async fn test_read_failure_differs_from_empty() {
        let surface = Arc::new(ScriptedSurface::new());
        let lists = make_lists(&surface);

        // Expanded panel with zero rows reads as an empty set.
        assert!(lists.read().await.unwrap().is_empty());

        surface.set_panel_present(false).await;
        assert!(matches!(
            lists.read().await,
            Err(EngineError::SurfaceTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_toggle_clicks_entry_and_closes() {
        let surface = Arc::new(ScriptedSurface::new());
        surface
            .set_lists(vec!["Favorites".to_string(), "Missing hours".to_string()])
            .await;

        let lists = make_lists(&surface);
        lists.toggle("Missing hours").await.unwrap();

        assert!(surface.saved().await.contains("Missing hours"));
        assert!(!surface.dialog_open().await);

        let clicks = surface.clicks().await;
        assert!(clicks.contains(&"save_action".to_string()));
        assert!(clicks.contains(&"dialog_entry:Missing hours".to_string()));
        assert!(clicks.contains(&"dialog_close".to_string()));
    }

    #[tokio::test]
    async fn test_toggle_unknown_label_reports_and_closes() {
        let surface = Arc::new(ScriptedSurface::new());
        surface.set_lists(vec!["Favorites".to_string()]).await;

        let lists = make_lists(&surface);
        let err = lists.toggle("Missing website").await.unwrap_err();

        assert!(matches!(err, EngineError::TargetNotFound(label) if label == "Missing website"));
        assert!(!surface.dialog_open().await);
        assert!(surface.saved().await.is_empty());
    }

    #[tokio::test]
    async fn test_toggle_reuses_open_dialog() {
        let surface = Arc::new(ScriptedSurface::new());
        let sel = SurfaceSelectors::default();
        surface.set_lists(vec!["Missing photo".to_string()]).await;

        let save = surface.find_element(&sel.save_action, Duration::ZERO).await.unwrap();
        surface.click(&save).await.unwrap();
        assert!(surface.dialog_open().await);

        let lists = make_lists(&surface);
        lists.toggle("Missing photo").await.unwrap();

        let openers = surface
            .clicks()
            .await
            .iter()
            .filter(|c| c.as_str() == "save_action")
            .count();
        assert_eq!(openers, 1);
    }

    #[tokio::test]
    async fn test_toggle_dialog_never_opening_is_protocol_error() {
        let surface = Arc::new(ScriptedSurface::new());
        surface.set_dialog_enabled(false).await;
        surface.set_lists(vec!["Missing hours".to_string()]).await;

        let lists = make_lists(&surface);
        let err = lists.toggle("Missing hours").await.unwrap_err();
        assert!(matches!(err, EngineError::DialogProtocol(_)));
        assert!(surface.saved().await.is_empty());
    }

    #[tokio::test]
    async fn test_collapse_only_when_expanded() {
        let surface = Arc::new(ScriptedSurface::new());
        let lists = make_lists(&surface);

        lists.collapse().await.unwrap();
        assert_eq!(surface.clicks().await.len(), 0);

        lists.read().await.unwrap();
        assert!(surface.panel_expanded().await);

        lists.collapse().await.unwrap();
        assert!(!surface.panel_expanded().await);
    }
}
