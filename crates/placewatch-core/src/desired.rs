//! Desired-state computation
//!
//! Scans the completeness affordances on the current page and derives what
//! the saved lists should look like for this place.

use tracing::debug;

use crate::surface::{Surface, SurfaceSelectors};
use crate::types::{DesiredState, MissingDetail};

/// Leading text line of the generic incomplete-profile banner.
const BANNER_LEAD: &str = "Add missing information";

/// Compute the desired state from the live page.
///
/// Pure read: nothing is clicked, and absent affordances simply mean "not
/// missing". The page is only complete when neither the banner nor any
/// recognized suggestion chip is visible.
pub async fn compute_desired(surface: &dyn Surface, selectors: &SurfaceSelectors) -> DesiredState {
    let mut banner_seen = false;
    for el in surface.find_all(&selectors.banner).await {
        let text = surface.text_of(&el).await;
        if text.lines().next().map(str::trim) == Some(BANNER_LEAD) {
            banner_seen = true;
        }
    }

    let mut details = Vec::new();
    for el in surface.find_all(&selectors.suggestion).await {
        let text = surface.text_of(&el).await;
        // The chip renders an icon line first; the copy sits on line two.
        let line = text.lines().nth(1).unwrap_or("");
        if let Some(detail) = MissingDetail::from_suggestion(line) {
            debug!(detail = detail.label(), "detected missing detail");
            details.push(detail);
        }
    }

    let mut state = DesiredState::from_missing(details);
    if banner_seen {
        state.complete = false;
    }
    state
}
