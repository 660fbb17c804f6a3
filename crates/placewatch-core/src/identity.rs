//! Entity identity
//!
//! Derives a stable id for the place the surface is showing from the
//! location string, and tracks transitions between places.

use percent_encoding::percent_decode_str;
use tracing::debug;
use url::Url;

use crate::types::EntityId;

/// Path segment that makes a location an entity view.
const PLACE_SEGMENT: &str = "place";

/// Derive the entity id from a location string.
///
/// The segment following `/place/` is percent-decoded (with `+` as space)
/// into the display name. Anything malformed means "no entity": locations
/// change constantly while the surface animates, so decode failures are a
/// debug log, never an error.
pub fn entity_from_location(location: &str) -> Option<EntityId> {
    let url = match Url::parse(location) {
        Ok(u) => u,
        Err(e) => {
            if !location.is_empty() {
                debug!(error = %e, location, "unparseable location");
            }
            return None;
        }
    };

    let raw = url
        .path_segments()?
        .skip_while(|s| *s != PLACE_SEGMENT)
        .nth(1)?;
    if raw.is_empty() {
        return None;
    }

    let spaced = raw.replace('+', " ");
    match percent_decode_str(&spaced).decode_utf8() {
        Ok(decoded) => Some(EntityId::new(decoded.into_owned())),
        Err(e) => {
            debug!(error = %e, segment = raw, "entity segment is not valid utf-8");
            None
        }
    }
}

/// A change of displayed entity. `previous` / `next` are None outside the
/// entity view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityTransition {
    pub previous: Option<EntityId>,
    pub next: Option<EntityId>,
}

/// Tracks which entity the surface is showing.
///
/// Mutation notifications fire far more often than the location changes, so
/// observations are debounced on the raw string before any decode happens.
/// A transition is reported only when the decoded identity differs.
#[derive(Debug, Default)]
pub struct EntityTracker {
    last_raw: Option<String>,
    current: Option<EntityId>,
}

impl EntityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&EntityId> {
        self.current.as_ref()
    }

    /// Feed one observed location. Returns a transition when the displayed
    /// entity actually changed.
    pub fn observe(&mut self, location: &str) -> Option<EntityTransition> {
        if self.last_raw.as_deref() == Some(location) {
            return None;
        }
        self.last_raw = Some(location.to_string());

        let next = entity_from_location(location);
        if next == self.current {
            return None;
        }
        let previous = std::mem::replace(&mut self.current, next.clone());
        Some(EntityTransition { previous, next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_from_location_basic() {
        let id = entity_from_location(
            "https://www.google.com/maps/place/Summer+Cafe/@40.71,-74.0,17z/data=!3m1",
        )
        .unwrap();
        assert_eq!(id.as_str(), "Summer Cafe");
    }

    #[test]
    fn test_entity_from_location_percent_escapes() {
        let id = entity_from_location("https://www.google.com/maps/place/Caf%C3%A9%20Nero/@48.85")
            .unwrap();
        assert_eq!(id.as_str(), "Café Nero");
    }

    #[test]
    fn test_entity_from_location_rejects_non_place() {
        assert_eq!(
            entity_from_location("https://www.google.com/maps/search/coffee/@40.7,-74.0"),
            None
        );
        assert_eq!(entity_from_location("not a url"), None);
        assert_eq!(entity_from_location(""), None);
        // trailing marker with no name
        assert_eq!(entity_from_location("https://www.google.com/maps/place/"), None);
        // invalid utf-8 after decoding
        assert_eq!(
            entity_from_location("https://www.google.com/maps/place/%FF%FE/@1"),
            None
        );
    }

    #[test]
    fn test_tracker_debounces_raw_location() {
        let mut tracker = EntityTracker::new();
        let loc = "https://www.google.com/maps/place/Summer+Cafe/@40.71";

        let first = tracker.observe(loc).unwrap();
        assert_eq!(first.previous, None);
        assert_eq!(first.next, Some(EntityId::new("Summer Cafe")));

        assert_eq!(tracker.observe(loc), None);
    }

    #[test]
    fn test_tracker_ignores_same_entity_new_viewport() {
        let mut tracker = EntityTracker::new();
        tracker.observe("https://www.google.com/maps/place/Summer+Cafe/@40.71,17z");

        // Pan/zoom rewrites the location without changing the place.
        assert_eq!(
            tracker.observe("https://www.google.com/maps/place/Summer+Cafe/@40.72,15z"),
            None
        );
        assert_eq!(tracker.current(), Some(&EntityId::new("Summer Cafe")));
    }

    #[test]
    fn test_tracker_reports_entry_switch_and_exit() {
        let mut tracker = EntityTracker::new();

        // Entering the entity view from a search page emits nothing yet.
        assert_eq!(tracker.observe("https://www.google.com/maps/search/coffee"), None);

        let entered = tracker
            .observe("https://www.google.com/maps/place/Summer+Cafe/@1")
            .unwrap();
        assert_eq!(entered.previous, None);
        assert_eq!(entered.next, Some(EntityId::new("Summer Cafe")));

        let switched = tracker
            .observe("https://www.google.com/maps/place/Harbor+Books/@2")
            .unwrap();
        assert_eq!(switched.previous, Some(EntityId::new("Summer Cafe")));
        assert_eq!(switched.next, Some(EntityId::new("Harbor Books")));

        let left = tracker.observe("https://www.google.com/maps/search/books").unwrap();
        assert_eq!(left.previous, Some(EntityId::new("Harbor Books")));
        assert_eq!(left.next, None);
    }
}
