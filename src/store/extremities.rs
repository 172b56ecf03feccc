/// Extremity Tracker — the graph's forward and backward frontiers.
///
/// - Forward: accepted events with no persisted child. New local events
///   name these as parents.
/// - Backward: parent ids referenced by held events but not persisted.
///   Backfill targets these.
///
/// Rejected events never enter the forward set and never displace their
/// parents from it: a rejected event is history, not a tip.
use std::collections::BTreeSet;

use crate::events::ids::EventId;
use crate::events::Event;

#[derive(Clone, Debug, Default)]
pub struct ExtremityTracker {
    forward: BTreeSet<EventId>,
    backward: BTreeSet<EventId>,
}

impl ExtremityTracker {
    pub fn new() -> Self {
        ExtremityTracker::default()
    }

    /// Update both frontiers for a newly persisted event.
    ///
    /// `is_persisted` answers for parents; every parent of a persisted event
    /// is normally present, but the check keeps the backward set exact.
    pub fn on_persisted<F>(&mut self, event: &Event, accepted: bool, is_persisted: F)
    where
        F: Fn(&EventId) -> bool,
    {
        self.backward.remove(&event.event_id);

        if accepted {
            for parent in &event.prev_events {
                self.forward.remove(parent);
            }
            self.forward.insert(event.event_id.clone());
        }

        for parent in &event.prev_events {
            if !is_persisted(parent) {
                self.backward.insert(parent.clone());
            }
        }
    }

    /// Replace the backward set, e.g. after pending events were dropped.
    pub fn reset_backward(&mut self, still_missing: BTreeSet<EventId>) {
        self.backward = still_missing;
    }

    pub fn forward(&self) -> &BTreeSet<EventId> {
        &self.forward
    }

    pub fn backward(&self) -> &BTreeSet<EventId> {
        &self.backward
    }
}
