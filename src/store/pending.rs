/// Pending registry — events held until their dependencies are persisted.
///
/// Suspension is a first-class state here rather than a blocked task: each
/// entry records what it still waits on, and persisting a dependency hands
/// back every entry that became ready. The registry is bounded; beyond the
/// bound the oldest entry is evicted (dropped, not rejected).
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use crate::events::ids::EventId;
use crate::events::Event;

#[derive(Clone, Debug)]
pub struct PendingEntry {
    pub event: Arc<Event>,
    pub missing: BTreeSet<EventId>,
}

impl PendingEntry {
    /// Missing ids that are parents (as opposed to auth events).
    pub fn missing_parents(&self) -> impl Iterator<Item = &EventId> {
        self.missing
            .iter()
            .filter(|id| self.event.prev_events.contains(id))
    }
}

#[derive(Debug)]
pub struct PendingRegistry {
    entries: HashMap<EventId, PendingEntry>,
    /// Arrival order for eviction.
    order: VecDeque<EventId>,
    /// dependency -> events waiting on it
    waiters: HashMap<EventId, BTreeSet<EventId>>,
    capacity: usize,
}

impl PendingRegistry {
    pub fn new(capacity: usize) -> Self {
        PendingRegistry {
            entries: HashMap::new(),
            order: VecDeque::new(),
            waiters: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Hold `event` until `missing` are persisted. Returns the evicted
    /// entry if the registry overflowed.
    pub fn insert(&mut self, event: Arc<Event>, missing: BTreeSet<EventId>) -> Option<PendingEntry> {
        let id = event.event_id.clone();
        if self.entries.contains_key(&id) {
            return None;
        }

        for dep in &missing {
            self.waiters.entry(dep.clone()).or_default().insert(id.clone());
        }
        self.entries.insert(id.clone(), PendingEntry { event, missing });
        self.order.push_back(id);

        if self.entries.len() <= self.capacity {
            return None;
        }
        while let Some(oldest) = self.order.pop_front() {
            if let Some(entry) = self.remove(&oldest) {
                return Some(entry);
            }
        }
        None
    }

    /// `dep` was persisted: returns entries with nothing left to wait on,
    /// ordered by (depth, event_id).
    pub fn satisfy(&mut self, dep: &EventId) -> Vec<Arc<Event>> {
        let Some(waiting) = self.waiters.remove(dep) else {
            return Vec::new();
        };

        let mut ready = Vec::new();
        for id in waiting {
            let now_ready = match self.entries.get_mut(&id) {
                Some(entry) => {
                    entry.missing.remove(dep);
                    entry.missing.is_empty()
                }
                None => false,
            };
            if now_ready {
                if let Some(entry) = self.remove(&id) {
                    ready.push(entry.event);
                }
            }
        }

        ready.sort_by(|a, b| (a.depth, &a.event_id).cmp(&(b.depth, &b.event_id)));
        ready
    }

    pub fn remove(&mut self, id: &EventId) -> Option<PendingEntry> {
        let entry = self.entries.remove(id)?;
        for dep in &entry.missing {
            if let Some(set) = self.waiters.get_mut(dep) {
                set.remove(id);
                if set.is_empty() {
                    self.waiters.remove(dep);
                }
            }
        }
        self.order.retain(|queued| queued != id);
        Some(entry)
    }

    /// Drop everything, returning how many entries were held.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.order.clear();
        self.waiters.clear();
        count
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every id some entry is waiting on.
    pub fn missing(&self) -> BTreeSet<EventId> {
        self.waiters.keys().cloned().collect()
    }

    /// Missing ids that are parents of some entry.
    pub fn missing_parents(&self) -> BTreeSet<EventId> {
        self.entries
            .values()
            .flat_map(|e| e.missing_parents().cloned())
            .collect()
    }
}
