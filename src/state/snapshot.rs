/// State snapshots — which event last set each mutation slot.
///
/// A snapshot is a value keyed by graph position, never a shared mutable
/// "current state". BTreeMap keeps iteration (and therefore hashing and
/// serialization) canonical.
use serde::{Deserialize, Serialize};
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;

use crate::events::ids::EventId;

// ---------------------------------------------------------------------------
// StateSlot
// ---------------------------------------------------------------------------

/// A mutation slot: (event type, state key).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateSlot {
    pub event_type: String,
    pub state_key: String,
}

impl StateSlot {
    pub fn new(event_type: &str, state_key: &str) -> Self {
        StateSlot {
            event_type: event_type.to_string(),
            state_key: state_key.to_string(),
        }
    }
}

impl fmt::Debug for StateSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {:?})", self.event_type, self.state_key)
    }
}

// ---------------------------------------------------------------------------
// StateSnapshot
// ---------------------------------------------------------------------------

/// Serialized form of one slot; JSON object keys must be strings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    #[serde(rename = "type")]
    pub event_type: String,
    pub state_key: String,
    pub event_id: EventId,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<SnapshotEntry>", into = "Vec<SnapshotEntry>")]
pub struct StateSnapshot {
    slots: BTreeMap<StateSlot, EventId>,
}

impl From<Vec<SnapshotEntry>> for StateSnapshot {
    fn from(entries: Vec<SnapshotEntry>) -> Self {
        let slots = entries
            .into_iter()
            .map(|e| (StateSlot::new(&e.event_type, &e.state_key), e.event_id))
            .collect();
        StateSnapshot { slots }
    }
}

impl From<StateSnapshot> for Vec<SnapshotEntry> {
    fn from(snapshot: StateSnapshot) -> Self {
        snapshot
            .slots
            .into_iter()
            .map(|(slot, event_id)| SnapshotEntry {
                event_type: slot.event_type,
                state_key: slot.state_key,
                event_id,
            })
            .collect()
    }
}

impl StateSnapshot {
    pub fn new() -> Self {
        StateSnapshot::default()
    }

    pub fn get(&self, slot: &StateSlot) -> Option<&EventId> {
        self.slots.get(slot)
    }

    pub fn lookup(&self, event_type: &str, state_key: &str) -> Option<&EventId> {
        self.slots.get(&StateSlot::new(event_type, state_key))
    }

    /// Set a slot, returning the event it replaced.
    pub fn insert(&mut self, slot: StateSlot, event_id: EventId) -> Option<EventId> {
        self.slots.insert(slot, event_id)
    }

    pub fn remove(&mut self, slot: &StateSlot) -> Option<EventId> {
        self.slots.remove(slot)
    }

    /// The changes that turn `self` into `target`.
    pub fn delta_to(&self, target: &StateSnapshot) -> StateDelta {
        let set = target
            .slots
            .iter()
            .filter(|(slot, id)| self.slots.get(*slot) != Some(*id))
            .map(|(slot, id)| SnapshotEntry {
                event_type: slot.event_type.clone(),
                state_key: slot.state_key.clone(),
                event_id: id.clone(),
            })
            .collect();
        let removed = self
            .slots
            .keys()
            .filter(|slot| !target.slots.contains_key(*slot))
            .cloned()
            .collect();
        StateDelta { set, removed }
    }

    pub fn apply(&mut self, delta: &StateDelta) {
        for slot in &delta.removed {
            self.slots.remove(slot);
        }
        for entry in &delta.set {
            self.slots.insert(
                StateSlot::new(&entry.event_type, &entry.state_key),
                entry.event_id.clone(),
            );
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, StateSlot, EventId> {
        self.slots.iter()
    }

    pub fn event_ids(&self) -> impl Iterator<Item = &EventId> {
        self.slots.values()
    }

    pub fn contains_event(&self, event_id: &EventId) -> bool {
        self.slots.values().any(|id| id == event_id)
    }

    /// Deterministic hash for convergence checks across servers.
    pub fn state_hash(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        for (slot, event_id) in &self.slots {
            hasher.update(&(slot.event_type.len() as u64).to_le_bytes());
            hasher.update(slot.event_type.as_bytes());
            hasher.update(&(slot.state_key.len() as u64).to_le_bytes());
            hasher.update(slot.state_key.as_bytes());
            hasher.update(&(event_id.as_str().len() as u64).to_le_bytes());
            hasher.update(event_id.as_str().as_bytes());
        }
        *hasher.finalize().as_bytes()
    }
}

// ---------------------------------------------------------------------------
// StateDelta
// ---------------------------------------------------------------------------

/// Slots changed between two snapshots. Removals apply before sets.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDelta {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set: Vec<SnapshotEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<StateSlot>,
}

impl StateDelta {
    /// A delta setting one slot.
    pub fn single(slot: StateSlot, event_id: EventId) -> Self {
        StateDelta {
            set: vec![SnapshotEntry {
                event_type: slot.event_type,
                state_key: slot.state_key,
                event_id,
            }],
            removed: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.removed.is_empty()
    }

    /// Number of slots touched.
    pub fn len(&self) -> usize {
        self.set.len() + self.removed.len()
    }
}

impl FromIterator<(StateSlot, EventId)> for StateSnapshot {
    fn from_iter<I: IntoIterator<Item = (StateSlot, EventId)>>(iter: I) -> Self {
        StateSnapshot {
            slots: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a StateSnapshot {
    type Item = (&'a StateSlot, &'a EventId);
    type IntoIter = btree_map::Iter<'a, StateSlot, EventId>;

    fn into_iter(self) -> Self::IntoIter {
        self.slots.iter()
    }
}

impl fmt::Debug for StateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.slots.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> EventId {
        EventId::parse(s).unwrap()
    }

    #[test]
    fn test_insert_replaces() {
        let mut snap = StateSnapshot::new();
        let slot = StateSlot::new("m.room.topic", "");
        assert_eq!(snap.insert(slot.clone(), id("$a")), None);
        assert_eq!(snap.insert(slot.clone(), id("$b")), Some(id("$a")));
        assert_eq!(snap.get(&slot), Some(&id("$b")));
        assert_eq!(snap.len(), 1);
    }

    #[test]
    fn test_state_hash_independent_of_insert_order() {
        let mut a = StateSnapshot::new();
        a.insert(StateSlot::new("m.room.create", ""), id("$c"));
        a.insert(StateSlot::new("m.room.member", "@a:x"), id("$m"));

        let mut b = StateSnapshot::new();
        b.insert(StateSlot::new("m.room.member", "@a:x"), id("$m"));
        b.insert(StateSlot::new("m.room.create", ""), id("$c"));

        assert_eq!(a.state_hash(), b.state_hash());
        assert_eq!(a, b);
    }

    #[test]
    fn test_state_hash_distinguishes_slot_boundaries() {
        let mut a = StateSnapshot::new();
        a.insert(StateSlot::new("ab", "c"), id("$x"));
        let mut b = StateSnapshot::new();
        b.insert(StateSlot::new("a", "bc"), id("$x"));
        assert_ne!(a.state_hash(), b.state_hash());
    }

    #[test]
    fn test_delta_rebuilds_target() {
        let mut base = StateSnapshot::new();
        base.insert(StateSlot::new("m.room.create", ""), id("$c"));
        base.insert(StateSlot::new("m.room.topic", ""), id("$t1"));
        base.insert(StateSlot::new("m.room.name", ""), id("$n"));

        let mut target = base.clone();
        target.insert(StateSlot::new("m.room.topic", ""), id("$t2"));
        target.remove(&StateSlot::new("m.room.name", ""));
        target.insert(StateSlot::new("m.room.member", "@a:x"), id("$m"));

        let delta = base.delta_to(&target);
        assert_eq!(delta.set.len(), 2);
        assert_eq!(delta.removed, vec![StateSlot::new("m.room.name", "")]);

        let mut rebuilt = base.clone();
        rebuilt.apply(&delta);
        assert_eq!(rebuilt, target);
        assert!(target.delta_to(&target).is_empty());
    }

    #[test]
    fn test_empty_delta_serializes_compactly() {
        let json = serde_json::to_string(&StateDelta::default()).unwrap();
        assert_eq!(json, "{}");
        let single = StateDelta::single(StateSlot::new("m.room.topic", ""), id("$t"));
        let restored: StateDelta = serde_json::from_str(&serde_json::to_string(&single).unwrap()).unwrap();
        assert_eq!(restored, single);
    }

    #[test]
    fn test_json_roundtrip() {
        let mut snap = StateSnapshot::new();
        snap.insert(StateSlot::new("m.room.create", ""), id("$c"));
        snap.insert(StateSlot::new("m.room.member", "@a:x"), id("$m"));
        let json = serde_json::to_string(&snap).unwrap();
        let restored: StateSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, snap);
    }
}
