/// State groups — snapshots held as a delta against an earlier group.
///
/// Neighbouring events share almost all of their state, so a group records
/// only the slots it changes relative to its base. A chain is cut at
/// `MAX_DELTA_CHAIN` links by storing the full state again. Recently
/// materialized snapshots are kept in an LRU keyed by group id.
use lru::LruCache;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::state::snapshot::{StateDelta, StateSnapshot};

/// Longest run of deltas before a group stores full state.
pub const MAX_DELTA_CHAIN: usize = 32;

/// Materialized snapshots kept in memory.
pub const MATERIALIZED_CACHE_SIZE: usize = 256;

pub struct StateGroup {
    id: u64,
    base: Option<Arc<StateGroup>>,
    delta: StateDelta,
    chain_len: usize,
}

impl StateGroup {
    /// Deltas between this group and the nearest full group.
    pub fn chain_len(&self) -> usize {
        self.chain_len
    }
}

impl fmt::Debug for StateGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateGroup")
            .field("id", &self.id)
            .field("base", &self.base.as_ref().map(|b| b.id))
            .field("changes", &self.delta.len())
            .finish()
    }
}

pub struct StateGroups {
    next_id: AtomicU64,
    materialized: Mutex<LruCache<u64, Arc<StateSnapshot>>>,
}

impl StateGroups {
    pub fn new(cache_size: usize) -> Self {
        StateGroups {
            next_id: AtomicU64::new(1),
            materialized: Mutex::new(LruCache::new(
                NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    fn cache(&self) -> MutexGuard<'_, LruCache<u64, Arc<StateSnapshot>>> {
        self.materialized.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// A group holding `state` in full.
    pub fn full(&self, state: Arc<StateSnapshot>) -> Arc<StateGroup> {
        let group = Arc::new(StateGroup {
            id: self.next_id(),
            base: None,
            delta: StateSnapshot::new().delta_to(&state),
            chain_len: 0,
        });
        self.cache().put(group.id, state);
        group
    }

    /// The group `delta` away from `base`, or from empty state without one.
    /// An empty delta yields `base` itself.
    pub fn derive(&self, base: Option<&Arc<StateGroup>>, delta: StateDelta) -> Arc<StateGroup> {
        let Some(base) = base else {
            let mut state = StateSnapshot::new();
            state.apply(&delta);
            return self.full(Arc::new(state));
        };
        if delta.is_empty() {
            return base.clone();
        }
        if base.chain_len + 1 >= MAX_DELTA_CHAIN {
            let mut state = (*self.materialize(base)).clone();
            state.apply(&delta);
            return self.full(Arc::new(state));
        }
        Arc::new(StateGroup {
            id: self.next_id(),
            base: Some(base.clone()),
            delta,
            chain_len: base.chain_len + 1,
        })
    }

    /// Seed the cache with a group's known state.
    pub fn remember(&self, group: &StateGroup, state: Arc<StateSnapshot>) {
        self.cache().put(group.id, state);
    }

    /// Rebuild the snapshot a group stands for.
    pub fn materialize(&self, group: &Arc<StateGroup>) -> Arc<StateSnapshot> {
        if let Some(hit) = self.cache().get(&group.id) {
            return hit.clone();
        }

        let mut deltas = vec![&group.delta];
        let mut current = group;
        let mut state = loop {
            match &current.base {
                None => break StateSnapshot::new(),
                Some(base) => {
                    if let Some(hit) = self.cache().get(&base.id) {
                        break (**hit).clone();
                    }
                    deltas.push(&base.delta);
                    current = base;
                }
            }
        };
        for delta in deltas.iter().rev() {
            state.apply(delta);
        }

        let state = Arc::new(state);
        self.cache().put(group.id, state.clone());
        state
    }
}
