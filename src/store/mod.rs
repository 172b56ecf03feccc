/// Event Store — content-addressed storage and indexing of immutable events.
///
/// The store is the single writer of truth. Every mutation is appended to
/// the backend log first and applied to the in-memory indices second, under
/// one write lock, so readers only ever observe whole commits.
///
/// # Module structure
/// - `backend` — StorageBackend trait, MemoryBackend, FileBackend, frame codec
/// - `extremities` — forward/backward frontier per conversation
/// - `pending` — events held on missing dependencies
/// - `state_group` — per-event state as deltas against a base group
/// - `stream` — StreamToken, StreamEntry, the `events_since` iterator
pub mod backend;
pub mod extremities;
pub mod pending;
pub mod state_group;
pub mod stream;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

use crate::events::ids::{ConversationId, EventId};
use crate::events::{AuthCategory, Event};
use crate::state::resolution::auth_chain;
use crate::state::snapshot::{StateDelta, StateSnapshot};
use crate::state::EventSource;

pub use backend::{FileBackend, LogRecord, MemoryBackend, StorageBackend};
pub use extremities::ExtremityTracker;
pub use pending::{PendingEntry, PendingRegistry};
pub use state_group::{StateGroup, StateGroups};
pub use stream::{EventsSince, StreamEntry, StreamToken};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record encoding failed: {0}")]
    Encode(String),

    #[error("Corrupt log at offset {offset}: {reason}")]
    Corrupt { offset: usize, reason: String },

    #[error("Log out of sequence: expected stream ordering {expected}, found {found}")]
    OutOfSequence { expected: u64, found: u64 },

    #[error("Invalid stream token: {0}")]
    InvalidToken(String),

    #[error("State of {event} is based on unknown event {base}")]
    UnknownStateBase { event: EventId, base: EventId },

    #[error("Store lock poisoned")]
    Poisoned,
}

// ---------------------------------------------------------------------------
// Stored data
// ---------------------------------------------------------------------------

/// An event with everything the store derived for it at persist time.
struct StoredEvent {
    event: Arc<Event>,
    stream_ordering: u64,
    /// Why the auth check failed, if it did.
    rejection: Option<String>,
    /// State at the event's parents.
    state_before: Arc<StateGroup>,
    /// `state_before` plus this event's slot, unless rejected or not state.
    state_after: Arc<StateGroup>,
}

impl StoredEvent {
    pub fn is_rejected(&self) -> bool {
        self.rejection.is_some()
    }
}

#[derive(Debug)]
pub enum PersistOutcome {
    /// Newly stored; `ready` are held events whose last dependency this was.
    Stored {
        stream_ordering: u64,
        ready: Vec<Arc<Event>>,
    },
    /// Already stored; nothing changed.
    Duplicate,
}

#[derive(Debug, Default)]
pub struct HoldOutcome {
    /// Dependencies still absent. Empty means the event can be persisted now.
    pub missing: BTreeSet<EventId>,
    /// Held event dropped to respect the per-conversation bound.
    pub evicted: Option<EventId>,
}

struct ConversationIndex {
    extremities: ExtremityTracker,
    pending: PendingRegistry,
    /// Create events persisted without rejection.
    creates: BTreeSet<EventId>,
}

impl ConversationIndex {
    fn new(pending_capacity: usize) -> Self {
        ConversationIndex {
            extremities: ExtremityTracker::new(),
            pending: PendingRegistry::new(pending_capacity),
            creates: BTreeSet::new(),
        }
    }
}

struct StoreInner {
    backend: Box<dyn StorageBackend>,
    events: HashMap<EventId, StoredEvent>,
    conversations: HashMap<ConversationId, ConversationIndex>,
    /// Stream ordering N is at index N - 1.
    stream: Vec<EventId>,
    pending_capacity: usize,
    groups: StateGroups,
    /// Held events that became ready during replay.
    recovered: Vec<Arc<Event>>,
}

impl StoreInner {
    fn new(backend: Box<dyn StorageBackend>, pending_capacity: usize) -> Self {
        StoreInner {
            backend,
            events: HashMap::new(),
            conversations: HashMap::new(),
            stream: Vec::new(),
            pending_capacity,
            groups: StateGroups::new(state_group::MATERIALIZED_CACHE_SIZE),
            recovered: Vec::new(),
        }
    }

    fn conversation(&mut self, id: &ConversationId) -> &mut ConversationIndex {
        let capacity = self.pending_capacity;
        self.conversations
            .entry(id.clone())
            .or_insert_with(|| ConversationIndex::new(capacity))
    }

    fn missing_dependencies(&self, event: &Event) -> BTreeSet<EventId> {
        event
            .prev_events
            .iter()
            .chain(event.auth_events.iter())
            .filter(|id| !self.events.contains_key(*id))
            .cloned()
            .collect()
    }

    /// The first stored parent, whose state-after an event's state is
    /// recorded against.
    fn state_base(&self, event: &Event) -> Option<(EventId, Arc<StateGroup>)> {
        event
            .prev_events
            .iter()
            .find_map(|p| self.events.get(p).map(|s| (p.clone(), s.state_after.clone())))
    }

    /// Apply a persisted record to the indices.
    fn index_persisted(
        &mut self,
        event: Arc<Event>,
        rejection: Option<String>,
        state_before: Arc<StateGroup>,
    ) -> (u64, Vec<Arc<Event>>) {
        let id = event.event_id.clone();
        let accepted = rejection.is_none();

        let state_after = match event.state_slot() {
            Some(slot) if accepted => self
                .groups
                .derive(Some(&state_before), StateDelta::single(slot, id.clone())),
            _ => state_before.clone(),
        };

        self.stream.push(id.clone());
        let stream_ordering = self.stream.len() as u64;
        self.events.insert(
            id.clone(),
            StoredEvent {
                event: event.clone(),
                stream_ordering,
                rejection,
                state_before,
                state_after,
            },
        );

        let capacity = self.pending_capacity;
        let events = &self.events;
        let conv = self
            .conversations
            .entry(event.conversation_id.clone())
            .or_insert_with(|| ConversationIndex::new(capacity));
        conv.pending.remove(&id);
        if accepted && AuthCategory::of(&event.event_type) == AuthCategory::Create {
            conv.creates.insert(id.clone());
        }
        conv.extremities
            .on_persisted(&event, accepted, |p| events.contains_key(p));
        let ready = conv.pending.satisfy(&id);
        conv.extremities.reset_backward(conv.pending.missing_parents());

        (stream_ordering, ready)
    }

    /// Hold an event; returns the evicted entry's id if the bound was hit.
    fn index_pending(&mut self, event: Arc<Event>, missing: BTreeSet<EventId>) -> Option<EventId> {
        let conv = self.conversation(&event.conversation_id);
        let evicted = conv.pending.insert(event, missing);
        conv.extremities.reset_backward(conv.pending.missing_parents());
        evicted.map(|entry| entry.event.event_id.clone())
    }

    fn replay(&mut self, record: LogRecord) -> Result<(), StoreError> {
        match record {
            LogRecord::Persisted {
                event,
                stream_ordering,
                rejection,
                state_base,
                state_delta,
            } => {
                let expected = self.stream.len() as u64 + 1;
                if stream_ordering != expected {
                    return Err(StoreError::OutOfSequence {
                        expected,
                        found: stream_ordering,
                    });
                }
                let base = match state_base {
                    Some(base) => match self.events.get(&base) {
                        Some(stored) => Some(stored.state_after.clone()),
                        None => {
                            return Err(StoreError::UnknownStateBase {
                                event: event.event_id.clone(),
                                base,
                            })
                        }
                    },
                    None => None,
                };
                let state_before = self.groups.derive(base.as_ref(), state_delta);
                let (_, ready) = self.index_persisted(Arc::new(event), rejection, state_before);
                self.recovered.extend(ready);
            }
            LogRecord::Pending { event } => {
                let missing = self.missing_dependencies(&event);
                if !missing.is_empty() {
                    self.index_pending(Arc::new(event), missing);
                }
            }
            LogRecord::PendingEvicted {
                conversation_id,
                event_id,
            } => {
                let conv = self.conversation(&conversation_id);
                conv.pending.remove(&event_id);
                conv.extremities.reset_backward(conv.pending.missing_parents());
            }
            LogRecord::PendingDiscarded { conversation_id } => {
                let conv = self.conversation(&conversation_id);
                conv.pending.clear();
                conv.extremities.reset_backward(BTreeSet::new());
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EventStore
// ---------------------------------------------------------------------------

pub struct EventStore {
    inner: RwLock<StoreInner>,
}

impl EventStore {
    /// Open a store over `backend`, replaying its log.
    pub fn open(mut backend: Box<dyn StorageBackend>, pending_capacity: usize) -> Result<Self, StoreError> {
        let records = backend.load()?;
        let record_count = records.len();
        let mut inner = StoreInner::new(backend, pending_capacity);
        for record in records {
            inner.replay(record)?;
        }

        let StoreInner {
            events, recovered, ..
        } = &mut inner;
        recovered.retain(|ev| !events.contains_key(&ev.event_id));

        let pending: usize = inner.conversations.values().map(|c| c.pending.len()).sum();
        log::info!(
            "Event store opened: {} records, {} events, {} pending across {} conversations",
            record_count,
            inner.events.len(),
            pending,
            inner.conversations.len()
        );

        Ok(EventStore {
            inner: RwLock::new(inner),
        })
    }

    /// Ephemeral store with a fresh in-memory log.
    pub fn in_memory(pending_capacity: usize) -> Self {
        EventStore {
            inner: RwLock::new(StoreInner::new(Box::new(MemoryBackend::new()), pending_capacity)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        // Indices change only after a successful append, so a poisoned lock
        // still guards a consistent commit.
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreInner>, StoreError> {
        self.inner.write().map_err(|_| StoreError::Poisoned)
    }

    // -- writes --------------------------------------------------------------

    /// Persist an event with the state at its parents.
    ///
    /// The log records that state as a delta against the first stored
    /// parent's state-after. Idempotent: an id already stored is a
    /// `Duplicate` no-op. On backend failure nothing in memory changes.
    pub fn persist(
        &self,
        event: Arc<Event>,
        state_before: Arc<StateSnapshot>,
        rejection: Option<String>,
    ) -> Result<PersistOutcome, StoreError> {
        let mut inner = self.write()?;
        if inner.events.contains_key(&event.event_id) {
            return Ok(PersistOutcome::Duplicate);
        }

        let (state_base, base_group) = match inner.state_base(&event) {
            Some((id, group)) => (Some(id), Some(group)),
            None => (None, None),
        };
        let state_delta = match &base_group {
            Some(group) => {
                let base_state = inner.groups.materialize(group);
                if Arc::ptr_eq(&base_state, &state_before) {
                    StateDelta::default()
                } else {
                    base_state.delta_to(&state_before)
                }
            }
            None => StateSnapshot::new().delta_to(&state_before),
        };

        let record = LogRecord::Persisted {
            event: (*event).clone(),
            stream_ordering: inner.stream.len() as u64 + 1,
            rejection: rejection.clone(),
            state_base,
            state_delta: state_delta.clone(),
        };
        inner.backend.append(&record)?;

        let before = inner.groups.derive(base_group.as_ref(), state_delta);
        inner.groups.remember(&before, state_before);
        let (stream_ordering, ready) = inner.index_persisted(event, rejection, before);
        Ok(PersistOutcome::Stored {
            stream_ordering,
            ready,
        })
    }

    /// Hold an event until its dependencies are persisted.
    ///
    /// Returns the dependencies still missing; if none are, nothing is held
    /// and the caller should persist instead.
    pub fn hold_pending(&self, event: Arc<Event>) -> Result<HoldOutcome, StoreError> {
        let mut inner = self.write()?;
        if inner.events.contains_key(&event.event_id) {
            return Ok(HoldOutcome::default());
        }

        let missing = inner.missing_dependencies(&event);
        if missing.is_empty() {
            return Ok(HoldOutcome::default());
        }

        let already_held = inner
            .conversations
            .get(&event.conversation_id)
            .map_or(false, |c| c.pending.contains(&event.event_id));
        if already_held {
            return Ok(HoldOutcome {
                missing,
                evicted: None,
            });
        }

        inner.backend.append(&LogRecord::Pending {
            event: (*event).clone(),
        })?;
        let conversation_id = event.conversation_id.clone();
        let evicted = inner.index_pending(event, missing.clone());

        if let Some(evicted_id) = &evicted {
            log::warn!(
                "Pending bound reached in {}: evicted {}",
                conversation_id,
                evicted_id
            );
            let record = LogRecord::PendingEvicted {
                conversation_id,
                event_id: evicted_id.clone(),
            };
            // Replay re-applies the same bound, so a lost record is harmless.
            if let Err(e) = inner.backend.append(&record) {
                log::warn!("Failed to record eviction of {}: {}", evicted_id, e);
            }
        }

        Ok(HoldOutcome { missing, evicted })
    }

    /// Drop every held event of a conversation without rejecting them.
    pub fn discard_pending(&self, conversation_id: &ConversationId) -> Result<usize, StoreError> {
        let mut inner = self.write()?;
        let held = inner
            .conversations
            .get(conversation_id)
            .map_or(0, |c| c.pending.len());
        if held == 0 {
            return Ok(0);
        }

        inner.backend.append(&LogRecord::PendingDiscarded {
            conversation_id: conversation_id.clone(),
        })?;
        let conv = inner.conversation(conversation_id);
        conv.pending.clear();
        conv.extremities.reset_backward(BTreeSet::new());
        Ok(held)
    }

    /// Held events that became ready while replaying the log. Drained.
    pub fn take_recovered(&self) -> Vec<Arc<Event>> {
        match self.inner.write() {
            Ok(mut inner) => std::mem::take(&mut inner.recovered),
            Err(_) => Vec::new(),
        }
    }

    // -- reads ---------------------------------------------------------------

    pub fn get(&self, id: &EventId) -> Option<Arc<Event>> {
        self.read().events.get(id).map(|s| s.event.clone())
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.read().events.contains_key(id)
    }

    /// Rejection reason for a stored event; `None` if accepted or unknown.
    pub fn rejection(&self, id: &EventId) -> Option<String> {
        self.read().events.get(id).and_then(|s| s.rejection.clone())
    }

    pub fn is_pending(&self, id: &EventId) -> bool {
        self.read()
            .conversations
            .values()
            .any(|c| c.pending.contains(id))
    }

    /// Transitive closure of auth references from `ids`.
    pub fn get_auth_chain<'a, I>(&self, ids: I) -> BTreeSet<EventId>
    where
        I: IntoIterator<Item = &'a EventId>,
    {
        auth_chain(ids, self)
    }

    /// State after the event.
    pub fn get_state_at(&self, id: &EventId) -> Option<Arc<StateSnapshot>> {
        let inner = self.read();
        let stored = inner.events.get(id)?;
        Some(inner.groups.materialize(&stored.state_after))
    }

    /// State at the event's parents.
    pub fn state_before(&self, id: &EventId) -> Option<Arc<StateSnapshot>> {
        let inner = self.read();
        let stored = inner.events.get(id)?;
        Some(inner.groups.materialize(&stored.state_before))
    }

    /// Create events of a conversation persisted without rejection.
    pub fn accepted_creates(&self, conversation_id: &ConversationId) -> Vec<Arc<Event>> {
        let inner = self.read();
        let Some(conv) = inner.conversations.get(conversation_id) else {
            return Vec::new();
        };
        conv.creates
            .iter()
            .filter_map(|id| inner.events.get(id).map(|s| s.event.clone()))
            .collect()
    }

    pub fn forward_extremities(&self, conversation_id: &ConversationId) -> BTreeSet<EventId> {
        self.read()
            .conversations
            .get(conversation_id)
            .map(|c| c.extremities.forward().clone())
            .unwrap_or_default()
    }

    pub fn backward_extremities(&self, conversation_id: &ConversationId) -> BTreeSet<EventId> {
        self.read()
            .conversations
            .get(conversation_id)
            .map(|c| c.extremities.backward().clone())
            .unwrap_or_default()
    }

    /// Every id a held event of this conversation waits on.
    pub fn missing_dependencies(&self, conversation_id: &ConversationId) -> BTreeSet<EventId> {
        self.read()
            .conversations
            .get(conversation_id)
            .map(|c| c.pending.missing())
            .unwrap_or_default()
    }

    pub fn pending_count(&self, conversation_id: &ConversationId) -> usize {
        self.read()
            .conversations
            .get(conversation_id)
            .map_or(0, |c| c.pending.len())
    }

    pub fn conversations(&self) -> Vec<ConversationId> {
        let mut ids: Vec<ConversationId> = self.read().conversations.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn event_count(&self) -> usize {
        self.read().events.len()
    }

    // -- stream --------------------------------------------------------------

    /// Token after the most recently persisted event.
    pub fn stream_head(&self) -> StreamToken {
        StreamToken::after(self.read().stream.len() as u64)
    }

    /// Everything persisted after `since`, lazily, up to the current head.
    ///
    /// A token past the head was never issued by this store.
    pub fn events_since(&self, since: StreamToken) -> Result<EventsSince<'_>, StoreError> {
        let head = self.stream_head();
        if since > head {
            return Err(StoreError::InvalidToken(since.to_string()));
        }
        Ok(EventsSince::new(self, since, head))
    }

    pub(crate) fn stream_page(&self, after: StreamToken, limit: usize) -> Result<Vec<StreamEntry>, StoreError> {
        let inner = self.read();
        let start = after.ordering() as usize;
        if start > inner.stream.len() {
            return Err(StoreError::InvalidToken(after.to_string()));
        }
        let end = (start + limit).min(inner.stream.len());

        let mut entries = Vec::with_capacity(end - start);
        for id in &inner.stream[start..end] {
            if let Some(stored) = inner.events.get(id) {
                entries.push(StreamEntry {
                    ordering: stored.stream_ordering,
                    event: stored.event.clone(),
                    rejected: stored.is_rejected(),
                });
            }
        }
        Ok(entries)
    }
}

impl EventSource for EventStore {
    fn event(&self, id: &EventId) -> Option<Arc<Event>> {
        self.get(id)
    }

    fn is_rejected(&self, id: &EventId) -> bool {
        self.read()
            .events
            .get(id)
            .map_or(false, StoredEvent::is_rejected)
    }
}
