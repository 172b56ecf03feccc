/// FederationEngine — the intake pipeline and the engine's public surface.
///
/// Concurrency:
/// - Structural checks, signature verification and the auth check against
///   the parents' state run without any conversation lock. Parents' states
///   are immutable once persisted, so this work parallelizes freely.
/// - Persistence, extremity updates and pending promotion run under a
///   per-conversation `tokio::sync::Mutex`. Conversations never contend.
/// - Backfill runs on separate tasks fed by an mpsc channel; a suspended
///   event is a record in the pending registry, not a waiting task.
use lru::LruCache;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::crypto::ServerSigningKey;
use crate::events::content::AuthCategory;
use crate::events::ids::{ConversationId, EventId, ServerName};
use crate::events::limits::{MAX_DEPTH, MAX_LOCAL_PARENTS};
use crate::events::{now_ms, Event, EventError, PartialEvent};
use crate::federation::{fetch_with_retry, BackfillError, BackfillRequest, FederationClient};
use crate::intake::{IntakeError, IntakeOutcome, RejectReason};
use crate::state::{
    auth_types_for_event, auth_types_of, check, resolve, AuthEvents, AuthFailure, EventSource,
    StateSnapshot,
};
use crate::store::{EventStore, EventsSince, FileBackend, PersistOutcome, StreamToken};

/// Result of checking an event whose dependencies are all persisted.
struct Evaluation {
    state_before: Arc<StateSnapshot>,
    failure: Option<AuthFailure>,
    state_resolved: bool,
}

pub struct FederationEngine<F: FederationClient> {
    config: EngineConfig,
    server_name: ServerName,
    signing_key: ServerSigningKey,
    client: Arc<F>,
    store: EventStore,
    conversation_locks: Mutex<HashMap<ConversationId, Arc<tokio::sync::Mutex<()>>>>,
    /// Resolved snapshots keyed by the sorted ids of the events they sit on.
    state_cache: Mutex<LruCache<Vec<EventId>, Arc<StateSnapshot>>>,
    cancellations: Mutex<HashMap<ConversationId, CancellationToken>>,
    /// Ids with a backfill request outstanding.
    inflight: Mutex<HashSet<EventId>>,
    backfill_tx: mpsc::UnboundedSender<BackfillRequest>,
    backfill_rx: Mutex<Option<mpsc::UnboundedReceiver<BackfillRequest>>>,
}

impl<F: FederationClient> FederationEngine<F> {
    /// Open the engine, replaying `config.data_dir` if set.
    pub fn open(
        config: EngineConfig,
        signing_key: ServerSigningKey,
        client: Arc<F>,
    ) -> Result<Arc<Self>, IntakeError> {
        config.validate()?;
        let capacity = config.max_pending_per_conversation;
        let store = match &config.data_dir {
            Some(dir) => EventStore::open(Box::new(FileBackend::open(dir)?), capacity)?,
            None => EventStore::in_memory(capacity),
        };
        Self::with_store(config, signing_key, client, store)
    }

    /// Build an engine around an already opened store.
    ///
    /// Held events that became ready during replay are promoted, and
    /// backfill is re-requested for everything still missing. Inside a
    /// tokio runtime the backfill worker starts here; otherwise requests
    /// queue until `spawn_backfill` is called from one.
    pub fn with_store(
        config: EngineConfig,
        signing_key: ServerSigningKey,
        client: Arc<F>,
        store: EventStore,
    ) -> Result<Arc<Self>, IntakeError> {
        config.validate()?;
        let server_name = config.server_name()?;
        if signing_key.server_name() != &server_name {
            return Err(crate::config::ConfigError::Invalid {
                field: "server_name",
                reason: format!("signing key belongs to {}", signing_key.server_name()),
            }
            .into());
        }

        let cache_capacity =
            NonZeroUsize::new(config.state_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        let (backfill_tx, backfill_rx) = mpsc::unbounded_channel();

        let engine = Arc::new(FederationEngine {
            config,
            server_name,
            signing_key,
            client,
            store,
            conversation_locks: Mutex::new(HashMap::new()),
            state_cache: Mutex::new(LruCache::new(cache_capacity)),
            cancellations: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashSet::new()),
            backfill_tx,
            backfill_rx: Mutex::new(Some(backfill_rx)),
        });

        if tokio::runtime::Handle::try_current().is_ok() {
            engine.spawn_backfill();
        }

        // No other handle exists yet, so no conversation lock is needed.
        let recovered = engine.store.take_recovered();
        if !recovered.is_empty() {
            log::info!("Promoting {} held events made ready by replay", recovered.len());
            engine.promote(recovered);
        }
        for conversation_id in engine.store.conversations() {
            engine.retry_backfill(&conversation_id);
        }

        log::info!(
            "Federation engine for {} ready: {} events",
            engine.server_name,
            engine.store.event_count()
        );
        Ok(engine)
    }

    /// Start the backfill worker. Returns `None` if already started.
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn_backfill(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let rx = self
            .backfill_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let engine = Arc::downgrade(self);
        Some(tokio::spawn(Self::backfill_worker(engine, rx)))
    }

    pub fn server_name(&self) -> &ServerName {
        &self.server_name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    // ------------------------------------------------------------------------
    // Intake
    // ------------------------------------------------------------------------

    /// Run one event from a peer through the pipeline.
    pub async fn receive_event(&self, event: Event) -> Result<IntakeOutcome, IntakeError> {
        let event = Arc::new(event);
        if self.store.contains(&event.event_id) {
            return Ok(IntakeOutcome::Duplicate);
        }

        event.check_structure()?;
        if !self.client.verify_signature(&event) {
            log::warn!(
                "Dropping {} from {}: bad signature",
                event.event_id,
                event.origin
            );
            return Err(EventError::InvalidSignature(event.origin.clone()).into());
        }

        let evaluation = self.evaluate(&event)?;

        let lock = self.conversation_lock(&event.conversation_id);
        let _guard = lock.lock().await;
        let (outcome, ready) = self.process(event, evaluation)?;
        self.promote(ready);
        Ok(outcome)
    }

    /// Run a batch in ascending depth order.
    pub async fn receive_batch(
        &self,
        mut events: Vec<Event>,
    ) -> Vec<(EventId, Result<IntakeOutcome, IntakeError>)> {
        events.sort_by(|a, b| (a.depth, &a.event_id).cmp(&(b.depth, &b.event_id)));
        let mut results = Vec::with_capacity(events.len());
        for event in events {
            let id = event.event_id.clone();
            let result = self.receive_event(event).await;
            results.push((id, result));
        }
        results
    }

    /// Create, sign, persist and send a local event on top of the current
    /// forward extremities.
    ///
    /// An event the local server itself would reject is refused outright and
    /// never persisted or sent.
    pub async fn submit_local_event(&self, partial: PartialEvent) -> Result<EventId, RejectReason> {
        if partial.sender.server_name() != self.server_name {
            return Err(RejectReason::ForeignSender {
                sender: partial.sender.to_string(),
                server: self.server_name.to_string(),
            });
        }
        let conversation_id = partial.conversation_id.clone();
        let lock = self.conversation_lock(&conversation_id);
        let guard = lock.lock().await;

        let forward = self.store.forward_extremities(&conversation_id);
        let is_create = AuthCategory::of(&partial.event_type) == AuthCategory::Create;

        let (prev_events, auth_events, depth) = if is_create {
            if !forward.is_empty() || !self.store.accepted_creates(&conversation_id).is_empty() {
                return Err(RejectReason::Auth(AuthFailure::DuplicateCreate));
            }
            (Vec::new(), Vec::new(), 1)
        } else {
            if forward.is_empty() {
                return Err(RejectReason::UnknownConversation(conversation_id));
            }
            let mut parents: Vec<Arc<Event>> =
                forward.iter().filter_map(|id| self.store.get(id)).collect();
            parents.sort_by(|a, b| (b.depth, &b.event_id).cmp(&(a.depth, &a.event_id)));
            parents.truncate(MAX_LOCAL_PARENTS);

            let depth = parents
                .iter()
                .map(|p| p.depth)
                .max()
                .unwrap_or(0)
                .saturating_add(1)
                .min(MAX_DEPTH);
            let mut prev: Vec<EventId> = parents.iter().map(|p| p.event_id.clone()).collect();
            prev.sort();

            let (state, _) = self.state_at_parents(&prev)?;
            let auth: Vec<EventId> = auth_types_for_event(
                &partial.event_type,
                partial.state_key.as_deref(),
                &partial.sender,
                &partial.content,
            )
            .iter()
            .filter_map(|slot| state.get(slot).cloned())
            .filter(|id| !self.store.is_rejected(id))
            .collect();
            (prev, auth, depth)
        };

        let event = Arc::new(Event::create_signed(
            partial,
            prev_events,
            auth_events,
            depth,
            now_ms(),
            &self.signing_key,
        )?);

        let Some(evaluation) = self.evaluate(&event)? else {
            return Err(RejectReason::UnknownConversation(conversation_id));
        };
        if let Some(failure) = evaluation.failure {
            log::info!(
                "Refusing local {} in {}: {}",
                event.event_type,
                conversation_id,
                failure
            );
            return Err(RejectReason::Auth(failure));
        }

        let (_, ready) = self.persist_evaluated(&event, evaluation)?;
        self.promote(ready);
        drop(guard);

        if let Err(e) = self.client.send_event(&event).await {
            log::warn!("Sending {} failed: {}", event.event_id, e);
        }
        Ok(event.event_id.clone())
    }

    /// Check an event whose dependencies may or may not be persisted.
    ///
    /// `None` when something is missing.
    fn evaluate(&self, event: &Arc<Event>) -> Result<Option<Evaluation>, IntakeError> {
        let mut missing = false;
        for dep in event.prev_events.iter().chain(event.auth_events.iter()) {
            match self.store.get(dep) {
                None => missing = true,
                Some(parent) if parent.conversation_id != event.conversation_id => {
                    return Err(IntakeError::ForeignDependency {
                        event: event.event_id.clone(),
                        dependency: dep.clone(),
                    })
                }
                Some(_) => {}
            }
        }
        if missing {
            return Ok(None);
        }

        let expected = self.expected_depth(event);
        if event.depth != expected {
            return Err(EventError::DepthMismatch {
                claimed: event.depth,
                expected,
            }
            .into());
        }

        let (state_before, state_resolved) = self.state_at_parents(&event.prev_events)?;
        let failure = self.auth_failure(event, &state_before);
        Ok(Some(Evaluation {
            state_before,
            failure,
            state_resolved,
        }))
    }

    /// One more than the deepest parent; 1 without parents.
    fn expected_depth(&self, event: &Event) -> u64 {
        event
            .prev_events
            .iter()
            .filter_map(|id| self.store.get(id))
            .map(|p| p.depth)
            .max()
            .unwrap_or(0)
            .saturating_add(1)
            .min(MAX_DEPTH)
    }

    fn auth_failure(&self, event: &Event, state_before: &StateSnapshot) -> Option<AuthFailure> {
        if let Some(rejected) = event
            .auth_events
            .iter()
            .find(|id| self.store.is_rejected(id))
        {
            return Some(AuthFailure::RejectedAuthEvent(rejected.clone()));
        }

        let auth = AuthEvents::from_snapshot(state_before, &auth_types_of(event), &self.store);
        check(event, &auth).err()
    }

    /// Persist (or hold) one event; caller holds the conversation lock.
    fn process(
        &self,
        event: Arc<Event>,
        evaluation: Option<Evaluation>,
    ) -> Result<(IntakeOutcome, Vec<Arc<Event>>), IntakeError> {
        if let Some(evaluation) = evaluation {
            return self.persist_evaluated(&event, evaluation);
        }

        let held = self.store.hold_pending(event.clone())?;
        if held.missing.is_empty() {
            // Dependencies landed since evaluation.
            return match self.evaluate(&event)? {
                Some(evaluation) => self.persist_evaluated(&event, evaluation),
                None => Ok((
                    IntakeOutcome::PendingBackfill {
                        missing: BTreeSet::new(),
                    },
                    Vec::new(),
                )),
            };
        }

        log::debug!(
            "Holding {} in {}: {} dependencies missing",
            event.event_id,
            event.conversation_id,
            held.missing.len()
        );
        self.request_backfill(&event.conversation_id, &held.missing);
        Ok((
            IntakeOutcome::PendingBackfill {
                missing: held.missing,
            },
            Vec::new(),
        ))
    }

    /// A create loses to any accepted create of the same conversation that
    /// sorts before it by (origin_server_ts, event_id). Caller holds the
    /// conversation lock.
    fn superseded_create(&self, event: &Event) -> bool {
        AuthCategory::of(&event.event_type) == AuthCategory::Create
            && self
                .store
                .accepted_creates(&event.conversation_id)
                .iter()
                .any(|c| (c.origin_server_ts, &c.event_id) < (event.origin_server_ts, &event.event_id))
    }

    fn persist_evaluated(
        &self,
        event: &Arc<Event>,
        mut evaluation: Evaluation,
    ) -> Result<(IntakeOutcome, Vec<Arc<Event>>), IntakeError> {
        if evaluation.failure.is_none() && self.superseded_create(event) {
            evaluation.failure = Some(AuthFailure::DuplicateCreate);
        }
        let rejection = evaluation.failure.as_ref().map(|f| f.to_string());
        match self
            .store
            .persist(event.clone(), evaluation.state_before, rejection)?
        {
            PersistOutcome::Duplicate => Ok((IntakeOutcome::Duplicate, Vec::new())),
            PersistOutcome::Stored {
                stream_ordering,
                ready,
            } => {
                let outcome = match evaluation.failure {
                    Some(failure) => {
                        log::warn!(
                            "Rejected {} ({}) from {} in {}: {}",
                            event.event_id,
                            event.event_type,
                            event.sender,
                            event.conversation_id,
                            failure
                        );
                        IntakeOutcome::Rejected(failure)
                    }
                    None => {
                        log::debug!(
                            "Persisted {} at s{} in {}",
                            event.event_id,
                            stream_ordering,
                            event.conversation_id
                        );
                        IntakeOutcome::Persisted {
                            state_resolved: evaluation.state_resolved,
                        }
                    }
                };
                Ok((outcome, ready))
            }
        }
    }

    /// Run held events that became ready, and whatever they unblock in turn.
    fn promote(&self, ready: Vec<Arc<Event>>) {
        let mut queue: VecDeque<Arc<Event>> = ready.into();
        while let Some(event) = queue.pop_front() {
            let id = event.event_id.clone();
            let result = self
                .evaluate(&event)
                .and_then(|evaluation| self.process(event, evaluation));
            match result {
                Ok((outcome, more)) => {
                    log::debug!("Promoted held {}: {:?}", id, outcome);
                    queue.extend(more);
                }
                Err(e) => log::warn!("Promoting held {} failed: {}", id, e),
            }
        }
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    /// State at a set of parents, resolving when their states diverge.
    /// The flag reports whether resolution was needed.
    fn state_at_parents(&self, parents: &[EventId]) -> Result<(Arc<StateSnapshot>, bool), IntakeError> {
        let mut key: Vec<EventId> = parents.to_vec();
        key.sort();
        key.dedup();

        let mut snapshots = Vec::with_capacity(key.len());
        for id in &key {
            let state = self
                .store
                .get_state_at(id)
                .ok_or_else(|| IntakeError::MissingState(id.clone()))?;
            snapshots.push(state);
        }

        let Some(first) = snapshots.first().cloned() else {
            return Ok((Arc::new(StateSnapshot::new()), false));
        };
        if snapshots.iter().all(|s| s == &first) {
            return Ok((first, false));
        }

        if let Some(hit) = self.cache().get(&key).cloned() {
            return Ok((hit, true));
        }

        let refs: Vec<&StateSnapshot> = snapshots.iter().map(|s| s.as_ref()).collect();
        let resolved = Arc::new(resolve(&refs, &self.store)?);
        log::info!(
            "Resolved {} divergent states: {} slots",
            refs.len(),
            resolved.len()
        );
        self.cache().put(key, resolved.clone());
        Ok((resolved, true))
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, LruCache<Vec<EventId>, Arc<StateSnapshot>>> {
        self.state_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The state at the conversation's forward extremities.
    pub fn current_state(&self, conversation_id: &ConversationId) -> Result<Arc<StateSnapshot>, IntakeError> {
        let forward: Vec<EventId> = self
            .store
            .forward_extremities(conversation_id)
            .into_iter()
            .collect();
        Ok(self.state_at_parents(&forward)?.0)
    }

    /// State after a given event.
    pub fn state_at(&self, event_id: &EventId) -> Option<Arc<StateSnapshot>> {
        self.store.get_state_at(event_id)
    }

    pub fn forward_extremities(&self, conversation_id: &ConversationId) -> BTreeSet<EventId> {
        self.store.forward_extremities(conversation_id)
    }

    pub fn backward_extremities(&self, conversation_id: &ConversationId) -> BTreeSet<EventId> {
        self.store.backward_extremities(conversation_id)
    }

    pub fn get_event(&self, event_id: &EventId) -> Option<Arc<Event>> {
        self.store.get(event_id)
    }

    /// Everything persisted after `marker`, lazily. A marker past the
    /// stream head is an `InvalidToken` error.
    pub fn get_events_since(&self, marker: StreamToken) -> Result<EventsSince<'_>, IntakeError> {
        Ok(self.store.events_since(marker)?)
    }

    // ------------------------------------------------------------------------
    // Backfill
    // ------------------------------------------------------------------------

    fn conversation_lock(&self, conversation_id: &ConversationId) -> Arc<tokio::sync::Mutex<()>> {
        self.conversation_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(conversation_id.clone())
            .or_default()
            .clone()
    }

    fn cancellation_token(&self, conversation_id: &ConversationId) -> CancellationToken {
        self.cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(conversation_id.clone())
            .or_default()
            .clone()
    }

    /// Queue a fetch for `missing`, skipping ids already held or requested.
    fn request_backfill(&self, conversation_id: &ConversationId, missing: &BTreeSet<EventId>) {
        let want: BTreeSet<EventId> = {
            let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            missing
                .iter()
                .filter(|id| !self.store.is_pending(id))
                .filter(|id| inflight.insert((*id).clone()))
                .cloned()
                .collect()
        };
        if want.is_empty() {
            return;
        }

        let request = BackfillRequest {
            conversation_id: conversation_id.clone(),
            have: self
                .store
                .forward_extremities(conversation_id)
                .into_iter()
                .collect(),
            want,
            cancel: self.cancellation_token(conversation_id),
        };
        if let Err(mpsc::error::SendError(request)) = self.backfill_tx.send(request) {
            log::warn!("Backfill queue closed; {} stays pending", conversation_id);
            self.release_inflight(&request.want);
        }
    }

    fn release_inflight(&self, ids: &BTreeSet<EventId>) {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        for id in ids {
            inflight.remove(id);
        }
    }

    /// Ask again for everything the conversation's held events wait on.
    pub fn retry_backfill(&self, conversation_id: &ConversationId) {
        let missing = self.store.missing_dependencies(conversation_id);
        if !missing.is_empty() {
            self.request_backfill(conversation_id, &missing);
        }
    }

    async fn backfill_worker(engine: Weak<Self>, mut rx: mpsc::UnboundedReceiver<BackfillRequest>) {
        while let Some(request) = rx.recv().await {
            let Some(engine) = engine.upgrade() else {
                break;
            };
            tokio::spawn(async move { engine.run_backfill(request).await });
        }
        log::debug!("Backfill worker stopped");
    }

    async fn run_backfill(&self, request: BackfillRequest) {
        let result = fetch_with_retry(self.client.as_ref(), &request, &self.config.backfill).await;
        self.release_inflight(&request.want);

        match result {
            Ok(events) => {
                log::info!(
                    "Backfilled {} events for {}",
                    events.len(),
                    request.conversation_id
                );
                for (id, result) in self.receive_batch(events).await {
                    if let Err(e) = result {
                        log::warn!("Backfilled {} refused: {}", id, e);
                    }
                }
            }
            Err(BackfillError::Cancelled(conversation_id)) => {
                log::info!("Backfill for {} cancelled", conversation_id);
            }
            Err(e) => log::warn!("{}; held events stay pending", e),
        }
    }

    /// Stop backfilling a conversation and drop its held events. They are
    /// forgotten, not rejected: a later delivery is processed afresh.
    pub async fn abandon_conversation(&self, conversation_id: &ConversationId) -> Result<usize, IntakeError> {
        if let Some(token) = self
            .cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(conversation_id)
        {
            token.cancel();
        }

        let lock = self.conversation_lock(conversation_id);
        let _guard = lock.lock().await;
        let discarded = self.store.discard_pending(conversation_id)?;
        log::info!(
            "Abandoned {}: discarded {} held events",
            conversation_id,
            discarded
        );
        Ok(discarded)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackfillConfig;
    use crate::crypto::generate_keypair;
    use crate::events::content;
    use crate::events::ids::UserId;
    use crate::events::PowerLevelsContent;
    use crate::federation::{FederationError, LocalKeyRing};
    use crate::store::{MemoryBackend, StoreError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    // -- mock network --------------------------------------------------------

    #[derive(Default)]
    struct MockFederation {
        keys: LocalKeyRing,
        history: Mutex<HashMap<EventId, Event>>,
        sent: Mutex<Vec<EventId>>,
    }

    impl MockFederation {
        fn publish(&self, event: &Event) {
            self.history
                .lock()
                .unwrap()
                .insert(event.event_id.clone(), event.clone());
        }

        fn sent(&self) -> Vec<EventId> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FederationClient for MockFederation {
        async fn fetch_event(&self, event_id: &EventId) -> Result<Event, FederationError> {
            self.history
                .lock()
                .unwrap()
                .get(event_id)
                .cloned()
                .ok_or_else(|| FederationError::NotFound(event_id.clone()))
        }

        async fn fetch_missing_events(
            &self,
            _conversation_id: &ConversationId,
            _have: &[EventId],
            want: &[EventId],
            _limit: usize,
        ) -> Result<Vec<Event>, FederationError> {
            let history = self.history.lock().unwrap();
            Ok(want.iter().filter_map(|id| history.get(id).cloned()).collect())
        }

        fn verify_signature(&self, event: &Event) -> bool {
            self.keys.verify(event)
        }

        async fn send_event(&self, event: &Event) -> Result<(), FederationError> {
            self.sent.lock().unwrap().push(event.event_id.clone());
            Ok(())
        }
    }

    // -- fixtures ------------------------------------------------------------

    /// One server's key material, reusable across engine restarts.
    struct ServerKey {
        name: ServerName,
        private: [u8; 32],
        public: [u8; 32],
    }

    impl ServerKey {
        fn new(name: &str) -> Self {
            let (public, private) = generate_keypair();
            ServerKey {
                name: ServerName::new(name).unwrap(),
                private,
                public,
            }
        }

        fn signing_key(&self) -> ServerSigningKey {
            ServerSigningKey::from_bytes(self.name.clone(), &self.private).unwrap()
        }
    }

    struct Net {
        a: ServerKey,
        b: ServerKey,
        mock: Arc<MockFederation>,
    }

    impl Net {
        fn new() -> Self {
            let a = ServerKey::new("a.example");
            let b = ServerKey::new("b.example");
            let mock = Arc::new(MockFederation::default());
            mock.keys.add_key(a.name.clone(), a.public);
            mock.keys.add_key(b.name.clone(), b.public);
            Net { a, b, mock }
        }

        fn config(key: &ServerKey) -> EngineConfig {
            EngineConfig {
                server_name: key.name.to_string(),
                backfill: BackfillConfig {
                    attempt_timeout_ms: 500,
                    max_attempts: 3,
                    backoff_base_ms: 5,
                    batch_limit: 100,
                },
                ..Default::default()
            }
        }

        fn engine(&self, key: &ServerKey) -> Arc<FederationEngine<MockFederation>> {
            FederationEngine::open(Self::config(key), key.signing_key(), self.mock.clone()).unwrap()
        }

        fn persistent_engine(&self, key: &ServerKey, dir: &std::path::Path) -> Arc<FederationEngine<MockFederation>> {
            let config = EngineConfig {
                data_dir: Some(dir.to_path_buf()),
                ..Self::config(key)
            };
            FederationEngine::open(config, key.signing_key(), self.mock.clone()).unwrap()
        }
    }

    fn alice() -> UserId {
        UserId::parse("@alice:a.example").unwrap()
    }

    fn bob() -> UserId {
        UserId::parse("@bob:b.example").unwrap()
    }

    fn partial(
        conv: &ConversationId,
        sender: &UserId,
        event_type: &str,
        state_key: Option<&str>,
        content: serde_json::Value,
    ) -> PartialEvent {
        PartialEvent::new(conv.clone(), event_type, state_key, sender.clone(), content)
    }

    async fn send(
        engine: &FederationEngine<MockFederation>,
        conv: &ConversationId,
        sender: &UserId,
        event_type: &str,
        state_key: Option<&str>,
        content: serde_json::Value,
    ) -> EventId {
        engine
            .submit_local_event(partial(conv, sender, event_type, state_key, content))
            .await
            .unwrap()
    }

    async fn message(engine: &FederationEngine<MockFederation>, conv: &ConversationId, body: &str) -> EventId {
        send(engine, conv, &alice(), content::MESSAGE, None, json!({ "body": body })).await
    }

    /// Copy events from one engine to another in the given order.
    async fn deliver(
        from: &FederationEngine<MockFederation>,
        to: &FederationEngine<MockFederation>,
        ids: &[EventId],
    ) -> Vec<IntakeOutcome> {
        let mut outcomes = Vec::new();
        for id in ids {
            let event = from.get_event(id).unwrap();
            outcomes.push(to.receive_event((*event).clone()).await.unwrap());
        }
        outcomes
    }

    /// Alice creates a public conversation on A: [C, JA, PL(alice 100, bob 50), JR].
    async fn create_conversation(a: &FederationEngine<MockFederation>, join_rule: &str) -> (ConversationId, Vec<EventId>) {
        let conv = ConversationId::generate(a.server_name());
        let al = alice();
        let c = send(a, &conv, &al, content::CREATE, Some(""), json!({ "creator": al.as_str() })).await;
        let ja = send(a, &conv, &al, content::MEMBER, Some(al.as_str()), json!({ "membership": "join" })).await;
        let pl = PowerLevelsContent::default().with_user(&al, 100).with_user(&bob(), 50);
        let p = send(a, &conv, &al, content::POWER_LEVELS, Some(""), pl.to_value()).await;
        let jr = send(a, &conv, &al, content::JOIN_RULES, Some(""), json!({ "join_rule": join_rule })).await;
        (conv, vec![c, ja, p, jr])
    }

    /// Alice demotes bob while bob concurrently updates his own membership.
    /// Returns (A, B, conv, PL', M) with both events delivered both ways.
    async fn demotion_scenario(
        net: &Net,
    ) -> (
        Arc<FederationEngine<MockFederation>>,
        Arc<FederationEngine<MockFederation>>,
        ConversationId,
        EventId,
        EventId,
    ) {
        let a = net.engine(&net.a);
        let b = net.engine(&net.b);
        let (al, bo) = (alice(), bob());

        let (conv, setup) = create_conversation(&a, "invite").await;
        let invite = send(&a, &conv, &al, content::MEMBER, Some(bo.as_str()), json!({ "membership": "invite" })).await;
        let mut history = setup.clone();
        history.push(invite);
        deliver(&a, &b, &history).await;

        let join = send(&b, &conv, &bo, content::MEMBER, Some(bo.as_str()), json!({ "membership": "join" })).await;
        deliver(&b, &a, &[join.clone()]).await;

        // Concurrent on J: alice demotes bob, bob sets a display name.
        let demote = PowerLevelsContent::default().with_user(&al, 100).with_user(&bo, 0);
        let pl2 = send(&a, &conv, &al, content::POWER_LEVELS, Some(""), demote.to_value()).await;
        let m = send(
            &b,
            &conv,
            &bo,
            content::MEMBER,
            Some(bo.as_str()),
            json!({ "membership": "join", "displayname": "Bob" }),
        )
        .await;

        assert_eq!(
            deliver(&a, &b, &[pl2.clone()]).await,
            vec![IntakeOutcome::Persisted { state_resolved: false }]
        );
        assert_eq!(
            deliver(&b, &a, &[m.clone()]).await,
            vec![IntakeOutcome::Persisted { state_resolved: false }]
        );
        (a, b, conv, pl2, m)
    }

    /// Sign an event by hand, citing its auth events from `state`.
    fn build_on(
        key: &ServerKey,
        state: &StateSnapshot,
        conv: &ConversationId,
        sender: &UserId,
        prev: Vec<EventId>,
        depth: u64,
        body: serde_json::Value,
    ) -> Event {
        let auth: Vec<EventId> = auth_types_for_event(content::MESSAGE, None, sender, &body)
            .iter()
            .filter_map(|slot| state.get(slot).cloned())
            .collect();
        Event::create_signed(
            partial(conv, sender, content::MESSAGE, None, body),
            prev,
            auth,
            depth,
            now_ms(),
            &key.signing_key(),
        )
        .unwrap()
    }

    fn stream_ids(engine: &FederationEngine<MockFederation>) -> Vec<EventId> {
        engine
            .get_events_since(StreamToken::START)
            .unwrap()
            .map(|e| e.event.event_id.clone())
            .collect()
    }

    async fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        done()
    }

    // -- tests ---------------------------------------------------------------

    #[tokio::test]
    async fn test_local_chain_then_concurrent_fork() {
        let net = Net::new();
        let a = net.engine(&net.a);
        let (conv, setup) = create_conversation(&a, "public").await;

        let e2 = message(&a, &conv, "two").await;
        let e3 = message(&a, &conv, "three").await;
        assert_eq!(a.forward_extremities(&conv), BTreeSet::from([e3.clone()]));

        // A second server's event that only saw the setup: a fork off JR.
        let b = net.engine(&net.b);
        deliver(&a, &b, &setup).await;
        let bo = bob();
        let join = send(&b, &conv, &bo, content::MEMBER, Some(bo.as_str()), json!({ "membership": "join" })).await;
        assert_eq!(
            deliver(&b, &a, &[join.clone()]).await,
            vec![IntakeOutcome::Persisted { state_resolved: false }]
        );

        assert_eq!(a.forward_extremities(&conv), BTreeSet::from([e3, join.clone()]));
        assert!(a.backward_extremities(&conv).is_empty());
        assert!(!a.forward_extremities(&conv).contains(&e2));

        // The next local event merges both tips.
        let merge = message(&a, &conv, "merge").await;
        assert_eq!(a.forward_extremities(&conv), BTreeSet::from([merge.clone()]));
        let merged = a.get_event(&merge).unwrap();
        assert_eq!(merged.prev_events.len(), 2);
        assert_eq!(
            a.current_state(&conv).unwrap().lookup(content::MEMBER, bo.as_str()),
            Some(&join)
        );
    }

    #[tokio::test]
    async fn test_missing_parent_held_then_promoted() {
        let net = Net::new();
        let a = net.engine(&net.a);
        let b = net.engine(&net.b);
        let (conv, setup) = create_conversation(&a, "public").await;
        let m1 = message(&a, &conv, "one").await;
        let m2 = message(&a, &conv, "two").await;

        deliver(&a, &b, &setup).await;
        let outcome = deliver(&a, &b, &[m2.clone()]).await;
        assert_eq!(
            outcome,
            vec![IntakeOutcome::PendingBackfill {
                missing: BTreeSet::from([m1.clone()])
            }]
        );
        assert_eq!(b.backward_extremities(&conv), BTreeSet::from([m1.clone()]));
        assert!(!b.store().contains(&m2));
        assert!(!stream_ids(&b).contains(&m2));

        // The parent arrives: the held child follows without resubmission.
        assert_eq!(
            deliver(&a, &b, &[m1.clone()]).await,
            vec![IntakeOutcome::Persisted { state_resolved: false }]
        );
        assert!(b.store().contains(&m2));
        assert_eq!(b.forward_extremities(&conv), BTreeSet::from([m2.clone()]));
        assert!(b.backward_extremities(&conv).is_empty());
        assert_eq!(b.store().pending_count(&conv), 0);
    }

    #[tokio::test]
    async fn test_backfill_worker_fetches_missing_history() {
        let net = Net::new();
        let a = net.engine(&net.a);
        let (conv, mut history) = create_conversation(&a, "public").await;
        history.push(message(&a, &conv, "one").await);
        history.push(message(&a, &conv, "two").await);
        for id in &history {
            net.mock.publish(&a.get_event(id).unwrap());
        }

        // The worker is already running; no explicit spawn.
        let b = net.engine(&net.b);
        assert!(b.spawn_backfill().is_none());

        let tip = history.last().unwrap().clone();
        let outcome = deliver(&a, &b, &[tip.clone()]).await;
        assert!(matches!(outcome[0], IntakeOutcome::PendingBackfill { .. }));

        let store_has_tip = || b.store().contains(&tip);
        assert!(wait_for(store_has_tip).await, "backfill did not complete");
        assert_eq!(b.forward_extremities(&conv), BTreeSet::from([tip.clone()]));
        assert!(b.backward_extremities(&conv).is_empty());
        assert_eq!(
            b.current_state(&conv).unwrap(),
            a.current_state(&conv).unwrap()
        );
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_noop() {
        let net = Net::new();
        let a = net.engine(&net.a);
        let b = net.engine(&net.b);
        let (conv, setup) = create_conversation(&a, "public").await;
        let m1 = message(&a, &conv, "one").await;
        let m2 = message(&a, &conv, "two").await;

        deliver(&a, &b, &setup).await;
        let head = b.store().stream_head();
        assert_eq!(
            deliver(&a, &b, &setup[..1]).await,
            vec![IntakeOutcome::Duplicate]
        );
        assert_eq!(b.store().stream_head(), head);

        // Holding the same event twice holds it once.
        deliver(&a, &b, &[m2.clone()]).await;
        deliver(&a, &b, &[m2.clone()]).await;
        assert_eq!(b.store().pending_count(&conv), 1);

        deliver(&a, &b, &[m1]).await;
        assert_eq!(deliver(&a, &b, &[m2]).await, vec![IntakeOutcome::Duplicate]);
    }

    #[tokio::test]
    async fn test_demotion_resolves_identically_on_both_servers() {
        let net = Net::new();
        let (a, b, conv, pl2, m) = demotion_scenario(&net).await;
        let bo = bob();

        for engine in [&a, &b] {
            let state = engine.current_state(&conv).unwrap();
            assert_eq!(state.lookup(content::POWER_LEVELS, ""), Some(&pl2));
            assert_eq!(state.lookup(content::MEMBER, bo.as_str()), Some(&m));
            let levels: PowerLevelsContent = engine
                .get_event(&pl2)
                .unwrap()
                .content_as()
                .unwrap();
            assert_eq!(levels.user_level(&bo), 0);
            assert_eq!(
                engine.forward_extremities(&conv),
                BTreeSet::from([pl2.clone(), m.clone()])
            );
        }
        assert_eq!(
            a.current_state(&conv).unwrap().state_hash(),
            b.current_state(&conv).unwrap().state_hash()
        );

        // Bob, now at 0, can no longer change the topic.
        let refused = b
            .submit_local_event(partial(&conv, &bo, content::TOPIC, Some(""), json!({ "topic": "x" })))
            .await;
        assert!(matches!(
            refused,
            Err(RejectReason::Auth(AuthFailure::InsufficientPower { .. }))
        ));
    }

    #[tokio::test]
    async fn test_convergence_across_delivery_orders() {
        let net = Net::new();
        let (a, b, conv, _, _) = demotion_scenario(&net).await;
        // One merge event on top of both branches.
        let late = message(&a, &conv, "after").await;
        deliver(&a, &b, &[late]).await;

        let history = stream_ids(&a);
        let forward_order = history.clone();
        let mut reverse_order = history.clone();
        reverse_order.reverse();
        let mut interleaved: Vec<EventId> = history.iter().step_by(2).cloned().collect();
        interleaved.extend(history.iter().skip(1).step_by(2).cloned());

        let mut states = Vec::new();
        for order in [forward_order, reverse_order, interleaved] {
            let c = net.engine(&ServerKey::new("c.example"));
            deliver(&a, &c, &order).await;
            assert_eq!(c.store().pending_count(&conv), 0);
            assert_eq!(c.forward_extremities(&conv), a.forward_extremities(&conv));
            states.push(c.current_state(&conv).unwrap());
        }
        let expected = a.current_state(&conv).unwrap();
        for state in &states {
            assert_eq!(state, &expected);
        }
        assert_eq!(b.current_state(&conv).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_invalid_signature_is_malformed() {
        let net = Net::new();
        let a = net.engine(&net.a);
        let b = net.engine(&net.b);
        let (conv, setup) = create_conversation(&a, "public").await;
        deliver(&a, &b, &setup).await;
        let m = message(&a, &conv, "signed").await;

        let mut forged = (*a.get_event(&m).unwrap()).clone();
        let impostor = ServerKey::new("a.example").signing_key();
        let signature = crate::crypto::encode_b64(&impostor.sign(&forged.signable_bytes().unwrap()));
        forged.signatures.insert(net.a.name.clone(), signature);

        let result = b.receive_event(forged).await;
        assert!(matches!(
            result,
            Err(IntakeError::Malformed(EventError::InvalidSignature(_)))
        ));
        assert!(result.unwrap_err().is_malformed());
        assert!(!b.store().contains(&m));
        assert!(!stream_ids(&b).contains(&m));
        assert_eq!(b.forward_extremities(&conv), BTreeSet::from([setup[3].clone()]));

        // A tampered body fails structurally before any signature check.
        let mut tampered = (*a.get_event(&m).unwrap()).clone();
        tampered.content = json!({ "body": "changed" });
        assert!(matches!(
            b.receive_event(tampered).await,
            Err(IntakeError::Malformed(EventError::ContentHashMismatch))
        ));
    }

    #[tokio::test]
    async fn test_rejected_event_kept_but_excluded_from_state() {
        let net = Net::new();
        let a = net.engine(&net.a);
        let b = net.engine(&net.b);
        let (conv, setup) = create_conversation(&a, "invite").await;
        deliver(&a, &b, &setup).await;

        // Bob never joined, so B refuses his topic locally.
        let bo = bob();
        let refused = b
            .submit_local_event(partial(&conv, &bo, content::TOPIC, Some(""), json!({ "topic": "mine" })))
            .await;
        assert!(matches!(
            refused,
            Err(RejectReason::Auth(AuthFailure::SenderNotJoined(_)))
        ));

        // The same topic built by hand and delivered to A.
        let state = a.current_state(&conv).unwrap();
        let auth: Vec<EventId> = auth_types_for_event(content::TOPIC, Some(""), &bo, &json!({}))
            .iter()
            .filter_map(|slot| state.get(slot).cloned())
            .collect();
        let topic = Event::create_signed(
            partial(&conv, &bo, content::TOPIC, Some(""), json!({ "topic": "mine" })),
            vec![setup[3].clone()],
            auth,
            5,
            now_ms(),
            &net.b.signing_key(),
        )
        .unwrap();
        let topic_id = topic.event_id.clone();

        let outcome = a.receive_event(topic).await.unwrap();
        assert_eq!(
            outcome,
            IntakeOutcome::Rejected(AuthFailure::SenderNotJoined(bo.clone()))
        );
        assert!(a.store().contains(&topic_id));
        assert!(a.store().is_rejected(&topic_id));
        assert_eq!(a.current_state(&conv).unwrap().lookup(content::TOPIC, ""), None);
        assert_eq!(a.forward_extremities(&conv), BTreeSet::from([setup[3].clone()]));

        let entry = a
            .get_events_since(StreamToken::START)
            .unwrap()
            .find(|e| e.event.event_id == topic_id)
            .unwrap();
        assert!(entry.rejected);

        // Citing the rejected event as an auth event is itself rejected.
        let alice_topic = Event::create_signed(
            partial(&conv, &alice(), content::TOPIC, Some(""), json!({ "topic": "x" })),
            vec![setup[3].clone()],
            vec![setup[0].clone(), topic_id.clone()],
            5,
            now_ms(),
            &net.a.signing_key(),
        )
        .unwrap();
        assert_eq!(
            a.receive_event(alice_topic).await.unwrap(),
            IntakeOutcome::Rejected(AuthFailure::RejectedAuthEvent(topic_id))
        );
    }

    #[tokio::test]
    async fn test_batch_processed_in_depth_order() {
        let net = Net::new();
        let a = net.engine(&net.a);
        let (conv, mut history) = create_conversation(&a, "public").await;
        history.push(message(&a, &conv, "one").await);

        let events: Vec<Event> = history
            .iter()
            .rev()
            .map(|id| (*a.get_event(id).unwrap()).clone())
            .collect();
        let b = net.engine(&net.b);
        let results = b.receive_batch(events).await;
        let order: Vec<EventId> = results.iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(order, history);
        assert!(results
            .iter()
            .all(|(_, r)| matches!(r, Ok(IntakeOutcome::Persisted { .. }))));
    }

    #[tokio::test]
    async fn test_local_submission_rules() {
        let net = Net::new();
        let a = net.engine(&net.a);
        let (conv, _) = create_conversation(&a, "public").await;

        let mallory = UserId::parse("@mallory:a.example").unwrap();
        let head = a.store().stream_head();
        assert!(matches!(
            a.submit_local_event(partial(&conv, &mallory, content::MESSAGE, None, json!({ "body": "hi" })))
                .await,
            Err(RejectReason::Auth(AuthFailure::SenderNotJoined(_)))
        ));
        assert_eq!(a.store().stream_head(), head);

        assert!(matches!(
            a.submit_local_event(partial(&conv, &bob(), content::MESSAGE, None, json!({}))).await,
            Err(RejectReason::ForeignSender { .. })
        ));

        let unknown = ConversationId::generate(a.server_name());
        assert!(matches!(
            a.submit_local_event(partial(&unknown, &alice(), content::MESSAGE, None, json!({}))).await,
            Err(RejectReason::UnknownConversation(_))
        ));

        assert!(matches!(
            a.submit_local_event(partial(&conv, &alice(), content::CREATE, Some(""), json!({}))).await,
            Err(RejectReason::Auth(AuthFailure::DuplicateCreate))
        ));

        let id = message(&a, &conv, "hello").await;
        assert!(net.mock.sent().contains(&id));
        let event = a.get_event(&id).unwrap();
        assert_eq!(event.depth, 5);
        assert_eq!(event.auth_events.len(), 3);
    }

    #[tokio::test]
    async fn test_abandon_discards_without_rejecting() {
        let net = Net::new();
        let a = net.engine(&net.a);
        let b = net.engine(&net.b);
        let (conv, setup) = create_conversation(&a, "public").await;
        let m1 = message(&a, &conv, "one").await;
        let m2 = message(&a, &conv, "two").await;
        deliver(&a, &b, &setup).await;
        deliver(&a, &b, &[m2.clone()]).await;

        assert_eq!(b.abandon_conversation(&conv).await.unwrap(), 1);
        assert_eq!(b.store().pending_count(&conv), 0);
        assert!(b.backward_extremities(&conv).is_empty());
        assert!(!b.store().contains(&m2));
        assert!(b.store().rejection(&m2).is_none());

        // A later delivery is processed afresh.
        deliver(&a, &b, &[m1, m2.clone()]).await;
        assert!(b.store().contains(&m2));
    }

    #[tokio::test]
    async fn test_restart_resumes_exactly() {
        let net = Net::new();
        let dir = tempfile::tempdir().unwrap();
        let a = net.engine(&net.a);
        let (conv, setup) = create_conversation(&a, "public").await;
        let m1 = message(&a, &conv, "one").await;
        let m2 = message(&a, &conv, "two").await;

        let (state, head) = {
            let b = net.persistent_engine(&net.b, dir.path());
            deliver(&a, &b, &setup).await;
            deliver(&a, &b, &[m2.clone()]).await;
            (b.current_state(&conv).unwrap(), b.store().stream_head())
        };

        let b = net.persistent_engine(&net.b, dir.path());
        assert_eq!(b.store().stream_head(), head);
        assert_eq!(b.current_state(&conv).unwrap(), state);
        assert_eq!(b.forward_extremities(&conv), BTreeSet::from([setup[3].clone()]));
        assert_eq!(b.backward_extremities(&conv), BTreeSet::from([m1.clone()]));
        assert_eq!(b.store().pending_count(&conv), 1);
        assert_eq!(stream_ids(&b), setup);

        deliver(&a, &b, &[m1.clone()]).await;
        assert_eq!(b.forward_extremities(&conv), BTreeSet::from([m2.clone()]));

        drop(b);
        let b = net.persistent_engine(&net.b, dir.path());
        assert_eq!(b.forward_extremities(&conv), BTreeSet::from([m2]));
        assert_eq!(b.store().pending_count(&conv), 0);
        assert_eq!(b.current_state(&conv).unwrap(), a.current_state(&conv).unwrap());
    }

    #[tokio::test]
    async fn test_competing_creates_converge_on_earliest() {
        let net = Net::new();
        let x = net.engine(&net.a);
        let y = net.engine(&net.b);
        let al = alice();
        let conv = ConversationId::generate(&net.a.name);
        let create = |ts: u64, v: u64| {
            Event::create_signed(
                partial(&conv, &al, content::CREATE, Some(""), json!({ "creator": al.as_str(), "v": v })),
                vec![],
                vec![],
                1,
                ts,
                &net.a.signing_key(),
            )
            .unwrap()
        };
        let early = create(100, 1);
        let late = create(200, 2);

        assert_eq!(
            x.receive_event(early.clone()).await.unwrap(),
            IntakeOutcome::Persisted { state_resolved: false }
        );
        assert_eq!(
            x.receive_event(late.clone()).await.unwrap(),
            IntakeOutcome::Rejected(AuthFailure::DuplicateCreate)
        );

        // Opposite arrival order: the earlier create still gets in.
        assert_eq!(
            y.receive_event(late.clone()).await.unwrap(),
            IntakeOutcome::Persisted { state_resolved: false }
        );
        assert_eq!(
            y.receive_event(early.clone()).await.unwrap(),
            IntakeOutcome::Persisted { state_resolved: false }
        );

        let on_x = x.current_state(&conv).unwrap();
        let on_y = y.current_state(&conv).unwrap();
        assert_eq!(on_x, on_y);
        assert_eq!(on_x.lookup(content::CREATE, ""), Some(&early.event_id));

        assert!(matches!(
            y.submit_local_event(partial(&conv, &al, content::CREATE, Some(""), json!({}))).await,
            Err(RejectReason::Auth(AuthFailure::DuplicateCreate))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_intake_on_one_conversation() {
        let net = Net::new();
        let a = net.engine(&net.a);
        let b = net.engine(&net.b);
        let (conv, setup) = create_conversation(&a, "public").await;
        deliver(&a, &b, &setup).await;
        let state = a.current_state(&conv).unwrap();
        let al = alice();

        // Eight siblings on JR, plus a child of the first one.
        let siblings: Vec<Event> = (0..8)
            .map(|n| build_on(&net.a, &state, &conv, &al, vec![setup[3].clone()], 5, json!({ "body": n })))
            .collect();
        let child = build_on(&net.a, &state, &conv, &al, vec![siblings[0].event_id.clone()], 6, json!({ "body": "child" }));

        let mut tasks = Vec::new();
        for event in siblings.iter().cloned().chain([child.clone()]) {
            let b = b.clone();
            tasks.push(tokio::spawn(async move { b.receive_event(event).await }));
        }
        for task in tasks {
            let outcome = task.await.unwrap().unwrap();
            assert!(matches!(
                outcome,
                IntakeOutcome::Persisted { .. } | IntakeOutcome::PendingBackfill { .. }
            ));
        }

        let mut expected: BTreeSet<EventId> = siblings[1..].iter().map(|e| e.event_id.clone()).collect();
        expected.insert(child.event_id.clone());
        assert_eq!(b.forward_extremities(&conv), expected);
        assert!(b.backward_extremities(&conv).is_empty());
        assert_eq!(b.store().pending_count(&conv), 0);
        assert_eq!(stream_ids(&b).len(), setup.len() + 9);
        assert_eq!(b.current_state(&conv).unwrap(), state);
    }

    #[tokio::test]
    async fn test_store_failure_persists_and_sends_nothing() {
        let net = Net::new();
        let a = net.engine(&net.a);
        let (conv, setup) = create_conversation(&a, "public").await;

        let backend = MemoryBackend::new();
        let store = EventStore::open(Box::new(backend.clone()), 16).unwrap();
        let b = FederationEngine::with_store(Net::config(&net.b), net.b.signing_key(), net.mock.clone(), store).unwrap();
        deliver(&a, &b, &setup).await;
        let m = message(&a, &conv, "lost").await;
        let head = b.store().stream_head();
        let sent = net.mock.sent().len();

        backend.set_fail_appends(true);
        let result = b.receive_event((*a.get_event(&m).unwrap()).clone()).await;
        assert!(matches!(result, Err(IntakeError::Store(StoreError::Io(_)))));
        assert!(!result.unwrap_err().is_malformed());
        assert!(!b.store().contains(&m));
        assert_eq!(b.forward_extremities(&conv), BTreeSet::from([setup[3].clone()]));

        let bo = bob();
        let join = b
            .submit_local_event(partial(&conv, &bo, content::MEMBER, Some(bo.as_str()), json!({ "membership": "join" })))
            .await;
        assert!(matches!(
            join,
            Err(RejectReason::Intake(IntakeError::Store(StoreError::Io(_))))
        ));
        assert_eq!(b.store().stream_head(), head);
        assert_eq!(net.mock.sent().len(), sent);

        backend.set_fail_appends(false);
        assert_eq!(
            deliver(&a, &b, &[m.clone()]).await,
            vec![IntakeOutcome::Persisted { state_resolved: false }]
        );
    }

    #[tokio::test]
    async fn test_depth_must_follow_parents() {
        let net = Net::new();
        let a = net.engine(&net.a);
        let b = net.engine(&net.b);
        let (conv, setup) = create_conversation(&a, "public").await;
        deliver(&a, &b, &setup).await;
        let state = a.current_state(&conv).unwrap();
        let al = alice();

        let deep = build_on(&net.a, &state, &conv, &al, vec![setup[3].clone()], 9, json!({ "body": "deep" }));
        let result = b.receive_event(deep.clone()).await;
        assert!(matches!(
            result,
            Err(IntakeError::Malformed(EventError::DepthMismatch { claimed: 9, expected: 5 }))
        ));
        assert!(!b.store().contains(&deep.event_id));

        // Held on a missing parent, then dropped once the parent shows the
        // depth is wrong.
        let parent = build_on(&net.a, &state, &conv, &al, vec![setup[3].clone()], 5, json!({ "body": "parent" }));
        let shallow = build_on(&net.a, &state, &conv, &al, vec![parent.event_id.clone()], 5, json!({ "body": "shallow" }));
        assert!(matches!(
            b.receive_event(shallow.clone()).await.unwrap(),
            IntakeOutcome::PendingBackfill { .. }
        ));
        b.receive_event(parent.clone()).await.unwrap();
        assert!(!b.store().contains(&shallow.event_id));
        assert_eq!(b.store().pending_count(&conv), 0);
        assert_eq!(b.forward_extremities(&conv), BTreeSet::from([parent.event_id.clone()]));
    }

    #[tokio::test]
    async fn test_token_past_head_is_invalid() {
        let net = Net::new();
        let a = net.engine(&net.a);
        create_conversation(&a, "public").await;
        let head = a.store().stream_head();
        assert_eq!(a.get_events_since(head).unwrap().count(), 0);
        assert!(matches!(
            a.get_events_since(StreamToken::after(head.ordering() + 1)),
            Err(IntakeError::Store(StoreError::InvalidToken(_)))
        ));
    }

    #[test]
    fn test_backfill_worker_deferred_outside_runtime() {
        let net = Net::new();
        let b = net.engine(&net.b);
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            assert!(b.spawn_backfill().is_some());
            assert!(b.spawn_backfill().is_none());
        });
    }
}
