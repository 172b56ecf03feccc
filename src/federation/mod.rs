/// Federation collaborator — the transport layer seen from the engine.
///
/// The engine never speaks a wire protocol itself. It asks a
/// `FederationClient` for missing history, for a signature verdict, and to
/// send locally created events out.
///
/// # Module structure
/// - `backfill` — bounded, cancellable retry loop for fetching history
pub mod backfill;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

use crate::events::ids::{ConversationId, EventId, ServerName};
use crate::events::Event;

pub use backfill::{fetch_with_retry, BackfillError, BackfillRequest};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FederationError {
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Event not found: {0}")]
    NotFound(EventId),

    #[error("Peer returned an invalid response: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait FederationClient: Send + Sync + 'static {
    /// Fetch a single event by id.
    async fn fetch_event(&self, event_id: &EventId) -> Result<Event, FederationError>;

    /// Events of `conversation_id` that are ancestors of `want` but not of
    /// `have`, at most `limit`.
    async fn fetch_missing_events(
        &self,
        conversation_id: &ConversationId,
        have: &[EventId],
        want: &[EventId],
        limit: usize,
    ) -> Result<Vec<Event>, FederationError>;

    /// Whether the origin's signature on `event` is valid.
    fn verify_signature(&self, event: &Event) -> bool;

    /// Send a locally created event to the other servers in its conversation.
    async fn send_event(&self, event: &Event) -> Result<(), FederationError>;
}

// ---------------------------------------------------------------------------
// LocalKeyRing
// ---------------------------------------------------------------------------

/// Known server public keys, for the default Ed25519 origin check.
#[derive(Default)]
pub struct LocalKeyRing {
    keys: RwLock<HashMap<ServerName, [u8; 32]>>,
}

impl LocalKeyRing {
    pub fn new() -> Self {
        LocalKeyRing::default()
    }

    pub fn add_key(&self, server: ServerName, public_key: [u8; 32]) {
        if let Ok(mut keys) = self.keys.write() {
            keys.insert(server, public_key);
        }
    }

    pub fn public_key(&self, server: &ServerName) -> Option<[u8; 32]> {
        self.keys.read().ok()?.get(server).copied()
    }

    /// True iff the origin's key is known and its signature verifies.
    pub fn verify(&self, event: &Event) -> bool {
        match self.public_key(&event.origin) {
            Some(key) => event.verify_origin_signature(&key).is_ok(),
            None => {
                log::debug!("No key for origin {} of {}", event.origin, event.event_id);
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// OfflineFederation
// ---------------------------------------------------------------------------

/// A client with no peers: history is never fetchable, sends are dropped,
/// signatures are checked against the key ring.
#[derive(Default)]
pub struct OfflineFederation {
    pub keys: LocalKeyRing,
}

impl OfflineFederation {
    pub fn new(keys: LocalKeyRing) -> Self {
        OfflineFederation { keys }
    }
}

#[async_trait]
impl FederationClient for OfflineFederation {
    async fn fetch_event(&self, event_id: &EventId) -> Result<Event, FederationError> {
        Err(FederationError::NotFound(event_id.clone()))
    }

    async fn fetch_missing_events(
        &self,
        _conversation_id: &ConversationId,
        _have: &[EventId],
        _want: &[EventId],
        _limit: usize,
    ) -> Result<Vec<Event>, FederationError> {
        Ok(Vec::new())
    }

    fn verify_signature(&self, event: &Event) -> bool {
        self.keys.verify(event)
    }

    async fn send_event(&self, _event: &Event) -> Result<(), FederationError> {
        Ok(())
    }
}
