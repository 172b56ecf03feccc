/// Event envelope — the immutable, signed, content-addressed unit of history.
///
/// - Canonical form: compact JSON, fixed field order, object keys sorted
///   (serde_json's default `Map` is ordered)
/// - Content hash: SHA-256 over canonical form without `hashes`/`signatures`
/// - Signature: Ed25519 by the origin server over canonical form without
///   `signatures`
/// - Event id: BLAKE3 over the same bytes the signature covers
///
/// Any change to any field except `signatures` yields a different id.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::crypto::{self, ServerSigningKey};
use crate::events::ids::{ConversationId, EventId, ServerName, UserId};
use crate::events::limits::{check_event_limits, LimitViolation, MAX_EVENT_BYTES};
use crate::state::snapshot::StateSlot;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum EventError {
    #[error("JSON encoding failed: {0}")]
    Encode(String),

    #[error("JSON decoding failed: {0}")]
    Decode(String),

    #[error("Guardrail violated: {0}")]
    Limit(LimitViolation),

    #[error("Event id does not match content (claimed {claimed}, computed {computed})")]
    IdMismatch { claimed: EventId, computed: EventId },

    #[error("Content hash mismatch")]
    ContentHashMismatch,

    #[error("Sender {sender} does not belong to origin {origin}")]
    SenderOriginMismatch { sender: UserId, origin: ServerName },

    #[error("Missing signature from origin {0}")]
    MissingSignature(ServerName),

    #[error("Invalid signature from {0}")]
    InvalidSignature(ServerName),

    #[error("Content must be a JSON object")]
    ContentNotObject,

    #[error("Depth {claimed} does not follow from parents (expected {expected})")]
    DepthMismatch { claimed: u64, expected: u64 },
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EventHashes {
    /// Unpadded base64 SHA-256 of the canonical content-bearing form.
    pub sha256: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub event_id: EventId,
    pub conversation_id: ConversationId,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Present iff this event mutates conversation state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    pub sender: UserId,
    pub origin: ServerName,
    /// Milliseconds since Unix epoch, as claimed by the origin.
    pub origin_server_ts: u64,
    /// 1 for the creation event, otherwise max(parent depth) + 1.
    pub depth: u64,
    pub prev_events: Vec<EventId>,
    pub auth_events: Vec<EventId>,
    /// Application payload, opaque outside the auth-relevant event kinds.
    pub content: serde_json::Value,
    pub hashes: EventHashes,
    /// Base64 Ed25519 signatures keyed by server.
    #[serde(default)]
    pub signatures: BTreeMap<ServerName, String>,
}

/// Borrowed view used for every hash and signature.
#[derive(Serialize)]
struct Canonical<'a> {
    conversation_id: &'a ConversationId,
    #[serde(rename = "type")]
    event_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_key: Option<&'a str>,
    sender: &'a UserId,
    origin: &'a ServerName,
    origin_server_ts: u64,
    depth: u64,
    prev_events: &'a [EventId],
    auth_events: &'a [EventId],
    content: &'a serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    hashes: Option<&'a EventHashes>,
}

/// Fields a local author provides; the engine fills in the graph position.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PartialEvent {
    pub conversation_id: ConversationId,
    pub event_type: String,
    pub state_key: Option<String>,
    pub sender: UserId,
    pub content: serde_json::Value,
}

impl PartialEvent {
    pub fn new(
        conversation_id: ConversationId,
        event_type: &str,
        state_key: Option<&str>,
        sender: UserId,
        content: serde_json::Value,
    ) -> Self {
        PartialEvent {
            conversation_id,
            event_type: event_type.to_string(),
            state_key: state_key.map(str::to_string),
            sender,
            content,
        }
    }
}

impl Event {
    /// Create, hash and sign a new event.
    ///
    /// # Arguments
    /// * `partial` — author-supplied fields
    /// * `prev_events` — parents, normally the current forward extremities
    /// * `auth_events` — events justifying this one, chosen from the parents' state
    /// * `depth` — max(parent depth) + 1, or 1 for a creation event
    /// * `origin_server_ts` — milliseconds since Unix epoch
    /// * `key` — local server key; its server name becomes `origin`
    pub fn create_signed(
        partial: PartialEvent,
        prev_events: Vec<EventId>,
        auth_events: Vec<EventId>,
        depth: u64,
        origin_server_ts: u64,
        key: &ServerSigningKey,
    ) -> Result<Self, EventError> {
        if !partial.content.is_object() {
            return Err(EventError::ContentNotObject);
        }

        let mut event = Event {
            // Placeholder until the reference hash is known.
            event_id: EventId::from_reference_hash(&[0u8; 32]),
            conversation_id: partial.conversation_id,
            event_type: partial.event_type,
            state_key: partial.state_key,
            sender: partial.sender,
            origin: key.server_name().clone(),
            origin_server_ts,
            depth,
            prev_events,
            auth_events,
            content: partial.content,
            hashes: EventHashes {
                sha256: String::new(),
            },
            signatures: BTreeMap::new(),
        };

        let hash = crypto::content_hash(&event.canonical_bytes(false)?);
        event.hashes.sha256 = crypto::encode_b64(&hash);

        let signable = event.canonical_bytes(true)?;
        event.event_id = EventId::from_reference_hash(&crypto::reference_hash(&signable));
        event
            .signatures
            .insert(key.server_name().clone(), crypto::encode_b64(&key.sign(&signable)));

        event.check_structure()?;
        Ok(event)
    }

    /// Canonical bytes with or without the `hashes` field.
    fn canonical_bytes(&self, with_hashes: bool) -> Result<Vec<u8>, EventError> {
        let canonical = Canonical {
            conversation_id: &self.conversation_id,
            event_type: &self.event_type,
            state_key: self.state_key.as_deref(),
            sender: &self.sender,
            origin: &self.origin,
            origin_server_ts: self.origin_server_ts,
            depth: self.depth,
            prev_events: &self.prev_events,
            auth_events: &self.auth_events,
            content: &self.content,
            hashes: if with_hashes { Some(&self.hashes) } else { None },
        };
        serde_json::to_vec(&canonical).map_err(|e| EventError::Encode(e.to_string()))
    }

    /// The bytes covered by signatures and the reference hash.
    pub fn signable_bytes(&self) -> Result<Vec<u8>, EventError> {
        self.canonical_bytes(true)
    }

    /// Recompute the id this event's content implies.
    pub fn compute_event_id(&self) -> Result<EventId, EventError> {
        let signable = self.canonical_bytes(true)?;
        Ok(EventId::from_reference_hash(&crypto::reference_hash(&signable)))
    }

    /// Structural validation: limits, content hash, id, sender/origin.
    ///
    /// Anything failing here is malformed and must never be persisted.
    pub fn check_structure(&self) -> Result<(), EventError> {
        if !self.content.is_object() {
            return Err(EventError::ContentNotObject);
        }

        check_event_limits(
            self.prev_events.len(),
            self.auth_events.len(),
            self.depth,
            self.event_type.len(),
            self.state_key.as_ref().map_or(0, |k| k.len()),
        )
        .map_err(EventError::Limit)?;

        let signable = self.canonical_bytes(true)?;
        if signable.len() > MAX_EVENT_BYTES {
            return Err(EventError::Limit(LimitViolation::TooLarge {
                size: signable.len(),
            }));
        }

        let expected_hash = crypto::encode_b64(&crypto::content_hash(&self.canonical_bytes(false)?));
        if expected_hash != self.hashes.sha256 {
            return Err(EventError::ContentHashMismatch);
        }

        let computed = EventId::from_reference_hash(&crypto::reference_hash(&signable));
        if computed != self.event_id {
            return Err(EventError::IdMismatch {
                claimed: self.event_id.clone(),
                computed,
            });
        }

        if self.sender.server_name() != self.origin {
            return Err(EventError::SenderOriginMismatch {
                sender: self.sender.clone(),
                origin: self.origin.clone(),
            });
        }

        Ok(())
    }

    /// Verify the origin server's signature against `origin_key`.
    pub fn verify_origin_signature(&self, origin_key: &[u8; 32]) -> Result<(), EventError> {
        let sig_b64 = self
            .signatures
            .get(&self.origin)
            .ok_or_else(|| EventError::MissingSignature(self.origin.clone()))?;
        let sig = crypto::decode_b64(sig_b64)
            .map_err(|_| EventError::InvalidSignature(self.origin.clone()))?;
        let signable = self.signable_bytes()?;
        match crypto::verify_signature(&signable, &sig, origin_key) {
            Ok(true) => Ok(()),
            _ => Err(EventError::InvalidSignature(self.origin.clone())),
        }
    }

    /// The mutation slot this event sets, if it is a state event.
    pub fn state_slot(&self) -> Option<StateSlot> {
        self.state_key
            .as_ref()
            .map(|key| StateSlot::new(&self.event_type, key))
    }

    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// Decode a typed view of the content.
    pub fn content_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, EventError> {
        serde_json::from_value(self.content.clone()).map_err(|e| EventError::Decode(e.to_string()))
    }

    /// Serialize for storage / wire transfer.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(|e| EventError::Encode(e.to_string()))
    }

    /// Deserialize from storage / wire bytes. Does not validate.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EventError> {
        if bytes.len() > MAX_EVENT_BYTES * 2 {
            return Err(EventError::Limit(LimitViolation::TooLarge { size: bytes.len() }));
        }
        serde_json::from_slice(bytes).map_err(|e| EventError::Decode(e.to_string()))
    }
}

/// Current time in milliseconds since Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
