/// Event Intake Pipeline — one event (or batch) through
/// validate → auth-check → persist → extend extremities → resolve.
///
/// Per event:
///
/// ```text
/// Received → ParentsKnown? ──no──→ PendingBackfill ──(deps persisted)──┐
///               │yes                                                   │
///               ▼                                                      │
///           AuthValid? ──no──→ Rejected (persisted, excluded from state)
///               │yes ◄─────────────────────────────────────────────────┘
///               ▼
///           Persisted → ExtremitiesUpdated → StateResolved (if parents diverge)
/// ```
///
/// # Module structure
/// - `pipeline` — FederationEngine: the public engine surface
pub mod pipeline;

use std::collections::BTreeSet;
use thiserror::Error;

use crate::config::ConfigError;
use crate::events::ids::{ConversationId, EventId};
use crate::events::EventError;
use crate::state::{AuthFailure, ResolutionError};
use crate::store::StoreError;

pub use pipeline::FederationEngine;

/// What happened to a received event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// Accepted into the graph. `state_resolved` when its parents' states
    /// diverged and had to be merged.
    Persisted { state_resolved: bool },
    /// Persisted but failed auth against its parents' state.
    Rejected(AuthFailure),
    /// Held until `missing` are persisted.
    PendingBackfill { missing: BTreeSet<EventId> },
    /// Already persisted.
    Duplicate,
}

#[derive(Error, Debug)]
pub enum IntakeError {
    /// Never persisted.
    #[error("Malformed event: {0}")]
    Malformed(#[from] EventError),

    #[error("Dependency {dependency} of {event} belongs to another conversation")]
    ForeignDependency { event: EventId, dependency: EventId },

    #[error("Store failure: {0}")]
    Store(#[from] StoreError),

    #[error("State resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("No stored state for parent {0}")]
    MissingState(EventId),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl IntakeError {
    /// True for failures that are a property of the event itself.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            IntakeError::Malformed(_) | IntakeError::ForeignDependency { .. }
        )
    }
}

/// Why a locally submitted event was not created.
#[derive(Error, Debug)]
pub enum RejectReason {
    #[error("Not permitted: {0}")]
    Auth(AuthFailure),

    #[error("Conversation {0} has no events to build on")]
    UnknownConversation(ConversationId),

    #[error("Sender {sender} is not local to {server}")]
    ForeignSender { sender: String, server: String },

    #[error(transparent)]
    Intake(#[from] IntakeError),
}

impl From<EventError> for RejectReason {
    fn from(e: EventError) -> Self {
        RejectReason::Intake(IntakeError::Malformed(e))
    }
}

impl From<StoreError> for RejectReason {
    fn from(e: StoreError) -> Self {
        RejectReason::Intake(IntakeError::Store(e))
    }
}
