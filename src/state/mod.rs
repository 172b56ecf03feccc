/// Conversation state: snapshots, authorization and resolution.
///
/// # Module structure
/// - `snapshot` — StateSlot, StateSnapshot
/// - `power` — power-level and membership lookups over an auth state
/// - `auth` — the Auth Rule Checker (pure)
/// - `resolution` — deterministic merge of divergent snapshots
use std::sync::Arc;

use crate::events::ids::EventId;
use crate::events::Event;

pub mod auth;
pub mod power;
pub mod resolution;
pub mod snapshot;

pub use auth::{auth_types_for_event, auth_types_of, check, AuthEvents, AuthFailure};
pub use resolution::{resolve, ResolutionError};
pub use snapshot::{StateDelta, StateSlot, StateSnapshot};

/// Read access to persisted events by id.
///
/// Implemented by the event store; resolution and auth only ever follow
/// edges through this lookup.
pub trait EventSource {
    fn event(&self, id: &EventId) -> Option<Arc<Event>>;

    fn is_rejected(&self, id: &EventId) -> bool;
}
