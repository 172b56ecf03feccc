/// Event model for the conversation graph.
///
/// Conversations are append-only DAGs of signed, immutable events. Every
/// event names its parents (`prev_events`) and the events that justify it
/// (`auth_events`), always by identifier, never by reference.
///
/// # Module structure
/// - `ids` — ServerName, UserId, ConversationId, EventId
/// - `event` — Event envelope, canonical form, hashing and signing
/// - `content` — typed content for auth-relevant kinds, AuthCategory
/// - `limits` — guardrail constants and limit checking
pub mod content;
pub mod event;
pub mod ids;
pub mod limits;

pub use content::{
    AuthCategory, CreateContent, JoinRule, JoinRulesContent, MemberContent, Membership,
    PowerLevelsContent,
};
pub use event::{now_ms, Event, EventError, EventHashes, PartialEvent};
pub use ids::{ConversationId, EventId, IdError, ServerName, UserId};
pub use limits::{check_event_limits, LimitViolation};
