/// Auth Rule Checker — is an event permitted by a given state?
///
/// `check` is a pure function of the event and the auth state: no I/O, no
/// clock, no interior mutability. Evaluating the same inputs on any server,
/// in any order, gives the same answer. Rejection is a property of the exact
/// event id; a rejected event is kept but never contributes to state.
///
/// Dispatch is by `AuthCategory`, a closed enumeration.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;

use crate::events::content::{
    self, AuthCategory, JoinRule, JoinRulesContent, MemberContent, Membership, PowerLevelsContent,
};
use crate::events::ids::{EventId, UserId};
use crate::events::Event;
use crate::state::power::{creator_of, membership_of, PowerView};
use crate::state::snapshot::{StateSlot, StateSnapshot};
use crate::state::EventSource;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("Create event must not have parents")]
    CreateHasParents,

    #[error("Create event sender is not from the conversation's server")]
    CreateServerMismatch,

    #[error("Conversation already has a create event")]
    DuplicateCreate,

    #[error("No create event in auth state")]
    NoCreateEvent,

    #[error("Auth event {0} belongs to another conversation")]
    WrongConversation(EventId),

    #[error("Auth event {0} was rejected")]
    RejectedAuthEvent(EventId),

    #[error("Invalid state key for {0}")]
    InvalidStateKey(String),

    #[error("Invalid content: {0}")]
    InvalidContent(String),

    #[error("Sender {0} is not joined")]
    SenderNotJoined(UserId),

    #[error("Cannot join on behalf of another user")]
    JoinForOtherUser,

    #[error("{0} is banned")]
    Banned(UserId),

    #[error("{0} is not invited")]
    NotInvited(UserId),

    #[error("{0} is already joined")]
    AlreadyJoined(UserId),

    #[error("{0} is not a member")]
    NotAMember(UserId),

    #[error("Restricted join not authorised by a joined user with invite power")]
    RestrictedJoinNotAuthorised,

    #[error("Insufficient power: need {required}, have {actual}")]
    InsufficientPower { required: i64, actual: i64 },

    #[error("Target {target} has power {target_level} >= sender's {sender_level}")]
    TargetOutranksSender {
        target: UserId,
        target_level: i64,
        sender_level: i64,
    },

    #[error("State key {0} is owned by another user")]
    StateKeyOwnedByOtherUser(String),

    #[error("Power level change of '{key}' exceeds sender level {sender_level}")]
    PowerChangeExceedsSender { key: String, sender_level: i64 },

    #[error("Cannot change level of {0}, who is not below the sender")]
    CannotChangePeerLevel(UserId),
}

// ---------------------------------------------------------------------------
// AuthEvents
// ---------------------------------------------------------------------------

/// The state an event is checked against, resolved to full events.
#[derive(Clone, Debug, Default)]
pub struct AuthEvents {
    events: BTreeMap<StateSlot, Arc<Event>>,
}

impl AuthEvents {
    pub fn new() -> Self {
        AuthEvents::default()
    }

    /// Materialize the given slots of `snapshot`. Unknown or rejected events
    /// are skipped.
    pub fn from_snapshot<S: EventSource + ?Sized>(
        snapshot: &StateSnapshot,
        slots: &[StateSlot],
        source: &S,
    ) -> Self {
        let mut auth = AuthEvents::new();
        for slot in slots {
            if let Some(id) = snapshot.get(slot) {
                auth.insert_from_source(slot.clone(), id, source);
            }
        }
        auth
    }

    /// Materialize an event's declared auth events.
    pub fn from_declared<S: EventSource + ?Sized>(event: &Event, source: &S) -> Self {
        let mut auth = AuthEvents::new();
        for id in &event.auth_events {
            if source.is_rejected(id) {
                continue;
            }
            if let Some(ev) = source.event(id) {
                if let Some(slot) = ev.state_slot() {
                    auth.events.insert(slot, ev);
                }
            }
        }
        auth
    }

    fn insert_from_source<S: EventSource + ?Sized>(
        &mut self,
        slot: StateSlot,
        id: &EventId,
        source: &S,
    ) {
        if source.is_rejected(id) {
            return;
        }
        if let Some(ev) = source.event(id) {
            self.events.insert(slot, ev);
        }
    }

    /// Overlay the given slots of `snapshot` on top of these events.
    pub fn overlay_snapshot<S: EventSource + ?Sized>(
        &mut self,
        snapshot: &StateSnapshot,
        slots: &[StateSlot],
        source: &S,
    ) {
        for slot in slots {
            if let Some(id) = snapshot.get(slot) {
                self.insert_from_source(slot.clone(), id, source);
            }
        }
    }

    pub fn insert(&mut self, event: Arc<Event>) {
        if let Some(slot) = event.state_slot() {
            self.events.insert(slot, event);
        }
    }

    pub fn get(&self, event_type: &str, state_key: &str) -> Option<&Arc<Event>> {
        self.events.get(&StateSlot::new(event_type, state_key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Event>> {
        self.events.values()
    }

    /// Ids of these events in slot order, as a new event declares them.
    pub fn event_ids(&self) -> Vec<EventId> {
        self.events.values().map(|e| e.event_id.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Auth types
// ---------------------------------------------------------------------------

/// The state slots that can justify an event of this shape.
pub fn auth_types_for_event(
    event_type: &str,
    state_key: Option<&str>,
    sender: &UserId,
    event_content: &serde_json::Value,
) -> Vec<StateSlot> {
    if event_type == content::CREATE {
        return Vec::new();
    }

    let mut slots = BTreeSet::new();
    slots.insert(StateSlot::new(content::CREATE, ""));
    slots.insert(StateSlot::new(content::POWER_LEVELS, ""));
    slots.insert(StateSlot::new(content::MEMBER, sender.as_str()));

    if event_type == content::MEMBER {
        if let Some(target) = state_key {
            slots.insert(StateSlot::new(content::MEMBER, target));
        }
        if let Ok(member) = serde_json::from_value::<MemberContent>(event_content.clone()) {
            if matches!(member.membership, Membership::Join | Membership::Invite) {
                slots.insert(StateSlot::new(content::JOIN_RULES, ""));
            }
            if member.membership == Membership::Join {
                if let Some(via) = member.join_authorised_via_users_server {
                    slots.insert(StateSlot::new(content::MEMBER, via.as_str()));
                }
            }
        }
    }

    slots.into_iter().collect()
}

/// Auth types for an existing event.
pub fn auth_types_of(event: &Event) -> Vec<StateSlot> {
    auth_types_for_event(
        &event.event_type,
        event.state_key.as_deref(),
        &event.sender,
        &event.content,
    )
}

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

/// Evaluate the ordered rule set for `event` against `auth`.
pub fn check(event: &Event, auth: &AuthEvents) -> Result<(), AuthFailure> {
    let category = AuthCategory::of(&event.event_type);

    if category == AuthCategory::Create {
        return check_create(event, auth);
    }

    let create = auth
        .get(content::CREATE, "")
        .ok_or(AuthFailure::NoCreateEvent)?;

    for ev in auth.iter() {
        if ev.conversation_id != event.conversation_id {
            return Err(AuthFailure::WrongConversation(ev.event_id.clone()));
        }
    }

    let power = PowerView::from_auth(auth);

    if category == AuthCategory::Member {
        return check_member(event, auth, create, &power);
    }

    if membership_of(auth, &event.sender) != Membership::Join {
        return Err(AuthFailure::SenderNotJoined(event.sender.clone()));
    }

    let sender_level = power.user_level(&event.sender);
    let required = power
        .levels()
        .required_level(&event.event_type, event.is_state());
    if sender_level < required {
        return Err(AuthFailure::InsufficientPower {
            required,
            actual: sender_level,
        });
    }

    if let Some(state_key) = event.state_key.as_deref() {
        if state_key.starts_with('@') && state_key != event.sender.as_str() {
            return Err(AuthFailure::StateKeyOwnedByOtherUser(state_key.to_string()));
        }
    }

    match category {
        AuthCategory::PowerLevels => check_power_levels(event, &power, sender_level),
        AuthCategory::JoinRules => event
            .content_as::<JoinRulesContent>()
            .map(|_| ())
            .map_err(|e| AuthFailure::InvalidContent(e.to_string())),
        _ => Ok(()),
    }
}

fn check_create(event: &Event, auth: &AuthEvents) -> Result<(), AuthFailure> {
    if !event.prev_events.is_empty() {
        return Err(AuthFailure::CreateHasParents);
    }
    if event.state_key.as_deref() != Some("") {
        return Err(AuthFailure::InvalidStateKey(event.event_type.clone()));
    }
    if event.sender.server_name() != event.conversation_id.server_name() {
        return Err(AuthFailure::CreateServerMismatch);
    }
    if auth.get(content::CREATE, "").is_some() {
        return Err(AuthFailure::DuplicateCreate);
    }
    Ok(())
}

fn check_member(
    event: &Event,
    auth: &AuthEvents,
    create: &Event,
    power: &PowerView,
) -> Result<(), AuthFailure> {
    let target = event
        .state_key
        .as_deref()
        .and_then(|k| UserId::parse(k).ok())
        .ok_or_else(|| AuthFailure::InvalidStateKey(event.event_type.clone()))?;
    let member: MemberContent = event
        .content_as()
        .map_err(|e| AuthFailure::InvalidContent(e.to_string()))?;

    let sender = &event.sender;
    let sender_membership = membership_of(auth, sender);
    let target_membership = membership_of(auth, &target);
    let sender_level = power.user_level(sender);
    let target_level = power.user_level(&target);
    let levels = power.levels();

    match member.membership {
        Membership::Join => {
            if *sender != target {
                return Err(AuthFailure::JoinForOtherUser);
            }
            // The creator's own first join, straight after the create event.
            if event.prev_events.len() == 1
                && event.prev_events[0] == create.event_id
                && creator_of(create) == target
            {
                return Ok(());
            }
            if target_membership == Membership::Ban {
                return Err(AuthFailure::Banned(target));
            }
            let join_rule = auth
                .get(content::JOIN_RULES, "")
                .and_then(|ev| ev.content_as::<JoinRulesContent>().ok())
                .map(|c| c.join_rule)
                .unwrap_or_default();
            let already_in = matches!(target_membership, Membership::Join | Membership::Invite);
            match join_rule {
                JoinRule::Public => Ok(()),
                JoinRule::Invite if already_in => Ok(()),
                JoinRule::Invite => Err(AuthFailure::NotInvited(target)),
                JoinRule::Restricted if already_in => Ok(()),
                JoinRule::Restricted => {
                    let via = member
                        .join_authorised_via_users_server
                        .ok_or(AuthFailure::RestrictedJoinNotAuthorised)?;
                    if membership_of(auth, &via) == Membership::Join
                        && power.user_level(&via) >= levels.invite
                    {
                        Ok(())
                    } else {
                        Err(AuthFailure::RestrictedJoinNotAuthorised)
                    }
                }
            }
        }

        Membership::Invite => {
            if sender_membership != Membership::Join {
                return Err(AuthFailure::SenderNotJoined(sender.clone()));
            }
            match target_membership {
                Membership::Ban => return Err(AuthFailure::Banned(target)),
                Membership::Join => return Err(AuthFailure::AlreadyJoined(target)),
                _ => {}
            }
            if sender_level < levels.invite {
                return Err(AuthFailure::InsufficientPower {
                    required: levels.invite,
                    actual: sender_level,
                });
            }
            Ok(())
        }

        Membership::Leave if *sender == target => {
            if matches!(target_membership, Membership::Join | Membership::Invite) {
                Ok(())
            } else {
                Err(AuthFailure::NotAMember(target))
            }
        }

        // Kick, or unban when the target is banned.
        Membership::Leave => {
            if sender_membership != Membership::Join {
                return Err(AuthFailure::SenderNotJoined(sender.clone()));
            }
            let required = if target_membership == Membership::Ban {
                levels.ban
            } else {
                levels.kick
            };
            if sender_level < required {
                return Err(AuthFailure::InsufficientPower {
                    required,
                    actual: sender_level,
                });
            }
            if target_level >= sender_level {
                return Err(AuthFailure::TargetOutranksSender {
                    target,
                    target_level,
                    sender_level,
                });
            }
            Ok(())
        }

        Membership::Ban => {
            if sender_membership != Membership::Join {
                return Err(AuthFailure::SenderNotJoined(sender.clone()));
            }
            if sender_level < levels.ban {
                return Err(AuthFailure::InsufficientPower {
                    required: levels.ban,
                    actual: sender_level,
                });
            }
            if target_level >= sender_level {
                return Err(AuthFailure::TargetOutranksSender {
                    target,
                    target_level,
                    sender_level,
                });
            }
            Ok(())
        }
    }
}

fn check_power_levels(
    event: &Event,
    current: &PowerView,
    sender_level: i64,
) -> Result<(), AuthFailure> {
    let new: PowerLevelsContent = event
        .content_as()
        .map_err(|e| AuthFailure::InvalidContent(e.to_string()))?;

    // The first power-levels event is bounded only by the send level.
    if !current.is_explicit() {
        return Ok(());
    }
    let old = current.levels();

    let exceeds = |key: &str, before: Option<i64>, after: Option<i64>| {
        if before == after {
            return Ok(());
        }
        if before.map_or(false, |v| v > sender_level) || after.map_or(false, |v| v > sender_level)
        {
            return Err(AuthFailure::PowerChangeExceedsSender {
                key: key.to_string(),
                sender_level,
            });
        }
        Ok(())
    };

    for ((key, before), (_, after)) in old.thresholds().iter().zip(new.thresholds().iter()) {
        exceeds(key, Some(*before), Some(*after))?;
    }

    let event_keys: BTreeSet<&String> = old.events.keys().chain(new.events.keys()).collect();
    for key in event_keys {
        exceeds(
            key,
            old.events.get(key).copied(),
            new.events.get(key).copied(),
        )?;
    }

    let user_keys: BTreeSet<&UserId> = old.users.keys().chain(new.users.keys()).collect();
    for user in user_keys {
        let before = old.users.get(user).copied();
        let after = new.users.get(user).copied();
        if before == after {
            continue;
        }
        if user != &event.sender && before.map_or(false, |v| v >= sender_level) {
            return Err(AuthFailure::CannotChangePeerLevel(user.clone()));
        }
        exceeds(user.as_str(), before, after)?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
