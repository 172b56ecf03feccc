/// Power-level and membership lookups over an auth state.
///
/// A conversation without a power-levels event gives its creator 100 and
/// everyone else `users_default` (0), with every other threshold at its
/// protocol default.
use crate::events::content::{self, CreateContent, MemberContent, Membership, PowerLevelsContent};
use crate::events::ids::UserId;
use crate::events::Event;
use crate::state::auth::AuthEvents;

/// Level the creator holds before any power-levels event exists.
pub const CREATOR_DEFAULT_LEVEL: i64 = 100;

pub struct PowerView {
    levels: PowerLevelsContent,
    /// False when derived from the creator fallback.
    explicit: bool,
}

impl PowerView {
    /// Derive from the power-levels and create events in `auth`.
    ///
    /// An unparsable power-levels content falls back to defaults; the event
    /// carrying it could only have been accepted if it parsed.
    pub fn from_auth(auth: &AuthEvents) -> Self {
        if let Some(pl) = auth.get(content::POWER_LEVELS, "") {
            if let Ok(levels) = pl.content_as::<PowerLevelsContent>() {
                return PowerView {
                    levels,
                    explicit: true,
                };
            }
        }

        let mut levels = PowerLevelsContent::default();
        if let Some(create) = auth.get(content::CREATE, "") {
            levels
                .users
                .insert(creator_of(create), CREATOR_DEFAULT_LEVEL);
        }
        PowerView {
            levels,
            explicit: false,
        }
    }

    pub fn levels(&self) -> &PowerLevelsContent {
        &self.levels
    }

    pub fn is_explicit(&self) -> bool {
        self.explicit
    }

    pub fn user_level(&self, user: &UserId) -> i64 {
        self.levels.user_level(user)
    }
}

/// The creator named in a create event, defaulting to its sender.
pub fn creator_of(create: &Event) -> UserId {
    create
        .content_as::<CreateContent>()
        .ok()
        .and_then(|c| c.creator)
        .unwrap_or_else(|| create.sender.clone())
}

/// Membership of `user` in `auth`; absent means `leave`.
pub fn membership_of(auth: &AuthEvents, user: &UserId) -> Membership {
    auth.get(content::MEMBER, user.as_str())
        .and_then(|ev| ev.content_as::<MemberContent>().ok())
        .map(|c| c.membership)
        .unwrap_or(Membership::Leave)
}

/// Whether a member event removes someone else (kick or ban).
pub fn is_kick_or_ban(event: &Event) -> bool {
    if event.event_type != content::MEMBER {
        return false;
    }
    let Some(target) = event.state_key.as_deref() else {
        return false;
    };
    if target == event.sender.as_str() {
        return false;
    }
    matches!(
        event.content_as::<MemberContent>().map(|c| c.membership),
        Ok(Membership::Leave) | Ok(Membership::Ban)
    )
}

/// Power-determining events are ordered and applied first during resolution.
pub fn is_power_event(event: &Event) -> bool {
    if !event.is_state() {
        return false;
    }
    match event.event_type.as_str() {
        content::CREATE | content::POWER_LEVELS | content::JOIN_RULES => {
            event.state_key.as_deref() == Some("")
        }
        content::MEMBER => is_kick_or_ban(event),
        _ => false,
    }
}
