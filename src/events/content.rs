/// Typed content for the event kinds authorization depends on.
///
/// Everything else is opaque JSON. Authorization dispatch is a closed
/// enumeration (`AuthCategory`): new categories are added here, not
/// registered at runtime.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::events::ids::UserId;

pub const CREATE: &str = "m.room.create";
pub const MEMBER: &str = "m.room.member";
pub const POWER_LEVELS: &str = "m.room.power_levels";
pub const JOIN_RULES: &str = "m.room.join_rules";
pub const TOPIC: &str = "m.room.topic";
pub const NAME: &str = "m.room.name";
pub const MESSAGE: &str = "m.room.message";

// ---------------------------------------------------------------------------
// AuthCategory
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuthCategory {
    Create,
    Member,
    PowerLevels,
    JoinRules,
    Other,
}

impl AuthCategory {
    pub fn of(event_type: &str) -> Self {
        match event_type {
            CREATE => AuthCategory::Create,
            MEMBER => AuthCategory::Member,
            POWER_LEVELS => AuthCategory::PowerLevels,
            JOIN_RULES => AuthCategory::JoinRules,
            _ => AuthCategory::Other,
        }
    }
}

// ---------------------------------------------------------------------------
// Membership / JoinRule
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Join,
    Invite,
    Leave,
    Ban,
}

impl Membership {
    pub fn as_str(&self) -> &'static str {
        match self {
            Membership::Join => "join",
            Membership::Invite => "invite",
            Membership::Leave => "leave",
            Membership::Ban => "ban",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum JoinRule {
    Public,
    #[default]
    Invite,
    Restricted,
}

// ---------------------------------------------------------------------------
// Content payloads
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct CreateContent {
    /// Defaults to the create event's sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<UserId>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MemberContent {
    pub membership: Membership,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayname: Option<String>,
    /// For restricted joins: the joined user vouching for this join.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_authorised_via_users_server: Option<UserId>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct JoinRulesContent {
    pub join_rule: JoinRule,
}

fn default_users_default() -> i64 {
    0
}
fn default_events_default() -> i64 {
    0
}
fn default_state_default() -> i64 {
    50
}
fn default_moderation() -> i64 {
    50
}
fn default_invite() -> i64 {
    0
}

/// Numeric permission thresholds. Missing fields take the protocol defaults.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PowerLevelsContent {
    #[serde(default)]
    pub users: BTreeMap<UserId, i64>,
    #[serde(default = "default_users_default")]
    pub users_default: i64,
    #[serde(default)]
    pub events: BTreeMap<String, i64>,
    #[serde(default = "default_events_default")]
    pub events_default: i64,
    #[serde(default = "default_state_default")]
    pub state_default: i64,
    #[serde(default = "default_moderation")]
    pub ban: i64,
    #[serde(default = "default_moderation")]
    pub kick: i64,
    #[serde(default = "default_invite")]
    pub invite: i64,
    #[serde(default = "default_moderation")]
    pub redact: i64,
}

impl Default for PowerLevelsContent {
    fn default() -> Self {
        PowerLevelsContent {
            users: BTreeMap::new(),
            users_default: default_users_default(),
            events: BTreeMap::new(),
            events_default: default_events_default(),
            state_default: default_state_default(),
            ban: default_moderation(),
            kick: default_moderation(),
            invite: default_invite(),
            redact: default_moderation(),
        }
    }
}

impl PowerLevelsContent {
    pub fn with_user(mut self, user: &UserId, level: i64) -> Self {
        self.users.insert(user.clone(), level);
        self
    }

    pub fn user_level(&self, user: &UserId) -> i64 {
        self.users.get(user).copied().unwrap_or(self.users_default)
    }

    /// Level needed to send `event_type` (as state when `is_state`).
    pub fn required_level(&self, event_type: &str, is_state: bool) -> i64 {
        match self.events.get(event_type) {
            Some(level) => *level,
            None if is_state => self.state_default,
            None => self.events_default,
        }
    }

    /// The top-level thresholds, by name, for change comparison.
    pub fn thresholds(&self) -> [(&'static str, i64); 7] {
        [
            ("users_default", self.users_default),
            ("events_default", self.events_default),
            ("state_default", self.state_default),
            ("ban", self.ban),
            ("kick", self.kick),
            ("invite", self.invite),
            ("redact", self.redact),
        ]
    }

    pub fn to_value(&self) -> serde_json::Value {
        // A struct of maps and integers always serializes.
        serde_json::to_value(self).unwrap_or_default()
    }
}
