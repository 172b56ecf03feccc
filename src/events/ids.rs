/// Identifier types for the event graph.
///
/// - `ServerName`: a federating server, e.g. `a.example`
/// - `UserId`: `@local:server`
/// - `ConversationId`: `!opaque:server`
/// - `EventId`: `$` + base64url(BLAKE3(canonical event)), content-addressed
///
/// All identifiers are plain strings on the wire and order lexicographically,
/// which is the tie-break order state resolution relies on.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("Identifier is empty")]
    Empty,

    #[error("Identifier must start with '{expected}': {value}")]
    BadSigil { expected: char, value: String },

    #[error("Identifier has no server part: {0}")]
    MissingServer(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    #[error("Identifier too long ({len} > {max})")]
    TooLong { len: usize, max: usize },
}

/// Max identifier length in bytes.
pub const MAX_ID_LEN: usize = 255;

fn valid_server_name(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_ID_LEN
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'))
}

/// Split `{sigil}{local}:{server}` and validate each part.
fn split_sigiled(value: &str, sigil: char) -> Result<(&str, &str), IdError> {
    if value.is_empty() {
        return Err(IdError::Empty);
    }
    if value.len() > MAX_ID_LEN {
        return Err(IdError::TooLong {
            len: value.len(),
            max: MAX_ID_LEN,
        });
    }
    let rest = value.strip_prefix(sigil).ok_or_else(|| IdError::BadSigil {
        expected: sigil,
        value: value.to_string(),
    })?;
    let (local, server) = rest
        .split_once(':')
        .ok_or_else(|| IdError::MissingServer(value.to_string()))?;
    if local.is_empty() {
        return Err(IdError::Empty);
    }
    if !valid_server_name(server) {
        return Err(IdError::InvalidServerName(server.to_string()));
    }
    Ok((local, server))
}

// ---------------------------------------------------------------------------
// ServerName
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerName(String);

impl ServerName {
    pub fn new(name: &str) -> Result<Self, IdError> {
        if !valid_server_name(name) {
            return Err(IdError::InvalidServerName(name.to_string()));
        }
        Ok(ServerName(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ServerName {
    type Error = IdError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        ServerName::new(&value)
    }
}

impl From<ServerName> for String {
    fn from(value: ServerName) -> Self {
        value.0
    }
}

impl fmt::Debug for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerName({})", self.0)
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// UserId
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub fn parse(value: &str) -> Result<Self, IdError> {
        split_sigiled(value, '@')?;
        Ok(UserId(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The server this user belongs to.
    pub fn server_name(&self) -> ServerName {
        // Validated at construction.
        let server = self.0.split_once(':').map(|(_, s)| s).unwrap_or_default();
        ServerName(server.to_string())
    }
}

impl TryFrom<String> for UserId {
    type Error = IdError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        UserId::parse(&value)
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.0
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// ConversationId
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConversationId(String);

impl ConversationId {
    pub fn parse(value: &str) -> Result<Self, IdError> {
        split_sigiled(value, '!')?;
        Ok(ConversationId(value.to_string()))
    }

    /// New random conversation id hosted on `server`.
    pub fn generate(server: &ServerName) -> Self {
        let opaque = uuid::Uuid::new_v4().simple().to_string();
        ConversationId(format!("!{}:{}", opaque, server))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The server that created the conversation.
    pub fn server_name(&self) -> ServerName {
        let server = self.0.split_once(':').map(|(_, s)| s).unwrap_or_default();
        ServerName(server.to_string())
    }
}

impl TryFrom<String> for ConversationId {
    type Error = IdError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        ConversationId::parse(&value)
    }
}

impl From<ConversationId> for String {
    fn from(value: ConversationId) -> Self {
        value.0
    }
}

impl fmt::Debug for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConversationId({})", self.0)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// EventId
// ---------------------------------------------------------------------------

/// Content-addressed event identifier.
///
/// Derived from the reference hash, never chosen by a sender. Ordering is
/// plain byte-wise string order.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventId(String);

impl EventId {
    pub fn from_reference_hash(hash: &[u8; 32]) -> Self {
        EventId(format!("${}", crate::crypto::encode_b64(hash)))
    }

    pub fn parse(value: &str) -> Result<Self, IdError> {
        if value.is_empty() {
            return Err(IdError::Empty);
        }
        if value.len() > MAX_ID_LEN {
            return Err(IdError::TooLong {
                len: value.len(),
                max: MAX_ID_LEN,
            });
        }
        if !value.starts_with('$') || value.len() == 1 {
            return Err(IdError::BadSigil {
                expected: '$',
                value: value.to_string(),
            });
        }
        Ok(EventId(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EventId {
    type Error = IdError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        EventId::parse(&value)
    }
}

impl From<EventId> for String {
    fn from(value: EventId) -> Self {
        value.0
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short: String = self.0.chars().take(12).collect();
        write!(f, "EventId({}..)", short)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
