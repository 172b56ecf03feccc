/// Event guardrails — enforced on every received or originated event.
///
/// These constants bound per-event size, fan-in, and graph depth so a single
/// peer cannot make validation or state resolution unbounded.

/// Max canonical event size in bytes.
pub const MAX_EVENT_BYTES: usize = 64 * 1024; // 64 KB

/// Max parents ("prev events") an event may declare.
pub const MAX_PREV_EVENTS: usize = 20;

/// Max auth events an event may declare.
pub const MAX_AUTH_EVENTS: usize = 10;

/// Max event depth.
pub const MAX_DEPTH: u64 = (1 << 53) - 1;

/// Max length of an event type or state key.
pub const MAX_TYPE_LEN: usize = 255;

/// Max forward extremities handed to a locally originated event.
pub const MAX_LOCAL_PARENTS: usize = 10;

/// Max events requested per backfill round.
pub const MAX_BACKFILL_BATCH: usize = 100;

/// Result of checking an event against the guardrails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitViolation {
    TooLarge { size: usize },
    TooManyPrevEvents { count: usize },
    TooManyAuthEvents { count: usize },
    DepthOutOfRange { depth: u64 },
    FieldTooLong { len: usize },
}

impl std::fmt::Display for LimitViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitViolation::TooLarge { size } => {
                write!(f, "event is {} bytes (max {})", size, MAX_EVENT_BYTES)
            }
            LimitViolation::TooManyPrevEvents { count } => {
                write!(f, "{} prev events (max {})", count, MAX_PREV_EVENTS)
            }
            LimitViolation::TooManyAuthEvents { count } => {
                write!(f, "{} auth events (max {})", count, MAX_AUTH_EVENTS)
            }
            LimitViolation::DepthOutOfRange { depth } => {
                write!(f, "depth {} out of range", depth)
            }
            LimitViolation::FieldTooLong { len } => {
                write!(f, "type/state key of {} bytes (max {})", len, MAX_TYPE_LEN)
            }
        }
    }
}

/// Check the shape-level limits. Size is checked separately on the
/// canonical bytes.
pub fn check_event_limits(
    prev_count: usize,
    auth_count: usize,
    depth: u64,
    type_len: usize,
    state_key_len: usize,
) -> Result<(), LimitViolation> {
    if prev_count > MAX_PREV_EVENTS {
        return Err(LimitViolation::TooManyPrevEvents { count: prev_count });
    }
    if auth_count > MAX_AUTH_EVENTS {
        return Err(LimitViolation::TooManyAuthEvents { count: auth_count });
    }
    if depth == 0 || depth > MAX_DEPTH {
        return Err(LimitViolation::DepthOutOfRange { depth });
    }
    let longest = type_len.max(state_key_len);
    if longest > MAX_TYPE_LEN {
        return Err(LimitViolation::FieldTooLong { len: longest });
    }
    Ok(())
}
