/// Incremental reads over the persisted-event stream.
///
/// Every persisted event (accepted or rejected) gets a strictly increasing
/// stream ordering. A `StreamToken` marks a position; reading "since" a token
/// yields everything persisted after it, in order, and hands back a new token
/// to resume from.
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::events::Event;
use crate::store::{EventStore, StoreError};

/// Entries fetched per store read.
pub const DEFAULT_PAGE_SIZE: usize = 64;

/// Opaque resume marker: "everything up to and including ordering N".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamToken(u64);

impl StreamToken {
    /// Before the first event.
    pub const START: StreamToken = StreamToken(0);

    pub fn after(ordering: u64) -> Self {
        StreamToken(ordering)
    }

    pub fn ordering(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

impl FromStr for StreamToken {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix('s')
            .and_then(|n| n.parse::<u64>().ok())
            .map(StreamToken)
            .ok_or_else(|| StoreError::InvalidToken(s.to_string()))
    }
}

impl TryFrom<String> for StreamToken {
    type Error = StoreError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StreamToken> for String {
    fn from(token: StreamToken) -> Self {
        token.to_string()
    }
}

#[derive(Clone, Debug)]
pub struct StreamEntry {
    pub ordering: u64,
    pub event: Arc<Event>,
    pub rejected: bool,
}

impl StreamEntry {
    /// Token that resumes after this entry.
    pub fn token(&self) -> StreamToken {
        StreamToken(self.ordering)
    }
}

/// Lazy, paged iterator over events persisted after a token.
///
/// Bounded by the stream head at creation: events persisted while iterating
/// are picked up by the next call, via `token()`.
pub struct EventsSince<'a> {
    store: &'a EventStore,
    position: StreamToken,
    head: StreamToken,
    page: VecDeque<StreamEntry>,
    page_size: usize,
}

impl<'a> EventsSince<'a> {
    pub(crate) fn new(store: &'a EventStore, since: StreamToken, head: StreamToken) -> Self {
        EventsSince {
            store,
            position: since,
            head,
            page: VecDeque::new(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Where the next call should resume.
    pub fn token(&self) -> StreamToken {
        self.position
    }
}

impl<'a> Iterator for EventsSince<'a> {
    type Item = StreamEntry;

    fn next(&mut self) -> Option<StreamEntry> {
        if self.page.is_empty() {
            if self.position >= self.head {
                return None;
            }
            let remaining = (self.head.0 - self.position.0) as usize;
            match self
                .store
                .stream_page(self.position, self.page_size.min(remaining))
            {
                Ok(entries) => self.page.extend(entries),
                Err(e) => {
                    log::error!("Stream read after {} failed: {}", self.position, e);
                    return None;
                }
            }
        }

        let entry = self.page.pop_front()?;
        self.position = entry.token();
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_text_form() {
        let token = StreamToken::after(42);
        assert_eq!(token.to_string(), "s42");
        assert_eq!("s42".parse::<StreamToken>().unwrap(), token);
        assert!("42".parse::<StreamToken>().is_err());
        assert!("sx".parse::<StreamToken>().is_err());
        assert_eq!(serde_json::to_string(&token).unwrap(), "\"s42\"");
    }

    #[test]
    fn test_start_precedes_everything() {
        assert!(StreamToken::START < StreamToken::after(1));
        assert_eq!(StreamToken::default(), StreamToken::START);
    }
}
