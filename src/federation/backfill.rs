/// Backfill — fetching missing history with bounded retries.
///
/// A request names the ids a conversation is waiting on. Each attempt asks
/// the peer for the missing range, then individually for whatever the range
/// did not cover, all under one per-attempt timeout. Failed attempts back off
/// exponentially. Cancelling the conversation's token aborts at once, even
/// mid-attempt or mid-backoff.
use std::collections::BTreeSet;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::BackfillConfig;
use crate::events::ids::{ConversationId, EventId};
use crate::events::Event;
use crate::federation::FederationClient;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackfillError {
    #[error("Backfill for {conversation_id} timed out after {attempts} attempts")]
    Timeout {
        conversation_id: ConversationId,
        attempts: u32,
    },

    #[error("Backfill for {0} cancelled")]
    Cancelled(ConversationId),
}

#[derive(Clone, Debug)]
pub struct BackfillRequest {
    pub conversation_id: ConversationId,
    /// Ids to fetch.
    pub want: BTreeSet<EventId>,
    /// Current forward extremities, so the peer can stop early.
    pub have: Vec<EventId>,
    pub cancel: CancellationToken,
}

/// One attempt: range fetch, then point fetches for the gaps.
async fn attempt<F: FederationClient + ?Sized>(
    client: &F,
    request: &BackfillRequest,
    limit: usize,
) -> Vec<Event> {
    let want: Vec<EventId> = request.want.iter().cloned().collect();
    let mut events = match client
        .fetch_missing_events(&request.conversation_id, &request.have, &want, limit)
        .await
    {
        Ok(events) => events,
        Err(e) => {
            log::debug!(
                "fetch_missing_events for {} failed: {}",
                request.conversation_id,
                e
            );
            Vec::new()
        }
    };

    let got: BTreeSet<EventId> = events.iter().map(|e| e.event_id.clone()).collect();
    for id in request.want.iter().filter(|id| !got.contains(*id)) {
        match client.fetch_event(id).await {
            Ok(event) => events.push(event),
            Err(e) => log::debug!("fetch_event {} failed: {}", id, e),
        }
    }

    events.retain(|e| e.conversation_id == request.conversation_id);
    events
}

/// Fetch the requested history, retrying per `config`.
///
/// Returns events sorted by (depth, event_id), deduplicated, at most
/// `batch_limit` plus the explicitly wanted ids.
pub async fn fetch_with_retry<F: FederationClient + ?Sized>(
    client: &F,
    request: &BackfillRequest,
    config: &BackfillConfig,
) -> Result<Vec<Event>, BackfillError> {
    let cancelled = || BackfillError::Cancelled(request.conversation_id.clone());

    for attempt_no in 1..=config.max_attempts {
        if request.cancel.is_cancelled() {
            return Err(cancelled());
        }

        log::debug!(
            "Backfill attempt {}/{} for {}: {} wanted",
            attempt_no,
            config.max_attempts,
            request.conversation_id,
            request.want.len()
        );

        let result = tokio::select! {
            _ = request.cancel.cancelled() => return Err(cancelled()),
            r = tokio::time::timeout(
                config.attempt_timeout(),
                attempt(client, request, config.batch_limit),
            ) => r,
        };

        match result {
            Ok(mut events) if !events.is_empty() => {
                events.sort_by(|a, b| (a.depth, &a.event_id).cmp(&(b.depth, &b.event_id)));
                events.dedup_by(|a, b| a.event_id == b.event_id);
                return Ok(events);
            }
            Ok(_) => log::warn!(
                "Backfill attempt {} for {} returned nothing",
                attempt_no,
                request.conversation_id
            ),
            Err(_) => log::warn!(
                "Backfill attempt {} for {} timed out after {:?}",
                attempt_no,
                request.conversation_id,
                config.attempt_timeout()
            ),
        }

        if attempt_no < config.max_attempts {
            tokio::select! {
                _ = request.cancel.cancelled() => return Err(cancelled()),
                _ = tokio::time::sleep(config.backoff(attempt_no)) => {}
            }
        }
    }

    Err(BackfillError::Timeout {
        conversation_id: request.conversation_id.clone(),
        attempts: config.max_attempts,
    })
}
