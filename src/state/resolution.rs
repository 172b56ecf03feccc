/// State Resolution — merge divergent snapshots into one canonical state.
///
/// Algorithm:
/// 1. Partition slots into unconflicted (all inputs agree) and conflicted.
/// 2. Extend the conflicted events with the auth difference (events in the
///    auth chain of some inputs but not all), dropping unknown or rejected ones.
/// 3. Phase a: power events and their conflicted auth ancestors, ordered
///    topologically along auth edges, ties by (depth, origin_server_ts,
///    event_id).
///    Each is auth-checked against the evolving working state.
/// 4. Phase b: every other conflicted event, ordered by
///    (mainline position, depth, origin_server_ts, event_id) against the
///    power-levels mainline chosen in phase a, auth-checked the same way.
/// 5. Unconflicted slots are re-applied on top.
///
/// Every collection iterated here is ordered, so two servers given the same
/// events produce byte-identical output regardless of arrival order.
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;

use crate::events::content;
use crate::events::ids::EventId;
use crate::events::Event;
use crate::state::auth::{self, auth_types_of, AuthEvents};
use crate::state::power::is_power_event;
use crate::state::snapshot::{StateSlot, StateSnapshot};
use crate::state::EventSource;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("No state snapshots to resolve")]
    NoSnapshots,

    #[error("Auth edges form a cycle among {0} events")]
    AuthCycle(usize),
}

// ---------------------------------------------------------------------------
// Auth chains
// ---------------------------------------------------------------------------

/// Transitive closure of auth-event references, excluding the start ids
/// unless one is an auth ancestor of another.
///
/// Unknown ids are skipped: the chain covers what is held locally.
pub fn auth_chain<'a, S, I>(ids: I, source: &S) -> BTreeSet<EventId>
where
    S: EventSource + ?Sized,
    I: IntoIterator<Item = &'a EventId>,
{
    let mut chain = BTreeSet::new();
    let mut queue: VecDeque<EventId> = VecDeque::new();

    for id in ids {
        if let Some(ev) = source.event(id) {
            queue.extend(ev.auth_events.iter().cloned());
        }
    }

    while let Some(id) = queue.pop_front() {
        if !chain.insert(id.clone()) {
            continue;
        }
        if let Some(ev) = source.event(&id) {
            for parent in &ev.auth_events {
                if !chain.contains(parent) {
                    queue.push_back(parent.clone());
                }
            }
        }
    }

    chain
}

/// Events in some but not all of the snapshots' full auth chains (each
/// snapshot's own events included).
fn auth_difference<S: EventSource + ?Sized>(
    snapshots: &[&StateSnapshot],
    source: &S,
) -> BTreeSet<EventId> {
    let chains: Vec<BTreeSet<EventId>> = snapshots
        .iter()
        .map(|snapshot| {
            let mut chain = auth_chain(snapshot.event_ids(), source);
            chain.extend(snapshot.event_ids().cloned());
            chain
        })
        .collect();

    let union: BTreeSet<EventId> = chains.iter().flatten().cloned().collect();
    union
        .into_iter()
        .filter(|id| !chains.iter().all(|chain| chain.contains(id)))
        .collect()
}

// ---------------------------------------------------------------------------
// resolve
// ---------------------------------------------------------------------------

/// Split slots into the agreed snapshot and the set of contested event ids.
fn partition(snapshots: &[&StateSnapshot]) -> (StateSnapshot, BTreeSet<EventId>) {
    let slots: BTreeSet<&StateSlot> = snapshots.iter().flat_map(|s| s.iter().map(|(k, _)| k)).collect();

    let mut unconflicted = StateSnapshot::new();
    let mut conflicted = BTreeSet::new();

    for slot in slots {
        let values: Vec<Option<&EventId>> = snapshots.iter().map(|s| s.get(slot)).collect();
        let first = values[0];
        if first.is_some() && values.iter().all(|v| *v == first) {
            if let Some(id) = first {
                unconflicted.insert(slot.clone(), id.clone());
            }
        } else {
            conflicted.extend(values.into_iter().flatten().cloned());
        }
    }

    (unconflicted, conflicted)
}

/// Resolve two or more snapshots into one.
pub fn resolve<S: EventSource + ?Sized>(
    snapshots: &[&StateSnapshot],
    source: &S,
) -> Result<StateSnapshot, ResolutionError> {
    match snapshots {
        [] => return Err(ResolutionError::NoSnapshots),
        [only] => return Ok((*only).clone()),
        _ => {}
    }

    let (unconflicted, conflicted) = partition(snapshots);
    if conflicted.is_empty() {
        return Ok(unconflicted);
    }

    let mut full: BTreeMap<EventId, Arc<Event>> = BTreeMap::new();
    for id in conflicted.iter().chain(auth_difference(snapshots, source).iter()) {
        if source.is_rejected(id) {
            continue;
        }
        if let Some(ev) = source.event(id) {
            full.insert(id.clone(), ev);
        }
    }

    log::debug!(
        "Resolving {} snapshots: {} unconflicted slots, {} conflicted events",
        snapshots.len(),
        unconflicted.len(),
        full.len()
    );

    // Phase a: power events and their conflicted auth ancestors.
    let mut power_set: BTreeSet<EventId> = full
        .values()
        .filter(|ev| is_power_event(ev))
        .map(|ev| ev.event_id.clone())
        .collect();
    let mut frontier: Vec<EventId> = power_set.iter().cloned().collect();
    while let Some(id) = frontier.pop() {
        if let Some(ev) = full.get(&id) {
            for parent in &ev.auth_events {
                if full.contains_key(parent) && power_set.insert(parent.clone()) {
                    frontier.push(parent.clone());
                }
            }
        }
    }

    let power_order = topological_auth_order(&power_set, &full)?;
    let mut working = unconflicted.clone();
    iterative_auth_checks(&power_order, &mut working, source);

    // Phase b: everything else, by mainline position.
    let mainline = build_mainline(working.lookup(content::POWER_LEVELS, ""), source);
    let mut rest: Vec<(u64, Arc<Event>)> = full
        .iter()
        .filter(|(id, _)| !power_set.contains(*id))
        .map(|(_, ev)| (mainline_position(ev, &mainline, source), ev.clone()))
        .collect();
    rest.sort_by(|(pos_a, a), (pos_b, b)| {
        (*pos_a, a.depth, a.origin_server_ts, &a.event_id).cmp(&(
            *pos_b,
            b.depth,
            b.origin_server_ts,
            &b.event_id,
        ))
    });
    let rest_order: Vec<Arc<Event>> = rest.into_iter().map(|(_, ev)| ev).collect();
    iterative_auth_checks(&rest_order, &mut working, source);

    for (slot, id) in &unconflicted {
        working.insert(slot.clone(), id.clone());
    }

    Ok(working)
}

/// Kahn's algorithm over auth edges inside `set`; ready events are taken in
/// (depth, origin_server_ts, event_id) order.
fn topological_auth_order(
    set: &BTreeSet<EventId>,
    events: &BTreeMap<EventId, Arc<Event>>,
) -> Result<Vec<Arc<Event>>, ResolutionError> {
    let mut indegree: BTreeMap<&EventId, usize> = BTreeMap::new();
    let mut children: BTreeMap<&EventId, Vec<&EventId>> = BTreeMap::new();

    for id in set {
        let Some(ev) = events.get(id) else {
            continue;
        };
        let parents: BTreeSet<&EventId> = ev.auth_events.iter().filter(|p| set.contains(*p)).collect();
        indegree.insert(id, parents.len());
        for parent in parents {
            children.entry(parent).or_default().push(id);
        }
    }

    let mut ready: BTreeSet<(u64, u64, &EventId)> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .filter_map(|(id, _)| {
            events
                .get(*id)
                .map(|ev| (ev.depth, ev.origin_server_ts, *id))
        })
        .collect();

    let mut order = Vec::with_capacity(indegree.len());
    while let Some(next) = ready.pop_first() {
        let (_, _, id) = next;
        if let Some(ev) = events.get(id) {
            order.push(ev.clone());
        }
        for child in children.get(id).into_iter().flatten() {
            if let Some(d) = indegree.get_mut(*child) {
                *d -= 1;
                if *d == 0 {
                    if let Some(ev) = events.get(*child) {
                        ready.insert((ev.depth, ev.origin_server_ts, *child));
                    }
                }
            }
        }
    }

    if order.len() != indegree.len() {
        return Err(ResolutionError::AuthCycle(indegree.len() - order.len()));
    }
    Ok(order)
}

/// Apply each event to `working` if it passes auth against its own auth
/// events overlaid with `working`. Failures are dropped.
fn iterative_auth_checks<S: EventSource + ?Sized>(
    events: &[Arc<Event>],
    working: &mut StateSnapshot,
    source: &S,
) {
    for event in events {
        let Some(slot) = event.state_slot() else {
            continue;
        };
        let mut slots = auth_types_of(event);
        if event.event_type == content::CREATE {
            // A later create must see the one already applied.
            slots.push(StateSlot::new(content::CREATE, ""));
        }
        let mut auth_state = AuthEvents::from_declared(event, source);
        auth_state.overlay_snapshot(working, &slots, source);

        match auth::check(event, &auth_state) {
            Ok(()) => {
                working.insert(slot, event.event_id.clone());
            }
            Err(failure) => {
                log::debug!(
                    "Resolution dropped {} ({}): {}",
                    event.event_id,
                    event.event_type,
                    failure
                );
            }
        }
    }
}

/// The power-levels event among an event's auth events.
fn power_levels_parent<S: EventSource + ?Sized>(event: &Event, source: &S) -> Option<Arc<Event>> {
    event
        .auth_events
        .iter()
        .filter_map(|id| source.event(id))
        .find(|ev| ev.event_type == content::POWER_LEVELS && ev.state_key.as_deref() == Some(""))
}

/// Mainline positions, oldest power-levels event = 1.
fn build_mainline<S: EventSource + ?Sized>(
    resolved_power_levels: Option<&EventId>,
    source: &S,
) -> BTreeMap<EventId, u64> {
    let mut chain = Vec::new();
    let mut seen = BTreeSet::new();
    let mut current = resolved_power_levels.and_then(|id| source.event(id));

    while let Some(ev) = current {
        if !seen.insert(ev.event_id.clone()) {
            break;
        }
        chain.push(ev.event_id.clone());
        current = power_levels_parent(&ev, source);
    }

    chain
        .into_iter()
        .rev()
        .enumerate()
        .map(|(i, id)| (id, i as u64 + 1))
        .collect()
}

/// Position of the nearest mainline event reachable through power-levels
/// auth edges; 0 when there is none.
fn mainline_position<S: EventSource + ?Sized>(
    event: &Arc<Event>,
    mainline: &BTreeMap<EventId, u64>,
    source: &S,
) -> u64 {
    let mut seen = BTreeSet::new();
    let mut current = Some(event.clone());

    while let Some(ev) = current {
        if let Some(pos) = mainline.get(&ev.event_id) {
            return *pos;
        }
        if !seen.insert(ev.event_id.clone()) {
            break;
        }
        current = power_levels_parent(&ev, source);
    }
    0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
