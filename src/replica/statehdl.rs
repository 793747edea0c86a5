//! Causal delivery engine guarding a replica's state.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::core::{Address, State, Update, VectorClock};

/// Outcome of comparing an incoming update against the local clock.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Verdict {
    /// Every dependency satisfied; apply now.
    Accept,

    /// Some earlier update is missing; hold on to it.
    Defer,

    /// Already applied (or older); drop it.
    Discard,
}

/// A deferred update together with the epoch relation it arrived under.
#[derive(Debug, PartialEq, Eq, Clone)]
struct PendingUpdate {
    update: Update,
    same_epoch: bool,
}

/// Deferred updates indexed by origin identity, then by the origin's own
/// counter in the update's snapshot. Only the entry whose counter is exactly
/// one past the local counter of its origin can ever become ready, so a
/// cascade step inspects one slot per origin instead of every entry.
#[derive(Debug, Default)]
struct PendingQueue {
    by_origin: HashMap<String, BTreeMap<u64, Vec<PendingUpdate>>>,
    len: usize,
}

impl PendingQueue {
    /// Inserts a deferred update. Exact duplicates are held only once.
    fn push(&mut self, update: Update, same_epoch: bool) {
        let slot = self
            .by_origin
            .entry(update.origin().key())
            .or_default()
            .entry(update.origin_counter())
            .or_default();
        let pending = PendingUpdate { update, same_epoch };
        if !slot.contains(&pending) {
            slot.push(pending);
            self.len += 1;
        }
    }

    /// Drops entries of `origin` whose counter is not above `local`; they
    /// would be discarded anyway.
    fn purge_stale(&mut self, origin: &str, local: u64) {
        if let Some(slots) = self.by_origin.get_mut(origin) {
            let fresh = slots.split_off(&(local + 1));
            self.len -= slots.values().map(Vec::len).sum::<usize>();
            *slots = fresh;
            if slots.is_empty() {
                self.by_origin.remove(origin);
            }
        }
    }

    /// Removes and returns the first update that is ready against `state`.
    fn take_ready(&mut self, state: &State) -> Option<Update> {
        let origins: Vec<String> = self.by_origin.keys().cloned().collect();
        for origin in origins {
            let local = state.counter(&origin);
            self.purge_stale(&origin, local);

            let Some(slots) = self.by_origin.get_mut(&origin) else {
                continue;
            };
            let Some(cands) = slots.get_mut(&(local + 1)) else {
                continue;
            };
            let ready = cands.iter().position(|p| {
                vector_check(state, &p.update, p.same_epoch) == Verdict::Accept
            });
            if let Some(idx) = ready {
                let pending = cands.swap_remove(idx);
                self.len -= 1;
                if cands.is_empty() {
                    slots.remove(&(local + 1));
                    if slots.is_empty() {
                        self.by_origin.remove(&origin);
                    }
                }
                return Some(pending.update);
            }
        }
        None
    }
}

/// Decides whether `update` can be applied on top of `state`.
///
/// The origin's own entry must be exactly one past the local counter. Every
/// other entry is a causal dependency: when the writer shared our epoch, an
/// identity missing locally has already left and is fully incorporated; when
/// it did not, a missing identity is one we have not seen join yet and counts
/// as zero.
fn vector_check(state: &State, update: &Update, same_epoch: bool) -> Verdict {
    let origin = update.origin().key();
    let expected = state.counter(&origin) + 1;
    let incoming = update.origin_counter();
    if incoming < expected {
        return Verdict::Discard;
    } else if incoming > expected {
        return Verdict::Defer;
    }

    for (id, &cnt) in update.vclock() {
        if *id == origin {
            continue;
        }
        match state.vclock().get(id) {
            Some(&local) if local < cnt => return Verdict::Defer,
            None if !same_epoch && cnt > 0 => return Verdict::Defer,
            _ => {}
        }
    }
    Verdict::Accept
}

/// State plus pending queue, always accessed under one lock.
#[derive(Debug)]
struct StateInner {
    state: State,
    pending: PendingQueue,
}

impl StateInner {
    /// Applies an accepted update.
    fn apply(&mut self, update: &Update) {
        self.state.tick(&update.origin().key());
        self.state.write(update.key(), update.value());
    }

    /// Applies deferred updates until none is ready. Returns how many were
    /// applied.
    fn cascade(&mut self) -> usize {
        let mut applied = 0;
        while let Some(update) = self.pending.take_ready(&self.state) {
            self.apply(&update);
            applied += 1;
        }
        applied
    }
}

/// Owner of a replica's `State` and its pending-update queue. Every
/// operation runs under a single mutex, since the causal check reasons over
/// the whole clock at once.
#[derive(Debug)]
pub struct StateHandler {
    /// My replica identity.
    me: Address,

    /// The guarded state.
    inner: Mutex<StateInner>,
}

impl StateHandler {
    /// Creates a handler around `state`, making sure my own identity has a
    /// clock entry.
    pub fn new(me: Address, mut state: State) -> Self {
        state.add_key(&me.key());
        StateHandler {
            me,
            inner: Mutex::new(StateInner {
                state,
                pending: PendingQueue::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        // no critical section leaves the state half-updated on panic
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Gets the current value of `key`.
    pub fn read(&self, key: &str) -> Option<String> {
        self.lock().state.read(key).cloned()
    }

    /// Performs a local write: ticks my own clock entry, applies the write,
    /// and returns the update to propagate.
    pub fn client_write(&self, key: &str, value: &str) -> Update {
        let mut inner = self.lock();
        inner.state.tick(&self.me.key());
        inner.state.write(key, value);
        let update = Update::new(
            inner.state.vclock().clone(),
            self.me.clone(),
            key,
            value,
        );
        pf_trace!(self.me; "client write {:?}", update);
        update
    }

    /// Runs causal delivery on an update received from a peer. Returns
    /// `true` if it was applied right away.
    pub fn replica_write(&self, update: Update, same_epoch: bool) -> bool {
        let mut inner = self.lock();
        match vector_check(&inner.state, &update, same_epoch) {
            Verdict::Accept => {
                inner.apply(&update);
                let cascaded = inner.cascade();
                pf_trace!(self.me; "applied {:?} (+{} cascaded)",
                                   update, cascaded);
                true
            }
            Verdict::Defer => {
                pf_debug!(self.me; "deferred update {}#{} from {}",
                                   update.key(), update.origin_counter(),
                                   update.origin());
                inner.pending.push(update, same_epoch);
                false
            }
            Verdict::Discard => {
                pf_trace!(self.me; "discarded stale {:?}", update);
                false
            }
        }
    }

    /// Adds a clock entry for a newly joined replica.
    pub fn add_address_key(&self, addr: &Address) {
        let mut inner = self.lock();
        if inner.state.add_key(&addr.key()) {
            inner.cascade();
        }
    }

    /// Removes the clock entry of a departed replica. Deferred updates that
    /// were only waiting on it may become ready.
    pub fn remove_address_key(&self, addr: &Address) {
        let mut inner = self.lock();
        if inner.state.remove_key(&addr.key()) {
            let cascaded = inner.cascade();
            if cascaded > 0 {
                pf_debug!(self.me; "{} deferred updates applied after {} left",
                                   cascaded, addr);
            }
        }
    }

    /// Clones the whole state, e.g. for bootstrapping a joining replica.
    pub fn snapshot(&self) -> State {
        self.lock().state.clone()
    }

    /// Clones the current vector clock.
    pub fn vclock(&self) -> VectorClock {
        self.lock().state.vclock().clone()
    }

    /// Number of deferred updates.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len
    }
}
