//! Membership epoch gate (tracker index handler).

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::core::{Address, Epoch, State, Update};
use crate::replica::{Membership, StateHandler};

/// Kind of a membership change announced by the tracker.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ChangeKind {
    Add,
    Remove,
}

/// Result of passing a data update through the epoch gate.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum GateResult {
    /// Causally delivered right away.
    Applied,

    /// Reached the causal engine but was deferred or discarded there.
    NotApplied,

    /// Sender is ahead of my membership view; held until I catch up.
    FutureEpoch,
}

impl GateResult {
    pub fn accepted(self) -> bool {
        self == GateResult::Applied
    }
}

/// Epoch plus everything waiting on it, always accessed under one lock.
#[derive(Debug)]
struct EpochInner {
    epoch: Epoch,

    /// Membership changes that arrived ahead of their turn.
    pending_changes: BTreeMap<Epoch, (ChangeKind, Address)>,

    /// Data updates tagged with an epoch I have not reached yet.
    pending_updates: BTreeMap<Epoch, Vec<Update>>,
}

/// Owner of the local epoch view. Membership changes are applied strictly in
/// epoch order, and data updates from senders with a newer view wait until
/// this replica reaches that view.
///
/// Lock order is always this handler's lock first, then the `StateHandler`
/// lock (taken inside its methods).
#[derive(Debug)]
pub struct EpochHandler {
    /// My replica identity.
    me: Address,

    inner: Mutex<EpochInner>,

    state: Arc<StateHandler>,

    membership: Arc<Membership>,

    /// Publishes every epoch advance.
    tx_epoch: watch::Sender<Epoch>,
}

impl EpochHandler {
    /// Creates the gate at the epoch assigned by the tracker on join.
    pub fn new(
        me: Address,
        epoch: Epoch,
        state: Arc<StateHandler>,
        membership: Arc<Membership>,
    ) -> Self {
        let (tx_epoch, _) = watch::channel(epoch);
        EpochHandler {
            me,
            inner: Mutex::new(EpochInner {
                epoch,
                pending_changes: BTreeMap::new(),
                pending_updates: BTreeMap::new(),
            }),
            state,
            membership,
            tx_epoch,
        }
    }

    fn lock(&self) -> MutexGuard<'_, EpochInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current local epoch.
    pub fn epoch(&self) -> Epoch {
        self.lock().epoch
    }

    /// Subscribes to epoch advances.
    pub fn subscribe(&self) -> watch::Receiver<Epoch> {
        self.tx_epoch.subscribe()
    }

    /// Gates a data update tagged with the sender's epoch.
    pub fn check_and_execute_update(
        &self,
        update: Update,
        incoming: Epoch,
    ) -> GateResult {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let applied = match incoming.cmp(&inner.epoch) {
            Ordering::Equal => self.state.replica_write(update, true),
            Ordering::Less => self.state.replica_write(update, false),
            Ordering::Greater => {
                pf_debug!(self.me; "holding update from {} at epoch {} > {}",
                                   update.origin(), incoming, inner.epoch);
                inner.pending_updates.entry(incoming).or_default().push(update);
                return GateResult::FutureEpoch;
            }
        };
        if applied {
            GateResult::Applied
        } else {
            GateResult::NotApplied
        }
    }

    /// Gates a membership change announced for `incoming` epoch. Returns
    /// `true` if it was applied right away.
    pub fn execute_tracker_update(
        &self,
        kind: ChangeKind,
        addr: &Address,
        incoming: Epoch,
    ) -> bool {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if incoming <= inner.epoch {
            pf_debug!(self.me; "ignoring {:?} {} at old epoch {} <= {}",
                               kind, addr, incoming, inner.epoch);
            return false;
        }
        if incoming > inner.epoch + 1 {
            pf_debug!(self.me; "queueing {:?} {} at epoch {} > {} + 1",
                               kind, addr, incoming, inner.epoch);
            inner
                .pending_changes
                .entry(incoming)
                .or_insert_with(|| (kind, addr.clone()));
            return false;
        }

        self.apply_change(inner, kind, addr);
        while let Some((kind, addr)) =
            inner.pending_changes.remove(&(inner.epoch + 1))
        {
            self.apply_change(inner, kind, &addr);
        }

        // data updates held for epochs I have now reached
        let later = inner.pending_updates.split_off(&(inner.epoch + 1));
        let ready = mem::replace(&mut inner.pending_updates, later);
        for (tagged, updates) in ready {
            let same_epoch = tagged == inner.epoch;
            for update in updates {
                self.state.replica_write(update, same_epoch);
            }
        }

        self.tx_epoch.send_replace(inner.epoch);
        true
    }

    /// Applies one membership change and advances the epoch by one.
    fn apply_change(
        &self,
        inner: &mut EpochInner,
        kind: ChangeKind,
        addr: &Address,
    ) {
        match kind {
            ChangeKind::Add => {
                self.state.add_address_key(addr);
                self.membership.add(addr);
            }
            ChangeKind::Remove => {
                self.membership.remove(addr);
                self.state.remove_address_key(addr);
            }
        }
        inner.epoch += 1;
        pf_info!(self.me; "{:?} {} -> epoch {}", kind, addr, inner.epoch);
    }

    /// Snapshots the state for a bootstrapping replica, only if it claims the
    /// same epoch as mine. The epoch cannot move between the check and the
    /// snapshot.
    pub fn snapshot_for(&self, epoch: Epoch) -> Option<State> {
        let inner = self.lock();
        if inner.epoch == epoch {
            Some(self.state.snapshot())
        } else {
            None
        }
    }

    /// Number of held membership changes and data updates.
    pub fn pending_len(&self) -> (usize, usize) {
        let inner = self.lock();
        (
            inner.pending_changes.len(),
            inner.pending_updates.values().map(Vec::len).sum(),
        )
    }
}
