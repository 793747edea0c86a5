//! Current peer set of a replica.

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

use tokio::sync::watch;

use crate::core::Address;

/// The set of peers a replica currently knows about (never containing
/// itself). Every change bumps a version number that propagation workers
/// watch, so a retry loop waiting on a departed peer wakes up immediately.
#[derive(Debug)]
pub struct Membership {
    /// My replica identity.
    me: Address,

    /// Known peers.
    peers: RwLock<HashSet<Address>>,

    /// Sender side of the change version channel.
    tx_change: watch::Sender<u64>,
}

impl Membership {
    /// Creates the peer set from the tracker's join reply.
    pub fn new(me: Address, mut peers: HashSet<Address>) -> Self {
        peers.remove(&me);
        let (tx_change, _) = watch::channel(0);
        Membership {
            me,
            peers: RwLock::new(peers),
            tx_change,
        }
    }

    /// Snapshot of the current peers.
    pub fn peers(&self) -> Vec<Address> {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        peers.iter().cloned().collect()
    }

    /// Whether `addr` is currently a peer.
    pub fn contains(&self, addr: &Address) -> bool {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        peers.contains(addr)
    }

    /// Number of peers.
    pub fn len(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds a peer. Adding myself is a no-op.
    pub(crate) fn add(&self, addr: &Address) {
        if *addr == self.me {
            return;
        }
        let mut peers =
            self.peers.write().unwrap_or_else(PoisonError::into_inner);
        if peers.insert(addr.clone()) {
            self.tx_change.send_modify(|v| *v += 1);
        }
    }

    /// Removes a peer.
    pub(crate) fn remove(&self, addr: &Address) {
        let mut peers =
            self.peers.write().unwrap_or_else(PoisonError::into_inner);
        if peers.remove(addr) {
            self.tx_change.send_modify(|v| *v += 1);
        }
    }

    /// Subscribes to membership change notifications.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx_change.subscribe()
    }
}

#[cfg(test)]
mod membership_tests {
    use super::*;

    #[test]
    fn never_contains_me() {
        let me = Address::new("h", 1);
        let members = Membership::new(
            me.clone(),
            HashSet::from([me.clone(), Address::new("h", 2)]),
        );
        assert_eq!(members.len(), 1);
        assert!(!members.contains(&me));
        members.add(&me);
        assert_eq!(members.peers(), vec![Address::new("h", 2)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn change_notifies() {
        let members = Membership::new(Address::new("h", 1), HashSet::new());
        let mut rx_change = members.subscribe();
        members.add(&Address::new("h", 2));
        assert!(rx_change.changed().await.is_ok());
        assert_eq!(*rx_change.borrow_and_update(), 1);

        // no-op changes do not bump the version
        members.remove(&Address::new("h", 3));
        members.remove(&Address::new("h", 2));
        assert!(rx_change.changed().await.is_ok());
        assert_eq!(*rx_change.borrow_and_update(), 2);
        assert!(members.is_empty());
    }
}
