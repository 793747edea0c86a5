//! Fan-out of local writes to peers, with retry and epoch-deferred resends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::core::{Address, Epoch, Message, Update};
use crate::replica::{EpochHandler, InFlight, InFlightGuard, Membership};
use crate::utils::{tcp_request, Backoff, CausalKvError};

/// An update a peer answered with `Wait`, kept for resending once that peer
/// is known to have caught up.
#[derive(Debug, Clone)]
struct Parked {
    update: Update,

    /// Epoch tag the update carried when it was turned down.
    epoch: Epoch,
}

/// Propagation module of a replica. Spawns one worker per peer per write;
/// the worker retries on transport failure for as long as the peer is still a
/// member.
#[derive(Debug)]
pub struct Propagator {
    /// My replica identity.
    me: Address,

    membership: Arc<Membership>,

    epoch: Arc<EpochHandler>,

    /// Outstanding attempts, awaited on graceful shutdown.
    inflight: Arc<InFlight>,

    /// Per-peer updates turned down with `Wait`.
    parked: Mutex<HashMap<Address, Vec<Parked>>>,

    /// Retry delay template cloned by every worker.
    backoff: Backoff,
}

impl Propagator {
    /// Creates a new propagation module.
    pub fn new(
        me: Address,
        membership: Arc<Membership>,
        epoch: Arc<EpochHandler>,
        inflight: Arc<InFlight>,
        backoff_base: Duration,
        backoff_cap: Duration,
    ) -> Result<Self, CausalKvError> {
        let backoff = Backoff::new(backoff_base, backoff_cap)?;
        Ok(Propagator {
            me,
            membership,
            epoch,
            inflight,
            parked: Mutex::new(HashMap::new()),
            backoff,
        })
    }

    /// Sends `update`, tagged with `epoch`, to every current peer
    /// concurrently. Returns immediately.
    pub fn fan_out(self: &Arc<Self>, update: Update, epoch: Epoch) {
        for peer in self.membership.peers() {
            self.spawn_attempt(peer, update.clone(), epoch);
        }
    }

    /// Spawns one propagation worker, counted as in flight until it finishes.
    fn spawn_attempt(
        self: &Arc<Self>,
        peer: Address,
        update: Update,
        epoch: Epoch,
    ) {
        let guard = self.inflight.enter();
        tokio::spawn(self.clone().send_to_peer(peer, update, epoch, guard));
    }

    /// Propagation worker: sends until the peer answers or leaves.
    async fn send_to_peer(
        self: Arc<Self>,
        peer: Address,
        update: Update,
        epoch: Epoch,
        _guard: InFlightGuard,
    ) {
        let mut backoff = self.backoff.clone();
        let mut rx_change = self.membership.subscribe();
        let req = Message::UpdateFromReplica {
            update: update.clone(),
            epoch,
        };

        loop {
            if !self.membership.contains(&peer) {
                pf_debug!(self.me; "peer {} left, dropping update {}#{}",
                                   peer, update.key(), update.origin_counter());
                return;
            }

            let Some(result) =
                self.request_while_member(&peer, &req, &mut rx_change).await
            else {
                pf_debug!(self.me; "peer {} left, dropping update {}#{}",
                                   peer, update.key(), update.origin_counter());
                return;
            };

            match result {
                Ok(Message::Ack) => {
                    pf_trace!(self.me; "update {}#{} acked by {}",
                                       update.key(), update.origin_counter(), peer);
                    return;
                }
                Ok(Message::Wait) => {
                    pf_debug!(self.me; "peer {} behind epoch {}, parking update",
                                       peer, epoch);
                    self.park(peer, update, epoch);
                    return;
                }
                Ok(reply) => {
                    pf_warn!(self.me; "unexpected reply {} from {}",
                                      reply.kind(), peer);
                    return;
                }
                Err(e) => {
                    pf_warn!(self.me; "could not update replica {}: {}", peer, e);
                    tokio::select! {
                        _ = backoff.wait() => {},
                        // wake up early to re-check membership
                        _ = rx_change.changed() => {},
                    }
                }
            }
        }
    }

    /// Sends one request to `peer` and waits for its reply, unless `peer`
    /// leaves the membership first. Returns `None` in that case; the
    /// connection is dropped along with the cancelled request.
    async fn request_while_member(
        &self,
        peer: &Address,
        req: &Message,
        rx_change: &mut watch::Receiver<u64>,
    ) -> Option<Result<Message, CausalKvError>> {
        let conn_addr = peer.to_string();
        let attempt = tcp_request::<_, Message>(&conn_addr, req);
        tokio::pin!(attempt);
        loop {
            tokio::select! {
                result = &mut attempt => return Some(result),
                changed = rx_change.changed() => {
                    if changed.is_err() || !self.membership.contains(peer) {
                        return None;
                    }
                }
            }
        }
    }

    fn park(&self, peer: Address, update: Update, epoch: Epoch) {
        let mut parked =
            self.parked.lock().unwrap_or_else(PoisonError::into_inner);
        parked.entry(peer).or_default().push(Parked { update, epoch });
    }

    /// Resends every parked update to peers still in the membership,
    /// tagged with my current epoch. Called whenever my epoch advances.
    pub fn flush_all(self: &Arc<Self>) {
        let drained: Vec<(Address, Vec<Parked>)> = {
            let mut parked =
                self.parked.lock().unwrap_or_else(PoisonError::into_inner);
            parked.drain().collect()
        };
        let epoch = self.epoch.epoch();
        for (peer, updates) in drained {
            self.resend(peer, updates, epoch);
        }
    }

    /// Spawns the task that calls `flush_all()` on every advance of my
    /// epoch. Ends when the epoch handler goes away.
    pub fn spawn_epoch_flusher(self: &Arc<Self>) -> JoinHandle<()> {
        let propagator = self.clone();
        let mut rx_epoch = self.epoch.subscribe();
        tokio::spawn(async move {
            while rx_epoch.changed().await.is_ok() {
                propagator.flush_all();
            }
        })
    }

    /// Records that `peer` was seen operating at epoch `seen` and resends the
    /// updates it turned down at epochs up to that.
    pub fn observe_peer_epoch(self: &Arc<Self>, peer: &Address, seen: Epoch) {
        let ready: Vec<Parked> = {
            let mut parked =
                self.parked.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(updates) = parked.get_mut(peer) else {
                return;
            };
            let (ready, rest): (Vec<Parked>, Vec<Parked>) =
                updates.drain(..).partition(|p| p.epoch <= seen);
            *updates = rest;
            if updates.is_empty() {
                parked.remove(peer);
            }
            ready
        };
        if !ready.is_empty() {
            let epoch = self.epoch.epoch();
            self.resend(peer.clone(), ready, epoch);
        }
    }

    fn resend(
        self: &Arc<Self>,
        peer: Address,
        updates: Vec<Parked>,
        epoch: Epoch,
    ) {
        if !self.membership.contains(&peer) {
            return;
        }
        pf_debug!(self.me; "resending {} parked updates to {} at epoch {}",
                           updates.len(), peer, epoch);
        for p in updates {
            self.spawn_attempt(peer.clone(), p.update, epoch);
        }
    }

    /// Number of parked updates across all peers.
    pub fn parked_len(&self) -> usize {
        let parked = self.parked.lock().unwrap_or_else(PoisonError::into_inner);
        parked.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod propagate_tests {
    use super::*;
    use crate::core::{State, VectorClock};
    use crate::replica::{ChangeKind, StateHandler};
    use crate::utils::{safe_tcp_read, safe_tcp_write, tcp_bind_with_retry};
    use std::collections::HashSet;
    use tokio::time;

    fn setup(me: &Address, peers: &[Address]) -> Arc<Propagator> {
        let state = Arc::new(StateHandler::new(me.clone(), State::fresh(me)));
        let membership = Arc::new(Membership::new(
            me.clone(),
            peers.iter().cloned().collect::<HashSet<_>>(),
        ));
        let epoch = Arc::new(EpochHandler::new(
            me.clone(),
            1,
            state,
            membership.clone(),
        ));
        Arc::new(
            Propagator::new(
                me.clone(),
                membership,
                epoch,
                InFlight::new(),
                Duration::from_millis(10),
                Duration::from_millis(100),
            )
            .expect("valid backoff"),
        )
    }

    fn sample_update(me: &Address) -> Update {
        Update::new(VectorClock::from([(me.key(), 1)]), me.clone(), "x", "1")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn retry_until_peer_up() -> Result<(), CausalKvError> {
        let me = Address::new("127.0.0.1", 53710);
        let peer = Address::new("127.0.0.1", 53711);
        let prop = setup(&me, &[peer.clone()]);
        prop.fan_out(sample_update(&me), 1);
        assert_eq!(prop.inflight.count(), 1);

        // peer comes up late
        time::sleep(Duration::from_millis(150)).await;
        let listener =
            tcp_bind_with_retry("127.0.0.1:53711".parse()?, 3).await?;
        let (mut stream, _) = listener.accept().await?;
        let req: Message = safe_tcp_read(&mut stream).await?;
        assert!(matches!(req, Message::UpdateFromReplica { epoch: 1, .. }));
        safe_tcp_write(&mut stream, &Message::Ack).await?;

        time::timeout(Duration::from_secs(2), prop.inflight.wait_idle())
            .await
            .map_err(|e| CausalKvError::msg(e.to_string()))?;
        assert_eq!(prop.parked_len(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandon_removed_peer() -> Result<(), CausalKvError> {
        let me = Address::new("127.0.0.1", 53720);
        let peer = Address::new("127.0.0.1", 53721);
        let prop = setup(&me, &[peer.clone()]);
        prop.fan_out(sample_update(&me), 1);
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(prop.inflight.count(), 1);

        prop.membership.remove(&peer);
        time::timeout(Duration::from_secs(1), prop.inflight.wait_idle())
            .await
            .map_err(|e| CausalKvError::msg(e.to_string()))?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn park_on_wait_then_resend() -> Result<(), CausalKvError> {
        let me = Address::new("127.0.0.1", 53730);
        let peer = Address::new("127.0.0.1", 53731);
        let listener =
            tcp_bind_with_retry("127.0.0.1:53731".parse()?, 3).await?;
        let prop = setup(&me, &[peer.clone()]);
        prop.fan_out(sample_update(&me), 1);

        let (mut stream, _) = listener.accept().await?;
        let _: Message = safe_tcp_read(&mut stream).await?;
        safe_tcp_write(&mut stream, &Message::Wait).await?;
        time::timeout(Duration::from_secs(1), prop.inflight.wait_idle())
            .await
            .map_err(|e| CausalKvError::msg(e.to_string()))?;
        assert_eq!(prop.parked_len(), 1);

        // peer still behind: nothing resent
        prop.observe_peer_epoch(&peer, 0);
        assert_eq!(prop.parked_len(), 1);

        prop.observe_peer_epoch(&peer, 1);
        assert_eq!(prop.parked_len(), 0);
        let (mut stream, _) = listener.accept().await?;
        let req: Message = safe_tcp_read(&mut stream).await?;
        match req {
            Message::UpdateFromReplica { update, epoch } => {
                assert_eq!(update.key(), "x");
                assert_eq!(epoch, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        safe_tcp_write(&mut stream, &Message::Ack).await?;
        time::timeout(Duration::from_secs(1), prop.inflight.wait_idle())
            .await
            .map_err(|e| CausalKvError::msg(e.to_string()))?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandon_silent_peer_on_removal() -> Result<(), CausalKvError> {
        let me = Address::new("127.0.0.1", 53740);
        let peer = Address::new("127.0.0.1", 53741);
        let listener =
            tcp_bind_with_retry("127.0.0.1:53741".parse()?, 3).await?;
        let prop = setup(&me, &[peer.clone()]);
        prop.fan_out(sample_update(&me), 1);

        // peer reads the request but never answers
        let (mut stream, _) = listener.accept().await?;
        let _: Message = safe_tcp_read(&mut stream).await?;
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(prop.inflight.count(), 1);

        prop.membership.remove(&peer);
        time::timeout(Duration::from_secs(2), prop.inflight.wait_idle())
            .await
            .map_err(|e| CausalKvError::msg(e.to_string()))?;
        assert_eq!(prop.parked_len(), 0);
        drop(stream);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn silent_peer_kept_while_member() -> Result<(), CausalKvError> {
        let me = Address::new("127.0.0.1", 53750);
        let peer = Address::new("127.0.0.1", 53751);
        let listener =
            tcp_bind_with_retry("127.0.0.1:53751".parse()?, 3).await?;
        let prop = setup(&me, &[peer.clone()]);
        prop.fan_out(sample_update(&me), 1);

        let (mut stream, _) = listener.accept().await?;
        let _: Message = safe_tcp_read(&mut stream).await?;

        // an unrelated membership change does not cancel the attempt
        prop.membership.add(&Address::new("127.0.0.1", 53752));
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(prop.inflight.count(), 1);

        safe_tcp_write(&mut stream, &Message::Ack).await?;
        time::timeout(Duration::from_secs(2), prop.inflight.wait_idle())
            .await
            .map_err(|e| CausalKvError::msg(e.to_string()))?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resend_parked_on_epoch_advance() -> Result<(), CausalKvError> {
        let me = Address::new("127.0.0.1", 53760);
        let peer = Address::new("127.0.0.1", 53761);
        let listener =
            tcp_bind_with_retry("127.0.0.1:53761".parse()?, 3).await?;
        let prop = setup(&me, &[peer.clone()]);
        let flusher = prop.spawn_epoch_flusher();
        prop.fan_out(sample_update(&me), 1);

        let (mut stream, _) = listener.accept().await?;
        let _: Message = safe_tcp_read(&mut stream).await?;
        safe_tcp_write(&mut stream, &Message::Wait).await?;
        time::timeout(Duration::from_secs(1), prop.inflight.wait_idle())
            .await
            .map_err(|e| CausalKvError::msg(e.to_string()))?;
        assert_eq!(prop.parked_len(), 1);

        // my epoch advances, so the parked update goes out at the new epoch
        assert!(prop.epoch.execute_tracker_update(
            ChangeKind::Add,
            &Address::new("127.0.0.1", 53762),
            2
        ));
        let (mut stream, _) =
            time::timeout(Duration::from_secs(2), listener.accept())
                .await
                .map_err(|e| CausalKvError::msg(e.to_string()))??;
        let req: Message = safe_tcp_read(&mut stream).await?;
        match req {
            Message::UpdateFromReplica { update, epoch } => {
                assert_eq!(update.key(), "x");
                assert_eq!(epoch, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        safe_tcp_write(&mut stream, &Message::Ack).await?;
        assert_eq!(prop.parked_len(), 0);

        flusher.abort();
        Ok(())
    }
}
