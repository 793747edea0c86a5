//! Replica node: join, bootstrap, serve, and graceful leave.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{self, Duration};

use crate::core::{Address, Epoch, Message, State};
use crate::replica::{
    ChangeKind, EpochHandler, GateResult, InFlight, Membership, Propagator,
    StateHandler,
};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, tcp_request, Backoff,
    CausalKvError,
};

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaConfig {
    /// First retry delay for tracker and peer requests.
    pub backoff_base_ms: u64,

    /// Largest retry delay for tracker and peer requests.
    pub backoff_cap_ms: u64,

    /// Pause before asking the next peer after a bootstrap `Wait`.
    pub bootstrap_retry_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            backoff_base_ms: 50,
            backoff_cap_ms: 2000,
            bootstrap_retry_ms: 100,
        }
    }
}

/// Request dispatcher shared by all connection servant tasks.
#[derive(Debug)]
struct Dispatcher {
    me: Address,
    state: Arc<StateHandler>,
    epoch: Arc<EpochHandler>,
    propagator: Arc<Propagator>,
}

impl Dispatcher {
    /// Serves exactly one request on `stream`, then closes it.
    async fn serve_conn(
        self: Arc<Self>,
        mut stream: TcpStream,
        conn_addr: SocketAddr,
    ) {
        let req: Message = match safe_tcp_read(&mut stream).await {
            Ok(req) => req,
            Err(e) => {
                pf_warn!(self.me; "error reading request from {}: {}",
                                  conn_addr, e);
                return;
            }
        };
        pf_trace!(self.me; "got {} from {}", req.kind(), conn_addr);

        if let Some(reply) = self.dispatch(req) {
            if let Err(e) = safe_tcp_write(&mut stream, &reply).await {
                pf_warn!(self.me; "error replying {} to {}: {}",
                                  reply.kind(), conn_addr, e);
            }
        }
    }

    /// Handles one request, returning the reply to send back if any.
    fn dispatch(&self, req: Message) -> Option<Message> {
        match req {
            Message::ReadFromClient { key } => {
                let value = self.state.read(&key);
                Some(Message::ReadAnswer { key, value })
            }

            Message::WriteFromClient { key, value } => {
                let epoch = self.epoch.epoch();
                let update = self.state.client_write(&key, &value);
                pf_debug!(self.me; "client write {} #{} at epoch {}",
                                   key, update.origin_counter(), epoch);
                self.propagator.fan_out(update, epoch);
                Some(Message::Ack)
            }

            Message::UpdateFromReplica { update, epoch } => {
                let origin = update.origin().clone();
                // updates are never forwarded, so the writer is also the
                // sender, and it has reached `epoch`: updates it turned down
                // earlier can go out again
                self.propagator.observe_peer_epoch(&origin, epoch);
                match self.epoch.check_and_execute_update(update, epoch) {
                    GateResult::FutureEpoch => Some(Message::Wait),
                    GateResult::Applied | GateResult::NotApplied => {
                        Some(Message::Ack)
                    }
                }
            }

            Message::GetState { epoch } => {
                match self.epoch.snapshot_for(epoch) {
                    Some(state) => Some(Message::SendState { state }),
                    None => {
                        pf_debug!(self.me; "state requested at epoch {} != {}",
                                           epoch, self.epoch.epoch());
                        Some(Message::Wait)
                    }
                }
            }

            Message::SendNewReplica { addr, epoch } => {
                self.epoch
                    .execute_tracker_update(ChangeKind::Add, &addr, epoch);
                Some(Message::Ack)
            }

            Message::RemoveOldReplica { addr, epoch } => {
                self.epoch
                    .execute_tracker_update(ChangeKind::Remove, &addr, epoch);
                Some(Message::Ack)
            }

            other => {
                pf_warn!(self.me; "unexpected message kind {}", other.kind());
                None
            }
        }
    }
}

/// A replica of the causally consistent key-value store.
#[derive(Debug)]
pub struct ReplicaNode {
    /// My replica identity.
    me: Address,

    /// Address of the membership tracker.
    tracker: Address,

    /// Listener bound before joining, so early peer requests queue up in the
    /// backlog until `run()` starts accepting.
    listener: TcpListener,

    state: Arc<StateHandler>,

    epoch: Arc<EpochHandler>,

    membership: Arc<Membership>,

    inflight: Arc<InFlight>,

    propagator: Arc<Propagator>,
}

impl ReplicaNode {
    /// Binds the listening socket, joins the network through the tracker,
    /// and bootstraps the local state. Only returns once the replica is
    /// ready to serve.
    pub async fn new_and_setup(
        me: Address,
        tracker: Address,
        config_str: Option<&str>,
    ) -> Result<Self, CausalKvError> {
        let config = parsed_config!(config_str => ReplicaConfig;
                                    backoff_base_ms, backoff_cap_ms,
                                    bootstrap_retry_ms)?;
        let backoff = Backoff::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_cap_ms),
        )?;

        let bind_addr = Self::resolve(&me).await?;
        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        pf_info!(me; "listening on {}", bind_addr);

        let (peers, epoch) =
            Self::join_network(&me, &tracker, backoff.clone()).await;
        pf_info!(me; "joined at epoch {} with {} peers", epoch, peers.len());

        let state = Self::bootstrap_state(
            &me,
            &peers,
            epoch,
            Duration::from_millis(config.bootstrap_retry_ms),
            backoff,
        )
        .await;
        pf_info!(me; "bootstrapped state with {} keys", state.len());

        let state = Arc::new(StateHandler::new(me.clone(), state));
        let membership = Arc::new(Membership::new(me.clone(), peers));
        let epoch = Arc::new(EpochHandler::new(
            me.clone(),
            epoch,
            state.clone(),
            membership.clone(),
        ));
        let inflight = InFlight::new();
        let propagator = Arc::new(Propagator::new(
            me.clone(),
            membership.clone(),
            epoch.clone(),
            inflight.clone(),
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_cap_ms),
        )?);

        Ok(ReplicaNode {
            me,
            tracker,
            listener,
            state,
            epoch,
            membership,
            inflight,
            propagator,
        })
    }

    /// Resolves my identity into a local socket address to bind.
    async fn resolve(me: &Address) -> Result<SocketAddr, CausalKvError> {
        let addrs: Vec<SocketAddr> =
            lookup_host(me.to_string()).await?.collect();
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| {
                CausalKvError::msg(format!("cannot resolve address {}", me))
            })
    }

    /// Sends `AddReplica` to the tracker until it answers with the current
    /// peers and my assigned epoch.
    async fn join_network(
        me: &Address,
        tracker: &Address,
        mut backoff: Backoff,
    ) -> (HashSet<Address>, Epoch) {
        let req = Message::AddReplica { addr: me.clone() };
        loop {
            match tcp_request::<_, Message>(&tracker.to_string(), &req).await {
                Ok(Message::JoinReply { peers, epoch }) => {
                    return (peers, epoch)
                }
                Ok(reply) => {
                    pf_warn!(me; "unexpected join reply {}", reply.kind());
                }
                Err(e) => {
                    pf_warn!(me; "could not reach tracker {}: {}", tracker, e);
                }
            }
            backoff.wait().await;
        }
    }

    /// Obtains the initial state: fresh if I am the first member, otherwise
    /// fetched from a peer that sits at exactly my join epoch.
    async fn bootstrap_state(
        me: &Address,
        peers: &HashSet<Address>,
        epoch: Epoch,
        retry_interval: Duration,
        mut backoff: Backoff,
    ) -> State {
        if peers.is_empty() {
            return State::fresh(me);
        }

        let mut peers: Vec<&Address> = peers.iter().collect();
        peers.sort();
        let req = Message::GetState { epoch };
        let mut turn = 0;
        loop {
            let peer = peers[turn % peers.len()];
            turn += 1;

            match tcp_request::<_, Message>(&peer.to_string(), &req).await {
                Ok(Message::SendState { state }) => {
                    pf_debug!(me; "got state from {}", peer);
                    return state;
                }
                Ok(Message::Wait) => {
                    pf_debug!(me; "peer {} not at epoch {} yet", peer, epoch);
                    backoff.reset();
                    time::sleep(retry_interval).await;
                }
                Ok(reply) => {
                    pf_warn!(me; "unexpected state reply {} from {}",
                                 reply.kind(), peer);
                    backoff.wait().await;
                }
                Err(e) => {
                    pf_warn!(me; "could not get state from {}: {}", peer, e);
                    backoff.wait().await;
                }
            }
        }
    }

    /// My replica identity.
    pub fn me(&self) -> &Address {
        &self.me
    }

    /// Handle to the causal delivery engine.
    pub fn state_handler(&self) -> Arc<StateHandler> {
        self.state.clone()
    }

    /// Handle to the epoch gate.
    pub fn epoch_handler(&self) -> Arc<EpochHandler> {
        self.epoch.clone()
    }

    /// Handle to the current peer set.
    pub fn membership(&self) -> Arc<Membership> {
        self.membership.clone()
    }

    /// Main event loop. Serves requests until the termination signal, then
    /// drains outstanding propagation, tells the tracker I am leaving, and
    /// stops listening.
    pub async fn run(
        self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), CausalKvError> {
        let dispatcher = Arc::new(Dispatcher {
            me: self.me.clone(),
            state: self.state.clone(),
            epoch: self.epoch.clone(),
            propagator: self.propagator.clone(),
        });

        // resend parked updates whenever my epoch advances
        let flusher = self.propagator.spawn_epoch_flusher();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    self.spawn_servant(&dispatcher, accepted);
                },

                _ = rx_term.changed() => {
                    pf_warn!(self.me; "replica caught termination signal");
                    break;
                }
            }
        }

        // keep serving while draining, as peers may still need my replies
        // for their own progress
        pf_info!(self.me; "waiting for {} in-flight updates",
                          self.inflight.count());
        let drain = self.inflight.wait_idle();
        tokio::pin!(drain);
        loop {
            tokio::select! {
                () = &mut drain => break,
                accepted = self.listener.accept() => {
                    self.spawn_servant(&dispatcher, accepted);
                },
            }
        }

        let req = Message::RemoveReplica {
            addr: self.me.clone(),
        };
        match tcp_request::<_, Message>(&self.tracker.to_string(), &req).await {
            Ok(Message::Ack) => {
                pf_info!(self.me; "left the network");
            }
            Ok(reply) => {
                pf_warn!(self.me; "unexpected leave reply {}", reply.kind());
            }
            Err(e) => {
                pf_error!(self.me; "could not notify tracker {}: {}",
                                   self.tracker, e);
            }
        }

        flusher.abort();
        Ok(())
    }

    fn spawn_servant(
        &self,
        dispatcher: &Arc<Dispatcher>,
        accepted: std::io::Result<(TcpStream, SocketAddr)>,
    ) {
        match accepted {
            Ok((stream, conn_addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    pf_warn!(self.me; "error setting nodelay: {}", e);
                }
                tokio::spawn(dispatcher.clone().serve_conn(stream, conn_addr));
            }
            Err(e) => {
                pf_warn!(self.me; "error accepting connection: {}", e);
            }
        }
    }
}
