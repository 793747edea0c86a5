//! Membership tracker implementation.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Duration;

use crate::core::{Address, Epoch, Message};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, tcp_request, Backoff,
    CausalKvError,
};

/// Log prefix of the tracker.
const ME: &str = "t";

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    /// First retry delay for membership broadcasts.
    pub backoff_base_ms: u64,

    /// Largest retry delay for membership broadcasts.
    pub backoff_cap_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            backoff_base_ms: 50,
            backoff_cap_ms: 2000,
        }
    }
}

/// Current members, each with the epoch it joined at.
#[derive(Debug, Default)]
struct Registry {
    epoch: Epoch,
    members: HashMap<Address, Epoch>,
}

/// Standalone membership tracker. The sole source of epoch increments: every
/// join or leave advances the epoch by one and is announced to the other
/// members tagged with the new epoch.
#[derive(Debug)]
pub struct Tracker {
    listener: TcpListener,

    registry: Arc<Mutex<Registry>>,

    /// Retry delay template for broadcast tasks.
    backoff: Backoff,
}

impl Tracker {
    /// Creates a new tracker listening on `bind_addr`.
    pub async fn new_and_setup(
        bind_addr: SocketAddr,
        config_str: Option<&str>,
    ) -> Result<Self, CausalKvError> {
        let config = parsed_config!(config_str => TrackerConfig;
                                    backoff_base_ms, backoff_cap_ms)?;
        let backoff = Backoff::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_cap_ms),
        )?;

        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        pf_info!(ME; "tracker listening on {}", bind_addr);

        Ok(Tracker {
            listener,
            registry: Arc::new(Mutex::new(Registry::default())),
            backoff,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Main event loop. Breaks out only upon the termination signal.
    pub async fn run(
        self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), CausalKvError> {
        let tracker = Arc::new(self);
        loop {
            tokio::select! {
                accepted = tracker.listener.accept() => {
                    match accepted {
                        Ok((stream, conn_addr)) => {
                            tokio::spawn(
                                tracker.clone().serve_conn(stream, conn_addr),
                            );
                        }
                        Err(e) => {
                            pf_warn!(ME; "error accepting connection: {}", e);
                        }
                    }
                },

                _ = rx_term.changed() => {
                    pf_warn!(ME; "tracker caught termination signal");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Serves exactly one request on `stream`.
    async fn serve_conn(
        self: Arc<Self>,
        mut stream: TcpStream,
        conn_addr: SocketAddr,
    ) {
        let req: Message = match safe_tcp_read(&mut stream).await {
            Ok(req) => req,
            Err(e) => {
                pf_warn!(ME; "error reading request from {}: {}", conn_addr, e);
                return;
            }
        };

        let reply = match req {
            Message::AddReplica { addr } => Some(self.handle_add(addr)),
            Message::RemoveReplica { addr } => {
                self.handle_remove(addr);
                Some(Message::Ack)
            }
            other => {
                pf_warn!(ME; "unexpected message kind {}", other.kind());
                None
            }
        };

        if let Some(reply) = reply {
            if let Err(e) = safe_tcp_write(&mut stream, &reply).await {
                pf_warn!(ME; "error replying {} to {}: {}",
                             reply.kind(), conn_addr, e);
            }
        }
    }

    /// Handler of `AddReplica`. A repeated join of a current member gets the
    /// same answer as its first one.
    fn handle_add(self: &Arc<Self>, addr: Address) -> Message {
        let mut registry = self.lock();

        if let Some(&joined) = registry.members.get(&addr) {
            pf_debug!(ME; "repeated join of {} at epoch {}", addr, joined);
            let peers = registry
                .members
                .iter()
                .filter(|&(_, &e)| e < joined)
                .map(|(a, _)| a.clone())
                .collect();
            return Message::JoinReply {
                peers,
                epoch: joined,
            };
        }

        registry.epoch += 1;
        let epoch = registry.epoch;
        let peers: HashSet<Address> =
            registry.members.keys().cloned().collect();
        registry.members.insert(addr.clone(), epoch);
        pf_info!(ME; "{} joined -> epoch {}", addr, epoch);

        for peer in &peers {
            self.spawn_broadcast(
                peer.clone(),
                Message::SendNewReplica {
                    addr: addr.clone(),
                    epoch,
                },
            );
        }
        Message::JoinReply { peers, epoch }
    }

    /// Handler of `RemoveReplica`. Removing a non-member is a no-op.
    fn handle_remove(self: &Arc<Self>, addr: Address) {
        let mut registry = self.lock();
        if registry.members.remove(&addr).is_none() {
            pf_debug!(ME; "ignoring leave of non-member {}", addr);
            return;
        }

        registry.epoch += 1;
        let epoch = registry.epoch;
        pf_info!(ME; "{} left -> epoch {}", addr, epoch);

        for peer in registry.members.keys() {
            self.spawn_broadcast(
                peer.clone(),
                Message::RemoveOldReplica {
                    addr: addr.clone(),
                    epoch,
                },
            );
        }
    }

    /// Delivers `msg` to `peer`, retrying while it is still a member.
    fn spawn_broadcast(self: &Arc<Self>, peer: Address, msg: Message) {
        let tracker = self.clone();
        let mut backoff = self.backoff.clone();
        tokio::spawn(async move {
            loop {
                if !tracker.lock().members.contains_key(&peer) {
                    pf_debug!(ME; "{} left, dropping {}", peer, msg.kind());
                    return;
                }
                match tcp_request::<_, Message>(&peer.to_string(), &msg).await
                {
                    Ok(Message::Ack) => return,
                    Ok(reply) => {
                        pf_warn!(ME; "unexpected reply {} from {}",
                                     reply.kind(), peer);
                        return;
                    }
                    Err(e) => {
                        pf_warn!(ME; "could not send {} to {}: {}",
                                     msg.kind(), peer, e);
                        backoff.wait().await;
                    }
                }
            }
        });
    }
}
