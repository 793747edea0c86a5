//! Causalkv: a replicated key-value store with per-key vector-clock causal
//! delivery and tracker-ordered membership epochs.

#[macro_use]
mod utils;

pub mod client;
pub mod core;
pub mod replica;
pub mod tracker;

pub use crate::utils::{logger_init, Backoff, CausalKvError};

pub use crate::core::{Address, Epoch, Message, State, Update, VectorClock};

pub use crate::replica::{
    ChangeKind, EpochHandler, GateResult, ReplicaConfig, ReplicaNode,
    StateHandler,
};

pub use crate::tracker::{Tracker, TrackerConfig};

pub use crate::client::KvClient;
