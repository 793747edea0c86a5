//! Replica side: causal delivery, epoch gating, propagation, and the node
//! that ties them together.

mod epochhdl;
mod inflight;
mod membership;
mod node;
mod propagate;
mod statehdl;

pub use epochhdl::{ChangeKind, EpochHandler, GateResult};
pub use inflight::{InFlight, InFlightGuard};
pub use membership::Membership;
pub use node::{ReplicaConfig, ReplicaNode};
pub use propagate::Propagator;
pub use statehdl::StateHandler;
