//! Data model shared by replicas, the tracker, and clients.

mod address;
mod messages;
mod state;

pub use address::Address;
pub use messages::{Epoch, Message};
pub use state::{State, Update, VectorClock};
