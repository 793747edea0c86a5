//! Membership tracker: hands out the global order of joins and leaves.

#[allow(clippy::module_inception)]
mod tracker;

pub use tracker::{Tracker, TrackerConfig};
