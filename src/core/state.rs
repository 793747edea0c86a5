//! Replicated state: key-value store plus vector clock, and the update record
//! that carries one write between replicas.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::Address;

/// Vector clock mapping replica identity string -> counter.
pub type VectorClock = HashMap<String, u64>;

/// Key-value store plus the vector clock describing which writes it
/// reflects. Only `StateHandler` mutates a replica's `State`; copies of it
/// travel in `SendState` messages during bootstrap.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct State {
    /// One counter per currently known replica.
    vclock: VectorClock,

    /// The stored data.
    store: HashMap<String, String>,
}

impl State {
    /// Creates the state of a network's first member: empty store and a
    /// clock holding only its own identity at 0.
    pub fn fresh(me: &Address) -> Self {
        State {
            vclock: VectorClock::from([(me.key(), 0)]),
            store: HashMap::new(),
        }
    }

    /// Gets the value stored under `key`.
    pub fn read(&self, key: &str) -> Option<&String> {
        self.store.get(key)
    }

    /// Puts `value` under `key`, returning the old value if any.
    pub(crate) fn write(&mut self, key: &str, value: &str) -> Option<String> {
        self.store.insert(key.into(), value.into())
    }

    /// Read-only view of the vector clock.
    pub fn vclock(&self) -> &VectorClock {
        &self.vclock
    }

    /// Local counter of identity `key`, 0 if absent.
    pub fn counter(&self, key: &str) -> u64 {
        self.vclock.get(key).copied().unwrap_or(0)
    }

    /// Increments the counter of identity `key` by one (inserting it at 1 if
    /// absent) and returns the new value.
    pub(crate) fn tick(&mut self, key: &str) -> u64 {
        let cnt = self.vclock.entry(key.into()).or_insert(0);
        *cnt += 1;
        *cnt
    }

    /// Adds identity `key` at counter 0 if not present. Returns `true` if it
    /// was newly added.
    pub(crate) fn add_key(&mut self, key: &str) -> bool {
        if self.vclock.contains_key(key) {
            false
        } else {
            self.vclock.insert(key.into(), 0);
            true
        }
    }

    /// Removes identity `key`. Returns `true` if it was present.
    pub(crate) fn remove_key(&mut self, key: &str) -> bool {
        self.vclock.remove(key).is_some()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

/// A single write tagged with the writer's full vector clock snapshot taken
/// right after the write. Immutable once created.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Update {
    vclock: VectorClock,
    from: Address,
    key: String,
    value: String,
}

impl Update {
    /// Creates a new update record.
    pub fn new(
        vclock: VectorClock,
        from: Address,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Update {
            vclock,
            from,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn vclock(&self) -> &VectorClock {
        &self.vclock
    }

    /// Identity of the replica that originated this write.
    pub fn origin(&self) -> &Address {
        &self.from
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// The writer's own counter in the snapshot, i.e. its sequence number
    /// among the writes it originated.
    pub fn origin_counter(&self) -> u64 {
        self.vclock.get(&self.from.key()).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod state_tests {
    use super::*;

    #[test]
    fn fresh_state() {
        let me = Address::new("127.0.0.1", 40000);
        let state = State::fresh(&me);
        assert_eq!(state.vclock().len(), 1);
        assert_eq!(state.counter(&me.key()), 0);
        assert!(state.is_empty());
    }

    #[test]
    fn tick_and_keys() {
        let mut state = State::default();
        assert_eq!(state.tick("a"), 1);
        assert_eq!(state.tick("a"), 2);
        assert!(!state.add_key("a"));
        assert_eq!(state.counter("a"), 2);
        assert!(state.add_key("b"));
        assert_eq!(state.counter("b"), 0);
        assert!(state.remove_key("b"));
        assert!(!state.remove_key("b"));
        assert_eq!(state.counter("zzz"), 0);
    }

    #[test]
    fn write_then_read() {
        let mut state = State::default();
        assert_eq!(state.write("x", "1"), None);
        assert_eq!(state.write("x", "2"), Some("1".into()));
        assert_eq!(state.read("x"), Some(&"2".to_string()));
        assert_eq!(state.read("y"), None);
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn update_origin_counter() {
        let from = Address::new("h", 1);
        let upd = Update::new(
            VectorClock::from([(from.key(), 3), ("h:2".into(), 5)]),
            from,
            "k",
            "v",
        );
        assert_eq!(upd.origin_counter(), 3);
        assert_eq!(upd.key(), "k");
        assert_eq!(upd.value(), "v");
    }
}
