//! Client side stub for talking to a replica.

mod kvclient;

pub use kvclient::KvClient;
