//! Network endpoint identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::utils::CausalKvError;

/// Immutable `(host, port)` identity of a replica or the tracker. Its
/// `host:port` string form doubles as the replica's vector clock index.
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    /// Creates a new address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Address {
            host: host.into(),
            port,
        }
    }

    /// Host part.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port part.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Vector clock index of this identity.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = CausalKvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                Ok(Address::new(host, port.parse::<u16>()?))
            }
            _ => Err(CausalKvError::msg(format!(
                "invalid address string '{}'",
                s
            ))),
        }
    }
}
