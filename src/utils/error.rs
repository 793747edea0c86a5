//! Error type shared by the replica, the tracker, and the client stub.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Error carried through every fallible causalkv path: socket and framing
/// failures, MessagePack codec errors, TOML config errors, bad addresses or
/// ports on the command line, and task or channel shutdown.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CausalKvError(pub String);

impl CausalKvError {
    pub fn msg(msg: impl ToString) -> Self {
        CausalKvError(msg.to_string())
    }
}

impl fmt::Display for CausalKvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for CausalKvError {}

// Turns a foreign error into its message, so `?` works on it.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for CausalKvError {
            fn from(e: $error) -> Self {
                CausalKvError(e.to_string())
            }
        }
    };
}

// Same for channel send errors, which are generic over the payload.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for CausalKvError {
            fn from(e: $error) -> CausalKvError {
                CausalKvError::msg(e.to_string())
            }
        }
    };
}

// transport and framing
impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
// addresses and ports
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
// wire codec
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
// `parsed_config!`
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
// runtime plumbing
impl_from_error!(ctrlc::Error);
impl_from_error!(tokio::task::JoinError);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = CausalKvError::msg("peer 127.0.0.1:40001 unreachable");
        assert_eq!(e.to_string(), "peer 127.0.0.1:40001 unreachable");
    }

    #[test]
    fn from_io_error() {
        let io_error =
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let e = CausalKvError::from(io_error);
        assert!(e.0.contains("refused"));
    }

    #[test]
    fn from_parse_error() {
        let e = CausalKvError::from("port70000".parse::<u16>().unwrap_err());
        assert!(!e.0.is_empty());
    }
}
