//! Wire messages exchanged among clients, replicas, and the tracker.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::core::{Address, State, Update};

/// Membership epoch (tracker index) type.
pub type Epoch = u64;

/// Tagged union of every message kind. Each TCP connection carries exactly
/// one request and at most one reply.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Replica -> Tracker: I want to join the network.
    AddReplica { addr: Address },

    /// Replica -> Tracker: I am leaving the network.
    RemoveReplica { addr: Address },

    /// Tracker -> Replica: answer to `AddReplica`, listing the peers already
    /// in the network and the epoch assigned to the join.
    JoinReply { peers: HashSet<Address>, epoch: Epoch },

    /// Replica -> Replica: bootstrap request, valid only if the recipient's
    /// epoch equals `epoch`.
    GetState { epoch: Epoch },

    /// Replica -> Replica: full state snapshot answering `GetState`.
    SendState { state: State },

    /// Client -> Replica: read a key.
    ReadFromClient { key: String },

    /// Replica -> Client: answer to `ReadFromClient`.
    ReadAnswer { key: String, value: Option<String> },

    /// Client -> Replica: write a key.
    WriteFromClient { key: String, value: String },

    /// Replica -> Replica: propagated write tagged with the sender's epoch.
    UpdateFromReplica { update: Update, epoch: Epoch },

    /// Positive acknowledgement.
    Ack,

    /// Request deferred because of an epoch mismatch.
    Wait,

    /// Tracker -> Replica: `addr` joined at `epoch`.
    SendNewReplica { addr: Address, epoch: Epoch },

    /// Tracker -> Replica: `addr` left at `epoch`.
    RemoveOldReplica { addr: Address, epoch: Epoch },
}

impl Message {
    /// Short kind name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddReplica { .. } => "AddReplica",
            Self::RemoveReplica { .. } => "RemoveReplica",
            Self::JoinReply { .. } => "JoinReply",
            Self::GetState { .. } => "GetState",
            Self::SendState { .. } => "SendState",
            Self::ReadFromClient { .. } => "ReadFromClient",
            Self::ReadAnswer { .. } => "ReadAnswer",
            Self::WriteFromClient { .. } => "WriteFromClient",
            Self::UpdateFromReplica { .. } => "UpdateFromReplica",
            Self::Ack => "Ack",
            Self::Wait => "Wait",
            Self::SendNewReplica { .. } => "SendNewReplica",
            Self::RemoveOldReplica { .. } => "RemoveOldReplica",
        }
    }
}

#[cfg(test)]
mod messages_tests {
    use super::*;
    use crate::core::VectorClock;
    use crate::utils::CausalKvError;
    use rmp_serde::decode::from_slice as decode_from_slice;
    use rmp_serde::encode::to_vec as encode_to_vec;

    #[test]
    fn update_survives_encoding() -> Result<(), CausalKvError> {
        let from = Address::new("127.0.0.1", 40000);
        let msg = Message::UpdateFromReplica {
            update: Update::new(
                VectorClock::from([(from.key(), 2), ("127.0.0.1:40001".into(), 1)]),
                from,
                "x",
                "1",
            ),
            epoch: 4,
        };
        let bytes = encode_to_vec(&msg)?;
        let decoded: Message = decode_from_slice(&bytes)?;
        assert_eq!(decoded, msg);
        Ok(())
    }

    #[test]
    fn unit_variants_are_distinct() -> Result<(), CausalKvError> {
        let ack: Message = decode_from_slice(&encode_to_vec(&Message::Ack)?)?;
        let wait: Message = decode_from_slice(&encode_to_vec(&Message::Wait)?)?;
        assert_eq!(ack, Message::Ack);
        assert_eq!(wait, Message::Wait);
        assert_ne!(ack.kind(), wait.kind());
        Ok(())
    }
}
