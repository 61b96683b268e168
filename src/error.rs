//! Module that contains the errors a peer can run into.

use crate::{
    clock::LogicalTimestamp,
    message::{PeerId, Request},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExclusionError {
    #[error("Transport failure talking to peer {peer}: {source}")]
    Transport {
        peer: PeerId,
        #[source]
        source: std::io::Error,
    },
    #[error("Protocol invariant violated: {0}")]
    InvariantViolation(#[from] Violation),
    #[error("The peer is shutting down and accepts no new entries")]
    ShuttingDown,
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Enum that represents the ways the protocol can be broken by a buggy or foreign peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("peer {0} received a request from itself")]
    SelfRequest(PeerId),
    #[error("message from unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("asked peer {expected} but peer {actual} replied")]
    UnexpectedResponder { expected: PeerId, actual: PeerId },
    #[error("{0} clashes with a request already in progress")]
    DuplicateRequest(Request),
    #[error("a new request was started while another one is in progress")]
    NotIdle,
    #[error("tried to enter the critical section without a pending request")]
    NotRequesting,
    #[error("tried to leave the critical section without being in it")]
    NotInSection,
    #[error("the logical clock cannot advance past {0}")]
    ClockOverflow(LogicalTimestamp),
    #[error("peer {peer} refused the request: {reason}")]
    Refused { peer: PeerId, reason: String },
}

impl ExclusionError {
    pub fn transport(peer: PeerId, source: std::io::Error) -> Self {
        Self::Transport { peer, source }
    }
}
