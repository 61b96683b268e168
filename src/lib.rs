//! Ricart-Agrawala mutual exclusion between symmetric peers.
//!
//! Each peer runs a [`coordinator::Coordinator`]. To enter the critical section
//! a peer stamps a [`message::Request`] with its Lamport clock, sends it to every
//! other peer and waits for all of them to reply. Peers answer requests through
//! the [`server::Server`] and hold their reply back while they are using the
//! section, or while their own pending request comes first.

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod log;
pub mod message;
pub mod operation;
pub mod peer;
pub mod poisson;
pub mod server;
pub mod sync;

pub use clock::{LogicalClock, LogicalTimestamp};
pub use coordinator::{Coordinator, PeerHandle, PeerRegistry};
pub use error::{ExclusionError, Violation};
pub use message::{PeerId, Reply, Request, Response};
pub use operation::{CriticalSectionRunner, RestrictedFunction};

/// Default number of automatic entries per second.
pub const RATE: f64 = 1.;
