//! Multi-worker QUIC server datagram router.
//!
//! Each worker owns one UDP socket and one set of routing tables, pinned to
//! its own task; datagrams that arrive on the wrong thread are handed off by
//! destination connection id. A sideband takeover socket lets two server
//! processes share a port during binary rollout, the newer instance
//! forwarding the older instance's in-flight connections back to it.
//!
//! The wire codec lives in [`quicgate_proto`]; the connection-level transport
//! state machine and all cryptography are external collaborators reached
//! through the traits in [`transport`] and [`quicgate_proto::crypto`].

use thiserror::Error;

pub mod config;
pub mod server;
pub mod socket;
pub mod stats;
pub mod takeover;
pub mod transport;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use crate::config::TransportSettings;
pub use crate::server::Server;
pub use crate::stats::{PacketDropReason, TransportStatsCallback, TransportStatsCallbackFactory};
pub use crate::transport::{NetworkData, RoutingData, ServerTransport, TransportFactory};
pub use crate::worker::{ServerWorker, WorkerHandle};

/// Errors that never appear on the wire; converted to drop counters or a
/// local close reason.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum LocalError {
    #[error("shutting down")]
    ShuttingDown,
    #[error("cannot make transport")]
    CannotMakeTransport,
    #[error("internal error")]
    Internal,
}
