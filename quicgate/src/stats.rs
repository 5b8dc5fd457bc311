//! Per-worker transport statistics.
//!
//! Counters only; no aggregation or export. Every method has an empty
//! default body so recorders implement what they care about.

use std::fmt;
use std::sync::Arc;

/// Why a datagram was dropped instead of dispatched.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PacketDropReason {
    /// The destination CID names a different host.
    RoutingErrorWrongHost,
    /// No transport owns the destination CID or source identity.
    ConnectionNotFound,
    /// The transport factory declined to build one (load shedding).
    CannotMakeTransport,
    /// The worker is shut down and refuses all work.
    ServerShutdown,
    /// Client Initial below the minimum datagram size.
    InitialPacketSizeTooSmall,
    /// Header failed to parse.
    InvalidPacketHeader,
    /// The destination CID could not be interpreted by the CID algorithm.
    ParseError,
    /// A known source identity reappeared from a different peer address.
    PeerAddressChange,
    /// Cross-worker handoff queue was full.
    WorkerQueueFull,
}

impl fmt::Display for PacketDropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Counter sink for everything a worker observes.
pub trait TransportStatsCallback: Send + Sync {
    fn on_packet_received(&self) {}
    fn on_read(&self, _bytes: usize) {}
    fn on_packet_forwarded(&self) {}
    fn on_forwarded_packet_received(&self) {}
    fn on_forwarded_packet_processed(&self) {}
    fn on_packet_dropped(&self, _reason: PacketDropReason) {}
    fn on_packet_sent(&self) {}
    fn on_write(&self, _bytes: usize) {}
    fn on_stateless_reset(&self) {}
    fn on_new_connection(&self) {}
    fn on_connection_close(&self) {}
    fn on_client_initial_received(&self) {}
    fn on_packet_processed(&self) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl TransportStatsCallback for NoopStats {}

/// Builds one stats callback per worker.
pub trait TransportStatsCallbackFactory: Send + Sync {
    fn make(&self) -> Arc<dyn TransportStatsCallback>;
}

impl<F> TransportStatsCallbackFactory for F
where
    F: Fn() -> Arc<dyn TransportStatsCallback> + Send + Sync,
{
    fn make(&self) -> Arc<dyn TransportStatsCallback> {
        self()
    }
}
