//! Seams to the external connection-level transport.
//!
//! The router never looks inside a connection: it hands datagrams to an
//! opaque [`ServerTransport`] and learns about connection ids through the
//! worker callbacks. Everything here is contract, not implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use quicgate_proto::packet::HeaderForm;
use quicgate_proto::{ConnectionId, ServerConnectionIdParams, Version};

use crate::config::TransportSettings;
use crate::stats::TransportStatsCallback;
use crate::worker::WorkerHandle;
use crate::LocalError;

/// A received datagram and when it arrived.
#[derive(Debug, Clone)]
pub struct NetworkData {
    pub data: Bytes,
    pub receive_time: Instant,
}

impl NetworkData {
    pub fn new(data: Bytes, receive_time: Instant) -> Self {
        Self { data, receive_time }
    }
}

/// Structured digest of a header peek; everything routing needs, nothing
/// else.
#[derive(Debug, Clone)]
pub struct RoutingData {
    pub header_form: HeaderForm,
    pub is_initial: bool,
    /// Whether the destination CID is still the client-chosen one, i.e. the
    /// source-identity table may apply.
    pub is_using_client_cid: bool,
    pub dst_cid: ConnectionId,
    pub src_cid: Option<ConnectionId>,
    /// Wire version from the long header; short headers carry none.
    pub version: Option<Version>,
}

impl RoutingData {
    pub fn new(
        header_form: HeaderForm,
        is_initial: bool,
        is_using_client_cid: bool,
        dst_cid: ConnectionId,
        src_cid: Option<ConnectionId>,
        version: Option<Version>,
    ) -> Self {
        Self {
            header_form,
            is_initial,
            is_using_client_cid,
            dst_cid,
            src_cid,
            version,
        }
    }
}

/// Pre-handshake identity of a connection: peer address plus the
/// client-chosen destination CID. Disambiguates Initial retransmits before
/// any server-chosen CID exists.
pub type SourceIdentity = (SocketAddr, ConnectionId);

/// A connection id a transport owns, with its issuance sequence number.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionIdData {
    pub cid: ConnectionId,
    pub sequence: u64,
}

impl ConnectionIdData {
    pub fn new(cid: ConnectionId, sequence: u64) -> Self {
        Self { cid, sequence }
    }
}

/// Handle to one connection's transport state machine.
///
/// Implementations live outside this repository. All methods are invoked
/// from the owning worker's task; a transport is never migrated across
/// workers.
pub trait ServerTransport: Send + Sync {
    /// Deliver a datagram that routed to this connection.
    fn on_network_data(&self, peer: SocketAddr, data: NetworkData);
    /// The worker has admitted this connection.
    fn accept(&self);
    /// Tear the connection down.
    fn close(&self, reason: LocalError);
    /// Install or clear the worker the transport reports CID events to.
    fn set_routing_callback(&self, callback: Option<WorkerHandle>);
    fn set_server_connection_id_params(&self, params: ServerConnectionIdParams);
    fn set_transport_settings(&self, settings: TransportSettings);
    fn set_stats_callback(&self, stats: Option<Arc<dyn TransportStatsCallback>>);
    fn set_supported_versions(&self, versions: &[Version]);
    /// The destination CID the client chose for its first Initial, while it
    /// is still authoritative.
    fn client_chosen_dest_connection_id(&self) -> Option<ConnectionId>;
    /// The peer address the connection was accepted from.
    fn original_peer_address(&self) -> SocketAddr;
    fn has_shutdown(&self) -> bool;
}

/// Admission control seam: builds a transport for a new connection, or
/// declines under load. `version` is the one the client's Initial arrived
/// with, already checked against the supported set.
pub trait TransportFactory: Send + Sync {
    fn make(&self, peer: SocketAddr, version: Version) -> Option<Arc<dyn ServerTransport>>;
}
