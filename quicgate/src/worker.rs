//! Per-thread datagram demultiplexer.
//!
//! A worker owns one UDP socket and two routing tables, and is only ever
//! touched from its own task. Datagrams are classified by a header peek,
//! then dispatched to a transport, routed to another worker, forwarded to a
//! peer server process, answered with a stateless reset, or dropped with a
//! categorized reason.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use quicgate_proto::builder::{build_stateless_reset, build_version_negotiation};
use quicgate_proto::cid::{ConnectionIdAlgo, RoutableConnectionIdAlgo, ROUTABLE_CID_LEN};
use quicgate_proto::packet::{
    header_form, parse_long_header_invariant, parse_long_header_variant,
    parse_short_header_invariant, HeaderForm, LongHeaderInvariant, LongType,
};
use quicgate_proto::{
    ConnectionId, ProcessId, ServerConnectionIdParams, StatelessResetToken, Version,
    DEFAULT_UDP_SEND_PACKET_LEN, MIN_INITIAL_DST_CID_LEN, MIN_INITIAL_PACKET_SIZE,
};

use crate::config::TransportSettings;
use crate::socket::DatagramSocket;
use crate::stats::{NoopStats, PacketDropReason, TransportStatsCallback};
use crate::takeover::{decode_forwarded_packet, encode_forwarded_packet, receive_instant};
use crate::transport::{
    ConnectionIdData, NetworkData, RoutingData, ServerTransport, SourceIdentity, TransportFactory,
};
use crate::LocalError;

/// Depth of each worker's cross-thread handoff queue.
pub(crate) const WORKER_QUEUE_DEPTH: usize = 1024;

/// Stateless resets are clamped into `[MIN_STATELESS_RESET_SIZE,
/// DEFAULT_UDP_SEND_PACKET_LEN]` and never exceed the inciting datagram above
/// that floor.
const MIN_STATELESS_RESET_SIZE: usize = 41;

/// Cap on the rejected-CID grace set.
const REJECTED_CID_CAPACITY: usize = 64 * 1024;

/// Work delivered to a worker from other threads.
pub enum WorkerEvent {
    Packet {
        peer: SocketAddr,
        routing: RoutingData,
        network: NetworkData,
        is_forwarded: bool,
    },
    /// A raw takeover-socket datagram, envelope still attached.
    Forwarded(Bytes),
    ConnectionIdAvailable {
        transport: Arc<dyn ServerTransport>,
        cid: ConnectionId,
    },
    ConnectionIdBound {
        transport: Arc<dyn ServerTransport>,
    },
    ConnectionUnbound {
        transport: Arc<dyn ServerTransport>,
        source: SourceIdentity,
        cids: Vec<ConnectionIdData>,
    },
    SetHealthCheckToken(Option<Bytes>),
    RejectNewConnections(bool),
    StartPacketForwarding(SocketAddr),
    StopPacketForwarding,
}

/// Cloneable mailbox for a worker; how transports (and the supervisor) reach
/// it from other threads.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<WorkerEvent>,
}

impl WorkerHandle {
    pub(crate) fn new(tx: mpsc::Sender<WorkerEvent>) -> Self {
        Self { tx }
    }

    pub fn on_connection_id_available(&self, transport: Arc<dyn ServerTransport>, cid: ConnectionId) {
        self.post(WorkerEvent::ConnectionIdAvailable { transport, cid });
    }

    pub fn on_connection_id_bound(&self, transport: Arc<dyn ServerTransport>) {
        self.post(WorkerEvent::ConnectionIdBound { transport });
    }

    pub fn on_connection_unbound(
        &self,
        transport: Arc<dyn ServerTransport>,
        source: SourceIdentity,
        cids: Vec<ConnectionIdData>,
    ) {
        self.post(WorkerEvent::ConnectionUnbound {
            transport,
            source,
            cids,
        });
    }

    pub(crate) fn post(&self, event: WorkerEvent) {
        if self.tx.try_send(event).is_err() {
            warn!("worker queue full, control event lost");
        }
    }
}

/// Where a routed datagram ended up.
pub enum RouteOutcome {
    /// The caller is the owning worker; dispatch in place.
    Local(RoutingData, NetworkData),
    /// Posted to the owning worker's queue.
    Posted,
    /// The owning worker's queue was full.
    Dropped,
}

/// Cross-worker routing, implemented by the supervisor.
pub trait WorkerCallback: Send + Sync {
    fn route_data_to_worker(
        &self,
        source_worker_id: u8,
        peer: SocketAddr,
        routing: RoutingData,
        network: NetworkData,
        is_forwarded: bool,
    ) -> RouteOutcome;
}

/// CIDs of recently departed transports, kept for a grace window so stray
/// packets draw stateless resets. Bounded; oldest entries fall out first.
#[derive(Default)]
struct RejectedCidSet {
    set: FxHashSet<ConnectionId>,
    order: VecDeque<ConnectionId>,
}

impl RejectedCidSet {
    fn insert(&mut self, cid: ConnectionId) {
        if self.set.insert(cid) {
            self.order.push_back(cid);
            while self.order.len() > REJECTED_CID_CAPACITY {
                if let Some(evicted) = self.order.pop_front() {
                    self.set.remove(&evicted);
                }
            }
        }
    }

    fn remove(&mut self, cid: &ConnectionId) {
        // Stale queue entries are skipped at eviction time.
        self.set.remove(cid);
    }

    fn contains(&self, cid: &ConnectionId) -> bool {
        self.set.contains(cid)
    }
}

struct PacketForwarder {
    socket: Arc<dyn DatagramSocket>,
    dest: SocketAddr,
}

/// One worker's routing state. All methods run on the owning task.
pub struct ServerWorker {
    worker_id: u8,
    host_id: u16,
    process_id: ProcessId,
    socket: Option<Arc<dyn DatagramSocket>>,
    takeover_socket: Option<Arc<dyn DatagramSocket>>,
    forwarding: Option<PacketForwarder>,
    supported_versions: Vec<Version>,
    health_check_token: Option<Bytes>,
    conn_id_algo: Arc<dyn ConnectionIdAlgo>,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    stats: Arc<dyn TransportStatsCallback>,
    settings: TransportSettings,
    callback: Option<Arc<dyn WorkerCallback>>,
    handle: Option<WorkerHandle>,
    src_to_transport: FxHashMap<SourceIdentity, Arc<dyn ServerTransport>>,
    conn_id_map: FxHashMap<ConnectionId, Arc<dyn ServerTransport>>,
    rejected_cids: RejectedCidSet,
    /// Reset tokens precomputed when a CID is published, so emitting a reset
    /// on the drop path costs a lookup, not an HMAC.
    reset_tokens: FxHashMap<ConnectionId, StatelessResetToken>,
    reject_new_connections: bool,
    is_shut_down: bool,
}

fn same_transport(a: &Arc<dyn ServerTransport>, b: &Arc<dyn ServerTransport>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl ServerWorker {
    pub fn new(worker_id: u8) -> Self {
        Self {
            worker_id,
            host_id: 0,
            process_id: ProcessId::Zero,
            socket: None,
            takeover_socket: None,
            forwarding: None,
            supported_versions: vec![Version::QUIC_V1],
            health_check_token: None,
            conn_id_algo: Arc::new(RoutableConnectionIdAlgo),
            transport_factory: None,
            stats: Arc::new(NoopStats),
            settings: TransportSettings::default(),
            callback: None,
            handle: None,
            src_to_transport: FxHashMap::default(),
            conn_id_map: FxHashMap::default(),
            rejected_cids: RejectedCidSet::default(),
            reset_tokens: FxHashMap::default(),
            reject_new_connections: false,
            is_shut_down: false,
        }
    }

    pub fn worker_id(&self) -> u8 {
        self.worker_id
    }

    pub fn set_worker_id(&mut self, worker_id: u8) {
        self.worker_id = worker_id;
    }

    pub fn set_socket(&mut self, socket: Arc<dyn DatagramSocket>) {
        self.socket = Some(socket);
    }

    pub fn set_host_id(&mut self, host_id: u16) {
        self.host_id = host_id;
    }

    pub fn set_process_id(&mut self, process_id: ProcessId) {
        self.process_id = process_id;
    }

    pub fn set_supported_versions(&mut self, versions: Vec<Version>) {
        self.supported_versions = versions;
    }

    pub fn set_health_check_token(&mut self, token: Option<Bytes>) {
        self.health_check_token = token;
    }

    pub fn set_connection_id_algo(&mut self, algo: Arc<dyn ConnectionIdAlgo>) {
        self.conn_id_algo = algo;
    }

    pub fn set_transport_factory(&mut self, factory: Arc<dyn TransportFactory>) {
        self.transport_factory = Some(factory);
    }

    pub fn set_transport_stats_callback(&mut self, stats: Arc<dyn TransportStatsCallback>) {
        self.stats = stats;
    }

    pub fn set_transport_settings(&mut self, settings: TransportSettings) {
        self.settings = settings;
    }

    pub fn set_worker_callback(&mut self, callback: Arc<dyn WorkerCallback>) {
        self.callback = Some(callback);
    }

    pub fn set_handle(&mut self, handle: WorkerHandle) {
        self.handle = Some(handle);
    }

    pub fn set_reject_new_connections(&mut self, reject: bool) {
        self.reject_new_connections = reject;
    }

    /// Register the sideband socket a peer process may forward our
    /// connections' datagrams to.
    pub fn set_takeover_socket(&mut self, socket: Arc<dyn DatagramSocket>) -> io::Result<SocketAddr> {
        let addr = socket.local_addr()?;
        self.takeover_socket = Some(socket);
        Ok(addr)
    }

    pub fn takeover_address(&self) -> Option<SocketAddr> {
        self.takeover_socket
            .as_ref()
            .and_then(|s| s.local_addr().ok())
    }

    /// Begin forwarding unclaimed datagrams to a peer server process.
    pub fn set_packet_forwarding(&mut self, socket: Arc<dyn DatagramSocket>, dest: SocketAddr) {
        self.forwarding = Some(PacketForwarder { socket, dest });
    }

    pub fn stop_packet_forwarding(&mut self) {
        self.forwarding = None;
    }

    /// Whether `cid` is unavailable for issuance: either currently routed or
    /// still inside the rejected-CID grace window.
    pub fn reject_connection_id(&self, cid: &ConnectionId) -> bool {
        self.conn_id_map.contains_key(cid) || self.rejected_cids.contains(cid)
    }

    /// Process one event from the handoff queue.
    pub fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Packet {
                peer,
                routing,
                network,
                is_forwarded,
            } => self.dispatch_packet_data(peer, routing, network, is_forwarded),
            WorkerEvent::Forwarded(data) => self.process_forwarded_packet(data),
            WorkerEvent::ConnectionIdAvailable { transport, cid } => {
                self.on_connection_id_available(transport, cid)
            }
            WorkerEvent::ConnectionIdBound { transport } => {
                self.on_connection_id_bound(&transport)
            }
            WorkerEvent::ConnectionUnbound {
                transport,
                source,
                cids,
            } => self.on_connection_unbound(&transport, source, cids),
            WorkerEvent::SetHealthCheckToken(token) => self.health_check_token = token,
            WorkerEvent::RejectNewConnections(reject) => self.reject_new_connections = reject,
            WorkerEvent::StartPacketForwarding(dest) => match bind_forwarding_socket(dest) {
                Ok(socket) => self.set_packet_forwarding(Arc::new(socket), dest),
                Err(err) => warn!(%err, "failed to bind packet-forwarding socket"),
            },
            WorkerEvent::StopPacketForwarding => self.stop_packet_forwarding(),
        }
    }

    /// Entry point for datagrams read off this worker's socket.
    pub fn handle_network_data(&mut self, peer: SocketAddr, data: Bytes, receive_time: Instant) {
        self.stats.on_packet_received();
        self.stats.on_read(data.len());
        self.classify_and_route(peer, data, receive_time, false);
    }

    /// Entry point for datagrams read off the takeover socket.
    pub fn process_forwarded_packet(&mut self, data: Bytes) {
        self.stats.on_forwarded_packet_received();
        match decode_forwarded_packet(data) {
            Ok(packet) => {
                self.stats.on_forwarded_packet_processed();
                let receive_time = receive_instant(packet.received);
                self.classify_and_route(packet.peer, packet.payload, receive_time, true);
            }
            Err(err) => {
                debug!(%err, "discarding malformed takeover envelope");
                self.drop_packet(PacketDropReason::InvalidPacketHeader);
            }
        }
    }

    fn classify_and_route(
        &mut self,
        peer: SocketAddr,
        data: Bytes,
        receive_time: Instant,
        is_forwarded: bool,
    ) {
        if self.is_shut_down {
            return self.drop_packet(PacketDropReason::ServerShutdown);
        }
        if let Some(token) = &self.health_check_token {
            if data.as_ref() == token.as_ref() {
                trace!(worker_id = self.worker_id, "health check probe");
                self.send_packet(peer, b"OK");
                return;
            }
        }
        if data.is_empty() {
            return self.drop_packet(PacketDropReason::InvalidPacketHeader);
        }

        let initial_byte = data[0];
        match header_form(initial_byte) {
            HeaderForm::Short => {
                let mut buf = data.slice(1..);
                let invariant =
                    match parse_short_header_invariant(initial_byte, &mut buf, ROUTABLE_CID_LEN) {
                        Ok(invariant) => invariant,
                        Err(err) => {
                            trace!(%err, "unroutable short header");
                            return self.drop_packet(PacketDropReason::InvalidPacketHeader);
                        }
                    };
                let routing = RoutingData::new(
                    HeaderForm::Short,
                    false,
                    false,
                    invariant.dst_cid,
                    None,
                    None,
                );
                self.route(peer, routing, NetworkData::new(data, receive_time), is_forwarded);
            }
            HeaderForm::Long => {
                let mut buf = data.slice(1..);
                let parsed = match parse_long_header_invariant(initial_byte, &mut buf) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        trace!(%err, "unroutable long header");
                        return self.drop_packet(PacketDropReason::InvalidPacketHeader);
                    }
                };
                let ty = LongType::from_initial_byte(initial_byte);
                if ty == LongType::Initial {
                    self.stats.on_client_initial_received();
                }
                let version = parsed.invariant.version;
                if version == Version::NEGOTIATION || !self.supported_versions.contains(&version) {
                    trace!(%version, "version not supported, negotiating");
                    return self.send_version_negotiation(peer, &parsed.invariant);
                }
                if ty == LongType::Initial && self.reject_new_connections {
                    // The invalid marker tells well-behaved clients to give
                    // up rather than retry against a draining instance.
                    return self.send_version_negotiation(peer, &parsed.invariant);
                }
                let dst_cid = parsed.invariant.dst_cid;
                let src_cid = parsed.invariant.src_cid;
                if ty == LongType::Initial && dst_cid.len() < MIN_INITIAL_DST_CID_LEN {
                    return self.send_version_negotiation(peer, &parsed.invariant);
                }
                if let Err(err) = parse_long_header_variant(parsed, &mut buf) {
                    trace!(%err, "malformed long header");
                    return self.drop_packet(PacketDropReason::InvalidPacketHeader);
                }
                let routing = RoutingData::new(
                    HeaderForm::Long,
                    ty == LongType::Initial,
                    matches!(ty, LongType::Initial | LongType::ZeroRtt),
                    dst_cid,
                    Some(src_cid),
                    Some(version),
                );
                self.route(peer, routing, NetworkData::new(data, receive_time), is_forwarded);
            }
        }
    }

    fn route(
        &mut self,
        peer: SocketAddr,
        routing: RoutingData,
        network: NetworkData,
        is_forwarded: bool,
    ) {
        let callback = self.callback.clone();
        match callback {
            Some(cb) => {
                match cb.route_data_to_worker(self.worker_id, peer, routing, network, is_forwarded)
                {
                    RouteOutcome::Local(routing, network) => {
                        self.dispatch_packet_data(peer, routing, network, is_forwarded)
                    }
                    RouteOutcome::Posted => {}
                    RouteOutcome::Dropped => {
                        self.drop_packet(PacketDropReason::WorkerQueueFull)
                    }
                }
            }
            None => self.dispatch_packet_data(peer, routing, network, is_forwarded),
        }
    }

    /// Route one datagram whose header digest is already extracted. At most
    /// one transport sees it.
    pub fn dispatch_packet_data(
        &mut self,
        peer: SocketAddr,
        routing: RoutingData,
        network: NetworkData,
        is_forwarded: bool,
    ) {
        if self.is_shut_down {
            return self.drop_packet(PacketDropReason::ServerShutdown);
        }

        // Server-chosen CIDs are authoritative once present.
        if let Some(transport) = self.conn_id_map.get(&routing.dst_cid) {
            self.stats.on_packet_processed();
            transport.on_network_data(peer, network);
            return;
        }

        // Pre-handshake retransmits still carry the client-chosen CID.
        if routing.is_using_client_cid {
            let source: SourceIdentity = (peer, routing.dst_cid);
            if let Some(transport) = self.src_to_transport.get(&source) {
                if transport.original_peer_address() != peer {
                    return self.drop_packet(PacketDropReason::PeerAddressChange);
                }
                self.stats.on_packet_processed();
                transport.on_network_data(peer, network);
                return;
            }
        }

        if routing.is_initial && !self.reject_new_connections {
            return self.try_create_transport(peer, routing, network);
        }

        self.handle_unroutable(peer, routing, network, is_forwarded);
    }

    fn try_create_transport(
        &mut self,
        peer: SocketAddr,
        routing: RoutingData,
        network: NetworkData,
    ) {
        if network.data.len() < MIN_INITIAL_PACKET_SIZE {
            trace!(len = network.data.len(), "initial below minimum size");
            return self.drop_packet(PacketDropReason::InitialPacketSizeTooSmall);
        }
        if routing.dst_cid.len() < MIN_INITIAL_DST_CID_LEN {
            return self.drop_packet(PacketDropReason::InvalidPacketHeader);
        }
        // Initials always arrive in long headers, so the version is known.
        let Some(version) = routing.version else {
            return self.drop_packet(PacketDropReason::InvalidPacketHeader);
        };
        let Some(factory) = self.transport_factory.clone() else {
            return self.drop_packet(PacketDropReason::CannotMakeTransport);
        };
        let Some(transport) = factory.make(peer, version) else {
            // Shedding: the factory declined.
            return self.drop_packet(PacketDropReason::CannotMakeTransport);
        };
        transport.set_routing_callback(self.handle.clone());
        transport.set_supported_versions(&self.supported_versions);
        transport.set_transport_settings(self.settings.clone());
        transport.set_server_connection_id_params(ServerConnectionIdParams::new(
            self.host_id,
            self.process_id,
            self.worker_id,
        ));
        transport.set_stats_callback(Some(self.stats.clone()));
        transport.accept();
        trace!(cid = %routing.dst_cid, %peer, "accepted connection");
        self.src_to_transport
            .insert((peer, routing.dst_cid), transport.clone());
        self.stats.on_packet_processed();
        transport.on_network_data(peer, network);
    }

    fn handle_unroutable(
        &mut self,
        peer: SocketAddr,
        routing: RoutingData,
        network: NetworkData,
        is_forwarded: bool,
    ) {
        // Grace window: CIDs of departed transports still answer with resets.
        if self.rejected_cids.contains(&routing.dst_cid) {
            if routing.header_form == HeaderForm::Short {
                self.send_reset_packet(peer, &routing.dst_cid, network.data.len());
            }
            return self.drop_packet(PacketDropReason::ConnectionNotFound);
        }

        if self.conn_id_algo.can_parse(&routing.dst_cid) {
            let params = match self.conn_id_algo.parse(&routing.dst_cid) {
                Ok(params) => params,
                Err(err) => {
                    debug!(%err, cid = %routing.dst_cid, "failed to parse routable cid");
                    return self.drop_packet(PacketDropReason::ParseError);
                }
            };
            if params.host_id != self.host_id {
                // Long-header packets drop silently: a reset would let a
                // spoofed source turn one datagram into two.
                if routing.header_form == HeaderForm::Short {
                    self.send_reset_packet(peer, &routing.dst_cid, network.data.len());
                }
                return self.drop_packet(PacketDropReason::RoutingErrorWrongHost);
            }
            if params.process_id != self.process_id
                && !routing.is_initial
                && !is_forwarded
                && self.forward_packet(peer, &network)
            {
                return;
            }
        }

        if routing.header_form == HeaderForm::Short && !routing.dst_cid.is_empty() {
            self.send_reset_packet(peer, &routing.dst_cid, network.data.len());
        }
        self.drop_packet(PacketDropReason::ConnectionNotFound);
    }

    fn forward_packet(&mut self, peer: SocketAddr, network: &NetworkData) -> bool {
        let Some(forwarder) = &self.forwarding else {
            return false;
        };
        let age = network.receive_time.elapsed();
        let received = SystemTime::now()
            .checked_sub(age)
            .unwrap_or_else(SystemTime::now);
        let envelope = encode_forwarded_packet(peer, received, &network.data);
        match forwarder.socket.try_send_to(&envelope, forwarder.dest) {
            Ok(_) => {
                trace!(%peer, dest = %forwarder.dest, "forwarded packet to peer server");
                self.stats.on_packet_forwarded();
                true
            }
            Err(err) => {
                debug!(%err, "takeover forward failed");
                false
            }
        }
    }

    /// A transport published a server-chosen CID; it becomes routable here.
    pub fn on_connection_id_available(
        &mut self,
        transport: Arc<dyn ServerTransport>,
        cid: ConnectionId,
    ) {
        trace!(%cid, worker_id = self.worker_id, "connection id available");
        if let Some(existing) = self.conn_id_map.get(&cid) {
            if !same_transport(existing, &transport) {
                warn!(%cid, "connection id already routed to another transport");
            }
            return;
        }
        let is_first_cid = !self
            .conn_id_map
            .values()
            .any(|t| same_transport(t, &transport));
        self.reset_tokens.insert(
            cid,
            StatelessResetToken::new(&self.settings.stateless_reset_secret, &cid),
        );
        self.rejected_cids.remove(&cid);
        self.conn_id_map.insert(cid, transport);
        if is_first_cid {
            self.stats.on_new_connection();
        }
    }

    /// The client-chosen CID is no longer authoritative for this transport.
    pub fn on_connection_id_bound(&mut self, transport: &Arc<dyn ServerTransport>) {
        if let Some(client_cid) = transport.client_chosen_dest_connection_id() {
            let source = (transport.original_peer_address(), client_cid);
            self.src_to_transport.remove(&source);
        }
    }

    /// A transport is going away; purge every route to it before it drops.
    pub fn on_connection_unbound(
        &mut self,
        transport: &Arc<dyn ServerTransport>,
        source: SourceIdentity,
        cids: Vec<ConnectionIdData>,
    ) {
        trace!(worker_id = self.worker_id, "connection unbound");
        transport.set_routing_callback(None);
        for cid_data in &cids {
            self.conn_id_map.remove(&cid_data.cid);
            self.reset_tokens.remove(&cid_data.cid);
            self.rejected_cids.insert(cid_data.cid);
        }
        self.src_to_transport.remove(&source);
        self.stats.on_connection_close();
    }

    /// Refuse new work and close every transport.
    pub fn shutdown_all_connections(&mut self, reason: LocalError) {
        if self.is_shut_down {
            return;
        }
        self.is_shut_down = true;
        self.reject_new_connections = true;
        let mut transports: Vec<Arc<dyn ServerTransport>> = Vec::new();
        for transport in self
            .conn_id_map
            .values()
            .chain(self.src_to_transport.values())
        {
            if !transports.iter().any(|t| same_transport(t, transport)) {
                transports.push(transport.clone());
            }
        }
        for transport in transports {
            transport.set_routing_callback(None);
            transport.set_stats_callback(None);
            if !transport.has_shutdown() {
                transport.close(reason);
            }
        }
        self.conn_id_map.clear();
        self.src_to_transport.clear();
        self.reset_tokens.clear();
        debug!(worker_id = self.worker_id, "worker shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.is_shut_down
    }

    fn send_version_negotiation(&mut self, peer: SocketAddr, invariant: &LongHeaderInvariant) {
        let versions: Vec<Version> = if self.reject_new_connections {
            vec![Version::RESERVED_INVALID]
        } else {
            self.supported_versions.clone()
        };
        // The client's source CID becomes the destination, and vice versa.
        let packet = build_version_negotiation(&invariant.src_cid, &invariant.dst_cid, &versions);
        if self.send_packet(peer, &packet) {
            self.stats.on_packet_processed();
        }
    }

    fn send_reset_packet(&mut self, peer: SocketAddr, dst_cid: &ConnectionId, inciting_len: usize) {
        let token = self
            .reset_tokens
            .get(dst_cid)
            .copied()
            .unwrap_or_else(|| {
                StatelessResetToken::new(&self.settings.stateless_reset_secret, dst_cid)
            });
        let max_size = inciting_len
            .max(MIN_STATELESS_RESET_SIZE)
            .min(DEFAULT_UDP_SEND_PACKET_LEN);
        let packet = build_stateless_reset(max_size, &token);
        if self.send_packet(peer, &packet) {
            self.stats.on_stateless_reset();
        }
    }

    fn send_packet(&self, peer: SocketAddr, data: &[u8]) -> bool {
        let Some(socket) = &self.socket else {
            debug!("no socket bound, dropping outgoing packet");
            return false;
        };
        match socket.try_send_to(data, peer) {
            Ok(written) => {
                self.stats.on_write(written);
                self.stats.on_packet_sent();
                true
            }
            Err(err) => {
                debug!(%err, %peer, "udp write failed");
                false
            }
        }
    }

    fn drop_packet(&self, reason: PacketDropReason) {
        trace!(worker_id = self.worker_id, %reason, "dropping packet");
        self.stats.on_packet_dropped(reason);
    }
}

fn bind_forwarding_socket(dest: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let bind_addr: SocketAddr = if dest.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    std::net::UdpSocket::bind(bind_addr)
}
