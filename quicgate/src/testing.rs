//! Test doubles shared by the worker and supervisor tests.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use quicgate_proto::builder::{write_frame, RegularPacketBuilder};
use quicgate_proto::frame::{Frame, Stream};
use quicgate_proto::packet::LongType;
use quicgate_proto::{
    ConnectionId, PacketHeader, ServerConnectionIdParams, StreamId, Version,
    DEFAULT_UDP_SEND_PACKET_LEN,
};

use crate::config::TransportSettings;
use crate::socket::DatagramSocket;
use crate::stats::{PacketDropReason, TransportStatsCallback};
use crate::transport::{NetworkData, ServerTransport, TransportFactory};
use crate::worker::WorkerHandle;
use crate::LocalError;

/// Build a real long-header datagram with one stream frame, zero-padded at
/// the tail up to `min_len`.
pub(crate) fn long_packet(
    ty: LongType,
    version: Version,
    src_cid: ConnectionId,
    dst_cid: ConnectionId,
    min_len: usize,
) -> Bytes {
    let header = match ty {
        LongType::Initial => PacketHeader::initial(version, src_cid, dst_cid, 1, Bytes::new()),
        ty => PacketHeader::long(ty, version, src_cid, dst_cid, 1),
    };
    let mut builder = RegularPacketBuilder::new(DEFAULT_UDP_SEND_PACKET_LEN, header, 0);
    assert!(write_frame(
        Frame::Stream(Stream {
            id: StreamId(1),
            offset: 0,
            fin: true,
            data: Bytes::from_static(b"hello, world!"),
        }),
        &mut builder,
    ));
    let mut wire = builder.build().to_bytes().to_vec();
    // Routing only inspects the header; padding the datagram tail is enough
    // to satisfy size floors.
    while wire.len() < min_len {
        wire.push(0);
    }
    wire.into()
}

/// Recording transport; every trait call lands in a counter or a log.
pub(crate) struct TestTransport {
    peer: SocketAddr,
    received: Mutex<Vec<(SocketAddr, Bytes)>>,
    accepted: AtomicBool,
    closed: Mutex<Option<LocalError>>,
    close_count: AtomicUsize,
    routing_cleared: AtomicUsize,
    routing_set: AtomicUsize,
    routing_handle: Mutex<Option<WorkerHandle>>,
    client_cid: Mutex<Option<ConnectionId>>,
    cid_params: Mutex<Option<ServerConnectionIdParams>>,
    shutdown: AtomicBool,
}

impl TestTransport {
    pub fn new(peer: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            peer,
            received: Mutex::new(Vec::new()),
            accepted: AtomicBool::new(false),
            closed: Mutex::new(None),
            close_count: AtomicUsize::new(0),
            routing_cleared: AtomicUsize::new(0),
            routing_set: AtomicUsize::new(0),
            routing_handle: Mutex::new(None),
            client_cid: Mutex::new(None),
            cid_params: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn set_client_cid(&self, cid: ConnectionId) {
        *self.client_cid.lock().unwrap() = Some(cid);
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn last_received(&self) -> Option<(SocketAddr, Bytes)> {
        self.received.lock().unwrap().last().cloned()
    }

    pub fn accepted(&self) -> bool {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> Option<LocalError> {
        *self.closed.lock().unwrap()
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn routing_cleared(&self) -> usize {
        self.routing_cleared.load(Ordering::SeqCst)
    }

    pub fn routing_set(&self) -> usize {
        self.routing_set.load(Ordering::SeqCst)
    }

    pub fn cid_params(&self) -> Option<ServerConnectionIdParams> {
        *self.cid_params.lock().unwrap()
    }

    pub fn routing_handle(&self) -> Option<WorkerHandle> {
        self.routing_handle.lock().unwrap().clone()
    }
}

impl ServerTransport for TestTransport {
    fn on_network_data(&self, peer: SocketAddr, data: NetworkData) {
        self.received.lock().unwrap().push((peer, data.data));
    }

    fn accept(&self) {
        self.accepted.store(true, Ordering::SeqCst);
    }

    fn close(&self, reason: LocalError) {
        *self.closed.lock().unwrap() = Some(reason);
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn set_routing_callback(&self, callback: Option<WorkerHandle>) {
        match callback {
            Some(handle) => {
                *self.routing_handle.lock().unwrap() = Some(handle);
                self.routing_set.fetch_add(1, Ordering::SeqCst);
            }
            None => {
                self.routing_handle.lock().unwrap().take();
                self.routing_cleared.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn set_server_connection_id_params(&self, params: ServerConnectionIdParams) {
        *self.cid_params.lock().unwrap() = Some(params);
    }

    fn set_transport_settings(&self, _settings: TransportSettings) {}

    fn set_stats_callback(&self, _stats: Option<Arc<dyn TransportStatsCallback>>) {}

    fn set_supported_versions(&self, _versions: &[Version]) {}

    fn client_chosen_dest_connection_id(&self) -> Option<ConnectionId> {
        *self.client_cid.lock().unwrap()
    }

    fn original_peer_address(&self) -> SocketAddr {
        self.peer
    }

    fn has_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Factory backed by a queue of prepared transports; an empty queue models
/// shedding.
#[derive(Default)]
pub(crate) struct TestFactory {
    queue: Mutex<Vec<Arc<TestTransport>>>,
    last_version: Mutex<Option<Version>>,
}

impl TestFactory {
    pub fn push(&self, transport: Arc<TestTransport>) {
        self.queue.lock().unwrap().push(transport);
    }

    pub fn ready(&self) -> bool {
        !self.queue.lock().unwrap().is_empty()
    }

    pub fn last_version(&self) -> Option<Version> {
        *self.last_version.lock().unwrap()
    }
}

impl TransportFactory for TestFactory {
    fn make(&self, _peer: SocketAddr, version: Version) -> Option<Arc<dyn ServerTransport>> {
        *self.last_version.lock().unwrap() = Some(version);
        let transport = self.queue.lock().unwrap().pop()?;
        Some(transport)
    }
}

/// Counter sink exposing everything the worker tests assert on.
#[derive(Default)]
pub(crate) struct StatsRecorder {
    drops: Mutex<Vec<PacketDropReason>>,
    packets_received: AtomicUsize,
    packets_sent: AtomicUsize,
    stateless_resets: AtomicUsize,
    new_connections: AtomicUsize,
    connection_closes: AtomicUsize,
    client_initials: AtomicUsize,
    packets_processed: AtomicUsize,
    packets_forwarded: AtomicUsize,
    forwarded_received: AtomicUsize,
    forwarded_processed: AtomicUsize,
}

impl StatsRecorder {
    pub fn drops(&self) -> Vec<PacketDropReason> {
        self.drops.lock().unwrap().clone()
    }

    pub fn packets_received(&self) -> usize {
        self.packets_received.load(Ordering::SeqCst)
    }

    pub fn packets_sent(&self) -> usize {
        self.packets_sent.load(Ordering::SeqCst)
    }

    pub fn stateless_resets(&self) -> usize {
        self.stateless_resets.load(Ordering::SeqCst)
    }

    pub fn new_connections(&self) -> usize {
        self.new_connections.load(Ordering::SeqCst)
    }

    pub fn connection_closes(&self) -> usize {
        self.connection_closes.load(Ordering::SeqCst)
    }

    pub fn client_initials(&self) -> usize {
        self.client_initials.load(Ordering::SeqCst)
    }

    pub fn packets_processed(&self) -> usize {
        self.packets_processed.load(Ordering::SeqCst)
    }

    pub fn packets_forwarded(&self) -> usize {
        self.packets_forwarded.load(Ordering::SeqCst)
    }

    pub fn forwarded_received(&self) -> usize {
        self.forwarded_received.load(Ordering::SeqCst)
    }

    pub fn forwarded_processed(&self) -> usize {
        self.forwarded_processed.load(Ordering::SeqCst)
    }
}

impl TransportStatsCallback for StatsRecorder {
    fn on_packet_received(&self) {
        self.packets_received.fetch_add(1, Ordering::SeqCst);
    }

    fn on_packet_dropped(&self, reason: PacketDropReason) {
        self.drops.lock().unwrap().push(reason);
    }

    fn on_packet_sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::SeqCst);
    }

    fn on_stateless_reset(&self) {
        self.stateless_resets.fetch_add(1, Ordering::SeqCst);
    }

    fn on_new_connection(&self) {
        self.new_connections.fetch_add(1, Ordering::SeqCst);
    }

    fn on_connection_close(&self) {
        self.connection_closes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_client_initial_received(&self) {
        self.client_initials.fetch_add(1, Ordering::SeqCst);
    }

    fn on_packet_processed(&self) {
        self.packets_processed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_packet_forwarded(&self) {
        self.packets_forwarded.fetch_add(1, Ordering::SeqCst);
    }

    fn on_forwarded_packet_received(&self) {
        self.forwarded_received.fetch_add(1, Ordering::SeqCst);
    }

    fn on_forwarded_packet_processed(&self) {
        self.forwarded_processed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Captures writes instead of touching the network.
pub(crate) struct TestSocket {
    addr: SocketAddr,
    written: Mutex<Vec<(SocketAddr, Bytes)>>,
}

impl TestSocket {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            written: Mutex::new(Vec::new()),
        }
    }

    pub fn written_count(&self) -> usize {
        self.written.lock().unwrap().len()
    }

    pub fn last_written(&self) -> Option<(SocketAddr, Bytes)> {
        self.written.lock().unwrap().last().cloned()
    }
}

impl DatagramSocket for TestSocket {
    fn try_send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.written
            .lock()
            .unwrap()
            .push((addr, Bytes::copy_from_slice(data)));
        Ok(data.len())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}
