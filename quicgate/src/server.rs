//! Multi-worker supervisor.
//!
//! The supervisor owns N workers, each pinned to its own task with its own
//! SO_REUSEPORT socket and a bounded handoff queue. Datagrams that land on
//! the wrong worker are re-routed by the worker id encoded in the
//! destination CID, falling back to a hash of the CID bytes. It also owns
//! the takeover socket: the sideband a peer server process uses to hand our
//! connections' datagrams back to us during rollout.

use std::hash::{Hash, Hasher};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rustc_hash::FxHasher;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use quicgate_proto::cid::{ConnectionIdAlgo, RoutableConnectionIdAlgo};
use quicgate_proto::{ConnectionId, ProcessId, Version};

use crate::config::TransportSettings;
use crate::stats::TransportStatsCallbackFactory;
use crate::transport::{NetworkData, RoutingData, TransportFactory};
use crate::worker::{
    RouteOutcome, ServerWorker, WorkerCallback, WorkerEvent, WorkerHandle, WORKER_QUEUE_DEPTH,
};
use crate::LocalError;

const RECV_BUF_LEN: usize = 64 * 1024;

/// Cross-thread dispatch table shared by the supervisor and every worker.
struct WorkerRouter {
    senders: Vec<mpsc::Sender<WorkerEvent>>,
    algo: Arc<dyn ConnectionIdAlgo>,
}

impl WorkerRouter {
    /// Which worker owns a destination CID.
    fn index_for(&self, cid: &ConnectionId) -> usize {
        if self.senders.len() == 1 {
            return 0;
        }
        if self.algo.can_parse(cid) {
            if let Ok(params) = self.algo.parse(cid) {
                return params.worker_id as usize % self.senders.len();
            }
        }
        let mut hasher = FxHasher::default();
        cid.hash(&mut hasher);
        hasher.finish() as usize % self.senders.len()
    }

    fn post(&self, index: usize, event: WorkerEvent) -> bool {
        self.senders[index].try_send(event).is_ok()
    }

    fn broadcast(&self, mut make: impl FnMut() -> WorkerEvent) {
        for sender in &self.senders {
            if sender.try_send(make()).is_err() {
                warn!("worker queue full, control event lost");
            }
        }
    }
}

impl WorkerCallback for WorkerRouter {
    fn route_data_to_worker(
        &self,
        source_worker_id: u8,
        peer: SocketAddr,
        routing: RoutingData,
        network: NetworkData,
        is_forwarded: bool,
    ) -> RouteOutcome {
        let index = self.index_for(&routing.dst_cid);
        if index == source_worker_id as usize {
            return RouteOutcome::Local(routing, network);
        }
        match self.post(
            index,
            WorkerEvent::Packet {
                peer,
                routing,
                network,
                is_forwarded,
            },
        ) {
            true => RouteOutcome::Posted,
            false => RouteOutcome::Dropped,
        }
    }
}

struct TakeoverHandler {
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
    task: JoinHandle<()>,
}

struct Started {
    router: Arc<WorkerRouter>,
    tasks: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<Option<LocalError>>,
    local_addr: SocketAddr,
    takeover: Option<TakeoverHandler>,
}

/// The server supervisor. Configure with the setters, then [`Server::start`].
pub struct Server {
    supported_versions: Vec<Version>,
    health_check_token: Option<Bytes>,
    host_id: u16,
    process_id: ProcessId,
    settings: TransportSettings,
    conn_id_algo: Arc<dyn ConnectionIdAlgo>,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    stats_factory: Option<Arc<dyn TransportStatsCallbackFactory>>,
    reject_new_connections: bool,
    started: Option<Started>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self {
            supported_versions: vec![Version::QUIC_V1],
            health_check_token: None,
            host_id: 0,
            process_id: ProcessId::Zero,
            settings: TransportSettings::default(),
            conn_id_algo: Arc::new(RoutableConnectionIdAlgo),
            transport_factory: None,
            stats_factory: None,
            reject_new_connections: false,
            started: None,
        }
    }

    pub fn set_supported_versions(&mut self, versions: Vec<Version>) {
        self.supported_versions = versions;
    }

    /// Install or clear the health-check token. Propagates to running
    /// workers through their handoff queues.
    pub fn set_health_check_token(&mut self, token: Option<Bytes>) {
        self.health_check_token = token.clone();
        if let Some(started) = &self.started {
            started
                .router
                .broadcast(|| WorkerEvent::SetHealthCheckToken(token.clone()));
        }
    }

    pub fn set_host_id(&mut self, host_id: u16) {
        self.host_id = host_id;
    }

    pub fn set_process_id(&mut self, process_id: ProcessId) {
        self.process_id = process_id;
    }

    pub fn set_transport_settings(&mut self, settings: TransportSettings) {
        self.settings = settings;
    }

    pub fn set_connection_id_algo(&mut self, algo: Arc<dyn ConnectionIdAlgo>) {
        self.conn_id_algo = algo;
    }

    pub fn set_transport_factory(&mut self, factory: Arc<dyn TransportFactory>) {
        self.transport_factory = Some(factory);
    }

    pub fn set_transport_stats_callback_factory(
        &mut self,
        factory: Arc<dyn TransportStatsCallbackFactory>,
    ) {
        self.stats_factory = Some(factory);
    }

    /// Refuse new connections; existing ones continue to be served. Client
    /// Initials are answered with a version-negotiation packet advertising
    /// only the reserved invalid version.
    pub fn reject_new_connections(&mut self, reject: bool) {
        self.reject_new_connections = reject;
        if let Some(started) = &self.started {
            started
                .router
                .broadcast(|| WorkerEvent::RejectNewConnections(reject));
        }
    }

    /// Bind `num_workers` sockets to `addr` and spawn the workers. Returns
    /// the bound address (with the resolved port when `addr` asked for an
    /// ephemeral one).
    pub async fn start(&mut self, addr: SocketAddr, num_workers: usize) -> io::Result<SocketAddr> {
        assert!(num_workers > 0 && num_workers <= u8::MAX as usize + 1);
        assert!(self.started.is_none(), "server already started");

        let (shutdown_tx, _) = watch::channel(None);
        let mut senders = Vec::with_capacity(num_workers);
        let mut receivers = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let (tx, rx) = mpsc::channel(WORKER_QUEUE_DEPTH);
            senders.push(tx);
            receivers.push(rx);
        }
        let router = Arc::new(WorkerRouter {
            senders,
            algo: self.conn_id_algo.clone(),
        });

        let mut bound_addr = addr;
        let mut tasks = Vec::with_capacity(num_workers);
        for (i, rx) in receivers.into_iter().enumerate() {
            let std_socket = bind_worker_socket(bound_addr)?;
            let socket = Arc::new(UdpSocket::from_std(std_socket)?);
            if i == 0 {
                // Pin the resolved port so the remaining workers share it.
                bound_addr = socket.local_addr()?;
            }
            let mut worker = ServerWorker::new(i as u8);
            worker.set_socket(socket.clone());
            worker.set_host_id(self.host_id);
            worker.set_process_id(self.process_id);
            worker.set_supported_versions(self.supported_versions.clone());
            worker.set_health_check_token(self.health_check_token.clone());
            worker.set_connection_id_algo(self.conn_id_algo.clone());
            worker.set_transport_settings(self.settings.clone());
            worker.set_reject_new_connections(self.reject_new_connections);
            if let Some(factory) = &self.transport_factory {
                worker.set_transport_factory(factory.clone());
            }
            if let Some(stats_factory) = &self.stats_factory {
                worker.set_transport_stats_callback(stats_factory.make());
            }
            worker.set_worker_callback(router.clone());
            worker.set_handle(WorkerHandle::new(router.senders[i].clone()));
            tasks.push(tokio::spawn(run_worker(
                worker,
                socket,
                rx,
                shutdown_tx.subscribe(),
            )));
        }

        debug!(%bound_addr, num_workers, "server started");
        self.started = Some(Started {
            router,
            tasks,
            shutdown: shutdown_tx,
            local_addr: bound_addr,
            takeover: None,
        });
        Ok(bound_addr)
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.started.as_ref().map(|s| s.local_addr)
    }

    /// Hand a datagram received elsewhere to the worker that owns its
    /// destination CID.
    pub fn route_data_to_worker(&self, peer: SocketAddr, routing: RoutingData, network: NetworkData) {
        let Some(started) = &self.started else {
            return;
        };
        let index = started.router.index_for(&routing.dst_cid);
        if !started.router.post(
            index,
            WorkerEvent::Packet {
                peer,
                routing,
                network,
                is_forwarded: false,
            },
        ) {
            debug!("worker queue full, dropping routed datagram");
        }
    }

    /// Bind the takeover socket a successor process will forward to, and
    /// start draining it. Returns the bound address to advertise
    /// out-of-band.
    pub async fn allow_being_taken_over(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let socket = UdpSocket::bind(addr).await?;
        self.install_takeover(Arc::new(socket))
    }

    /// Rebind the takeover socket, replacing any previous one.
    pub async fn override_takeover_handler_address(
        &mut self,
        addr: SocketAddr,
    ) -> io::Result<SocketAddr> {
        self.allow_being_taken_over(addr).await
    }

    /// Adopt an inherited takeover socket so its address survives a process
    /// swap.
    #[cfg(unix)]
    pub fn allow_being_taken_over_from_fd(
        &mut self,
        fd: std::os::fd::RawFd,
    ) -> io::Result<SocketAddr> {
        use std::os::fd::FromRawFd;
        let std_socket = unsafe { std::net::UdpSocket::from_raw_fd(fd) };
        std_socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_socket)?;
        self.install_takeover(Arc::new(socket))
    }

    /// Raw fd of the takeover socket, for handing to a successor process.
    #[cfg(unix)]
    pub fn takeover_socket_fd(&self) -> Option<std::os::fd::RawFd> {
        use std::os::fd::AsRawFd;
        self.started
            .as_ref()?
            .takeover
            .as_ref()
            .map(|t| t.socket.as_raw_fd())
    }

    pub fn takeover_address(&self) -> Option<SocketAddr> {
        self.started.as_ref()?.takeover.as_ref().map(|t| t.addr)
    }

    fn install_takeover(&mut self, socket: Arc<UdpSocket>) -> io::Result<SocketAddr> {
        let started = self
            .started
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "server not started"))?;
        let bound = socket.local_addr()?;
        if let Some(old) = started.takeover.take() {
            old.task.abort();
        }
        let task = tokio::spawn(run_takeover_reader(
            socket.clone(),
            started.router.senders[0].clone(),
            started.shutdown.subscribe(),
        ));
        started.takeover = Some(TakeoverHandler {
            socket,
            addr: bound,
            task,
        });
        debug!(%bound, "takeover handler listening");
        Ok(bound)
    }

    /// Begin forwarding unclaimed datagrams to a predecessor's takeover
    /// address.
    pub fn start_packet_forwarding(&mut self, dest: SocketAddr) {
        if let Some(started) = &self.started {
            started
                .router
                .broadcast(|| WorkerEvent::StartPacketForwarding(dest));
        }
    }

    /// Stop forwarding after `grace`, leaving time for straggler datagrams
    /// already in flight.
    pub fn stop_packet_forwarding(&mut self, grace: Duration) {
        let Some(started) = &self.started else {
            return;
        };
        if grace.is_zero() {
            started.router.broadcast(|| WorkerEvent::StopPacketForwarding);
            return;
        }
        let router = started.router.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            router.broadcast(|| WorkerEvent::StopPacketForwarding);
        });
    }

    /// Close every connection on every worker and stop.
    pub async fn shutdown(&mut self) {
        self.shutdown_all_connections(LocalError::ShuttingDown).await;
    }

    /// Like [`Server::shutdown`], with an explicit close reason handed to
    /// every in-flight transport.
    pub async fn shutdown_all_connections(&mut self, reason: LocalError) {
        let Some(started) = self.started.take() else {
            return;
        };
        if let Some(takeover) = &started.takeover {
            takeover.task.abort();
        }
        let _ = started.shutdown.send(Some(reason));
        for task in started.tasks {
            let _ = task.await;
        }
        debug!("server shut down");
    }
}

async fn run_worker(
    mut worker: ServerWorker,
    socket: Arc<UdpSocket>,
    mut rx: mpsc::Receiver<WorkerEvent>,
    mut shutdown: watch::Receiver<Option<LocalError>>,
) {
    let mut buf = vec![0u8; RECV_BUF_LEN];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, peer)) => {
                    let data = Bytes::copy_from_slice(&buf[..len]);
                    worker.handle_network_data(peer, data, Instant::now());
                }
                // ECONNRESET can be induced remotely; QUIC gives it no
                // meaning.
                Err(ref err) if err.kind() == io::ErrorKind::ConnectionReset => {}
                Err(err) => warn!(%err, "udp read failed"),
            },
            event = rx.recv() => match event {
                Some(event) => worker.handle_event(event),
                None => break,
            },
            changed = shutdown.changed() => {
                let reason = shutdown.borrow().unwrap_or(LocalError::ShuttingDown);
                if changed.is_err() || shutdown.borrow().is_some() {
                    // Drain already-posted handoffs before refusing work.
                    while let Ok(event) = rx.try_recv() {
                        worker.handle_event(event);
                    }
                    worker.shutdown_all_connections(reason);
                    break;
                }
            }
        }
    }
}

async fn run_takeover_reader(
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<WorkerEvent>,
    mut shutdown: watch::Receiver<Option<LocalError>>,
) {
    let mut buf = vec![0u8; RECV_BUF_LEN];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, _)) => {
                    let data = Bytes::copy_from_slice(&buf[..len]);
                    if tx.try_send(WorkerEvent::Forwarded(data)).is_err() {
                        debug!("worker queue full, dropping forwarded datagram");
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::ConnectionReset => {}
                Err(err) => warn!(%err, "takeover read failed"),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || shutdown.borrow().is_some() {
                    break;
                }
            }
        }
    }
}

fn bind_worker_socket(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    disable_pmtu_discovery(&socket);
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Workers always emit datagrams at or below the minimum MTU; in-network
/// fragmentation discovery would only add failure modes.
#[cfg(target_os = "linux")]
fn disable_pmtu_discovery(socket: &socket2::Socket) {
    use std::os::fd::AsRawFd;
    for (level, option) in [
        (libc::IPPROTO_IP, libc::IP_MTU_DISCOVER),
        (libc::IPPROTO_IPV6, libc::IPV6_MTU_DISCOVER),
    ] {
        let value: libc::c_int = libc::IP_PMTUDISC_DONT;
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                level,
                option,
                &value as *const _ as *const libc::c_void,
                std::mem::size_of_val(&value) as libc::socklen_t,
            )
        };
        if rc != 0 {
            // Wrong address family for one of the two levels; harmless.
            debug!(level, "could not disable path-MTU discovery");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn disable_pmtu_discovery(_: &socket2::Socket) {}
