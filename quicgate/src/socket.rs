//! Thin datagram-socket seam so workers can be driven without real sockets.

use std::io;
use std::net::SocketAddr;

/// Non-blocking datagram send plus address introspection. Reads stay on the
/// concrete socket inside each worker's run loop.
pub trait DatagramSocket: Send + Sync {
    fn try_send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramSocket for tokio::net::UdpSocket {
    fn try_send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        tokio::net::UdpSocket::try_send_to(self, data, addr)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        tokio::net::UdpSocket::local_addr(self)
    }
}

impl DatagramSocket for std::net::UdpSocket {
    fn try_send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.send_to(data, addr)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        std::net::UdpSocket::local_addr(self)
    }
}
