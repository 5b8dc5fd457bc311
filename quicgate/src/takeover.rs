//! Takeover envelope codec.
//!
//! During rollout the newer server process rewraps datagrams it cannot claim
//! and writes them to the older process's takeover socket:
//!
//! ```text
//! [version: u32 = 1]
//! [peer_addr_len: u16][peer_addr bytes]
//! [receive epoch: u64 nanoseconds since Unix epoch]
//! [original datagram bytes]
//! ```
//!
//! The address bytes are one family octet (4 or 6), the big-endian port, and
//! the raw IP octets.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

/// Envelope layout version. Bumped only if the fields above change.
pub const TAKEOVER_PROTOCOL_VERSION: u32 = 1;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// A decoded takeover envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedPacket {
    /// The client the datagram originally came from.
    pub peer: SocketAddr,
    /// When the forwarding process received it.
    pub received: SystemTime,
    /// The unaltered original datagram.
    pub payload: Bytes,
}

/// Reasons an envelope fails to decode.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum TakeoverError {
    #[error("unsupported takeover protocol version {0}")]
    UnsupportedVersion(u32),
    #[error("truncated takeover envelope")]
    Truncated,
    #[error("malformed peer address")]
    BadAddress,
}

/// Wrap `payload` for the peer process's takeover socket.
pub fn encode_forwarded_packet(peer: SocketAddr, received: SystemTime, payload: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(payload.len() + 32);
    out.put_u32(TAKEOVER_PROTOCOL_VERSION);
    let addr = encode_addr(peer);
    out.put_u16(addr.len() as u16);
    out.extend_from_slice(&addr);
    let epoch_ns = received
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    out.put_u64(epoch_ns);
    out.extend_from_slice(payload);
    out.into()
}

/// Strip a takeover envelope, returning the original peer, receive time, and
/// datagram.
pub fn decode_forwarded_packet(mut data: Bytes) -> Result<ForwardedPacket, TakeoverError> {
    if data.remaining() < 4 {
        return Err(TakeoverError::Truncated);
    }
    let version = data.get_u32();
    if version != TAKEOVER_PROTOCOL_VERSION {
        return Err(TakeoverError::UnsupportedVersion(version));
    }
    if data.remaining() < 2 {
        return Err(TakeoverError::Truncated);
    }
    let addr_len = data.get_u16() as usize;
    if data.remaining() < addr_len {
        return Err(TakeoverError::Truncated);
    }
    let addr_bytes = data.split_to(addr_len);
    let peer = decode_addr(&addr_bytes)?;
    if data.remaining() < 8 {
        return Err(TakeoverError::Truncated);
    }
    let epoch_ns = data.get_u64();
    let received = UNIX_EPOCH + Duration::from_nanos(epoch_ns);
    Ok(ForwardedPacket {
        peer,
        received,
        payload: data,
    })
}

fn encode_addr(addr: SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(19);
    match addr.ip() {
        IpAddr::V4(ip) => {
            out.push(FAMILY_V4);
            out.put_u16(addr.port());
            out.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out.push(FAMILY_V6);
            out.put_u16(addr.port());
            out.extend_from_slice(&ip.octets());
        }
    }
    out
}

fn decode_addr(bytes: &[u8]) -> Result<SocketAddr, TakeoverError> {
    if bytes.len() < 3 {
        return Err(TakeoverError::BadAddress);
    }
    let family = bytes[0];
    let port = u16::from_be_bytes([bytes[1], bytes[2]]);
    let ip = match (family, bytes.len() - 3) {
        (FAMILY_V4, 4) => {
            let octets: [u8; 4] = bytes[3..].try_into().unwrap();
            IpAddr::from(octets)
        }
        (FAMILY_V6, 16) => {
            let octets: [u8; 16] = bytes[3..].try_into().unwrap();
            IpAddr::from(octets)
        }
        _ => return Err(TakeoverError::BadAddress),
    };
    Ok(SocketAddr::new(ip, port))
}

/// Map an envelope timestamp back onto the monotonic clock, clamping
/// envelopes from the future to now.
pub fn receive_instant(received: SystemTime) -> Instant {
    let now = Instant::now();
    match SystemTime::now().duration_since(received) {
        Ok(age) => now.checked_sub(age).unwrap_or(now),
        Err(_) => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_v4() {
        let peer: SocketAddr = "1.2.3.4:1234".parse().unwrap();
        let now = SystemTime::now();
        let wire = encode_forwarded_packet(peer, now, b"original datagram");
        let packet = decode_forwarded_packet(wire).unwrap();
        assert_eq!(packet.peer, peer);
        assert_eq!(packet.payload.as_ref(), b"original datagram");
        let delta = now
            .duration_since(packet.received)
            .unwrap_or_else(|e| e.duration());
        // Nanosecond truncation only.
        assert!(delta < Duration::from_micros(1));
    }

    #[test]
    fn roundtrip_v6() {
        let peer: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        let wire = encode_forwarded_packet(peer, SystemTime::now(), b"x");
        let packet = decode_forwarded_packet(wire).unwrap();
        assert_eq!(packet.peer, peer);
    }

    #[test]
    fn rejects_unknown_version() {
        let peer: SocketAddr = "1.2.3.4:1234".parse().unwrap();
        let wire = encode_forwarded_packet(peer, SystemTime::now(), b"x");
        let mut raw = wire.to_vec();
        raw[3] = 2;
        assert_eq!(
            decode_forwarded_packet(raw.into()),
            Err(TakeoverError::UnsupportedVersion(2))
        );
    }

    #[test]
    fn rejects_truncation() {
        let peer: SocketAddr = "1.2.3.4:1234".parse().unwrap();
        let wire = encode_forwarded_packet(peer, SystemTime::now(), b"payload");
        for cut in 0..wire.len() - b"payload".len() {
            let trimmed = wire.slice(..cut);
            assert!(decode_forwarded_packet(trimmed).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn rejects_bad_family() {
        let peer: SocketAddr = "1.2.3.4:1234".parse().unwrap();
        let wire = encode_forwarded_packet(peer, SystemTime::now(), b"x");
        let mut raw = wire.to_vec();
        raw[6] = 9; // family octet
        assert_eq!(
            decode_forwarded_packet(raw.into()),
            Err(TakeoverError::BadAddress)
        );
    }
}
