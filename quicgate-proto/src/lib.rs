//! Sans-I/O QUIC wire codec and packet construction.
//!
//! This crate performs no I/O whatsoever. It decodes adversarial, bit-packed
//! network input into typed headers and frames, and builds outgoing packets
//! (including stateless resets and version negotiation) into byte buffers.
//! Sockets, threads, and routing live in the `quicgate` crate.

use std::fmt;

use bytes::{Buf, BufMut};

pub mod builder;
pub mod cid;
pub mod coding;
pub mod crypto;
pub mod frame;
pub mod packet;
pub mod token;
mod transport_error;
mod varint;

pub use crate::cid::{ConnectionId, ConnectionIdAlgo, ProcessId, ServerConnectionIdParams};
pub use crate::frame::{Frame, FrameType};
pub use crate::packet::{HeaderForm, LongHeader, LongType, PacketHeader, ProtectionType, ShortHeader};
pub use crate::token::{StatelessResetSecret, StatelessResetToken};
pub use crate::transport_error::{TransportError, TransportErrorCode};
pub use crate::varint::{VarInt, VarIntBoundsExceeded};

/// A QUIC version number as it appears on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Version(pub u32);

impl Version {
    /// Sentinel carried by version negotiation packets.
    pub const NEGOTIATION: Self = Self(0);
    /// QUIC version 1 (RFC 9000).
    pub const QUIC_V1: Self = Self(0x0000_0001);
    /// Final pre-standard draft, still widely deployed.
    pub const DRAFT_29: Self = Self(0xff00_001d);
    /// Reserved greasing version, advertised alone when refusing new
    /// connections so that well-behaved clients give up immediately.
    pub const RESERVED_INVALID: Self = Self(0x0a1a_2a3a);

    /// Whether this version matches the reserved-for-greasing pattern.
    pub fn is_reserved(self) -> bool {
        self.0 & 0x0f0f_0f0f == 0x0a0a_0a0a
    }
}

impl coding::Codec for Version {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Self(u32::decode(buf)?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.0.encode(buf);
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Identifier for a stream within a particular connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream {}", self.0)
    }
}

impl coding::Codec for StreamId {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Self(VarInt::decode(buf)?.into_inner()))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        coding::BufMutExt::write_var(buf, self.0);
    }
}

/// Whether a stream or stream-limit frame refers to bidirectional or
/// unidirectional streams.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Dir {
    /// Data flows in both directions
    Bi,
    /// Data flows only from the stream's initiator
    Uni,
}

//
// Wire-format constants shared between the codec and the server.
//

/// Maximum connection ID length permitted by the invariants.
pub const MAX_CID_SIZE: usize = 20;
/// Minimum destination CID length a server accepts on a client Initial.
pub const MIN_INITIAL_DST_CID_LEN: usize = 8;
/// Minimum UDP datagram size for a client Initial.
pub const MIN_INITIAL_PACKET_SIZE: usize = 1200;
/// Stateless reset tokens are always this long.
pub const RESET_TOKEN_SIZE: usize = 16;
/// Length of the integrity tag trailing a Retry packet.
pub const RETRY_INTEGRITY_TAG_LEN: usize = 16;
/// Largest wire encoding of a packet number.
pub const MAX_PACKET_NUM_ENCODING_SIZE: usize = 4;
/// The packet-length field slot is always reserved at this fixed width so it
/// can be back-patched after the body is written.
pub const MAX_PACKET_LEN_SIZE: usize = 4;
/// Default maximum UDP payload we will emit.
pub const DEFAULT_UDP_SEND_PACKET_LEN: usize = 1452;
/// Bytes of ciphertext required for a header-protection sample.
pub const HEADER_PROTECTION_SAMPLE_LEN: usize = 16;
/// Upper bound on the reason phrase carried by close frames.
pub const MAX_REASON_PHRASE_LEN: u64 = 1024;
/// Ack delay exponent assumed before one is negotiated.
pub const DEFAULT_ACK_DELAY_EXPONENT: u8 = 3;
