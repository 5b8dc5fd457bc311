//! Packet header parsing and packet-number coding.
//!
//! Header parsing is split into three layers: the version-independent
//! invariant fields, the long-header variants, and the short header. The
//! routing layer only ever needs the invariant parse; the full parses are
//! for code that has removed header protection.

use bytes::{Buf, Bytes};

use crate::coding::{BufExt, Codec};
use crate::{
    ConnectionId, TransportError, Version, MAX_CID_SIZE, MAX_PACKET_NUM_ENCODING_SIZE,
    MIN_INITIAL_DST_CID_LEN, RETRY_INTEGRITY_TAG_LEN,
};

pub(crate) const HEADER_FORM_MASK: u8 = 0x80;
pub(crate) const FIXED_BIT: u8 = 0x40;
pub(crate) const LONG_TYPE_MASK: u8 = 0x30;
pub(crate) const LONG_TYPE_SHIFT: u8 = 4;
pub(crate) const LONG_RESERVED_MASK: u8 = 0x0c;
pub(crate) const SHORT_RESERVED_MASK: u8 = 0x18;
pub(crate) const KEY_PHASE_BIT: u8 = 0x04;
pub(crate) const PACKET_NUM_LEN_MASK: u8 = 0x03;

/// The two header forms distinguished by the most significant bit.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum HeaderForm {
    Long,
    Short,
}

/// Classify a packet by its first byte.
pub fn header_form(initial_byte: u8) -> HeaderForm {
    if initial_byte & HEADER_FORM_MASK != 0 {
        HeaderForm::Long
    } else {
        HeaderForm::Short
    }
}

/// Long packet types.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum LongType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

impl LongType {
    /// Extract the type from a long-header initial byte.
    pub fn from_initial_byte(b: u8) -> Self {
        match (b & LONG_TYPE_MASK) >> LONG_TYPE_SHIFT {
            0x0 => Self::Initial,
            0x1 => Self::ZeroRtt,
            0x2 => Self::Handshake,
            0x3 => Self::Retry,
            _ => unreachable!(),
        }
    }

    pub(crate) fn type_bits(self) -> u8 {
        let bits = match self {
            Self::Initial => 0x0,
            Self::ZeroRtt => 0x1,
            Self::Handshake => 0x2,
            Self::Retry => 0x3,
        };
        bits << LONG_TYPE_SHIFT
    }
}

/// Key phase carried by short headers.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ProtectionType {
    KeyPhaseZero,
    KeyPhaseOne,
}

/// Fully specified long header, as handed to a packet builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongHeader {
    pub ty: LongType,
    pub version: Version,
    pub src_cid: ConnectionId,
    pub dst_cid: ConnectionId,
    pub packet_num: u64,
    /// Initial token, or the Retry token (with its integrity tag) for Retry.
    pub token: Bytes,
    /// Original destination CID a Retry responds to. Not serialized; input to
    /// the external integrity-tag computation.
    pub orig_dst_cid: Option<ConnectionId>,
}

/// Fully specified short header, as handed to a packet builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortHeader {
    pub protection_type: ProtectionType,
    pub dst_cid: ConnectionId,
    pub packet_num: u64,
}

/// Builder-side packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketHeader {
    Long(LongHeader),
    Short(ShortHeader),
}

impl PacketHeader {
    pub fn initial(
        version: Version,
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        packet_num: u64,
        token: Bytes,
    ) -> Self {
        Self::Long(LongHeader {
            ty: LongType::Initial,
            version,
            src_cid,
            dst_cid,
            packet_num,
            token,
            orig_dst_cid: None,
        })
    }

    pub fn long(
        ty: LongType,
        version: Version,
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        packet_num: u64,
    ) -> Self {
        Self::Long(LongHeader {
            ty,
            version,
            src_cid,
            dst_cid,
            packet_num,
            token: Bytes::new(),
            orig_dst_cid: None,
        })
    }

    pub fn short(protection_type: ProtectionType, dst_cid: ConnectionId, packet_num: u64) -> Self {
        Self::Short(ShortHeader {
            protection_type,
            dst_cid,
            packet_num,
        })
    }

    pub fn form(&self) -> HeaderForm {
        match self {
            Self::Long(_) => HeaderForm::Long,
            Self::Short(_) => HeaderForm::Short,
        }
    }

    pub fn dst_cid(&self) -> &ConnectionId {
        match self {
            Self::Long(h) => &h.dst_cid,
            Self::Short(h) => &h.dst_cid,
        }
    }

    pub fn packet_num(&self) -> u64 {
        match self {
            Self::Long(h) => h.packet_num,
            Self::Short(h) => h.packet_num,
        }
    }
}

/// The version-independent fields of a long header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongHeaderInvariant {
    pub version: Version,
    pub src_cid: ConnectionId,
    pub dst_cid: ConnectionId,
}

/// Invariant fields plus the initial byte and the number of bytes consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLongHeaderInvariant {
    pub initial_byte: u8,
    pub invariant: LongHeaderInvariant,
    pub consumed: usize,
}

/// Result of the full long-header parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLongHeader {
    pub ty: LongType,
    pub invariant: LongHeaderInvariant,
    /// Initial token, or the Retry token and integrity tag.
    pub token: Bytes,
    /// Value and encoded width of the packet-length field. Zero for Retry.
    pub packet_len: PacketLength,
    /// Width of the truncated packet number, from the initial byte.
    pub packet_num_len: usize,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PacketLength {
    pub value: u64,
    pub encoded_size: usize,
}

/// Either a real long header or the version-negotiation sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LongHeaderResult {
    VersionNegotiation(LongHeaderInvariant),
    Parsed(ParsedLongHeader),
}

/// Short header fields visible without removing header protection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortHeaderInvariant {
    pub dst_cid: ConnectionId,
}

/// Parse the invariant fields of a long header.
///
/// `buf` must be positioned just past the initial byte. CID lengths above 20
/// are a `PROTOCOL_VIOLATION`; truncation is a `FRAME_ENCODING_ERROR`.
pub fn parse_long_header_invariant(
    initial_byte: u8,
    buf: &mut Bytes,
) -> Result<ParsedLongHeaderInvariant, TransportError> {
    let start = buf.remaining();
    let version = Version::decode(buf)
        .map_err(|_| TransportError::FRAME_ENCODING_ERROR("truncated version"))?;
    let dst_cid = parse_cid(buf)?;
    let src_cid = parse_cid(buf)?;
    Ok(ParsedLongHeaderInvariant {
        initial_byte,
        invariant: LongHeaderInvariant {
            version,
            src_cid,
            dst_cid,
        },
        consumed: start - buf.remaining(),
    })
}

fn parse_cid(buf: &mut Bytes) -> Result<ConnectionId, TransportError> {
    let len = u8::decode(buf)
        .map_err(|_| TransportError::FRAME_ENCODING_ERROR("truncated connection id length"))?
        as usize;
    if len > MAX_CID_SIZE {
        return Err(TransportError::PROTOCOL_VIOLATION("oversized connection id"));
    }
    if buf.remaining() < len {
        return Err(TransportError::FRAME_ENCODING_ERROR("truncated connection id"));
    }
    let cid = ConnectionId::new(&buf.chunk()[..len]);
    buf.advance(len);
    Ok(cid)
}

/// Parse a complete long header, starting just past the initial byte.
pub fn parse_long_header(
    initial_byte: u8,
    buf: &mut Bytes,
) -> Result<LongHeaderResult, TransportError> {
    if header_form(initial_byte) != HeaderForm::Long {
        return Err(TransportError::FRAME_ENCODING_ERROR("bad header form bit"));
    }
    let parsed = parse_long_header_invariant(initial_byte, buf)?;
    if parsed.invariant.version == Version::NEGOTIATION {
        return Ok(LongHeaderResult::VersionNegotiation(parsed.invariant));
    }
    Ok(LongHeaderResult::Parsed(parse_long_header_variant(
        parsed, buf,
    )?))
}

/// Parse the per-type remainder of a long header whose invariant fields are
/// already in hand.
pub fn parse_long_header_variant(
    parsed: ParsedLongHeaderInvariant,
    buf: &mut Bytes,
) -> Result<ParsedLongHeader, TransportError> {
    let ty = LongType::from_initial_byte(parsed.initial_byte);

    if ty == LongType::Retry {
        // Trailing 16 bytes are the integrity tag; the token must be at
        // least one byte, so strictly more than the tag must remain.
        if buf.remaining() <= RETRY_INTEGRITY_TAG_LEN {
            return Err(TransportError::FRAME_ENCODING_ERROR("retry too short"));
        }
        let token = buf.split_to(buf.remaining());
        return Ok(ParsedLongHeader {
            ty,
            invariant: parsed.invariant,
            token,
            packet_len: PacketLength::default(),
            packet_num_len: 0,
        });
    }

    if ty == LongType::Initial && parsed.invariant.dst_cid.len() < MIN_INITIAL_DST_CID_LEN {
        return Err(TransportError::FRAME_ENCODING_ERROR(
            "initial destination connection id too short",
        ));
    }

    let mut token = Bytes::new();
    if ty == LongType::Initial {
        let token_len = buf
            .get_var()
            .map_err(|_| TransportError::FRAME_ENCODING_ERROR("truncated token length"))?;
        if token_len > buf.remaining() as u64 {
            return Err(TransportError::FRAME_ENCODING_ERROR("truncated token"));
        }
        token = buf.split_to(token_len as usize);
    }

    let len_start = buf.remaining();
    let packet_len = buf
        .get_var()
        .map_err(|_| TransportError::FRAME_ENCODING_ERROR("truncated packet length"))?;
    let encoded_size = len_start - buf.remaining();
    if packet_len > buf.remaining() as u64 {
        return Err(TransportError::FRAME_ENCODING_ERROR("packet length exceeds datagram"));
    }
    let packet_num_len = packet_number_len(parsed.initial_byte);
    if packet_num_len > MAX_PACKET_NUM_ENCODING_SIZE || buf.remaining() < packet_num_len {
        return Err(TransportError::FRAME_ENCODING_ERROR("truncated packet number"));
    }

    Ok(ParsedLongHeader {
        ty,
        invariant: parsed.invariant,
        token,
        packet_len: PacketLength {
            value: packet_len,
            encoded_size,
        },
        packet_num_len,
    })
}

/// Extract the destination CID of a short header without inspecting any
/// protected bits. The CID length is configuration, not wire data.
pub fn parse_short_header_invariant(
    initial_byte: u8,
    buf: &mut Bytes,
    dst_cid_len: usize,
) -> Result<ShortHeaderInvariant, TransportError> {
    if header_form(initial_byte) != HeaderForm::Short {
        return Err(TransportError::FRAME_ENCODING_ERROR("bad header form bit"));
    }
    if dst_cid_len > MAX_CID_SIZE {
        return Err(TransportError::PROTOCOL_VIOLATION("oversized connection id"));
    }
    if buf.remaining() < dst_cid_len {
        return Err(TransportError::FRAME_ENCODING_ERROR("truncated connection id"));
    }
    let dst_cid = ConnectionId::new(&buf.chunk()[..dst_cid_len]);
    buf.advance(dst_cid_len);
    Ok(ShortHeaderInvariant { dst_cid })
}

/// Parse a short header whose protected bits have been exposed.
pub fn parse_short_header(
    initial_byte: u8,
    buf: &mut Bytes,
    dst_cid_len: usize,
) -> Result<ShortHeader, TransportError> {
    if initial_byte & FIXED_BIT == 0 {
        return Err(TransportError::FRAME_ENCODING_ERROR("fixed bit unset"));
    }
    if initial_byte & SHORT_RESERVED_MASK != 0 {
        return Err(TransportError::PROTOCOL_VIOLATION("reserved bits set"));
    }
    let invariant = parse_short_header_invariant(initial_byte, buf, dst_cid_len)?;
    let protection_type = if initial_byte & KEY_PHASE_BIT != 0 {
        ProtectionType::KeyPhaseOne
    } else {
        ProtectionType::KeyPhaseZero
    };
    Ok(ShortHeader {
        protection_type,
        dst_cid: invariant.dst_cid,
        // Recovered separately once the truncated bytes are readable.
        packet_num: 0,
    })
}

/// A decoded version negotiation packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionNegotiationPacket {
    pub src_cid: ConnectionId,
    pub dst_cid: ConnectionId,
    pub versions: Vec<Version>,
}

/// Decode the version list of a version negotiation packet whose invariant
/// fields have already been parsed. `None` if the list is empty or ragged.
pub fn decode_version_negotiation(
    invariant: &LongHeaderInvariant,
    buf: &mut Bytes,
) -> Option<VersionNegotiationPacket> {
    let len = buf.remaining();
    if len < 4 || len % 4 != 0 {
        tracing::debug!("version negotiation packet invalid");
        return None;
    }
    let mut versions = Vec::with_capacity(len / 4);
    while buf.has_remaining() {
        versions.push(Version(buf.get_u32()));
    }
    Some(VersionNegotiationPacket {
        src_cid: invariant.src_cid,
        dst_cid: invariant.dst_cid,
        versions,
    })
}

//
// Packet number coding
//

/// A truncated packet number ready to be written to the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PacketNumEncoding {
    pub value: u64,
    pub len: usize,
}

impl PacketNumEncoding {
    /// Big-endian bytes of the truncation.
    pub fn to_bytes(self) -> [u8; MAX_PACKET_NUM_ENCODING_SIZE] {
        let raw = (self.value as u32) << (8 * (MAX_PACKET_NUM_ENCODING_SIZE - self.len));
        raw.to_be_bytes()
    }
}

/// Truncate `packet_num` against the largest acknowledged packet number,
/// using the smallest length whose window covers the distance.
pub fn encode_packet_number(packet_num: u64, largest_acked: u64) -> PacketNumEncoding {
    debug_assert!(packet_num >= largest_acked);
    let range = packet_num - largest_acked;
    let len = (1..=MAX_PACKET_NUM_ENCODING_SIZE)
        .find(|&len| range < 1 << (8 * len - 1))
        .expect("packet number delta exceeds 4-byte window");
    PacketNumEncoding {
        value: packet_num & ((1 << (8 * len)) - 1),
        len,
    }
}

/// Recover a full packet number from its truncation.
///
/// Deterministically picks the candidate with the given low bits inside
/// `[expected - 2^(8 len - 1), expected + 2^(8 len - 1))`.
pub fn decode_packet_number(truncated: u64, len: usize, expected: u64) -> u64 {
    debug_assert!(len >= 1 && len <= MAX_PACKET_NUM_ENCODING_SIZE);
    let win = 1u64 << (8 * len);
    let hwin = win / 2;
    let mask = win - 1;
    let candidate = (expected & !mask) | truncated;
    if expected.checked_sub(hwin).map_or(false, |x| candidate <= x) {
        candidate + win
    } else if candidate > expected + hwin && candidate > win {
        candidate - win
    } else {
        candidate
    }
}

/// Width of the truncated packet number, from the initial byte's low bits.
/// The mask is shared between both header forms.
pub fn packet_number_len(initial_byte: u8) -> usize {
    (initial_byte & PACKET_NUM_LEN_MASK) as usize + 1
}
