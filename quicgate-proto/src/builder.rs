//! Outgoing packet construction.
//!
//! The packet number is written last, into a slot reserved in the header, so
//! its width is known only after the body is complete. Long headers (other
//! than Retry) additionally reserve a fixed 4-byte varint slot for the
//! packet-length field, so its position never moves whatever the value.
//!
//! Two builders share one contract: [`RegularPacketBuilder`] grows its own
//! buffers, [`InplacePacketBuilder`] writes into a caller-provided buffer and
//! back-patches by recorded offset.

use bytes::{BufMut, Bytes};
use rand::RngCore;

use crate::coding::Codec;
use crate::frame::Frame;
use crate::packet::{
    LongHeader, LongType, PacketHeader, PacketNumEncoding, ProtectionType, ShortHeader,
    encode_packet_number, FIXED_BIT, HEADER_FORM_MASK, KEY_PHASE_BIT, LONG_RESERVED_MASK,
    PACKET_NUM_LEN_MASK, SHORT_RESERVED_MASK,
};
use crate::{
    ConnectionId, StatelessResetToken, VarInt, Version, DEFAULT_UDP_SEND_PACKET_LEN,
    HEADER_PROTECTION_SAMPLE_LEN, MAX_PACKET_LEN_SIZE, MAX_PACKET_NUM_ENCODING_SIZE,
};

/// Write interface shared by both builder variants.
pub trait PacketBuilder {
    /// Bytes still available in the packet.
    fn remaining_space_in_pkt(&self) -> usize;
    /// Append a variable-length integer to the body.
    fn write_var(&mut self, value: VarInt);
    fn write_u8(&mut self, value: u8);
    fn write_u16(&mut self, value: u16);
    fn write_u32(&mut self, value: u32);
    fn write_u64(&mut self, value: u64);
    /// Append raw bytes to the body.
    fn push(&mut self, data: &[u8]);
    /// Append an owned buffer to the body without copying where possible.
    fn insert(&mut self, data: Bytes);
    /// Record a frame for post-encryption accounting.
    fn append_frame(&mut self, frame: Frame);
    /// AEAD expansion to account for when sizing the packet.
    fn set_cipher_overhead(&mut self, overhead: u8);
    /// False once the packet has run out of space.
    fn can_build_packet(&self) -> bool;
}

/// A finished packet from [`RegularPacketBuilder`].
#[derive(Debug)]
pub struct BuiltPacket {
    pub header: PacketHeader,
    pub frames: Vec<Frame>,
    pub header_bytes: Bytes,
    pub body_bytes: Bytes,
}

impl BuiltPacket {
    /// Header and body as one contiguous datagram payload.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = Vec::with_capacity(self.header_bytes.len() + self.body_bytes.len());
        out.extend_from_slice(&self.header_bytes);
        out.extend_from_slice(&self.body_bytes);
        out.into()
    }
}

fn long_initial_byte(header: &LongHeader, pn: PacketNumEncoding) -> u8 {
    let mut initial_byte = HEADER_FORM_MASK | FIXED_BIT | header.ty.type_bits();
    initial_byte &= !LONG_RESERVED_MASK;
    if header.ty == LongType::Retry {
        // No packet number; the low nibble is unused on the wire.
        initial_byte & 0xf0
    } else {
        initial_byte | (pn.len as u8 - 1)
    }
}

fn short_initial_byte(header: &ShortHeader, pn: PacketNumEncoding) -> u8 {
    let mut initial_byte = FIXED_BIT | (pn.len as u8 - 1);
    debug_assert_eq!(initial_byte & SHORT_RESERVED_MASK, 0);
    debug_assert_eq!(pn.len as u8 - 1, (pn.len as u8 - 1) & PACKET_NUM_LEN_MASK);
    if header.protection_type == ProtectionType::KeyPhaseOne {
        initial_byte |= KEY_PHASE_BIT;
    }
    initial_byte
}

/// Write the long header up to (but excluding) the deferred packet-length and
/// packet-number fields, and charge the whole header against `remaining`.
fn encode_long_header<W: BufMut>(
    header: &LongHeader,
    out: &mut W,
    remaining: &mut usize,
    largest_acked: u64,
) -> PacketNumEncoding {
    let pn = encode_packet_number(header.packet_num, largest_acked);
    out.put_u8(long_initial_byte(header, pn));

    let is_initial = header.ty == LongType::Initial;
    let token_header_len = if is_initial {
        VarInt::from_u64(header.token.len() as u64)
            .expect("token length is bounded by the datagram")
            .size()
            + header.token.len()
    } else {
        0
    };
    let header_len = 1
        + 4
        + 1
        + header.dst_cid.len()
        + 1
        + header.src_cid.len()
        + token_header_len
        + MAX_PACKET_LEN_SIZE
        + pn.len;
    *remaining = remaining.saturating_sub(header_len);

    out.put_u32(header.version.0);
    out.put_u8(header.dst_cid.len() as u8);
    out.put_slice(&header.dst_cid);
    out.put_u8(header.src_cid.len() as u8);
    out.put_slice(&header.src_cid);

    if is_initial {
        VarInt::from_u64(header.token.len() as u64)
            .expect("token length is bounded by the datagram")
            .encode(out);
        out.put_slice(&header.token);
    }
    if header.ty == LongType::Retry {
        debug_assert!(!header.token.is_empty(), "retry packet must carry a token");
        out.put_slice(&header.token);
    }
    pn
}

/// Write a complete short header, packet number included.
fn encode_short_header<W: BufMut>(
    header: &ShortHeader,
    out: &mut W,
    remaining: &mut usize,
    largest_acked: u64,
) -> PacketNumEncoding {
    let pn = encode_packet_number(header.packet_num, largest_acked);
    let needed = 1 + header.dst_cid.len() + pn.len;
    if *remaining < needed {
        *remaining = 0;
    } else {
        *remaining -= needed;
    }
    out.put_u8(short_initial_byte(header, pn));
    out.put_slice(&header.dst_cid);
    out.put_slice(&pn.to_bytes()[..pn.len]);
    pn
}

/// Growable-buffer packet builder.
pub struct RegularPacketBuilder {
    remaining: usize,
    header: PacketHeader,
    frames: Vec<Frame>,
    header_buf: Vec<u8>,
    body_buf: Vec<u8>,
    pn: PacketNumEncoding,
    cipher_overhead: usize,
}

impl RegularPacketBuilder {
    pub fn new(remaining_bytes: usize, header: PacketHeader, largest_acked: u64) -> Self {
        let mut remaining = remaining_bytes;
        let mut header_buf = Vec::with_capacity(64);
        let pn = match &header {
            PacketHeader::Long(h) => {
                encode_long_header(h, &mut header_buf, &mut remaining, largest_acked)
            }
            PacketHeader::Short(h) => {
                encode_short_header(h, &mut header_buf, &mut remaining, largest_acked)
            }
        };
        Self {
            remaining,
            header,
            frames: Vec::new(),
            header_buf,
            body_buf: Vec::new(),
            pn,
            cipher_overhead: 0,
        }
    }

    /// Header length in bytes, deferred fields included.
    pub fn header_bytes_len(&self) -> usize {
        match &self.header {
            PacketHeader::Long(h) if h.ty != LongType::Retry => {
                self.header_buf.len() + MAX_PACKET_LEN_SIZE + self.pn.len
            }
            _ => self.header_buf.len(),
        }
    }

    /// Finish the packet: pad the body up to the header-protection sampling
    /// bound, then fill the deferred length and packet-number fields.
    pub fn build(mut self) -> BuiltPacket {
        let min_body = MAX_PACKET_NUM_ENCODING_SIZE - self.pn.len + HEADER_PROTECTION_SAMPLE_LEN;
        while self.body_buf.len() + self.cipher_overhead < min_body
            && !self.frames.is_empty()
            && self.remaining > MAX_PACKET_LEN_SIZE
        {
            self.body_buf.push(0); // PADDING
            self.remaining -= 1;
        }
        if let PacketHeader::Long(h) = &self.header {
            if h.ty != LongType::Retry {
                let packet_len = self.pn.len + self.body_buf.len() + self.cipher_overhead;
                VarInt::from_u64(packet_len as u64)
                    .expect("packet length is bounded by the datagram")
                    .encode_fixed4(&mut self.header_buf);
                self.header_buf
                    .extend_from_slice(&self.pn.to_bytes()[..self.pn.len]);
            }
        }
        BuiltPacket {
            header: self.header,
            frames: self.frames,
            header_bytes: self.header_buf.into(),
            body_bytes: self.body_buf.into(),
        }
    }
}

impl PacketBuilder for RegularPacketBuilder {
    fn remaining_space_in_pkt(&self) -> usize {
        self.remaining
    }

    fn write_var(&mut self, value: VarInt) {
        self.remaining = self.remaining.saturating_sub(value.size());
        value.encode(&mut self.body_buf);
    }

    fn write_u8(&mut self, value: u8) {
        self.remaining = self.remaining.saturating_sub(1);
        self.body_buf.put_u8(value);
    }

    fn write_u16(&mut self, value: u16) {
        self.remaining = self.remaining.saturating_sub(2);
        self.body_buf.put_u16(value);
    }

    fn write_u32(&mut self, value: u32) {
        self.remaining = self.remaining.saturating_sub(4);
        self.body_buf.put_u32(value);
    }

    fn write_u64(&mut self, value: u64) {
        self.remaining = self.remaining.saturating_sub(8);
        self.body_buf.put_u64(value);
    }

    fn push(&mut self, data: &[u8]) {
        self.remaining = self.remaining.saturating_sub(data.len());
        self.body_buf.extend_from_slice(data);
    }

    fn insert(&mut self, data: Bytes) {
        self.remaining = self.remaining.saturating_sub(data.len());
        self.body_buf.extend_from_slice(&data);
    }

    fn append_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    fn set_cipher_overhead(&mut self, overhead: u8) {
        self.cipher_overhead = overhead as usize;
    }

    fn can_build_packet(&self) -> bool {
        self.remaining != 0
    }
}

/// A finished packet from [`InplacePacketBuilder`]: the caller's buffer holds
/// the bytes; this carries the region boundaries.
#[derive(Debug)]
pub struct InplaceBuiltPacket {
    pub header: PacketHeader,
    pub frames: Vec<Frame>,
    /// Offset at which the body begins.
    pub header_len: usize,
    /// Total bytes written.
    pub packet_len: usize,
}

/// In-place packet builder over a caller-provided buffer.
pub struct InplacePacketBuilder<'a> {
    buf: &'a mut [u8],
    pos: usize,
    remaining: usize,
    header: PacketHeader,
    frames: Vec<Frame>,
    pn: PacketNumEncoding,
    packet_len_offset: usize,
    packet_num_offset: usize,
    body_start: usize,
    cipher_overhead: usize,
}

struct SliceWriter<'a> {
    buf: &'a mut [u8],
    pos: &'a mut usize,
}

unsafe impl BufMut for SliceWriter<'_> {
    fn remaining_mut(&self) -> usize {
        self.buf.len() - *self.pos
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        *self.pos += cnt;
    }

    fn chunk_mut(&mut self) -> &mut bytes::buf::UninitSlice {
        bytes::buf::UninitSlice::new(&mut self.buf[*self.pos..])
    }

    fn put_slice(&mut self, src: &[u8]) {
        self.buf[*self.pos..*self.pos + src.len()].copy_from_slice(src);
        *self.pos += src.len();
    }
}

impl<'a> InplacePacketBuilder<'a> {
    pub fn new(buf: &'a mut [u8], header: PacketHeader, largest_acked: u64) -> Self {
        let mut remaining = buf.len();
        let mut pos = 0;
        let mut packet_len_offset = 0;
        let mut packet_num_offset = 0;
        let pn = match &header {
            PacketHeader::Long(h) => {
                let pn = {
                    let mut w = SliceWriter {
                        buf: &mut *buf,
                        pos: &mut pos,
                    };
                    encode_long_header(h, &mut w, &mut remaining, largest_acked)
                };
                if h.ty != LongType::Retry {
                    // Remember where to back-patch length and packet number.
                    packet_len_offset = pos;
                    packet_num_offset = packet_len_offset + MAX_PACKET_LEN_SIZE;
                    pos += MAX_PACKET_LEN_SIZE + pn.len;
                }
                pn
            }
            PacketHeader::Short(h) => {
                let mut w = SliceWriter {
                    buf: &mut *buf,
                    pos: &mut pos,
                };
                encode_short_header(h, &mut w, &mut remaining, largest_acked)
            }
        };
        Self {
            body_start: pos,
            buf,
            pos,
            remaining,
            header,
            frames: Vec::new(),
            pn,
            packet_len_offset,
            packet_num_offset,
            cipher_overhead: 0,
        }
    }

    fn put(&mut self, data: &[u8]) {
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
        self.remaining = self.remaining.saturating_sub(data.len());
    }

    pub fn build(mut self) -> InplaceBuiltPacket {
        let min_body = MAX_PACKET_NUM_ENCODING_SIZE - self.pn.len + HEADER_PROTECTION_SAMPLE_LEN;
        while (self.pos - self.body_start) + self.cipher_overhead < min_body
            && !self.frames.is_empty()
            && self.remaining > MAX_PACKET_LEN_SIZE
        {
            self.put(&[0]); // PADDING
        }
        if let PacketHeader::Long(h) = &self.header {
            if h.ty != LongType::Retry {
                let body_len = self.pos - self.body_start;
                let packet_len = self.pn.len + body_len + self.cipher_overhead;
                let mut slot = Vec::with_capacity(MAX_PACKET_LEN_SIZE);
                VarInt::from_u64(packet_len as u64)
                    .expect("packet length is bounded by the buffer")
                    .encode_fixed4(&mut slot);
                self.buf[self.packet_len_offset..self.packet_len_offset + MAX_PACKET_LEN_SIZE]
                    .copy_from_slice(&slot);
                self.buf[self.packet_num_offset..self.packet_num_offset + self.pn.len]
                    .copy_from_slice(&self.pn.to_bytes()[..self.pn.len]);
            }
        }
        InplaceBuiltPacket {
            header: self.header,
            frames: self.frames,
            header_len: self.body_start,
            packet_len: self.pos,
        }
    }
}

impl PacketBuilder for InplacePacketBuilder<'_> {
    fn remaining_space_in_pkt(&self) -> usize {
        self.remaining
    }

    fn write_var(&mut self, value: VarInt) {
        let mut tmp = [0u8; 8];
        let mut cursor = &mut tmp[..];
        value.encode(&mut cursor);
        let len = value.size();
        self.put(&tmp[..len]);
    }

    fn write_u8(&mut self, value: u8) {
        self.put(&[value]);
    }

    fn write_u16(&mut self, value: u16) {
        self.put(&value.to_be_bytes());
    }

    fn write_u32(&mut self, value: u32) {
        self.put(&value.to_be_bytes());
    }

    fn write_u64(&mut self, value: u64) {
        self.put(&value.to_be_bytes());
    }

    fn push(&mut self, data: &[u8]) {
        self.put(data);
    }

    fn insert(&mut self, data: Bytes) {
        self.put(&data);
    }

    fn append_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    fn set_cipher_overhead(&mut self, overhead: u8) {
        self.cipher_overhead = overhead as usize;
    }

    fn can_build_packet(&self) -> bool {
        self.remaining != 0
    }
}

/// Encode a frame into the packet body and record it, refusing if it does
/// not fit.
pub fn write_frame<B: PacketBuilder>(frame: Frame, builder: &mut B) -> bool {
    let mut buf = Vec::new();
    frame.encode(&mut buf);
    if buf.len() > builder.remaining_space_in_pkt() {
        return false;
    }
    builder.push(&buf);
    builder.append_frame(frame);
    true
}

/// Build a stateless reset datagram: one byte with only the fixed bit set,
/// `max_packet_size - 16 - 1` cryptographically random bytes, then the reset
/// token.
pub fn build_stateless_reset(max_packet_size: usize, token: &StatelessResetToken) -> Bytes {
    debug_assert!(max_packet_size > token.as_ref().len() + 1);
    let random_len = max_packet_size - token.as_ref().len() - 1;
    let mut out = vec![0u8; 1 + random_len];
    rand::thread_rng().fill_bytes(&mut out[1..]);
    out[0] = FIXED_BIT;
    out.extend_from_slice(token.as_ref());
    out.into()
}

/// Build a version negotiation datagram advertising `versions`.
///
/// Unencrypted by definition; truncates the list rather than exceed the
/// default send size.
pub fn build_version_negotiation(
    dst_cid: &ConnectionId,
    src_cid: &ConnectionId,
    versions: &[Version],
) -> Bytes {
    let mut remaining = DEFAULT_UDP_SEND_PACKET_LEN;
    let mut out = Vec::with_capacity(64);
    out.put_u8(HEADER_FORM_MASK);
    out.put_u32(Version::NEGOTIATION.0);
    out.put_u8(dst_cid.len() as u8);
    out.put_slice(dst_cid);
    out.put_u8(src_cid.len() as u8);
    out.put_slice(src_cid);
    remaining -= out.len();
    for version in versions {
        if remaining < 4 {
            break;
        }
        out.put_u32(version.0);
        remaining -= 4;
    }
    out.into()
}

#[cfg(test)]
mod tests {
    use bytes::{Buf, Bytes};

    use super::*;
    use crate::frame::{CodecParams, decode_frames};
    use crate::packet::{
        header_form, parse_long_header, parse_short_header_invariant, HeaderForm,
        LongHeaderResult,
    };
    use crate::{StreamId, RESET_TOKEN_SIZE};

    fn cid(bytes: &[u8]) -> ConnectionId {
        ConnectionId::new(bytes)
    }

    fn ping_and_stream() -> Vec<Frame> {
        vec![
            Frame::Ping,
            Frame::Stream(crate::frame::Stream {
                id: StreamId(1),
                offset: 0,
                fin: true,
                data: Bytes::from_static(b"hello, world!"),
            }),
        ]
    }

    fn build_regular(header: PacketHeader) -> BuiltPacket {
        let mut builder = RegularPacketBuilder::new(DEFAULT_UDP_SEND_PACKET_LEN, header, 0);
        for frame in ping_and_stream() {
            assert!(write_frame(frame, &mut builder));
        }
        builder.build()
    }

    #[test]
    fn long_header_roundtrip() {
        let header = PacketHeader::initial(
            Version::QUIC_V1,
            cid(&[9; 4]),
            cid(&[7; 8]),
            1,
            Bytes::from_static(b"tok"),
        );
        let packet = build_regular(header);
        let wire = packet.to_bytes();

        let first = wire[0];
        assert_eq!(header_form(first), HeaderForm::Long);
        let mut buf = wire.slice(1..);
        let parsed = match parse_long_header(first, &mut buf).unwrap() {
            LongHeaderResult::Parsed(p) => p,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(parsed.ty, LongType::Initial);
        assert_eq!(parsed.invariant.dst_cid, cid(&[7; 8]));
        assert_eq!(parsed.invariant.src_cid, cid(&[9; 4]));
        assert_eq!(parsed.token.as_ref(), b"tok");
        // The deferred length slot is always the fixed 4-byte form.
        assert_eq!(parsed.packet_len.encoded_size, MAX_PACKET_LEN_SIZE);
        assert_eq!(
            parsed.packet_len.value as usize,
            parsed.packet_num_len + packet.body_bytes.len()
        );

        buf.advance(parsed.packet_num_len);
        let frames = decode_frames(buf, HeaderForm::Long, CodecParams::default()).unwrap();
        // Trailing padding coalesces into one extra frame.
        assert_eq!(frames[..2], ping_and_stream()[..]);
        assert!(matches!(frames.last(), Some(Frame::Padding) | Some(Frame::Stream(_))));
    }

    #[test]
    fn short_header_roundtrip() {
        let header = PacketHeader::short(ProtectionType::KeyPhaseOne, cid(&[3; 8]), 77);
        let packet = build_regular(header);
        let wire = packet.to_bytes();

        assert_eq!(header_form(wire[0]), HeaderForm::Short);
        assert_ne!(wire[0] & KEY_PHASE_BIT, 0);
        let mut buf = wire.slice(1..);
        let invariant = parse_short_header_invariant(wire[0], &mut buf, 8).unwrap();
        assert_eq!(invariant.dst_cid, cid(&[3; 8]));

        let pn_len = crate::packet::packet_number_len(wire[0]);
        buf.advance(pn_len);
        let frames = decode_frames(buf, HeaderForm::Short, CodecParams::default()).unwrap();
        assert_eq!(frames[..2], ping_and_stream()[..]);
    }

    #[test]
    fn body_padded_for_header_protection_sample() {
        let header = PacketHeader::short(ProtectionType::KeyPhaseZero, cid(&[3; 8]), 1);
        let mut builder = RegularPacketBuilder::new(DEFAULT_UDP_SEND_PACKET_LEN, header, 0);
        assert!(write_frame(Frame::Ping, &mut builder));
        let pn_len = 1;
        let packet = builder.build();
        assert!(
            packet.body_bytes.len() >= MAX_PACKET_NUM_ENCODING_SIZE - pn_len + HEADER_PROTECTION_SAMPLE_LEN
        );
    }

    #[test]
    fn empty_packet_not_padded() {
        let header = PacketHeader::short(ProtectionType::KeyPhaseZero, cid(&[3; 8]), 1);
        let builder = RegularPacketBuilder::new(DEFAULT_UDP_SEND_PACKET_LEN, header, 0);
        let packet = builder.build();
        assert!(packet.body_bytes.is_empty());
    }

    #[test]
    fn cipher_overhead_reduces_padding() {
        let header = PacketHeader::short(ProtectionType::KeyPhaseZero, cid(&[3; 8]), 1);
        let mut builder = RegularPacketBuilder::new(DEFAULT_UDP_SEND_PACKET_LEN, header, 0);
        builder.set_cipher_overhead(16);
        assert!(write_frame(Frame::Ping, &mut builder));
        let packet = builder.build();
        // 16 bytes of AEAD expansion already satisfy the sample bound.
        assert!(packet.body_bytes.len() <= 3);
    }

    #[test]
    fn inplace_matches_regular() {
        let header = PacketHeader::long(
            LongType::Handshake,
            Version::QUIC_V1,
            cid(&[9; 4]),
            cid(&[7; 8]),
            2,
        );
        let regular = {
            let mut b = RegularPacketBuilder::new(DEFAULT_UDP_SEND_PACKET_LEN, header.clone(), 0);
            for frame in ping_and_stream() {
                assert!(write_frame(frame, &mut b));
            }
            b.build()
        };

        let mut storage = vec![0u8; DEFAULT_UDP_SEND_PACKET_LEN];
        let inplace = {
            let mut b = InplacePacketBuilder::new(&mut storage, header, 0);
            for frame in ping_and_stream() {
                assert!(write_frame(frame, &mut b));
            }
            b.build()
        };

        let regular_wire = regular.to_bytes();
        assert_eq!(&storage[..inplace.packet_len], regular_wire.as_ref());
        assert_eq!(inplace.header_len, regular.header_bytes.len());
    }

    #[test]
    fn retry_has_no_length_or_packet_number() {
        let mut header = PacketHeader::long(
            LongType::Retry,
            Version::QUIC_V1,
            cid(&[9; 4]),
            cid(&[7; 8]),
            0,
        );
        if let PacketHeader::Long(h) = &mut header {
            h.token = Bytes::from_static(&[0x5a; 24]); // token + integrity tag
            h.orig_dst_cid = Some(cid(&[1; 8]));
        }
        let packet = RegularPacketBuilder::new(DEFAULT_UDP_SEND_PACKET_LEN, header, 0).build();
        let wire = packet.to_bytes();
        let mut buf = wire.slice(1..);
        let parsed = match parse_long_header(wire[0], &mut buf).unwrap() {
            LongHeaderResult::Parsed(p) => p,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(parsed.ty, LongType::Retry);
        assert_eq!(parsed.token.as_ref(), &[0x5a; 24][..]);
        assert_eq!(parsed.packet_len.value, 0);
    }

    #[test]
    fn stateless_reset_shape() {
        let token = StatelessResetToken::from([0xab; RESET_TOKEN_SIZE]);
        let packet = build_stateless_reset(100, &token);
        assert_eq!(packet.len(), 100);
        assert_eq!(packet[0], FIXED_BIT);
        assert_eq!(header_form(packet[0]), HeaderForm::Short);
        assert_eq!(&packet[packet.len() - RESET_TOKEN_SIZE..], token.as_ref());
    }

    #[test]
    fn version_negotiation_roundtrip() {
        let wire = build_version_negotiation(
            &cid(&[1; 8]),
            &cid(&[2; 8]),
            &[Version::QUIC_V1, Version::DRAFT_29],
        );
        let first = wire[0];
        assert_eq!(header_form(first), HeaderForm::Long);
        let mut buf = wire.slice(1..);
        let invariant = match parse_long_header(first, &mut buf).unwrap() {
            LongHeaderResult::VersionNegotiation(inv) => inv,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(invariant.dst_cid, cid(&[1; 8]));
        assert_eq!(invariant.src_cid, cid(&[2; 8]));
        let packet = crate::packet::decode_version_negotiation(&invariant, &mut buf).unwrap();
        assert_eq!(packet.versions, vec![Version::QUIC_V1, Version::DRAFT_29]);
    }
}
