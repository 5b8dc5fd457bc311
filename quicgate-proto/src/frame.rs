//! Frame-level encoding and decoding.
//!
//! Every decoder shares one error contract: malformed input yields a
//! [`TransportError`] with code `FRAME_ENCODING_ERROR` carrying the frame
//! type that was being parsed. Stream, crypto, and token payloads are handed
//! off by reference count, never copied.

use std::fmt;
use std::ops::RangeInclusive;

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;
use tinyvec::TinyVec;

use crate::coding::{self, BufExt, BufMutExt, UnexpectedEnd};
use crate::packet::HeaderForm;
use crate::{
    ConnectionId, Dir, StreamId, TransportError, VarInt, DEFAULT_ACK_DELAY_EXPONENT, MAX_CID_SIZE,
    MAX_REASON_PHRASE_LEN, RESET_TOKEN_SIZE,
};

/// A QUIC frame type
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct FrameType(u64);

impl FrameType {
    fn stream(self) -> Option<StreamInfo> {
        if STREAM_TYS.contains(&self.0) {
            Some(StreamInfo(self.0 as u8))
        } else {
            None
        }
    }

    /// Raw wire value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl coding::Codec for FrameType {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Self(buf.get_var()?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write_var(self.0);
    }
}

macro_rules! frame_types {
    {$($name:ident = $val:expr,)*} => {
        impl FrameType {
            $(pub(crate) const $name: FrameType = FrameType($val);)*
        }

        impl fmt::Debug for FrameType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    _ => write!(f, "Type({:02x})", self.0),
                }
            }
        }

        impl fmt::Display for FrameType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x if STREAM_TYS.contains(&x) => f.write_str("STREAM"),
                    _ => write!(f, "<unknown {:02x}>", self.0),
                }
            }
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct StreamInfo(u8);

impl StreamInfo {
    fn fin(self) -> bool {
        self.0 & 0x01 != 0
    }
    fn len(self) -> bool {
        self.0 & 0x02 != 0
    }
    fn off(self) -> bool {
        self.0 & 0x04 != 0
    }
}

frame_types! {
    PADDING = 0x00,
    PING = 0x01,
    ACK = 0x02,
    ACK_ECN = 0x03,
    RESET_STREAM = 0x04,
    STOP_SENDING = 0x05,
    CRYPTO = 0x06,
    NEW_TOKEN = 0x07,
    // STREAM 0x08..=0x0f
    MAX_DATA = 0x10,
    MAX_STREAM_DATA = 0x11,
    MAX_STREAMS_BIDI = 0x12,
    MAX_STREAMS_UNI = 0x13,
    DATA_BLOCKED = 0x14,
    STREAM_DATA_BLOCKED = 0x15,
    STREAMS_BLOCKED_BIDI = 0x16,
    STREAMS_BLOCKED_UNI = 0x17,
    NEW_CONNECTION_ID = 0x18,
    RETIRE_CONNECTION_ID = 0x19,
    PATH_CHALLENGE = 0x1a,
    PATH_RESPONSE = 0x1b,
    CONNECTION_CLOSE = 0x1c,
    APPLICATION_CLOSE = 0x1d,
    HANDSHAKE_DONE = 0x1e,
    // Partial-reliability extension
    MIN_STREAM_DATA = 0xfe,
    EXPIRED_STREAM_DATA = 0xff,
}

const STREAM_TYS: RangeInclusive<u64> = RangeInclusive::new(0x08, 0x0f);

/// Parameters negotiated (or defaulted) with the peer that affect decoding.
#[derive(Debug, Copy, Clone)]
pub struct CodecParams {
    /// Exponent applied to ack delay fields in short-header packets.
    pub peer_ack_delay_exponent: u8,
}

impl Default for CodecParams {
    fn default() -> Self {
        Self {
            peer_ack_delay_exponent: DEFAULT_ACK_DELAY_EXPONENT,
        }
    }
}

/// A decoded QUIC frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Padding,
    Ping,
    Ack(Ack),
    ResetStream(ResetStream),
    StopSending(StopSending),
    Crypto(Crypto),
    NewToken(NewToken),
    Stream(Stream),
    MaxData(VarInt),
    MaxStreamData { id: StreamId, offset: u64 },
    MaxStreams { dir: Dir, count: u64 },
    DataBlocked { offset: u64 },
    StreamDataBlocked { id: StreamId, offset: u64 },
    StreamsBlocked { dir: Dir, limit: u64 },
    NewConnectionId(NewConnectionId),
    RetireConnectionId { sequence: u64 },
    PathChallenge(u64),
    PathResponse(u64),
    Close(Close),
    MinStreamData(MinStreamData),
    ExpiredStreamData(ExpiredStreamData),
    HandshakeDone,
}

impl Frame {
    /// The wire type this frame encodes as.
    pub fn ty(&self) -> FrameType {
        use Frame::*;
        match *self {
            Padding => FrameType::PADDING,
            Ping => FrameType::PING,
            Ack(ref x) if x.ecn.is_some() => FrameType::ACK_ECN,
            Ack(_) => FrameType::ACK,
            ResetStream(_) => FrameType::RESET_STREAM,
            StopSending(_) => FrameType::STOP_SENDING,
            Crypto(_) => FrameType::CRYPTO,
            NewToken(_) => FrameType::NEW_TOKEN,
            Stream(ref x) => {
                let mut ty = *STREAM_TYS.start() | 0x02;
                if x.offset != 0 {
                    ty |= 0x04;
                }
                if x.fin {
                    ty |= 0x01;
                }
                FrameType(ty)
            }
            MaxData(_) => FrameType::MAX_DATA,
            MaxStreamData { .. } => FrameType::MAX_STREAM_DATA,
            MaxStreams { dir: Dir::Bi, .. } => FrameType::MAX_STREAMS_BIDI,
            MaxStreams { dir: Dir::Uni, .. } => FrameType::MAX_STREAMS_UNI,
            DataBlocked { .. } => FrameType::DATA_BLOCKED,
            StreamDataBlocked { .. } => FrameType::STREAM_DATA_BLOCKED,
            StreamsBlocked { dir: Dir::Bi, .. } => FrameType::STREAMS_BLOCKED_BIDI,
            StreamsBlocked { dir: Dir::Uni, .. } => FrameType::STREAMS_BLOCKED_UNI,
            NewConnectionId(_) => FrameType::NEW_CONNECTION_ID,
            RetireConnectionId { .. } => FrameType::RETIRE_CONNECTION_ID,
            PathChallenge(_) => FrameType::PATH_CHALLENGE,
            PathResponse(_) => FrameType::PATH_RESPONSE,
            Close(self::Close::Connection(_)) => FrameType::CONNECTION_CLOSE,
            Close(self::Close::Application(_)) => FrameType::APPLICATION_CLOSE,
            MinStreamData(_) => FrameType::MIN_STREAM_DATA,
            ExpiredStreamData(_) => FrameType::EXPIRED_STREAM_DATA,
            HandshakeDone => FrameType::HANDSHAKE_DONE,
        }
    }

    /// Append the wire encoding of this frame.
    ///
    /// Ack delays are re-scaled with the default exponent; ack blocks are
    /// emitted largest-first.
    pub fn encode<W: BufMut>(&self, out: &mut W) {
        use Frame::*;
        match *self {
            Padding => out.write(FrameType::PADDING),
            Ping => out.write(FrameType::PING),
            Ack(ref x) => x.encode(DEFAULT_ACK_DELAY_EXPONENT, out),
            ResetStream(ref x) => x.encode(out),
            StopSending(ref x) => x.encode(out),
            Crypto(ref x) => x.encode(out),
            NewToken(ref x) => x.encode(out),
            Stream(ref x) => x.encode(out),
            MaxData(x) => {
                out.write(FrameType::MAX_DATA);
                out.write(x);
            }
            MaxStreamData { id, offset } => {
                out.write(FrameType::MAX_STREAM_DATA);
                out.write(id);
                out.write_var(offset);
            }
            MaxStreams { dir, count } => {
                out.write(match dir {
                    Dir::Bi => FrameType::MAX_STREAMS_BIDI,
                    Dir::Uni => FrameType::MAX_STREAMS_UNI,
                });
                out.write_var(count);
            }
            DataBlocked { offset } => {
                out.write(FrameType::DATA_BLOCKED);
                out.write_var(offset);
            }
            StreamDataBlocked { id, offset } => {
                out.write(FrameType::STREAM_DATA_BLOCKED);
                out.write(id);
                out.write_var(offset);
            }
            StreamsBlocked { dir, limit } => {
                out.write(match dir {
                    Dir::Bi => FrameType::STREAMS_BLOCKED_BIDI,
                    Dir::Uni => FrameType::STREAMS_BLOCKED_UNI,
                });
                out.write_var(limit);
            }
            NewConnectionId(ref x) => x.encode(out),
            RetireConnectionId { sequence } => {
                out.write(FrameType::RETIRE_CONNECTION_ID);
                out.write_var(sequence);
            }
            PathChallenge(token) => {
                out.write(FrameType::PATH_CHALLENGE);
                out.put_u64(token);
            }
            PathResponse(token) => {
                out.write(FrameType::PATH_RESPONSE);
                out.put_u64(token);
            }
            Close(ref x) => x.encode(out),
            MinStreamData(ref x) => x.encode(out),
            ExpiredStreamData(ref x) => x.encode(out),
            HandshakeDone => out.write(FrameType::HANDSHAKE_DONE),
        }
    }
}

/// One inclusive range of acknowledged packet numbers.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct AckBlock {
    pub start: u64,
    pub end: u64,
}

/// Invalid ack block sequence passed to [`AckBlocks::new`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("ack blocks must descend with strict gaps")]
pub struct InvalidAckBlocks;

/// Ordered ack ranges, largest-first, with strict gaps between blocks:
/// `blocks[i].start > blocks[i + 1].end + 1`.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct AckBlocks(TinyVec<[AckBlock; 4]>);

impl AckBlocks {
    /// Validate and adopt a largest-first block sequence.
    pub fn new(blocks: impl IntoIterator<Item = AckBlock>) -> Result<Self, InvalidAckBlocks> {
        let mut out = TinyVec::new();
        let mut prev: Option<AckBlock> = None;
        for block in blocks {
            if block.start > block.end {
                return Err(InvalidAckBlocks);
            }
            if let Some(prev) = prev {
                if prev.start <= block.end + 1 {
                    return Err(InvalidAckBlocks);
                }
            }
            prev = Some(block);
            out.push(block);
        }
        if out.is_empty() {
            return Err(InvalidAckBlocks);
        }
        Ok(Self(out))
    }

    /// Largest acknowledged packet number.
    pub fn largest(&self) -> u64 {
        self.0[0].end
    }

    pub fn iter(&self) -> impl Iterator<Item = AckBlock> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// ECN counts trailing an ACK_ECN frame.
///
/// Validated syntactically on decode and surfaced to the caller; the server
/// core itself does not consume them.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ce: u64,
}

impl EcnCounts {
    fn encode<W: BufMut>(&self, out: &mut W) {
        out.write_var(self.ect0);
        out.write_var(self.ect1);
        out.write_var(self.ce);
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Ack {
    /// Largest packet number being acknowledged.
    pub largest: u64,
    /// Ack delay in microseconds, already scaled by the applicable exponent.
    pub delay_micros: u64,
    /// Acknowledged ranges, largest-first.
    pub blocks: AckBlocks,
    pub ecn: Option<EcnCounts>,
}

impl Ack {
    /// Encode with the given ack delay exponent.
    pub fn encode<W: BufMut>(&self, exponent: u8, out: &mut W) {
        debug_assert_eq!(self.largest, self.blocks.largest());
        out.write(match self.ecn {
            Some(_) => FrameType::ACK_ECN,
            None => FrameType::ACK,
        });
        out.write_var(self.largest);
        out.write_var(self.delay_micros >> exponent);
        out.write_var(self.blocks.len() as u64 - 1);
        let mut blocks = self.blocks.iter();
        let first = blocks.next().expect("ack blocks are never empty");
        out.write_var(first.end - first.start);
        let mut prev = first.start;
        for block in blocks {
            out.write_var(prev - block.end - 2);
            out.write_var(block.end - block.start);
            prev = block.start;
        }
        if let Some(ecn) = self.ecn {
            ecn.encode(out);
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ResetStream {
    pub id: StreamId,
    pub error_code: VarInt,
    pub final_offset: VarInt,
}

impl ResetStream {
    fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::RESET_STREAM);
        out.write(self.id);
        out.write(self.error_code);
        out.write(self.final_offset);
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StopSending {
    pub id: StreamId,
    pub error_code: VarInt,
}

impl StopSending {
    fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::STOP_SENDING);
        out.write(self.id);
        out.write(self.error_code);
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Crypto {
    pub offset: u64,
    pub data: Bytes,
}

impl Crypto {
    fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::CRYPTO);
        out.write_var(self.offset);
        out.write_var(self.data.len() as u64);
        out.put_slice(&self.data);
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NewToken {
    pub token: Bytes,
}

impl NewToken {
    fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::NEW_TOKEN);
        out.write_var(self.token.len() as u64);
        out.put_slice(&self.token);
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Stream {
    pub id: StreamId,
    pub offset: u64,
    pub fin: bool,
    pub data: Bytes,
}

impl Stream {
    fn encode<W: BufMut>(&self, out: &mut W) {
        let mut ty = *STREAM_TYS.start() | 0x02;
        if self.offset != 0 {
            ty |= 0x04;
        }
        if self.fin {
            ty |= 0x01;
        }
        out.write_var(ty);
        out.write(self.id);
        if self.offset != 0 {
            out.write_var(self.offset);
        }
        out.write_var(self.data.len() as u64);
        out.put_slice(&self.data);
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NewConnectionId {
    pub sequence: u64,
    pub retire_prior_to: u64,
    pub id: ConnectionId,
    pub reset_token: [u8; RESET_TOKEN_SIZE],
}

impl NewConnectionId {
    fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::NEW_CONNECTION_ID);
        out.write_var(self.sequence);
        out.write_var(self.retire_prior_to);
        out.put_u8(self.id.len() as u8);
        out.put_slice(&self.id);
        out.put_slice(&self.reset_token);
    }
}

/// Reason given for closing the connection
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Close {
    /// The transport detected an error
    Connection(ConnectionClose),
    /// The application closed the connection
    Application(ApplicationClose),
}

impl Close {
    fn encode<W: BufMut>(&self, out: &mut W) {
        match *self {
            Self::Connection(ref x) => x.encode(out),
            Self::Application(ref x) => x.encode(out),
        }
    }
}

impl From<TransportError> for Close {
    fn from(x: TransportError) -> Self {
        Self::Connection(x.into())
    }
}

/// Transport-level close, carrying the triggering frame type.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionClose {
    pub error_code: crate::TransportErrorCode,
    pub frame_type: Option<FrameType>,
    pub reason: Bytes,
}

impl From<TransportError> for ConnectionClose {
    fn from(x: TransportError) -> Self {
        Self {
            error_code: x.code,
            frame_type: x.frame,
            reason: Bytes::from_static(x.reason.as_bytes()),
        }
    }
}

impl ConnectionClose {
    fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::CONNECTION_CLOSE);
        out.write(self.error_code);
        out.write_var(self.frame_type.map_or(0, |x| x.0));
        out.write_var(self.reason.len() as u64);
        out.put_slice(&self.reason);
    }
}

/// Application-level close with an opaque 62-bit code.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ApplicationClose {
    pub error_code: VarInt,
    pub reason: Bytes,
}

impl ApplicationClose {
    fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::APPLICATION_CLOSE);
        out.write(self.error_code);
        out.write_var(self.reason.len() as u64);
        out.put_slice(&self.reason);
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MinStreamData {
    pub id: StreamId,
    pub maximum_data: u64,
    pub minimum_stream_offset: u64,
}

impl MinStreamData {
    fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::MIN_STREAM_DATA);
        out.write(self.id);
        out.write_var(self.maximum_data);
        out.write_var(self.minimum_stream_offset);
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ExpiredStreamData {
    pub id: StreamId,
    pub minimum_stream_offset: u64,
}

impl ExpiredStreamData {
    fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::EXPIRED_STREAM_DATA);
        out.write(self.id);
        out.write_var(self.minimum_stream_offset);
    }
}

/// Frame decoder over a packet payload.
///
/// Yields frames until the payload is exhausted; the first malformed frame
/// drains the payload and yields the structured error, so the caller can
/// close the offending connection with `FRAME_ENCODING_ERROR`.
pub struct Iter {
    bytes: Bytes,
    header_form: HeaderForm,
    params: CodecParams,
    last_ty: Option<FrameType>,
}

impl Iter {
    pub fn new(
        payload: Bytes,
        header_form: HeaderForm,
        params: CodecParams,
    ) -> Result<Self, TransportError> {
        if payload.is_empty() {
            return Err(TransportError::PROTOCOL_VIOLATION("packet payload is empty"));
        }
        Ok(Self {
            bytes: payload,
            header_form,
            params,
            last_ty: None,
        })
    }

    fn take_len(&mut self) -> Result<Bytes, IterErr> {
        let len = self.bytes.get_var()?;
        if len > self.bytes.remaining() as u64 {
            return Err(IterErr::Malformed("length mismatch"));
        }
        Ok(self.bytes.split_to(len as usize))
    }

    fn take_remaining(&mut self) -> Bytes {
        std::mem::take(&mut self.bytes)
    }

    fn ack_delay_exponent(&self) -> u8 {
        match self.header_form {
            // Before negotiation the peer has to use something; the protocol
            // pins the default for every long-header packet.
            HeaderForm::Long => DEFAULT_ACK_DELAY_EXPONENT,
            HeaderForm::Short => self.params.peer_ack_delay_exponent,
        }
    }

    fn decode_ack(&mut self, with_ecn: bool) -> Result<Ack, IterErr> {
        let largest = self.bytes.get_var()?;
        let delay = self.bytes.get_var()?;
        let additional_blocks = self.bytes.get_var()?;
        let first_block_len = self.bytes.get_var()?;

        let exponent = self.ack_delay_exponent();
        // An exponent of 0 is legitimate and would make the guard shift by
        // the full word width; anything at or above 64 cannot be shifted at
        // all.
        if exponent >= 64 {
            return Err(IterErr::Malformed("ack delay exponent out of range"));
        }
        if exponent > 0 && delay >> (64 - u32::from(exponent)) != 0 {
            return Err(IterErr::Malformed("ack delay overflows"));
        }
        let delay_micros = delay << exponent;
        if delay_micros > i64::MAX as u64 {
            return Err(IterErr::Malformed("ack delay exceeds representable time"));
        }

        let mut start = largest
            .checked_sub(first_block_len)
            .ok_or(IterErr::Malformed("bad first block"))?;
        let mut blocks = TinyVec::new();
        blocks.push(AckBlock { start, end: largest });
        for _ in 0..additional_blocks {
            let gap = self.bytes.get_var()?;
            let block_len = self.bytes.get_var()?;
            let end = start
                .checked_sub(gap + 2)
                .ok_or(IterErr::Malformed("bad gap"))?;
            start = end
                .checked_sub(block_len)
                .ok_or(IterErr::Malformed("bad block len"))?;
            blocks.push(AckBlock { start, end });
        }

        let ecn = if with_ecn {
            Some(EcnCounts {
                ect0: self.bytes.get_var()?,
                ect1: self.bytes.get_var()?,
                ce: self.bytes.get_var()?,
            })
        } else {
            None
        };

        Ok(Ack {
            largest,
            delay_micros,
            blocks: AckBlocks(blocks),
            ecn,
        })
    }

    fn try_next(&mut self) -> Result<Frame, IterErr> {
        let ty = self.bytes.get::<FrameType>()?;
        self.last_ty = Some(ty);
        Ok(match ty {
            FrameType::PADDING => {
                // Padding runs are common; coalesce the whole run into one
                // frame instead of yielding per byte.
                while self.bytes.has_remaining() && self.bytes.chunk()[0] == 0 {
                    self.bytes.advance(1);
                }
                Frame::Padding
            }
            FrameType::PING => Frame::Ping,
            FrameType::ACK => Frame::Ack(self.decode_ack(false)?),
            FrameType::ACK_ECN => Frame::Ack(self.decode_ack(true)?),
            FrameType::RESET_STREAM => Frame::ResetStream(ResetStream {
                id: self.bytes.get()?,
                error_code: self.bytes.get()?,
                final_offset: self.bytes.get()?,
            }),
            FrameType::STOP_SENDING => Frame::StopSending(StopSending {
                id: self.bytes.get()?,
                error_code: self.bytes.get()?,
            }),
            FrameType::CRYPTO => Frame::Crypto(Crypto {
                offset: self.bytes.get_var()?,
                data: self.take_len()?,
            }),
            FrameType::NEW_TOKEN => Frame::NewToken(NewToken {
                token: self.take_len()?,
            }),
            FrameType::MAX_DATA => Frame::MaxData(self.bytes.get()?),
            FrameType::MAX_STREAM_DATA => Frame::MaxStreamData {
                id: self.bytes.get()?,
                offset: self.bytes.get_var()?,
            },
            FrameType::MAX_STREAMS_BIDI => Frame::MaxStreams {
                dir: Dir::Bi,
                count: self.bytes.get_var()?,
            },
            FrameType::MAX_STREAMS_UNI => Frame::MaxStreams {
                dir: Dir::Uni,
                count: self.bytes.get_var()?,
            },
            FrameType::DATA_BLOCKED => Frame::DataBlocked {
                offset: self.bytes.get_var()?,
            },
            FrameType::STREAM_DATA_BLOCKED => Frame::StreamDataBlocked {
                id: self.bytes.get()?,
                offset: self.bytes.get_var()?,
            },
            FrameType::STREAMS_BLOCKED_BIDI => Frame::StreamsBlocked {
                dir: Dir::Bi,
                limit: self.bytes.get_var()?,
            },
            FrameType::STREAMS_BLOCKED_UNI => Frame::StreamsBlocked {
                dir: Dir::Uni,
                limit: self.bytes.get_var()?,
            },
            FrameType::NEW_CONNECTION_ID => {
                let sequence = self.bytes.get_var()?;
                let retire_prior_to = self.bytes.get_var()?;
                if retire_prior_to > sequence {
                    return Err(IterErr::Malformed("retire_prior_to exceeds sequence"));
                }
                let length = self.bytes.get::<u8>()? as usize;
                if length == 0 || length > MAX_CID_SIZE {
                    return Err(IterErr::Malformed("invalid connection id length"));
                }
                if self.bytes.remaining() < length {
                    return Err(IterErr::UnexpectedEnd);
                }
                let id = ConnectionId::new(&self.bytes.chunk()[..length]);
                self.bytes.advance(length);
                if self.bytes.remaining() < RESET_TOKEN_SIZE {
                    return Err(IterErr::UnexpectedEnd);
                }
                let mut reset_token = [0; RESET_TOKEN_SIZE];
                self.bytes.copy_to_slice(&mut reset_token);
                Frame::NewConnectionId(NewConnectionId {
                    sequence,
                    retire_prior_to,
                    id,
                    reset_token,
                })
            }
            FrameType::RETIRE_CONNECTION_ID => Frame::RetireConnectionId {
                sequence: self.bytes.get_var()?,
            },
            FrameType::PATH_CHALLENGE => Frame::PathChallenge(self.bytes.get()?),
            FrameType::PATH_RESPONSE => Frame::PathResponse(self.bytes.get()?),
            FrameType::CONNECTION_CLOSE => {
                let error_code = self.bytes.get()?;
                let (frame_value, frame_len) = {
                    let before = self.bytes.remaining();
                    let x = self.bytes.get_var()?;
                    (x, before - self.bytes.remaining())
                };
                // The triggering frame type has to fit a single byte.
                if frame_len != 1 {
                    return Err(IterErr::Malformed("oversized triggering frame type"));
                }
                Frame::Close(Close::Connection(ConnectionClose {
                    error_code,
                    frame_type: if frame_value == 0 {
                        None
                    } else {
                        Some(FrameType(frame_value))
                    },
                    reason: self.take_reason()?,
                }))
            }
            FrameType::APPLICATION_CLOSE => Frame::Close(Close::Application(ApplicationClose {
                error_code: self.bytes.get()?,
                reason: self.take_reason()?,
            })),
            FrameType::MIN_STREAM_DATA => Frame::MinStreamData(MinStreamData {
                id: self.bytes.get()?,
                maximum_data: self.bytes.get_var()?,
                minimum_stream_offset: self.bytes.get_var()?,
            }),
            FrameType::EXPIRED_STREAM_DATA => Frame::ExpiredStreamData(ExpiredStreamData {
                id: self.bytes.get()?,
                minimum_stream_offset: self.bytes.get_var()?,
            }),
            FrameType::HANDSHAKE_DONE => Frame::HandshakeDone,
            _ => {
                if let Some(s) = ty.stream() {
                    Frame::Stream(Stream {
                        id: self.bytes.get()?,
                        offset: if s.off() { self.bytes.get_var()? } else { 0 },
                        fin: s.fin(),
                        data: if s.len() {
                            self.take_len()?
                        } else {
                            // No length field: the rest of the packet is data.
                            self.take_remaining()
                        },
                    })
                } else {
                    return Err(IterErr::InvalidFrameId);
                }
            }
        })
    }

    fn take_reason(&mut self) -> Result<Bytes, IterErr> {
        let len = self.bytes.get_var()?;
        if len > MAX_REASON_PHRASE_LEN {
            return Err(IterErr::Malformed("bad reason phrase length"));
        }
        if len > self.bytes.remaining() as u64 {
            return Err(IterErr::UnexpectedEnd);
        }
        Ok(self.bytes.split_to(len as usize))
    }
}

impl Iterator for Iter {
    type Item = Result<Frame, TransportError>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.bytes.has_remaining() {
            return None;
        }
        match self.try_next() {
            Ok(x) => Some(Ok(x)),
            Err(e) => {
                // Corrupt frame: nothing after it can be trusted.
                self.bytes.clear();
                let mut err = TransportError::FRAME_ENCODING_ERROR(e.reason());
                err.frame = self.last_ty;
                Some(Err(err))
            }
        }
    }
}

/// Decode an entire payload into frames, failing on the first malformed one.
pub fn decode_frames(
    payload: Bytes,
    header_form: HeaderForm,
    params: CodecParams,
) -> Result<Vec<Frame>, TransportError> {
    Iter::new(payload, header_form, params)?.collect()
}

#[derive(Debug)]
enum IterErr {
    UnexpectedEnd,
    InvalidFrameId,
    Malformed(&'static str),
}

impl IterErr {
    fn reason(&self) -> &'static str {
        match *self {
            Self::UnexpectedEnd => "unexpected end",
            Self::InvalidFrameId => "invalid frame ID",
            Self::Malformed(reason) => reason,
        }
    }
}

impl From<UnexpectedEnd> for IterErr {
    fn from(_: UnexpectedEnd) -> Self {
        Self::UnexpectedEnd
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::TransportErrorCode;

    fn decode_one(payload: &[u8]) -> Result<Vec<Frame>, TransportError> {
        decode_frames(
            Bytes::copy_from_slice(payload),
            HeaderForm::Short,
            CodecParams::default(),
        )
    }

    fn roundtrip(frame: Frame) {
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        let decoded = decode_one(&buf).unwrap();
        assert_eq!(decoded, vec![frame]);
    }

    #[test]
    fn ack_multiple_blocks() {
        roundtrip(Frame::Ack(Ack {
            largest: 1000,
            delay_micros: 7 << DEFAULT_ACK_DELAY_EXPONENT,
            blocks: AckBlocks::new([
                AckBlock { start: 990, end: 1000 },
                AckBlock { start: 700, end: 800 },
                AckBlock { start: 3, end: 3 },
            ])
            .unwrap(),
            ecn: None,
        }));
    }

    #[test]
    fn ack_with_ecn_counts() {
        roundtrip(Frame::Ack(Ack {
            largest: 42,
            delay_micros: 0,
            blocks: AckBlocks::new([AckBlock { start: 0, end: 42 }]).unwrap(),
            ecn: Some(EcnCounts {
                ect0: 10,
                ect1: 2,
                ce: 1,
            }),
        }));
    }

    #[test]
    fn ack_gap_underflow_rejected() {
        let mut buf = Vec::new();
        buf.write(FrameType::ACK);
        buf.write_var(10); // largest
        buf.write_var(0); // delay
        buf.write_var(1); // one additional block
        buf.write_var(2); // first block: 8..=10
        buf.write_var(20); // gap larger than remaining space
        buf.write_var(0);
        let err = decode_one(&buf).unwrap_err();
        assert_eq!(err.code, TransportErrorCode::FRAME_ENCODING_ERROR);
        assert_eq!(err.frame, Some(FrameType::ACK));
    }

    #[test]
    fn ack_first_block_underflow_rejected() {
        let mut buf = Vec::new();
        buf.write(FrameType::ACK);
        buf.write_var(5);
        buf.write_var(0);
        buf.write_var(0);
        buf.write_var(6); // first block longer than largest
        let err = decode_one(&buf).unwrap_err();
        assert_eq!(err.code, TransportErrorCode::FRAME_ENCODING_ERROR);
    }

    #[test]
    fn ack_delay_overflow_rejected() {
        let mut buf = Vec::new();
        buf.write(FrameType::ACK);
        buf.write_var(10);
        // Shifting by the default exponent would overflow 64 bits.
        buf.write_var((1 << 62) - 1);
        buf.write_var(0);
        buf.write_var(0);
        let err = decode_one(&buf).unwrap_err();
        assert_eq!(err.code, TransportErrorCode::FRAME_ENCODING_ERROR);
        assert_eq!(err.frame, Some(FrameType::ACK));
    }

    #[test]
    fn padding_coalesces() {
        let mut buf = vec![0u8; 17];
        buf.push(0x01); // trailing PING
        let frames = decode_one(&buf).unwrap();
        assert_eq!(frames, vec![Frame::Padding, Frame::Ping]);
    }

    #[test]
    fn stream_variants() {
        roundtrip(Frame::Stream(Stream {
            id: StreamId(3),
            offset: 0,
            fin: false,
            data: Bytes::from_static(b"hello, world!"),
        }));
        roundtrip(Frame::Stream(Stream {
            id: StreamId(64),
            offset: 4096,
            fin: true,
            data: Bytes::new(),
        }));
    }

    #[test]
    fn stream_without_length_takes_rest() {
        let mut buf = Vec::new();
        buf.write_var(0x08); // OFF=0 LEN=0 FIN=0
        buf.write(StreamId(1));
        buf.extend_from_slice(b"rest of packet");
        let frames = decode_one(&buf).unwrap();
        assert_matches!(
            &frames[..],
            [Frame::Stream(s)] if s.data.as_ref() == b"rest of packet" && s.offset == 0 && !s.fin
        );
    }

    #[test]
    fn crypto_roundtrip() {
        roundtrip(Frame::Crypto(Crypto {
            offset: 1 << 20,
            data: Bytes::from_static(b"client hello"),
        }));
    }

    #[test]
    fn crypto_length_mismatch_rejected() {
        let mut buf = Vec::new();
        buf.write(FrameType::CRYPTO);
        buf.write_var(0);
        buf.write_var(100); // longer than the remaining payload
        buf.extend_from_slice(b"short");
        let err = decode_one(&buf).unwrap_err();
        assert_eq!(err.frame, Some(FrameType::CRYPTO));
    }

    #[test]
    fn new_connection_id_roundtrip() {
        roundtrip(Frame::NewConnectionId(NewConnectionId {
            sequence: 5,
            retire_prior_to: 2,
            id: ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]),
            reset_token: [0xab; RESET_TOKEN_SIZE],
        }));
    }

    #[test]
    fn new_connection_id_rejects_bad_lengths() {
        for bad_len in [0u8, 21] {
            let mut buf = Vec::new();
            buf.write(FrameType::NEW_CONNECTION_ID);
            buf.write_var(1);
            buf.write_var(0);
            buf.push(bad_len);
            buf.extend_from_slice(&[0; 64]);
            let err = decode_one(&buf).unwrap_err();
            assert_eq!(err.frame, Some(FrameType::NEW_CONNECTION_ID));
        }
    }

    #[test]
    fn retire_prior_to_must_not_exceed_sequence() {
        let mut buf = Vec::new();
        buf.write(FrameType::NEW_CONNECTION_ID);
        buf.write_var(1);
        buf.write_var(2);
        let err = decode_one(&buf).unwrap_err();
        assert_eq!(err.code, TransportErrorCode::FRAME_ENCODING_ERROR);
    }

    #[test]
    fn connection_close_roundtrip() {
        roundtrip(Frame::Close(Close::Connection(ConnectionClose {
            error_code: TransportErrorCode::PROTOCOL_VIOLATION,
            frame_type: Some(FrameType::ACK),
            reason: Bytes::from_static(b"bad peer"),
        })));
        roundtrip(Frame::Close(Close::Application(ApplicationClose {
            error_code: VarInt::from_u32(0x17),
            reason: Bytes::from_static(b"done"),
        })));
    }

    #[test]
    fn close_reason_too_long_rejected() {
        let mut buf = Vec::new();
        buf.write(FrameType::CONNECTION_CLOSE);
        buf.write(TransportErrorCode::NO_ERROR);
        buf.write_var(0);
        buf.write_var(MAX_REASON_PHRASE_LEN + 1);
        let err = decode_one(&buf).unwrap_err();
        assert_eq!(err.frame, Some(FrameType::CONNECTION_CLOSE));
    }

    #[test]
    fn path_frames_roundtrip() {
        roundtrip(Frame::PathChallenge(0xdead_beef_0102_0304));
        roundtrip(Frame::PathResponse(0xdead_beef_0102_0304));
    }

    #[test]
    fn limit_frames_roundtrip() {
        roundtrip(Frame::MaxData(VarInt::from_u32(1 << 20)));
        roundtrip(Frame::MaxStreamData {
            id: StreamId(9),
            offset: 1 << 21,
        });
        roundtrip(Frame::MaxStreams {
            dir: Dir::Uni,
            count: 128,
        });
        roundtrip(Frame::DataBlocked { offset: 77 });
        roundtrip(Frame::StreamDataBlocked {
            id: StreamId(4),
            offset: 99,
        });
        roundtrip(Frame::StreamsBlocked {
            dir: Dir::Bi,
            limit: 12,
        });
        roundtrip(Frame::RetireConnectionId { sequence: 8 });
        roundtrip(Frame::MinStreamData(MinStreamData {
            id: StreamId(1),
            maximum_data: 1 << 14,
            minimum_stream_offset: 512,
        }));
        roundtrip(Frame::ExpiredStreamData(ExpiredStreamData {
            id: StreamId(1),
            minimum_stream_offset: 512,
        }));
        roundtrip(Frame::HandshakeDone);
        roundtrip(Frame::NewToken(NewToken {
            token: Bytes::from_static(b"resume me"),
        }));
        roundtrip(Frame::ResetStream(ResetStream {
            id: StreamId(2),
            error_code: VarInt::from_u32(4),
            final_offset: VarInt::from_u32(1 << 16),
        }));
        roundtrip(Frame::StopSending(StopSending {
            id: StreamId(2),
            error_code: VarInt::from_u32(4),
        }));
    }

    #[test]
    fn unknown_frame_type_rejected() {
        let mut buf = Vec::new();
        buf.write_var(0x42);
        let err = decode_one(&buf).unwrap_err();
        assert_eq!(err.code, TransportErrorCode::FRAME_ENCODING_ERROR);
    }

    #[test]
    fn empty_payload_rejected() {
        let err = decode_one(&[]).unwrap_err();
        assert_eq!(err.code, TransportErrorCode::PROTOCOL_VIOLATION);
    }

    #[test]
    fn zero_ack_delay_exponent_decodes() {
        let mut buf = Vec::new();
        buf.write(FrameType::ACK);
        buf.write_var(10);
        // Largest encodable delay; with exponent 0 it is used unscaled.
        buf.write_var((1 << 62) - 1);
        buf.write_var(0);
        buf.write_var(0);
        let frames = decode_frames(
            Bytes::copy_from_slice(&buf),
            HeaderForm::Short,
            CodecParams {
                peer_ack_delay_exponent: 0,
            },
        )
        .unwrap();
        assert_matches!(&frames[..], [Frame::Ack(ack)] if ack.delay_micros == (1 << 62) - 1);
    }

    #[test]
    fn oversized_ack_delay_exponent_rejected() {
        let mut buf = Vec::new();
        buf.write(FrameType::ACK);
        buf.write_var(10);
        buf.write_var(1);
        buf.write_var(0);
        buf.write_var(0);
        let err = decode_frames(
            Bytes::copy_from_slice(&buf),
            HeaderForm::Short,
            CodecParams {
                peer_ack_delay_exponent: 64,
            },
        )
        .unwrap_err();
        assert_eq!(err.code, TransportErrorCode::FRAME_ENCODING_ERROR);
        assert_eq!(err.frame, Some(FrameType::ACK));
    }

    #[test]
    fn long_header_uses_default_ack_delay_exponent() {
        let mut buf = Vec::new();
        buf.write(FrameType::ACK);
        buf.write_var(10);
        buf.write_var(4); // 4 << 3 = 32us under the default exponent
        buf.write_var(0);
        buf.write_var(0);
        let frames = decode_frames(
            Bytes::copy_from_slice(&buf),
            HeaderForm::Long,
            CodecParams {
                peer_ack_delay_exponent: 10,
            },
        )
        .unwrap();
        assert_matches!(&frames[..], [Frame::Ack(ack)] if ack.delay_micros == 32);
    }
}
