use std::fmt;

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::coding::{self, Codec, UnexpectedEnd};

/// An integer less than 2^62
///
/// Values of this type are self-delimiting on the wire: the two most
/// significant bits of the first byte select a 1, 2, 4, or 8 byte encoding,
/// and the remaining bits carry the big-endian value. The encoder always
/// emits the canonical shortest form.
#[derive(Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VarInt(pub(crate) u64);

impl VarInt {
    /// The largest representable value.
    pub const MAX: Self = Self((1 << 62) - 1);

    /// Construct a `VarInt` infallibly from a `u32`.
    pub const fn from_u32(x: u32) -> Self {
        Self(x as u64)
    }

    /// Succeeds iff `x` < 2^62.
    pub const fn from_u64(x: u64) -> Result<Self, VarIntBoundsExceeded> {
        if x < 1 << 62 {
            Ok(Self(x))
        } else {
            Err(VarIntBoundsExceeded)
        }
    }

    /// Extract the integer value.
    pub const fn into_inner(self) -> u64 {
        self.0
    }

    /// Length of the canonical wire encoding, in bytes.
    pub const fn size(self) -> usize {
        let x = self.0;
        if x < 1 << 6 {
            1
        } else if x < 1 << 14 {
            2
        } else if x < 1 << 30 {
            4
        } else {
            8
        }
    }

    /// Encode with a forced 4-byte width.
    ///
    /// Used for the packet-length field, whose slot is reserved before the
    /// packet body is written and back-patched afterwards. The value must fit
    /// the 4-byte form, i.e. be below 2^30.
    pub fn encode_fixed4<B: BufMut>(self, buf: &mut B) {
        debug_assert!(self.0 < 1 << 30, "value does not fit a 4-byte varint");
        buf.put_u32(0b10 << 30 | self.0 as u32);
    }
}

impl From<VarInt> for u64 {
    fn from(x: VarInt) -> Self {
        x.0
    }
}

impl From<u32> for VarInt {
    fn from(x: u32) -> Self {
        Self(x.into())
    }
}

impl From<u16> for VarInt {
    fn from(x: u16) -> Self {
        Self(x.into())
    }
}

impl From<u8> for VarInt {
    fn from(x: u8) -> Self {
        Self(x.into())
    }
}

impl fmt::Debug for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Error returned when constructing a `VarInt` from a value >= 2^62.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("value too large for varint encoding")]
pub struct VarIntBoundsExceeded;

impl Codec for VarInt {
    fn decode<B: Buf>(r: &mut B) -> coding::Result<Self> {
        if !r.has_remaining() {
            return Err(UnexpectedEnd);
        }
        let mut buf = [0; 8];
        buf[0] = r.get_u8();
        let tag = buf[0] >> 6;
        buf[0] &= 0b0011_1111;
        let x = match tag {
            0b00 => u64::from(buf[0]),
            0b01 => {
                if r.remaining() < 1 {
                    return Err(UnexpectedEnd);
                }
                r.copy_to_slice(&mut buf[1..2]);
                u64::from(u16::from_be_bytes(buf[..2].try_into().unwrap()))
            }
            0b10 => {
                if r.remaining() < 3 {
                    return Err(UnexpectedEnd);
                }
                r.copy_to_slice(&mut buf[1..4]);
                u64::from(u32::from_be_bytes(buf[..4].try_into().unwrap()))
            }
            0b11 => {
                if r.remaining() < 7 {
                    return Err(UnexpectedEnd);
                }
                r.copy_to_slice(&mut buf[1..8]);
                u64::from_be_bytes(buf)
            }
            _ => unreachable!(),
        };
        Ok(Self(x))
    }

    fn encode<B: BufMut>(&self, w: &mut B) {
        let x = self.0;
        if x < 1 << 6 {
            w.put_u8(x as u8);
        } else if x < 1 << 14 {
            w.put_u16(0b01 << 14 | x as u16);
        } else if x < 1 << 30 {
            w.put_u32(0b10 << 30 | x as u32);
        } else if x < 1 << 62 {
            w.put_u64(0b11 << 62 | x);
        } else {
            unreachable!("malformed VarInt");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::coding::{BufExt, BufMutExt};

    fn roundtrip(x: u64) -> usize {
        let mut buf = Vec::new();
        buf.write_var(x);
        let len = buf.len();
        let mut r = io::Cursor::new(buf);
        assert_eq!(r.get_var(), Ok(x));
        len
    }

    #[test]
    fn sizes_are_canonical() {
        assert_eq!(roundtrip(0), 1);
        assert_eq!(roundtrip(63), 1);
        assert_eq!(roundtrip(64), 2);
        assert_eq!(roundtrip(16383), 2);
        assert_eq!(roundtrip(16384), 4);
        assert_eq!(roundtrip((1 << 30) - 1), 4);
        assert_eq!(roundtrip(1 << 30), 8);
        assert_eq!(roundtrip((1 << 62) - 1), 8);
        for x in [0, 63, 64, 16383, 16384, (1 << 30) - 1, 1 << 30, (1 << 62) - 1] {
            assert_eq!(VarInt(x).size(), roundtrip(x));
        }
    }

    #[test]
    fn bounds() {
        assert_eq!(VarInt::from_u64(1 << 62), Err(VarIntBoundsExceeded));
        assert_eq!(VarInt::from_u64((1 << 62) - 1), Ok(VarInt((1 << 62) - 1)));
    }

    #[test]
    fn truncated_rejected() {
        // Two-byte encoding of 64, cut to one byte
        let mut buf = Vec::new();
        buf.write_var(64);
        let mut r = io::Cursor::new(&buf[..1]);
        assert_eq!(VarInt::decode(&mut r), Err(UnexpectedEnd));

        let mut buf = Vec::new();
        buf.write_var(1 << 40);
        for cut in 1..8 {
            let mut r = io::Cursor::new(&buf[..cut]);
            assert_eq!(VarInt::decode(&mut r), Err(UnexpectedEnd));
        }
    }

    #[test]
    fn fixed4() {
        let mut buf = Vec::new();
        VarInt(1201).encode_fixed4(&mut buf);
        assert_eq!(buf.len(), 4);
        let mut r = io::Cursor::new(buf);
        assert_eq!(r.get_var(), Ok(1201));
    }
}
