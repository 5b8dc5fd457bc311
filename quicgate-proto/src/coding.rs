//! Byte-level building blocks shared by every codec in this crate.

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::VarInt;

/// The buffer ran out before a complete value could be read.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
#[error("unexpected end of buffer")]
pub struct UnexpectedEnd;

/// Coding result type.
pub type Result<T> = ::std::result::Result<T, UnexpectedEnd>;

/// A value with a fixed wire layout.
///
/// Only decoding can fail: writes grow the buffer, reads must prove the
/// bytes are there first.
pub trait Codec: Sized {
    /// Read one `Self` at the cursor, failing if too few bytes remain.
    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;
    /// Write `self` at the buffer's tail.
    fn encode<B: BufMut>(&self, buf: &mut B);
}

fn ensure<B: Buf>(buf: &B, len: usize) -> Result<()> {
    if buf.remaining() < len {
        return Err(UnexpectedEnd);
    }
    Ok(())
}

impl Codec for u8 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        ensure(buf, 1)?;
        Ok(buf.get_u8())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(*self);
    }
}

impl Codec for u16 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        ensure(buf, 2)?;
        Ok(buf.get_u16())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(*self);
    }
}

impl Codec for u32 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        ensure(buf, 4)?;
        Ok(buf.get_u32())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(*self);
    }
}

impl Codec for u64 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        ensure(buf, 8)?;
        Ok(buf.get_u64())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(*self);
    }
}

/// Cursor-style reads of codec values.
pub trait BufExt {
    /// Decode a `T` at the cursor.
    fn get<T: Codec>(&mut self) -> Result<T>;
    /// Read one variable-length integer.
    fn get_var(&mut self) -> Result<u64>;
}

impl<T: Buf> BufExt for T {
    fn get<U: Codec>(&mut self) -> Result<U> {
        U::decode(self)
    }

    fn get_var(&mut self) -> Result<u64> {
        Ok(VarInt::decode(self)?.into_inner())
    }
}

/// Append-style writes of codec values.
pub trait BufMutExt {
    /// Encode `x` at the buffer's tail.
    fn write<T: Codec>(&mut self, x: T);
    /// Write `x` as a variable-length integer.
    ///
    /// Every length and count this codec emits sits far below the 2^62
    /// varint ceiling; a larger value is a caller bug and is clamped after
    /// a debug assertion.
    fn write_var(&mut self, x: u64);
}

impl<T: BufMut> BufMutExt for T {
    fn write<U: Codec>(&mut self, x: U) {
        x.encode(self);
    }

    fn write_var(&mut self, x: u64) {
        let var = VarInt::from_u64(x).unwrap_or_else(|_| {
            debug_assert!(false, "value {x} exceeds the varint range");
            VarInt::MAX
        });
        var.encode(self);
    }
}
