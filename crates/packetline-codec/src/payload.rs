use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::Endianness;
use crate::error::{CodecError, Result};
use crate::packet::PacketId;

/// Size in bytes of a string written with [`PayloadWriter::put_str`].
pub fn str_size(value: &str) -> usize {
    2 + value.len()
}

macro_rules! put_numbers {
    ($($name:ident: $ty:ty => $be:ident, $le:ident;)+) => {
        $(
            pub fn $name(&mut self, value: $ty) {
                match self.endianness {
                    Endianness::Big => self.buf.$be(value),
                    Endianness::Little => self.buf.$le(value),
                }
            }
        )+
    };
}

macro_rules! get_numbers {
    ($($name:ident: $ty:ty => $be:ident, $le:ident;)+) => {
        $(
            pub fn $name(&mut self) -> Result<$ty> {
                self.ensure(std::mem::size_of::<$ty>())?;
                Ok(match self.endianness {
                    Endianness::Big => self.buf.$be(),
                    Endianness::Little => self.buf.$le(),
                })
            }
        )+
    };
}

/// Endian-aware cursor that appends payload fields to an outgoing frame.
pub struct PayloadWriter<'a> {
    buf: &'a mut BytesMut,
    endianness: Endianness,
    start: usize,
}

impl<'a> PayloadWriter<'a> {
    pub fn new(buf: &'a mut BytesMut, endianness: Endianness) -> Self {
        let start = buf.len();
        Self {
            buf,
            endianness,
            start,
        }
    }

    /// Bytes written through this cursor so far.
    pub fn written(&self) -> usize {
        self.buf.len() - self.start
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_i8(&mut self, value: i8) {
        self.buf.put_i8(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    put_numbers! {
        put_u16: u16 => put_u16, put_u16_le;
        put_i16: i16 => put_i16, put_i16_le;
        put_u32: u32 => put_u32, put_u32_le;
        put_i32: i32 => put_i32, put_i32_le;
        put_u64: u64 => put_u64, put_u64_le;
        put_i64: i64 => put_i64, put_i64_le;
        put_f32: f32 => put_f32, put_f32_le;
        put_f64: f64 => put_f64, put_f64_le;
    }

    /// Raw bytes with no length prefix.
    pub fn put_slice(&mut self, value: &[u8]) {
        self.buf.put_slice(value);
    }

    /// UTF-8 string prefixed with its 16-bit byte length.
    pub fn put_str(&mut self, value: &str) -> Result<()> {
        let len = u16::try_from(value.len()).map_err(|_| {
            CodecError::Payload(format!(
                "string of {} bytes does not fit a 16-bit length",
                value.len()
            ))
        })?;
        self.put_u16(len);
        self.buf.put_slice(value.as_bytes());
        Ok(())
    }
}

/// Endian-aware cursor over the payload of one received frame.
///
/// Reading past the end of the payload fails with
/// [`CodecError::PayloadMismatch`] instead of touching the next frame.
#[derive(Debug)]
pub struct PayloadReader {
    buf: Bytes,
    endianness: Endianness,
    id: PacketId,
    declared: usize,
}

impl PayloadReader {
    pub fn new(payload: Bytes, endianness: Endianness, id: PacketId) -> Self {
        let declared = payload.len();
        Self {
            buf: payload,
            endianness,
            id,
            declared,
        }
    }

    /// Unread payload bytes.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_i8(&mut self) -> Result<i8> {
        self.ensure(1)?;
        Ok(self.buf.get_i8())
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::Payload(format!("invalid bool byte {other:#04x}"))),
        }
    }

    get_numbers! {
        get_u16: u16 => get_u16, get_u16_le;
        get_i16: i16 => get_i16, get_i16_le;
        get_u32: u32 => get_u32, get_u32_le;
        get_i32: i32 => get_i32, get_i32_le;
        get_u64: u64 => get_u64, get_u64_le;
        get_i64: i64 => get_i64, get_i64_le;
        get_f32: f32 => get_f32, get_f32_le;
        get_f64: f64 => get_f64, get_f64_le;
    }

    /// Exactly `len` raw bytes.
    pub fn get_bytes(&mut self, len: usize) -> Result<Bytes> {
        self.ensure(len)?;
        Ok(self.buf.split_to(len))
    }

    /// Everything left in the payload.
    pub fn get_rest(&mut self) -> Bytes {
        self.buf.split_off(0)
    }

    /// A UTF-8 string written by [`PayloadWriter::put_str`].
    pub fn get_str(&mut self) -> Result<String> {
        let len = usize::from(self.get_u16()?);
        let raw = self.get_bytes(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|err| CodecError::Payload(format!("string is not valid UTF-8: {err}")))
    }

    /// Fail unless the whole payload has been consumed.
    pub fn finish(&self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(CodecError::PayloadMismatch {
                id: self.id,
                declared: self.declared,
                consumed: self.declared - self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn ensure(&self, wanted: usize) -> Result<()> {
        let remaining = self.buf.remaining();
        if remaining < wanted {
            return Err(CodecError::PayloadMismatch {
                id: self.id,
                declared: self.declared,
                consumed: self.declared - remaining + wanted,
            });
        }
        Ok(())
    }
}
