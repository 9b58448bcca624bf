//! Fixed-size byte stream reader and writer.
//!
//! A [`StreamReader`] walks a borrowed byte slice and a [`StreamWriter`] fills
//! a buffer of fixed capacity. Each instance is bound to one [`Endian`] for
//! its whole lifetime, and every operation advances the cursor by exactly the
//! number of bytes it consumes or produces.
//!
//! Overrunning either side panics. Callers validate frame lengths before
//! decoding, so an overrun always indicates a bug rather than bad input.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Byte order used for multi-byte integers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Endian {
    /// Most significant byte first. ERD frames are always big-endian.
    Big,
    /// Least significant byte first.
    #[default]
    Little,
}

/// Reads integers and byte runs from a fixed byte sequence.
#[derive(Debug, Clone)]
pub struct StreamReader<'a> {
    data: &'a [u8],
    position: usize,
    endian: Endian,
}

macro_rules! read_int {
    ($name:ident, $ty:ty, $be:ident, $le:ident) => {
        #[doc = concat!("Reads a `", stringify!($ty), "` in the reader's byte order.")]
        pub fn $name(&mut self) -> $ty {
            let mut bytes = self.take(std::mem::size_of::<$ty>());
            match self.endian {
                Endian::Big => bytes.$be(),
                Endian::Little => bytes.$le(),
            }
        }
    };
}

impl<'a> StreamReader<'a> {
    pub fn new(data: &'a [u8], endian: Endian) -> Self {
        Self {
            data,
            position: 0,
            endian,
        }
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Number of bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    fn take(&mut self, count: usize) -> &'a [u8] {
        assert!(
            count <= self.remaining(),
            "stream read of {} bytes at offset {} overruns a {} byte buffer",
            count,
            self.position,
            self.data.len()
        );
        let bytes = &self.data[self.position..self.position + count];
        self.position += count;
        bytes
    }

    pub fn read_u8(&mut self) -> u8 {
        self.take(1)[0]
    }

    pub fn read_i8(&mut self) -> i8 {
        self.read_u8() as i8
    }

    read_int!(read_u16, u16, get_u16, get_u16_le);
    read_int!(read_i16, i16, get_i16, get_i16_le);
    read_int!(read_u32, u32, get_u32, get_u32_le);
    read_int!(read_i32, i32, get_i32, get_i32_le);
    read_int!(read_u64, u64, get_u64, get_u64_le);
    read_int!(read_i64, i64, get_i64, get_i64_le);

    /// Reads an opaque run of `count` bytes.
    pub fn read_bytes(&mut self, count: usize) -> &'a [u8] {
        self.take(count)
    }

    /// Reads an ASCII string occupying `count` bytes.
    ///
    /// The first NUL byte terminates the string; the remainder of the
    /// budget is still consumed.
    pub fn read_ascii(&mut self, count: usize) -> String {
        self.take(count)
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| char::from(b))
            .collect()
    }

    /// Reads `count` bytes and returns them as lowercase hex.
    pub fn read_hex(&mut self, count: usize) -> String {
        hex::encode(self.take(count))
    }
}

/// Writes integers and byte runs into a buffer of fixed capacity.
#[derive(Debug, Clone)]
pub struct StreamWriter {
    buf: BytesMut,
    capacity: usize,
    endian: Endian,
}

macro_rules! write_int {
    ($name:ident, $ty:ty, $be:ident, $le:ident) => {
        #[doc = concat!("Writes a `", stringify!($ty), "` in the writer's byte order.")]
        pub fn $name(&mut self, value: $ty) {
            self.reserve(std::mem::size_of::<$ty>());
            match self.endian {
                Endian::Big => self.buf.$be(value),
                Endian::Little => self.buf.$le(value),
            }
        }
    };
}

impl StreamWriter {
    pub fn new(capacity: usize, endian: Endian) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
            endian,
        }
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    fn reserve(&mut self, count: usize) {
        assert!(
            self.buf.len() + count <= self.capacity,
            "stream write of {} bytes at offset {} overruns a {} byte capacity",
            count,
            self.buf.len(),
            self.capacity
        );
    }

    pub fn write_u8(&mut self, value: u8) {
        self.reserve(1);
        self.buf.put_u8(value);
    }

    pub fn write_i8(&mut self, value: i8) {
        self.reserve(1);
        self.buf.put_i8(value);
    }

    write_int!(write_u16, u16, put_u16, put_u16_le);
    write_int!(write_i16, i16, put_i16, put_i16_le);
    write_int!(write_u32, u32, put_u32, put_u32_le);
    write_int!(write_i32, i32, put_i32, put_i32_le);
    write_int!(write_u64, u64, put_u64, put_u64_le);
    write_int!(write_i64, i64, put_i64, put_i64_le);

    pub fn write_bytes(&mut self, value: &[u8]) {
        self.reserve(value.len());
        self.buf.put_slice(value);
    }

    /// Writes `value` into exactly `budget` bytes.
    ///
    /// Longer strings are truncated; shorter ones are NUL padded.
    pub fn write_ascii(&mut self, value: &str, budget: usize) {
        self.reserve(budget);
        let bytes = value.as_bytes();
        let used = bytes.len().min(budget);
        self.buf.put_slice(&bytes[..used]);
        self.buf.put_bytes(0, budget - used);
    }

    /// Decodes a hex string and writes the resulting bytes.
    pub fn write_hex(&mut self, value: &str) -> Result<(), ProtocolError> {
        let bytes = hex::decode(value)?;
        self.write_bytes(&bytes);
        Ok(())
    }

    /// Returns exactly the bytes written so far, not the full capacity.
    pub fn to_vec(&self) -> Vec<u8> {
        self.buf.to_vec()
    }

    /// Consumes the writer, returning the bytes written so far.
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}
