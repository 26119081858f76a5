//! Fixed-layout binary writer and reader
//!
//! Every multi-byte integer is little-endian and every byte string is
//! prefixed with its length as an `i32`. Command log records and id blocks
//! are laid out with these primitives so that their byte shape is stable
//! independently of any serde format.

use crate::error::WireError;

/// Append-only byte buffer with typed write helpers
#[derive(Debug, Default, Clone)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes raw bytes with no length prefix
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Writes an `i32` length followed by the bytes themselves
    pub fn write_prefixed_bytes(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        let len = i32::try_from(bytes.len()).map_err(|_| WireError::TooLong(bytes.len()))?;
        self.write_i32(len);
        self.write_raw(bytes);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a borrowed byte slice
#[derive(Debug)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], WireError> {
        let remaining = self.remaining();
        if count > remaining {
            return Err(WireError::UnexpectedEnd {
                needed: count,
                remaining,
            });
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(i32::from_le_bytes(bytes))
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn read_prefixed_bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.read_i32()?;
        let len = usize::try_from(len).map_err(|_| WireError::NegativeLength(len))?;
        Ok(self.take(len)?.to_vec())
    }

    /// Consumes and returns everything left in the buffer
    pub fn read_remaining(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}
