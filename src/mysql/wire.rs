//! Low-level MySQL wire encoding primitives.
//!
//! Integers are little-endian. Variable-length quantities use the
//! length-encoded form: one byte up to 250, then a 0xFC/0xFD/0xFE prefix
//! for 2-, 3- and 8-byte encodings. 0xFB marks a NULL cell in row data.

use bytes::{BufMut, Bytes, BytesMut};

/// Length-encoded marker for a NULL column value.
pub const NULL_CELL: u8 = 0xFB;

/// Errors from reading a packet payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Payload ended before the expected data.
    UnexpectedEof,
    /// A string field was not valid UTF-8.
    InvalidUtf8,
    /// A length-encoded integer started with an invalid prefix byte.
    InvalidLenencPrefix(u8),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::UnexpectedEof => write!(f, "unexpected end of packet"),
            WireError::InvalidUtf8 => write!(f, "invalid UTF-8 in packet string"),
            WireError::InvalidLenencPrefix(b) => {
                write!(f, "invalid length-encoded integer prefix 0x{b:02X}")
            }
        }
    }
}

impl std::error::Error for WireError {}

/// Builder for one packet payload (header excluded).
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: BytesMut,
}

impl PacketWriter {
    /// Create an empty payload builder.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(64),
        }
    }

    /// Finish and return the payload bytes.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u16_le(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn put_u32_le(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn put_bytes(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Append a string followed by a NUL terminator.
    pub fn put_nul_str(&mut self, s: &str) {
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
    }

    /// Append `n` zero bytes.
    pub fn put_filler(&mut self, n: usize) {
        self.buf.put_bytes(0, n);
    }

    /// Append a length-encoded integer.
    pub fn put_lenenc_int(&mut self, v: u64) {
        if v < 251 {
            self.buf.put_u8(v as u8);
        } else if v < 0x1_0000 {
            self.buf.put_u8(0xFC);
            self.buf.put_u16_le(v as u16);
        } else if v < 0x100_0000 {
            self.buf.put_u8(0xFD);
            self.buf.put_u8((v & 0xFF) as u8);
            self.buf.put_u8(((v >> 8) & 0xFF) as u8);
            self.buf.put_u8(((v >> 16) & 0xFF) as u8);
        } else {
            self.buf.put_u8(0xFE);
            self.buf.put_u64_le(v);
        }
    }

    /// Append a length-encoded string.
    pub fn put_lenenc_str(&mut self, s: &str) {
        self.put_lenenc_int(s.len() as u64);
        self.buf.put_slice(s.as_bytes());
    }

    /// Append a NULL column value.
    pub fn put_null_cell(&mut self) {
        self.buf.put_u8(NULL_CELL);
    }
}

/// Cursor over one packet payload.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn take_u8(&mut self) -> Result<u8, WireError> {
        let b = *self.data.get(self.pos).ok_or(WireError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    pub fn take_u16_le(&mut self) -> Result<u16, WireError> {
        let bytes = self.take_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn take_u32_le(&mut self) -> Result<u32, WireError> {
        let bytes = self.take_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn take_u64_le(&mut self) -> Result<u64, WireError> {
        let bytes = self.take_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn take_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < len {
            return Err(WireError::UnexpectedEof);
        }
        let data = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(data)
    }

    /// Consume everything left in the payload.
    pub fn take_rest(&mut self) -> &'a [u8] {
        let data = &self.data[self.pos..];
        self.pos = self.data.len();
        data
    }

    /// Skip `len` bytes.
    pub fn skip(&mut self, len: usize) -> Result<(), WireError> {
        self.take_bytes(len).map(|_| ())
    }

    /// Read a NUL-terminated string.
    pub fn take_nul_str(&mut self) -> Result<&'a str, WireError> {
        let start = self.pos;
        while self.pos < self.data.len() && self.data[self.pos] != 0 {
            self.pos += 1;
        }
        if self.pos >= self.data.len() {
            return Err(WireError::UnexpectedEof);
        }
        let s = std::str::from_utf8(&self.data[start..self.pos])
            .map_err(|_| WireError::InvalidUtf8)?;
        self.pos += 1; // skip the terminator
        Ok(s)
    }

    /// Read a length-encoded integer.
    pub fn take_lenenc_int(&mut self) -> Result<u64, WireError> {
        let first = self.take_u8()?;
        match first {
            0..=250 => Ok(u64::from(first)),
            0xFC => Ok(u64::from(self.take_u16_le()?)),
            0xFD => {
                let bytes = self.take_bytes(3)?;
                Ok(u64::from(bytes[0])
                    | u64::from(bytes[1]) << 8
                    | u64::from(bytes[2]) << 16)
            }
            0xFE => self.take_u64_le(),
            other => Err(WireError::InvalidLenencPrefix(other)),
        }
    }

    /// Read a length-encoded string.
    pub fn take_lenenc_str(&mut self) -> Result<&'a str, WireError> {
        let len = self.take_lenenc_int()? as usize;
        let bytes = self.take_bytes(len)?;
        std::str::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)
    }

    /// Read one row cell: a length-encoded string or NULL (0xFB).
    pub fn take_cell(&mut self) -> Result<Option<String>, WireError> {
        if self.data.get(self.pos) == Some(&NULL_CELL) {
            self.pos += 1;
            return Ok(None);
        }
        self.take_lenenc_str().map(|s| Some(s.to_string()))
    }
}
