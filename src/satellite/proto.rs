//! Minimal protobuf wire primitives for native-API payloads
//!
//! The native API encodes message payloads as standard protobuf. The bridge
//! only needs varint, fixed32 and length-delimited fields, so this is a small
//! hand-rolled reader/writer rather than a codegen dependency. Unknown fields
//! are skipped on read for forward compatibility; default values (zero,
//! false, empty) are omitted on write, matching proto3 encoders.

use crate::{Error, Result};

/// Decode a varint from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer ends mid-varint (caller waits for more
/// bytes) and an error when the varint exceeds the 10-byte limit, which on a
/// framed stream means the framing itself is lost.
///
/// # Errors
///
/// Returns [`Error::Device`] on an over-long varint.
pub fn decode_varint(buf: &[u8]) -> Result<Option<(u64, usize)>> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= 10 {
            return Err(Error::Device("varint exceeds 10 bytes".to_string()));
        }
        value |= u64::from(byte & 0x7f) << (i * 7);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= 10 {
        return Err(Error::Device("varint exceeds 10 bytes".to_string()));
    }
    Ok(None)
}

/// Append a varint to `buf`.
pub fn encode_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// One decoded field value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    Varint(u64),
    Fixed32(u32),
    Fixed64(u64),
    Bytes(&'a [u8]),
}

impl FieldValue<'_> {
    /// Varint interpreted as a saturated u32.
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        match *self {
            Self::Varint(v) => u32::try_from(v).unwrap_or(u32::MAX),
            Self::Fixed32(v) => v,
            Self::Fixed64(v) => u32::try_from(v).unwrap_or(u32::MAX),
            Self::Bytes(_) => 0,
        }
    }

    /// Varint interpreted as a bool.
    #[must_use]
    pub fn as_bool(&self) -> bool {
        matches!(*self, Self::Varint(v) if v != 0)
    }

    /// Fixed32 bits reinterpreted as an f32.
    #[must_use]
    pub const fn as_f32(&self) -> f32 {
        match *self {
            Self::Fixed32(v) => f32::from_bits(v),
            _ => 0.0,
        }
    }

    /// Length-delimited payload as UTF-8, lossily.
    #[must_use]
    pub fn as_string(&self) -> String {
        match *self {
            Self::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            _ => String::new(),
        }
    }

    /// Length-delimited payload as raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8] {
        match *self {
            Self::Bytes(b) => b,
            _ => &[],
        }
    }
}

/// Field-by-field reader over one complete payload.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Read the next `(field_number, value)` pair.
    ///
    /// Returns `Ok(None)` at the end of the payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] on truncated fields or unsupported wire
    /// types: the payload is complete by construction, so running out of
    /// bytes mid-field means the payload is malformed.
    pub fn read_field(&mut self) -> Result<Option<(u32, FieldValue<'a>)>> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }

        let (tag, n) = self.require_varint()?;
        self.pos += n;
        let field = u32::try_from(tag >> 3)
            .map_err(|_| Error::Device("field number out of range".to_string()))?;

        let value = match tag & 0x07 {
            0 => {
                let (v, n) = self.require_varint()?;
                self.pos += n;
                FieldValue::Varint(v)
            }
            1 => {
                let bytes = self.take(8)?;
                FieldValue::Fixed64(u64::from_le_bytes([
                    bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
                ]))
            }
            2 => {
                let (len, n) = self.require_varint()?;
                self.pos += n;
                let len = usize::try_from(len)
                    .map_err(|_| Error::Device("field length out of range".to_string()))?;
                FieldValue::Bytes(self.take(len)?)
            }
            5 => {
                let bytes = self.take(4)?;
                FieldValue::Fixed32(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            wire => {
                return Err(Error::Device(format!("unsupported wire type {wire}")));
            }
        };

        Ok(Some((field, value)))
    }

    fn require_varint(&mut self) -> Result<(u64, usize)> {
        decode_varint(&self.buf[self.pos..])?
            .ok_or_else(|| Error::Device("truncated varint in payload".to_string()))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| Error::Device("truncated field in payload".to_string()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

/// Payload builder. Default values are skipped, matching proto3 encoders.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tag(&mut self, field: u32, wire: u8) {
        encode_varint(&mut self.buf, (u64::from(field) << 3) | u64::from(wire));
    }

    pub fn varint(&mut self, field: u32, value: u64) {
        if value != 0 {
            self.tag(field, 0);
            encode_varint(&mut self.buf, value);
        }
    }

    pub fn bool(&mut self, field: u32, value: bool) {
        self.varint(field, u64::from(value));
    }

    pub fn fixed32(&mut self, field: u32, value: u32) {
        if value != 0 {
            self.tag(field, 5);
            self.buf.extend_from_slice(&value.to_le_bytes());
        }
    }

    pub fn float(&mut self, field: u32, value: f32) {
        if value != 0.0 {
            self.tag(field, 5);
            self.buf.extend_from_slice(&value.to_bits().to_le_bytes());
        }
    }

    pub fn bytes(&mut self, field: u32, value: &[u8]) {
        if !value.is_empty() {
            self.tag(field, 2);
            encode_varint(&mut self.buf, value.len() as u64);
            self.buf.extend_from_slice(value);
        }
    }

    pub fn string(&mut self, field: u32, value: &str) {
        self.bytes(field, value.as_bytes());
    }

    /// Nested message field. Always written, even when empty, so repeated
    /// submessages keep their element count.
    pub fn message(&mut self, field: u32, inner: &Self) {
        self.tag(field, 2);
        encode_varint(&mut self.buf, inner.buf.len() as u64);
        self.buf.extend_from_slice(&inner.buf);
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}
