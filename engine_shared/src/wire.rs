//! Binary wire codec.
//!
//! All integers and floats are fixed-width little-endian. Strings are a `u32`
//! byte length followed by UTF-8 bytes. Collections are a `u32` element count
//! followed by the elements.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::math::Vec2;

/// Errors produced while decoding a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of message: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },
    #[error("empty message")]
    Empty,
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),
    #[error("unknown action type {0}")]
    UnknownActionType(u8),
    #[error("unknown object type {0}")]
    UnknownObjectType(u8),
    #[error("unknown property {name:?} on object type {kind}")]
    UnknownProperty { kind: u8, name: String },
    #[error("snapshot root must be a scene root, got object type {0}")]
    InvalidRoot(u8),
    #[error("object tree deeper than {0} levels")]
    TreeTooDeep(usize),
    #[error("declared count {count} exceeds remaining {remaining} bytes")]
    CountTooLarge { count: u32, remaining: usize },
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid boolean byte {0}")]
    InvalidBool(u8),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

/// Append-only encoder over a `BytesMut`.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn put_f32(&mut self, v: f32) {
        self.buf.put_f32_le(v);
    }

    pub fn put_vec2(&mut self, v: Vec2) {
        self.put_f32(v.x);
        self.put_f32(v.y);
    }

    pub fn put_str(&mut self, s: &str) {
        self.put_len(s.len());
        self.buf.put_slice(s.as_bytes());
    }

    /// Writes a collection length prefix.
    pub fn put_len(&mut self, len: usize) {
        let len = u32::try_from(len).unwrap_or(u32::MAX);
        self.put_u32(len);
    }

    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Bounds-checked decoder over a byte slice.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, needed: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < needed {
            return Err(DecodeError::UnexpectedEof {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn bool(&mut self) -> Result<bool, DecodeError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::InvalidBool(other)),
        }
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn i32(&mut self) -> Result<i32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn f32(&mut self) -> Result<f32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_f32_le())
    }

    pub fn vec2(&mut self) -> Result<Vec2, DecodeError> {
        let x = self.f32()?;
        let y = self.f32()?;
        Ok(Vec2::new(x, y))
    }

    pub fn string(&mut self) -> Result<String, DecodeError> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        let s = std::str::from_utf8(head).map_err(|_| DecodeError::InvalidUtf8)?;
        self.buf = tail;
        Ok(s.to_owned())
    }

    /// Reads a collection count whose elements each occupy at least
    /// `min_elem_size` bytes, rejecting counts the buffer cannot hold.
    pub fn count(&mut self, min_elem_size: usize) -> Result<u32, DecodeError> {
        let count = self.u32()?;
        let min_total = (count as usize).saturating_mul(min_elem_size.max(1));
        if min_total > self.remaining() {
            return Err(DecodeError::CountTooLarge {
                count,
                remaining: self.remaining(),
            });
        }
        Ok(count)
    }

    /// Fails if any bytes are left unread.
    pub fn finish(self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_are_u32_length_prefixed_utf8() {
        let mut w = WireWriter::new();
        w.put_str("hé");
        let bytes = w.into_vec();
        assert_eq!(&bytes[..4], &3u32.to_le_bytes());
        assert_eq!(&bytes[4..], "hé".as_bytes());

        let mut r = WireReader::new(&bytes);
        assert_eq!(r.string().unwrap(), "hé");
        r.finish().unwrap();
    }

    #[test]
    fn short_buffer_is_an_error_not_a_panic() {
        let mut r = WireReader::new(&[1, 2]);
        assert_eq!(
            r.i32(),
            Err(DecodeError::UnexpectedEof {
                needed: 4,
                remaining: 2
            })
        );
    }

    #[test]
    fn oversized_string_length_is_rejected() {
        let mut w = WireWriter::new();
        w.put_u32(1_000_000);
        w.put_slice(b"abc");
        let bytes = w.into_vec();
        assert!(matches!(
            WireReader::new(&bytes).string(),
            Err(DecodeError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn count_guards_against_huge_collections() {
        let mut w = WireWriter::new();
        w.put_u32(u32::MAX);
        let bytes = w.into_vec();
        assert!(matches!(
            WireReader::new(&bytes).count(1),
            Err(DecodeError::CountTooLarge { .. })
        ));
    }

    #[test]
    fn invalid_bool_byte_is_rejected() {
        assert_eq!(WireReader::new(&[2]).bool(), Err(DecodeError::InvalidBool(2)));
    }
}
