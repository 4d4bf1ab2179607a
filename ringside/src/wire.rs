//! Bounds-checked field extraction from record bodies.
//!
//! Producer-side values are written native-endian by the local kernel, so
//! all reads here use native byte order. Every access is checked against
//! the slice length; the ring layer validates record sizes against the
//! producer head, but embedded lengths and per-field layouts can still
//! disagree with the number of bytes actually present.

use crate::errors::DecodeError;

pub(crate) struct Cursor<'a> {
    kind: u32,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(kind: u32, buf: &'a [u8]) -> Cursor<'a> {
        Cursor { kind, buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Consumes the unread remainder of the body.
    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::ShortBody {
                kind: self.kind,
                needed: self.pos + n,
                len: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.bytes(4)?;
        Ok(u32::from_ne_bytes(b.try_into().unwrap()))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.bytes(8)?;
        Ok(u64::from_ne_bytes(b.try_into().unwrap()))
    }

    /// Reads a counted byte blob, `u32` length first.
    pub(crate) fn counted(&mut self) -> Result<&'a [u8], DecodeError> {
        let n = self.u32()? as usize;
        if self.remaining() < n {
            return Err(DecodeError::BadLength {
                kind: self.kind,
                declared: n,
                len: self.remaining(),
            });
        }
        self.bytes(n)
    }
}

/// Reads a NUL-padded string field, cutting at the first NUL byte.
pub(crate) fn zero_padded_str(bytes: &[u8]) -> String {
    let end = memchr::memchr(0, bytes).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
