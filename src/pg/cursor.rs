//! Offset-tracked readers and writers over message buffers.
//!
//! All integers are big-endian. Reads past the end of the buffer fail with
//! [`PgError::Framing`] instead of panicking.

use bytes::{BufMut, BytesMut};

use super::error::{PgError, PgResult};

/// Sequential reader over a borrowed byte slice.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current read offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Take the next `n` bytes.
    pub fn read_bytes(&mut self, n: usize) -> PgResult<&'a [u8]> {
        if n > self.remaining() {
            return Err(PgError::Framing(format!(
                "read of {} bytes at offset {} overruns {}-byte buffer",
                n,
                self.pos,
                self.buf.len()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self) -> PgResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> PgResult<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_i16(&mut self) -> PgResult<i16> {
        self.read_array().map(i16::from_be_bytes)
    }

    pub fn read_u16(&mut self) -> PgResult<u16> {
        self.read_array().map(u16::from_be_bytes)
    }

    pub fn read_i32(&mut self) -> PgResult<i32> {
        self.read_array().map(i32::from_be_bytes)
    }

    pub fn read_u32(&mut self) -> PgResult<u32> {
        self.read_array().map(u32::from_be_bytes)
    }

    /// Everything from the cursor to the end.
    pub fn read_remaining(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    /// Bytes up to the next NUL; the terminator is consumed but not returned.
    pub fn read_cstr(&mut self) -> PgResult<&'a [u8]> {
        let rest = &self.buf[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| PgError::Framing("Missing null terminator in string".to_string()))?;
        self.pos += end + 1;
        Ok(&rest[..end])
    }

    /// Read a null-terminated string, replacing invalid UTF-8.
    pub fn read_cstring(&mut self) -> PgResult<String> {
        let raw = self.read_cstr()?;
        Ok(std::str::from_utf8(raw)
            .map(|s| s.to_owned())
            .unwrap_or_else(|_| String::from_utf8_lossy(raw).into_owned()))
    }
}

/// Append-only writer used to build message bodies.
#[derive(Debug, Default)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn put_i16(&mut self, v: i16) -> &mut Self {
        self.buf.put_i16(v);
        self
    }

    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16(v);
        self
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32(v);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    pub fn put_slice(&mut self, v: &[u8]) -> &mut Self {
        self.buf.put_slice(v);
        self
    }

    /// Write `s` followed by a NUL terminator.
    pub fn put_cstr(&mut self, s: &str) -> &mut Self {
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
        self
    }

    /// Overwrite four bytes at `at` with `v`.
    pub fn patch_i32(&mut self, at: usize, v: i32) {
        self.buf[at..at + 4].copy_from_slice(&v.to_be_bytes());
    }

    pub fn into_inner(self) -> BytesMut {
        self.buf
    }
}
