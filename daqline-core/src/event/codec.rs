//! Little-endian primitives shared by the event encoders and decoders.
//!
//! Every integer goes over the wire in little-endian byte order. Strings and
//! byte blobs are written as a `u32` length followed by the raw bytes.

use std::io::{ErrorKind, Read};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Chunk size used when reading length-prefixed blobs, so that a corrupted
/// length can't trigger one huge allocation up front.
const READ_CHUNK: usize = 4096;

/// Sequential reader over any byte source, with support for peeking at the
/// next type identifier without consuming it.
pub struct ByteReader<'a> {
    inner: Box<dyn Read + 'a>,
    /// Bytes already pulled from `inner` but not yet consumed
    lookahead: Vec<u8>,
    /// Number of bytes consumed so far
    position: u64,
}

impl<'a> ByteReader<'a> {
    pub fn new<R: Read + 'a>(reader: R) -> Self {
        Self {
            inner: Box::new(reader),
            lookahead: Vec::new(),
            position: 0,
        }
    }

    /// Number of bytes consumed since the reader was created.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Makes sure at least `n` bytes sit in the lookahead buffer. Returns
    /// `false` if the source ends first.
    fn fill(&mut self, n: usize) -> Result<bool> {
        let mut buf = [0; 64];
        while self.lookahead.len() < n {
            let want = (n - self.lookahead.len()).min(buf.len());
            match self.inner.read(&mut buf[..want]) {
                Ok(0) => return Ok(false),
                Ok(count) => self.lookahead.extend_from_slice(&buf[..count]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// Returns `true` if there are no more bytes to read.
    pub fn is_at_end(&mut self) -> Result<bool> {
        Ok(!self.fill(1)?)
    }

    /// Reads the next `u32` without advancing the position.
    pub fn peek_u32(&mut self) -> Result<u32> {
        if !self.fill(4)? {
            return Err(Error::Truncated(self.position + self.lookahead.len() as u64));
        }
        Ok(LittleEndian::read_u32(&self.lookahead[..4]))
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let from_lookahead = buf.len().min(self.lookahead.len());
        buf[..from_lookahead].copy_from_slice(&self.lookahead[..from_lookahead]);
        self.lookahead.drain(..from_lookahead);
        if from_lookahead < buf.len() {
            if let Err(e) = self.inner.read_exact(&mut buf[from_lookahead..]) {
                return Err(match e.kind() {
                    ErrorKind::UnexpectedEof => {
                        Error::Truncated(self.position + from_lookahead as u64)
                    }
                    _ => e.into(),
                });
            }
        }
        self.position += buf.len() as u64;
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0; 4];
        self.read_exact(&mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0; 8];
        self.read_exact(&mut buf)?;
        Ok(LittleEndian::read_u64(&buf))
    }

    /// Reads a length-prefixed byte blob.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        let mut out = Vec::with_capacity(len.min(READ_CHUNK * 16));
        let mut chunk = [0; READ_CHUNK];
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(READ_CHUNK);
            self.read_exact(&mut chunk[..n])?;
            out.extend_from_slice(&chunk[..n]);
            remaining -= n;
        }
        Ok(out)
    }

    /// Reads a length-prefixed utf-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        Ok(String::from_utf8(self.read_bytes()?)?)
    }
}

/// Growable output buffer for event encoding. Writing never fails.
#[derive(Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        let mut b = [0; 4];
        LittleEndian::write_u32(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    pub fn put_u64(&mut self, v: u64) {
        let mut b = [0; 8];
        LittleEndian::write_u64(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_str(&mut self, s: &str) {
        self.put_bytes(s.as_bytes());
    }
}

#[test]
fn peek_does_not_consume() {
    let mut w = ByteWriter::new();
    w.put_u32(0xdead_beef);
    w.put_str("abc");
    let bytes = w.into_inner();

    let mut r = ByteReader::new(&bytes[..]);
    assert_eq!(r.peek_u32().unwrap(), 0xdead_beef);
    assert_eq!(r.position(), 0);
    assert_eq!(r.read_u32().unwrap(), 0xdead_beef);
    assert_eq!(r.read_string().unwrap(), "abc");
    assert!(r.is_at_end().unwrap());
}

#[test]
fn short_input_reports_truncation() {
    let bytes = [5u8, 0, 0, 0, 9];
    let mut r = ByteReader::new(&bytes[..]);
    match r.read_bytes() {
        Err(Error::Truncated(pos)) => assert_eq!(pos, 4),
        other => panic!("expected truncation, got {:?}", other),
    }
}
