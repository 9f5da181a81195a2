//! Little-endian blob helpers with an xxh3 trailer.
//!
//! Every binary object written by the crate ends with the xxh3-64 checksum
//! of the bytes before it.

use bytes::Bytes;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{QuiverError, Result};

/// What a blob holds; decides which error a malformed blob surfaces as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    /// Dataset fragment: `ChecksumMismatch` / `Serialization`.
    Fragment,
    /// Index model or posting list: `CorruptIndex`.
    Index,
}

impl BlobKind {
    fn malformed(self, msg: String) -> QuiverError {
        match self {
            BlobKind::Fragment => QuiverError::Serialization(msg),
            BlobKind::Index => QuiverError::CorruptIndex(msg),
        }
    }
}

/// Append the checksum trailer.
pub fn seal(mut buf: Vec<u8>) -> Bytes {
    let checksum = xxh3_64(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    Bytes::from(buf)
}

/// Verify the trailer and return the payload in front of it.
pub fn unseal(data: &[u8], kind: BlobKind) -> Result<&[u8]> {
    if data.len() < 8 {
        return Err(kind.malformed(format!(
            "blob too small for checksum: {} bytes",
            data.len()
        )));
    }
    let (payload, trailer) = data.split_at(data.len() - 8);
    let mut raw = [0u8; 8];
    raw.copy_from_slice(trailer);
    let stored = u64::from_le_bytes(raw);
    let actual = xxh3_64(payload);
    if stored != actual {
        return Err(match kind {
            BlobKind::Fragment => QuiverError::ChecksumMismatch {
                expected: stored,
                actual,
            },
            BlobKind::Index => QuiverError::CorruptIndex(format!(
                "checksum mismatch: expected {stored}, got {actual}"
            )),
        });
    }
    Ok(payload)
}

/// Bounds-checked cursor over a blob payload.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    kind: BlobKind,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8], kind: BlobKind) -> Self {
        Self { data, pos: 0, kind }
    }

    pub fn kind(&self) -> BlobKind {
        self.kind
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn malformed(&self, msg: impl Into<String>) -> QuiverError {
        self.kind.malformed(msg.into())
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                self.malformed(format!(
                    "truncated blob: need {n} bytes at offset {}, have {}",
                    self.pos,
                    self.remaining()
                ))
            })?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn expect_magic(&mut self, magic: &[u8; 4]) -> Result<()> {
        let got = self.bytes(4)?;
        if got != magic {
            return Err(self.malformed(format!(
                "bad magic: expected {:?}, got {:?}",
                String::from_utf8_lossy(magic),
                String::from_utf8_lossy(got)
            )));
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    /// Read `count` elements of `width` bytes each, refusing sizes that overflow.
    fn array(&mut self, count: usize, width: usize) -> Result<&'a [u8]> {
        let len = count
            .checked_mul(width)
            .ok_or_else(|| self.malformed(format!("array length overflow: {count} x {width}")))?;
        self.bytes(len)
    }

    pub fn f32s(&mut self, count: usize) -> Result<Vec<f32>> {
        Ok(self
            .array(count, 4)?
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    pub fn u64s(&mut self, count: usize) -> Result<Vec<u64>> {
        Ok(self
            .array(count, 8)?
            .chunks_exact(8)
            .map(|b| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                u64::from_le_bytes(raw)
            })
            .collect())
    }

    pub fn u16s(&mut self, count: usize) -> Result<Vec<u16>> {
        Ok(self
            .array(count, 2)?
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect())
    }

    pub fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|e| self.malformed(format!("invalid utf-8: {e}")))
    }

    /// Fail unless the whole payload was consumed.
    pub fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(self.malformed(format!(
                "{} trailing bytes after payload",
                self.remaining()
            )));
        }
        Ok(())
    }
}

pub fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_f32s(buf: &mut Vec<u8>, values: &[f32]) {
    buf.reserve(values.len() * 4);
    for &v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
}

pub fn put_string(buf: &mut Vec<u8>, s: &str) {
    put_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}
