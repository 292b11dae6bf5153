//! Gzip streaming helpers and the add-time metadata pre-pass.
//!
//! Blobs in the data region are plain gzip streams at the default level.
//! Compression at a fixed level is deterministic (flate2 writes a zero-mtime
//! gzip header), which the mutation engine relies on: the pre-pass and the
//! rewrite pass must produce the same compressed byte count.

use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};

use crate::cancel::CancelToken;
use crate::error::Result;

/// Buffer size for raw blob copies during a rewrite.
pub const COPY_BUF_SIZE: usize = 1024 * 1024;

/// Buffer size for the metadata pre-pass.
const SCAN_BUF_SIZE: usize = 64 * 1024;

/// Extraction buffer heuristic keyed on the plaintext size.
pub fn buffer_size_for(plain_size: u64) -> usize {
    if plain_size < 1 << 20 {
        64 << 10
    } else if plain_size < 100 << 20 {
        1 << 20
    } else {
        4 << 20
    }
}

/// Writer adapter that counts bytes passing through to the inner writer.
pub struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Sink that discards bytes but keeps the count. Used by the pre-pass to
/// learn a blob's compressed size without storing it.
#[derive(Default)]
struct CountingSink {
    written: u64,
}

impl Write for CountingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Result of the metadata pre-pass over a source stream.
#[derive(Debug, Clone, Copy)]
pub struct StreamSummary {
    pub size: u64,
    pub compressed_size: u64,
    pub sha256: [u8; 32],
}

/// Single sequential pass over `reader`: every buffer is fed to a SHA-256
/// hasher and to a gzip encoder draining into a byte counter. No payload
/// bytes are retained.
pub fn scan_stream<R: Read>(mut reader: R, cancel: &CancelToken) -> Result<StreamSummary> {
    let mut hasher = Sha256::new();
    let mut encoder = GzEncoder::new(CountingSink::default(), Compression::default());
    let mut size = 0u64;
    let mut buf = vec![0u8; SCAN_BUF_SIZE];
    loop {
        cancel.check()?;
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        encoder.write_all(&buf[..n])?;
        size += n as u64;
    }
    let sink = encoder.finish()?;
    Ok(StreamSummary {
        size,
        compressed_size: sink.written,
        sha256: hasher.finalize().into(),
    })
}

/// Gzip-compress `reader` into `writer`, returning the compressed byte count.
pub fn compress_stream<R: Read, W: Write>(
    mut reader: R,
    writer: W,
    cancel: &CancelToken,
) -> Result<u64> {
    let mut counting = CountingWriter::new(writer);
    let mut encoder = GzEncoder::new(&mut counting, Compression::default());
    let mut buf = vec![0u8; SCAN_BUF_SIZE];
    loop {
        cancel.check()?;
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        encoder.write_all(&buf[..n])?;
    }
    encoder.finish()?;
    Ok(counting.written())
}

/// Copy exactly `len` bytes through a fixed-size buffer.
pub fn copy_exact<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    len: u64,
    buf_size: usize,
    cancel: &CancelToken,
) -> Result<()> {
    let mut buf = vec![0u8; buf_size];
    let mut remaining = len;
    while remaining > 0 {
        cancel.check()?;
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(buf.len()));
        reader.read_exact(&mut buf[..want])?;
        writer.write_all(&buf[..want])?;
        remaining -= want as u64;
    }
    Ok(())
}

/// Drain `reader` into `writer`, hashing the bytes as they pass. Returns the
/// byte count and the SHA-256 of everything copied.
pub fn hashing_copy<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    buf_size: usize,
    cancel: &CancelToken,
) -> Result<(u64, [u8; 32])> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; buf_size];
    let mut copied = 0u64;
    loop {
        cancel.check()?;
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
        copied += n as u64;
    }
    Ok((copied, hasher.finalize().into()))
}

/// In-memory gzip for the directory document.
pub fn gzip_bytes(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// In-memory gunzip for the directory document.
pub fn gunzip_bytes(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
