//! Byte-range partitioning
//!
//! A transfer of `size` bytes is split into `ceil(size / chunk_size)` ranges
//! `[i * chunk_size, min((i + 1) * chunk_size, size) - 1]`. End offsets are
//! inclusive to line up with HTTP `Range` semantics. Chunks are produced
//! lazily onto a pipeline stage, so memory use does not grow with the number
//! of chunks.
//!
//! Readers and writers are positional: every chunk holds a bounded view over a
//! shared resource, and because the views never overlap, workers can use them
//! concurrently without locking.

use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::sync::Arc;

use bytes::Bytes;

use super::cancel::CancelToken;
use super::generator::iter_generator;
use super::pipeline::Stage;

/// Positional reads that do not move a shared cursor
pub trait ReadAt: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "source shorter than expected",
                    ))
                }
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Positional writes that do not move a shared cursor
pub trait WriteAt: Send + Sync {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    fn write_all_at(&self, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write_at(buf, offset) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
impl ReadAt for File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }
}

#[cfg(unix)]
impl WriteAt for File {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::write_at(self, buf, offset)
    }
}

#[cfg(windows)]
impl ReadAt for File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, buf, offset)
    }
}

#[cfg(windows)]
impl WriteAt for File {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_write(self, buf, offset)
    }
}

impl ReadAt for Bytes {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
        if start >= self.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }
}

/// Inclusive byte range, as used by HTTP `Range` headers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        (self.end + 1).saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// 1-based multipart part number for this range
    pub fn part_number(&self, chunk_size: u64) -> u32 {
        part_number(self.start, chunk_size)
    }

    /// Value for a `Range` or `x-amz-copy-source-range` header
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// 1-based part number of the chunk starting at `start`
pub fn part_number(start: u64, chunk_size: u64) -> u32 {
    match chunk_size {
        0 => 1,
        _ => u32::try_from(start / chunk_size + 1).unwrap_or(u32::MAX),
    }
}

/// Number of chunks covering `size` bytes
pub fn chunk_count(size: u64, chunk_size: u64) -> u64 {
    match chunk_size {
        0 => 0,
        _ => size.div_ceil(chunk_size),
    }
}

/// Iterator over the ranges covering `[0, size)`
#[derive(Debug, Clone)]
pub struct ChunkRanges {
    next: u64,
    size: u64,
    chunk_size: u64,
}

impl Iterator for ChunkRanges {
    type Item = ByteRange;

    fn next(&mut self) -> Option<ByteRange> {
        if self.chunk_size == 0 || self.next >= self.size {
            return None;
        }
        let start = self.next;
        let end = start.saturating_add(self.chunk_size).min(self.size) - 1;
        self.next = end + 1;
        Some(ByteRange { start, end })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = chunk_count(self.size.saturating_sub(self.next), self.chunk_size);
        let remaining = usize::try_from(remaining).unwrap_or(usize::MAX);
        (remaining, Some(remaining))
    }
}

/// Ranges covering `[0, size)` in ascending order; empty for a zero chunk size
pub fn chunk_ranges(size: u64, chunk_size: u64) -> ChunkRanges {
    ChunkRanges {
        next: 0,
        size,
        chunk_size,
    }
}

/// Read-only view over `[offset, offset + len)` of a shared source
#[derive(Clone)]
pub struct SectionReader {
    source: Arc<dyn ReadAt>,
    offset: u64,
    len: u64,
}

impl SectionReader {
    pub fn new(source: Arc<dyn ReadAt>, offset: u64, len: u64) -> Self {
        Self {
            source,
            offset,
            len,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read the whole section into memory (blocking)
    pub fn read_all(&self) -> io::Result<Bytes> {
        let len = usize::try_from(self.len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "section too large"))?;
        let mut buf = vec![0u8; len];
        self.source.read_exact_at(&mut buf, self.offset)?;
        Ok(Bytes::from(buf))
    }

    /// Read the whole section on the blocking thread pool
    pub async fn read_all_async(&self) -> io::Result<Bytes> {
        let section = self.clone();
        tokio::task::spawn_blocking(move || section.read_all())
            .await
            .map_err(|e| io::Error::other(e.to_string()))?
    }
}

impl fmt::Debug for SectionReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectionReader")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// Sequential writer confined to `[start, end]` of a shared sink.
///
/// Writes past `end` fail instead of spilling into a neighbouring chunk.
pub struct OffsetWriter {
    sink: Arc<dyn WriteAt>,
    start: u64,
    end: u64,
    written: u64,
}

impl OffsetWriter {
    pub fn new(sink: Arc<dyn WriteAt>, range: ByteRange) -> Self {
        Self {
            sink,
            start: range.start,
            end: range.end,
            written: 0,
        }
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Bytes still expected to fill the range
    pub fn remaining(&self) -> u64 {
        (self.end - self.start + 1).saturating_sub(self.written)
    }
}

impl Write for OffsetWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if buf.len() as u64 > self.remaining() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "write of {} bytes exceeds range {}-{} ({} already written)",
                    buf.len(),
                    self.start,
                    self.end,
                    self.written
                ),
            ));
        }
        self.sink.write_all_at(buf, self.start + self.written)?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for OffsetWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffsetWriter")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("written", &self.written)
            .finish()
    }
}

/// A section of the source to upload
#[derive(Debug, Clone)]
pub struct Chunk {
    pub reader: SectionReader,
    pub start_offset: u64,
    /// Size of the whole source, not of this chunk
    pub total_size: u64,
}

impl Chunk {
    pub fn range(&self) -> ByteRange {
        ByteRange {
            start: self.start_offset,
            end: self.start_offset + self.reader.len() - 1,
        }
    }
}

/// A section of the destination to fill
#[derive(Debug)]
pub struct WriteableChunk {
    pub writer: OffsetWriter,
    pub start_offset: u64,
    /// Inclusive
    pub end_offset: u64,
}

impl WriteableChunk {
    pub fn range(&self) -> ByteRange {
        ByteRange {
            start: self.start_offset,
            end: self.end_offset,
        }
    }
}

/// Stage of read chunks covering `source[0..size)`
pub fn read_chunks(
    cancel: &CancelToken,
    source: Arc<dyn ReadAt>,
    size: u64,
    chunk_size: u64,
) -> Stage<Chunk> {
    iter_generator(
        cancel,
        chunk_ranges(size, chunk_size).map(move |range| Chunk {
            reader: SectionReader::new(Arc::clone(&source), range.start, range.len()),
            start_offset: range.start,
            total_size: size,
        }),
    )
}

/// Stage of write chunks covering `sink[0..size)`
pub fn prepare_write_chunks(
    cancel: &CancelToken,
    sink: Arc<dyn WriteAt>,
    size: u64,
    chunk_size: u64,
) -> Stage<WriteableChunk> {
    iter_generator(
        cancel,
        chunk_ranges(size, chunk_size).map(move |range| WriteableChunk {
            writer: OffsetWriter::new(Arc::clone(&sink), range),
            start_offset: range.start,
            end_offset: range.end,
        }),
    )
}

/// Stage of bare ranges, for server-side copies
pub fn range_chunks(cancel: &CancelToken, size: u64, chunk_size: u64) -> Stage<ByteRange> {
    iter_generator(cancel, chunk_ranges(size, chunk_size))
}
