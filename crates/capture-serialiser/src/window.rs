//! Raw backing storage for a [`crate::Serialiser`].
//!
//! Writing appends into a growable, 64-byte aligned buffer. Reading keeps a window over a
//! [`WindowSource`]: requests inside the window are served from memory, anything else refills
//! the window at the requested offset, growing it so the whole request lands contiguously.

use std::io::{Read, Seek, SeekFrom};

use bytemuck::{Pod, Zeroable};
use tracing::trace;

use crate::error::{unexpected_eof, Result, SerialiserError};
use crate::format::CHUNK_ALIGNMENT;

/// Random-access byte source the read window refills from.
pub trait WindowSource: Send {
    /// Total stream length in bytes.
    fn len(&self) -> u64;

    /// Fill `buf` with the bytes at `offset`. Short reads are errors.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A `[base, base + len)` slice of a seekable reader, exposed as a stream starting at 0.
pub struct RegionSource<R> {
    inner: R,
    base: u64,
    len: u64,
}

impl<R: Read + Seek + Send> RegionSource<R> {
    pub fn new(inner: R, base: u64, len: u64) -> Self {
        Self { inner, base, len }
    }

    /// Exposes everything from the reader's current end-of-stream as one region.
    pub fn whole(mut inner: R) -> Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        Ok(Self::new(inner, 0, len))
    }
}

impl<R: Read + Seek + Send> WindowSource for RegionSource<R> {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(SerialiserError::Corrupt("read offset overflow"))?;
        if end > self.len {
            return Err(unexpected_eof("read past end of region"));
        }
        self.inner.seek(SeekFrom::Start(self.base + offset))?;
        self.inner.read_exact(buf)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, align(64))]
struct AlignedBlock([u8; CHUNK_ALIGNMENT]);

/// Byte buffer whose first byte sits on a 64-byte boundary.
#[derive(Clone, Default)]
pub(crate) struct AlignedBuf {
    blocks: Vec<AlignedBlock>,
    len: usize,
}

impl AlignedBuf {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_slice(bytes: &[u8]) -> Result<Self> {
        let mut buf = Self::new();
        buf.resize(bytes.len())?;
        buf.as_mut_slice().copy_from_slice(bytes);
        Ok(buf)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &bytemuck::cast_slice::<AlignedBlock, u8>(&self.blocks)[..self.len]
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut bytemuck::cast_slice_mut::<AlignedBlock, u8>(&mut self.blocks)[..len]
    }

    /// Grow or shrink to `len` bytes; new bytes are zero.
    pub(crate) fn resize(&mut self, len: usize) -> Result<()> {
        let blocks = len.div_ceil(CHUNK_ALIGNMENT);
        if blocks > self.blocks.len() {
            self.blocks
                .try_reserve(blocks - self.blocks.len())
                .map_err(|_| SerialiserError::OutOfMemory { len })?;
        }
        if len < self.len {
            self.as_mut_slice()[len..].fill(0);
        }
        self.blocks.resize(blocks, AlignedBlock::zeroed());
        self.len = len;
        Ok(())
    }

    pub(crate) fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<()> {
        let start = self.len;
        self.resize(start + bytes.len())?;
        self.as_mut_slice()[start..].copy_from_slice(bytes);
        Ok(())
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.as_mut_slice()[len..].fill(0);
            self.len = len;
        }
    }

    pub(crate) fn clear(&mut self) {
        self.blocks.clear();
        self.len = 0;
    }
}

impl core::fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AlignedBuf").field("len", &self.len).finish()
    }
}

pub(crate) struct ReadWindow {
    source: Box<dyn WindowSource>,
    stream_len: u64,
    initial_size: usize,
    capacity: usize,
    window_start: u64,
    window: AlignedBuf,
    head: usize,
    persistent_from: Option<u64>,
}

impl ReadWindow {
    pub(crate) fn new(source: Box<dyn WindowSource>, initial_size: usize) -> Self {
        let stream_len = source.len();
        let initial_size = initial_size.max(CHUNK_ALIGNMENT);
        Self {
            source,
            stream_len,
            initial_size,
            capacity: initial_size,
            window_start: 0,
            window: AlignedBuf::new(),
            head: 0,
            persistent_from: None,
        }
    }

    pub(crate) fn offset(&self) -> u64 {
        self.window_start + self.head as u64
    }

    pub(crate) fn stream_len(&self) -> u64 {
        self.stream_len
    }

    pub(crate) fn remaining(&self) -> u64 {
        self.stream_len.saturating_sub(self.offset())
    }

    /// Current window capacity; only grows until the next rewind.
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the next `n` bytes as one contiguous slice and advances past them.
    #[cfg(test)]
    pub(crate) fn read(&mut self, n: usize) -> Result<&[u8]> {
        self.fill(n)?;
        Ok(self.consume(n))
    }

    /// Makes sure the next `n` bytes are resident in the window.
    pub(crate) fn fill(&mut self, n: usize) -> Result<()> {
        if self.head + n > self.window.len() {
            let pos = self.offset();
            self.refill(pos, n)?;
        }
        Ok(())
    }

    /// Hands out `n` bytes made resident by a preceding [`ReadWindow::fill`].
    pub(crate) fn consume(&mut self, n: usize) -> &[u8] {
        let start = self.head;
        let end = (start + n).min(self.window.len());
        self.head = end;
        &self.window.as_slice()[start..end]
    }

    fn refill(&mut self, pos: u64, n: usize) -> Result<()> {
        let end = pos
            .checked_add(n as u64)
            .ok_or(SerialiserError::Corrupt("read offset overflow"))?;
        if end > self.stream_len {
            return Err(unexpected_eof("read past end of stream"));
        }

        // Refill from a 64-byte boundary so stream alignment matches memory alignment.
        let start = pos - pos % CHUNK_ALIGNMENT as u64;
        let lead = (pos - start) as usize;
        let needed = (lead + n).next_multiple_of(CHUNK_ALIGNMENT);
        if needed > self.capacity {
            trace!(from = self.capacity, to = needed, "growing read window");
            self.capacity = needed;
        }

        let len = (self.capacity as u64).min(self.stream_len - start) as usize;
        trace!(offset = start, len, "refilling read window");
        self.window.clear();
        self.window.resize(len)?;
        self.window_start = start;
        self.head = lead;
        if let Err(err) = self.source.read_at(start, self.window.as_mut_slice()) {
            self.window.clear();
            self.head = 0;
            self.window_start = pos;
            return Err(err);
        }
        Ok(())
    }

    /// Advances by `n` bytes without materialising them.
    pub(crate) fn skip(&mut self, n: u64) -> Result<()> {
        let target = self
            .offset()
            .checked_add(n)
            .ok_or(SerialiserError::Corrupt("skip offset overflow"))?;
        if target > self.stream_len {
            return Err(unexpected_eof("skip past end of stream"));
        }
        self.set_offset(target)
    }

    pub(crate) fn set_offset(&mut self, offset: u64) -> Result<()> {
        if offset > self.stream_len {
            return Err(SerialiserError::Corrupt("seek past end of stream"));
        }
        let window_end = self.window_start + self.window.len() as u64;
        if offset >= self.window_start && offset <= window_end {
            self.head = (offset - self.window_start) as usize;
            return Ok(());
        }
        if self.persistent_from.is_some_and(|from| offset < from) {
            self.persistent_from = None;
        }
        self.window.clear();
        self.window_start = offset;
        self.head = 0;
        Ok(())
    }

    pub(crate) fn rewind(&mut self) {
        self.capacity = self.initial_size;
        self.persistent_from = None;
        self.window.clear();
        self.window_start = 0;
        self.head = 0;
    }

    /// Loads `[offset, end)` into memory in one go and positions the stream at `offset`.
    /// Reads inside that range never touch the source again.
    pub(crate) fn set_persistent_block(&mut self, offset: u64) -> Result<()> {
        if offset > self.stream_len {
            return Err(SerialiserError::Corrupt("persistent block past end of stream"));
        }
        let start = offset - offset % CHUNK_ALIGNMENT as u64;
        let len = usize::try_from(self.stream_len - start).map_err(|_| {
            SerialiserError::OutOfMemory {
                len: usize::MAX,
            }
        })?;
        trace!(offset = start, len, "loading persistent block");
        self.window.clear();
        self.window.resize(len)?;
        if let Err(err) = self.source.read_at(start, self.window.as_mut_slice()) {
            self.window.clear();
            self.window_start = offset;
            self.head = 0;
            return Err(err);
        }
        self.window_start = start;
        self.head = (offset - start) as usize;
        self.capacity = self.capacity.max(len);
        self.persistent_from = Some(offset);
        Ok(())
    }

    pub(crate) fn is_persistent(&self) -> bool {
        self.persistent_from.is_some()
    }
}

pub(crate) enum ByteWindow {
    Write(AlignedBuf),
    Read(ReadWindow),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSource {
        data: Vec<u8>,
        reads: Arc<AtomicUsize>,
    }

    impl WindowSource for CountingSource {
        fn len(&self) -> u64 {
            self.data.len() as u64
        }

        fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let offset = offset as usize;
            buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
            Ok(())
        }
    }

    fn counting(len: usize) -> (Box<dyn WindowSource>, Arc<AtomicUsize>, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        let reads = Arc::new(AtomicUsize::new(0));
        let src = CountingSource {
            data: data.clone(),
            reads: reads.clone(),
        };
        (Box::new(src), reads, data)
    }

    #[test]
    fn aligned_buf_is_64_byte_aligned() {
        let buf = AlignedBuf::from_slice(&[1, 2, 3]).unwrap();
        assert_eq!(buf.as_slice().as_ptr() as usize % 64, 0);
        assert_eq!(buf.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn aligned_buf_truncate_then_extend_leaves_no_stale_bytes() {
        let mut buf = AlignedBuf::from_slice(&[9; 10]).unwrap();
        buf.truncate(2);
        buf.resize(4).unwrap();
        assert_eq!(buf.as_slice(), &[9, 9, 0, 0]);
    }

    #[test]
    fn reads_inside_the_window_do_no_io() {
        let (src, reads, data) = counting(4096);
        let mut w = ReadWindow::new(src, 1024);
        assert_eq!(w.read(16).unwrap(), &data[..16]);
        assert_eq!(w.read(16).unwrap(), &data[16..32]);
        assert_eq!(reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn oversized_read_grows_window_contiguously() {
        let (src, _reads, data) = counting(10_000);
        let mut w = ReadWindow::new(src, 64);
        w.set_offset(10).unwrap();
        let got = w.read(5000).unwrap().to_vec();
        assert_eq!(got, &data[10..5010]);
        assert!(w.capacity() >= 5010);
        assert_eq!(w.offset(), 5010);
    }

    #[test]
    fn short_stream_is_io_error() {
        let mut w = ReadWindow::new(
            Box::new(RegionSource::new(Cursor::new(vec![0u8; 8]), 0, 8)),
            64,
        );
        let err = w.read(9).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Io);
    }

    #[test]
    fn persistent_block_serves_everything_after_one_read() {
        let (src, reads, data) = counting(3000);
        let mut w = ReadWindow::new(src, 64);
        w.set_persistent_block(100).unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        assert_eq!(w.offset(), 100);

        w.set_offset(2900).unwrap();
        assert_eq!(w.read(100).unwrap(), &data[2900..]);
        w.set_offset(150).unwrap();
        assert_eq!(w.read(10).unwrap(), &data[150..160]);
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        assert!(w.is_persistent());

        w.set_offset(0).unwrap();
        assert!(!w.is_persistent());
    }

    #[test]
    fn rewind_resets_growth() {
        let (src, _reads, _data) = counting(1000);
        let mut w = ReadWindow::new(src, 64);
        w.read(900).unwrap();
        assert!(w.capacity() >= 900);
        w.rewind();
        assert_eq!(w.capacity(), 64);
        assert_eq!(w.offset(), 0);
    }
}
