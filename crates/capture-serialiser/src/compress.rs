//! Block-framed section compression.
//!
//! A compressed section payload is a run of blocks:
//!
//! ```text
//! u32 uncompressed_len
//! u32 compressed_len
//! [compressed_len bytes]
//! ```
//!
//! Each block decompresses on its own, so a reader can serve a window anywhere in the section
//! without inflating everything in front of it.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use crate::error::{unexpected_eof, Result, SerialiserError};
use crate::io::ReadLeExt;
use crate::options::MAX_BLOCK_SIZE;
use crate::window::WindowSource;

const BLOCK_HEADER_LEN: u64 = 8;

/// Byte transform applied to compressed sections.
pub trait CompressionTransform: Send + Sync {
    fn compress(&self, input: &[u8]) -> Vec<u8>;
    fn decompress(&self, input: &[u8], expected_len: usize) -> Result<Vec<u8>>;

    /// Upper bound on `compress(input).len()` for an input of `uncompressed_len` bytes.
    fn max_compressed_len(&self, uncompressed_len: u32) -> u32;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4Block;

impl CompressionTransform for Lz4Block {
    fn compress(&self, input: &[u8]) -> Vec<u8> {
        lz4_flex::block::compress(input)
    }

    fn decompress(&self, input: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let out = lz4_flex::block::decompress(input, expected_len)?;
        if out.len() != expected_len {
            return Err(SerialiserError::Corrupt("lz4 block length mismatch"));
        }
        Ok(out)
    }

    fn max_compressed_len(&self, uncompressed_len: u32) -> u32 {
        // LZ4 worst-case size: uncompressed + (uncompressed / 255) + 16
        uncompressed_len
            .saturating_add(uncompressed_len / 255)
            .saturating_add(16)
    }
}

pub fn default_transform() -> Arc<dyn CompressionTransform> {
    Arc::new(Lz4Block)
}

/// Splits everything written into blocks of `block_size` bytes and emits them compressed.
pub(crate) struct BlockWriter<'a, W: Write> {
    inner: &'a mut W,
    transform: &'a dyn CompressionTransform,
    block_size: usize,
    pending: Vec<u8>,
    stored: u64,
}

impl<'a, W: Write> BlockWriter<'a, W> {
    pub(crate) fn new(
        inner: &'a mut W,
        transform: &'a dyn CompressionTransform,
        block_size: u32,
    ) -> Result<Self> {
        if block_size == 0 || block_size > MAX_BLOCK_SIZE {
            return Err(SerialiserError::Corrupt("invalid compression block size"));
        }
        Ok(Self {
            inner,
            transform,
            block_size: block_size as usize,
            pending: Vec::with_capacity(block_size as usize),
            stored: 0,
        })
    }

    fn emit_block(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let compressed = self.transform.compress(&self.pending);
        let compressed_len = u32::try_from(compressed.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "compressed block too large"))?;
        self.inner
            .write_all(&(self.pending.len() as u32).to_le_bytes())?;
        self.inner.write_all(&compressed_len.to_le_bytes())?;
        self.inner.write_all(&compressed)?;
        self.stored += BLOCK_HEADER_LEN + compressed.len() as u64;
        self.pending.clear();
        Ok(())
    }

    /// Flushes the partial trailing block and returns the stored byte count.
    pub(crate) fn finish(mut self) -> Result<u64> {
        self.emit_block()?;
        Ok(self.stored)
    }
}

impl<W: Write> Write for BlockWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = self.block_size - self.pending.len();
        let n = room.min(buf.len());
        self.pending.extend_from_slice(&buf[..n]);
        if self.pending.len() == self.block_size {
            self.emit_block()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[derive(Debug, Clone, Copy)]
struct BlockEntry {
    data_offset: u64,
    file_offset: u64,
    compressed_len: u32,
    uncompressed_len: u32,
}

/// Random-access view of a block-compressed section. Block headers are indexed up front;
/// payloads are decompressed lazily, keeping the most recent block cached.
pub(crate) struct CompressedSource<R> {
    inner: R,
    transform: Arc<dyn CompressionTransform>,
    blocks: Vec<BlockEntry>,
    data_len: u64,
    cached: Option<(usize, Vec<u8>)>,
}

impl<R: Read + Seek + Send> CompressedSource<R> {
    pub(crate) fn open(
        mut inner: R,
        base: u64,
        stored_len: u64,
        data_len: u64,
        transform: Arc<dyn CompressionTransform>,
    ) -> Result<Self> {
        let end = base
            .checked_add(stored_len)
            .ok_or(SerialiserError::Corrupt("compressed section overflow"))?;
        let mut blocks = Vec::new();
        let mut pos = base;
        let mut total = 0u64;
        while pos < end {
            if end - pos < BLOCK_HEADER_LEN {
                return Err(SerialiserError::Corrupt("truncated block header"));
            }
            inner.seek(SeekFrom::Start(pos))?;
            let uncompressed_len = inner.read_u32_le()?;
            let compressed_len = inner.read_u32_le()?;
            if uncompressed_len == 0 || uncompressed_len > MAX_BLOCK_SIZE {
                return Err(SerialiserError::Corrupt("invalid block length"));
            }
            if compressed_len > transform.max_compressed_len(uncompressed_len) {
                return Err(SerialiserError::Corrupt("compressed block too large"));
            }
            let payload = pos + BLOCK_HEADER_LEN;
            let next = payload + compressed_len as u64;
            if next > end {
                return Err(SerialiserError::Corrupt("block exceeds section"));
            }
            blocks.push(BlockEntry {
                data_offset: total,
                file_offset: payload,
                compressed_len,
                uncompressed_len,
            });
            total += uncompressed_len as u64;
            pos = next;
        }
        if total != data_len {
            return Err(SerialiserError::Corrupt("compressed section length mismatch"));
        }
        Ok(Self {
            inner,
            transform,
            blocks,
            data_len,
            cached: None,
        })
    }

    fn load_block(&mut self, idx: usize) -> Result<&[u8]> {
        if self.cached.as_ref().map(|(i, _)| *i) != Some(idx) {
            let entry = self.blocks[idx];
            self.inner.seek(SeekFrom::Start(entry.file_offset))?;
            let compressed = self.inner.read_exact_vec(entry.compressed_len as usize)?;
            let data = self
                .transform
                .decompress(&compressed, entry.uncompressed_len as usize)?;
            if data.len() != entry.uncompressed_len as usize {
                return Err(SerialiserError::Corrupt("block decompressed to the wrong length"));
            }
            self.cached = Some((idx, data));
        }
        match &self.cached {
            Some((_, data)) => Ok(data),
            None => Err(SerialiserError::Corrupt("block cache empty")),
        }
    }
}

impl<R: Read + Seek + Send> WindowSource for CompressedSource<R> {
    fn len(&self) -> u64 {
        self.data_len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(SerialiserError::Corrupt("read offset overflow"))?;
        if end > self.data_len {
            return Err(unexpected_eof("read past end of compressed section"));
        }
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let idx = self
                .blocks
                .partition_point(|b| b.data_offset + b.uncompressed_len as u64 <= pos);
            let block_start = self.blocks[idx].data_offset;
            let data = self.load_block(idx)?;
            let within = (pos - block_start) as usize;
            let n = (data.len() - within).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&data[within..within + n]);
            done += n;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn compress_all(data: &[u8], block_size: u32) -> Vec<u8> {
        let mut out = Vec::new();
        let mut w = BlockWriter::new(&mut out, &Lz4Block, block_size).unwrap();
        w.write_all(data).unwrap();
        w.finish().unwrap();
        out
    }

    #[test]
    fn reads_across_block_boundaries() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let stored = compress_all(&data, 1000);
        let stored_len = stored.len() as u64;
        let mut src = CompressedSource::open(
            Cursor::new(stored),
            0,
            stored_len,
            data.len() as u64,
            default_transform(),
        )
        .unwrap();

        let mut buf = vec![0u8; 2500];
        src.read_at(1900, &mut buf).unwrap();
        assert_eq!(&buf[..], &data[1900..4400]);

        // Backwards reads re-inflate the earlier block.
        let mut head = [0u8; 10];
        src.read_at(0, &mut head).unwrap();
        assert_eq!(&head[..], &data[..10]);
    }

    #[test]
    fn length_mismatch_is_corrupt() {
        let stored = compress_all(&[7u8; 300], 128);
        let stored_len = stored.len() as u64;
        let err = CompressedSource::open(Cursor::new(stored), 0, stored_len, 301, default_transform())
            .err()
            .unwrap();
        assert!(matches!(err, SerialiserError::Corrupt(_)));
    }

    #[test]
    fn oversized_compressed_len_is_rejected_before_allocation() {
        let mut stored = Vec::new();
        stored.extend_from_slice(&16u32.to_le_bytes());
        stored.extend_from_slice(&u32::MAX.to_le_bytes());
        let stored_len = stored.len() as u64;
        let err = CompressedSource::open(Cursor::new(stored), 0, stored_len, 16, default_transform())
            .err()
            .unwrap();
        assert!(matches!(err, SerialiserError::Corrupt(_)));
    }

    #[test]
    fn read_past_end_is_io_error() {
        let data = [1u8; 64];
        let stored = compress_all(&data, 32);
        let stored_len = stored.len() as u64;
        let mut src =
            CompressedSource::open(Cursor::new(stored), 0, stored_len, 64, default_transform())
                .unwrap();
        let mut buf = [0u8; 8];
        let err = src.read_at(60, &mut buf).unwrap_err();
        assert!(matches!(err, SerialiserError::Io(_)));
    }

    /// Stores blocks as-is but hands back one byte short on decompress.
    struct ShortRead;

    impl CompressionTransform for ShortRead {
        fn compress(&self, input: &[u8]) -> Vec<u8> {
            input.to_vec()
        }

        fn decompress(&self, input: &[u8], _expected_len: usize) -> Result<Vec<u8>> {
            Ok(input[..input.len().saturating_sub(1)].to_vec())
        }

        fn max_compressed_len(&self, uncompressed_len: u32) -> u32 {
            uncompressed_len
        }
    }

    #[test]
    fn short_decompressed_block_is_corrupt() {
        let mut stored = Vec::new();
        let mut w = BlockWriter::new(&mut stored, &ShortRead, 32).unwrap();
        w.write_all(&[3u8; 64]).unwrap();
        w.finish().unwrap();
        let stored_len = stored.len() as u64;

        let mut src =
            CompressedSource::open(Cursor::new(stored), 0, stored_len, 64, Arc::new(ShortRead))
                .unwrap();
        let mut buf = [0u8; 40];
        let err = src.read_at(20, &mut buf).unwrap_err();
        assert!(matches!(err, SerialiserError::Corrupt(_)));
    }
}
