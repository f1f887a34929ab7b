use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::window::AlignedBuf;

/// Live-chunk instrumentation. Only debug builds count; release builds always report zero.
#[derive(Debug, Default)]
pub struct ChunkCounters {
    live: AtomicI64,
    peak: AtomicI64,
    total_bytes: AtomicI64,
}

impl ChunkCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn live_chunks(&self) -> u64 {
        self.live.load(Ordering::Relaxed).max(0) as u64
    }

    pub fn peak_chunks(&self) -> u64 {
        self.peak.load(Ordering::Relaxed).max(0) as u64
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed).max(0) as u64
    }

    fn created(&self, len: usize) {
        if cfg!(debug_assertions) {
            let live = self.live.fetch_add(1, Ordering::Relaxed) + 1;
            self.peak.fetch_max(live, Ordering::Relaxed);
            self.total_bytes.fetch_add(len as i64, Ordering::Relaxed);
        }
    }

    fn released(&self, len: usize) {
        if cfg!(debug_assertions) {
            self.live.fetch_sub(1, Ordering::Relaxed);
            self.total_bytes.fetch_sub(len as i64, Ordering::Relaxed);
        }
    }
}

#[derive(Debug)]
enum ChunkData {
    Plain(Vec<u8>),
    Aligned(AlignedBuf),
}

/// One finished record: its encoded bytes (header included), tag and debug rendering.
///
/// Chunks are produced by [`crate::RecordScope::finish`] and handed to
/// [`crate::Serialiser::insert_chunk`]; they are not clonable.
#[derive(Debug)]
pub struct Chunk {
    data: ChunkData,
    tag: u32,
    temporary: bool,
    debug_text: String,
    counters: Arc<ChunkCounters>,
}

impl Chunk {
    pub(crate) fn new(
        bytes: Vec<u8>,
        aligned: bool,
        tag: u32,
        temporary: bool,
        debug_text: String,
        counters: Arc<ChunkCounters>,
    ) -> Result<Self> {
        let data = if aligned {
            ChunkData::Aligned(AlignedBuf::from_slice(&bytes)?)
        } else {
            ChunkData::Plain(bytes)
        };
        let chunk = Self {
            data,
            tag,
            temporary,
            debug_text,
            counters,
        };
        chunk.counters.created(chunk.len());
        Ok(chunk)
    }

    pub fn data(&self) -> &[u8] {
        match &self.data {
            ChunkData::Plain(v) => v,
            ChunkData::Aligned(buf) => buf.as_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    /// The data holds a buffer written after `align_next_buffer`, and is stored 64-byte aligned.
    pub fn is_aligned(&self) -> bool {
        matches!(self.data, ChunkData::Aligned(_))
    }

    /// Temporary chunks are copied on insertion instead of being retained.
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub fn debug_text(&self) -> &str {
        &self.debug_text
    }

    /// Copy into a retained (non-temporary) chunk.
    pub(crate) fn retained_copy(&self) -> Result<Chunk> {
        Chunk::new(
            self.data().to_vec(),
            self.is_aligned(),
            self.tag,
            false,
            self.debug_text.clone(),
            self.counters.clone(),
        )
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        self.counters.released(self.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(debug_assertions)]
    fn counters_track_live_chunks() {
        let counters = ChunkCounters::new();
        let a = Chunk::new(vec![0; 10], false, 1, false, String::new(), counters.clone()).unwrap();
        let b = Chunk::new(vec![0; 6], true, 2, false, String::new(), counters.clone()).unwrap();
        assert_eq!(counters.live_chunks(), 2);
        assert_eq!(counters.total_bytes(), 16);
        drop(a);
        assert_eq!(counters.live_chunks(), 1);
        assert_eq!(counters.total_bytes(), 6);
        assert_eq!(counters.peak_chunks(), 2);
        drop(b);
        assert_eq!(counters.live_chunks(), 0);
    }

    #[test]
    fn aligned_chunks_store_aligned_data() {
        let chunk = Chunk::new(vec![5; 100], true, 3, false, String::new(), ChunkCounters::new())
            .unwrap();
        assert!(chunk.is_aligned());
        assert_eq!(chunk.data().as_ptr() as usize % 64, 0);
        assert_eq!(chunk.data(), &[5u8; 100][..]);
    }
}
