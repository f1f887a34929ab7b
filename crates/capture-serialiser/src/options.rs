pub const DEFAULT_WINDOW_SIZE: usize = 64 * 1024;
pub const DEFAULT_BLOCK_SIZE: u32 = 1024 * 1024;
pub(crate) const MAX_BLOCK_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Compression {
    None = 0,
    Lz4 = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialiserOptions {
    /// Initial size of the read window. The window grows past this when a single read needs more.
    pub window_size: usize,
    /// Transform applied to sections written by `flush_to_disk`.
    pub compression: Compression,
    /// Uncompressed size of each independently decompressible block of a compressed section.
    pub block_size: u32,
    /// Store the debug-text rendering next to the primary section when flushing.
    pub store_debug_text: bool,
}

impl Default for SerialiserOptions {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            compression: Compression::Lz4,
            block_size: DEFAULT_BLOCK_SIZE,
            store_debug_text: false,
        }
    }
}

/// Per-record header choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordOptions {
    /// Use the 16-bit length header. The record body must stay below 64 KiB.
    pub compact: bool,
    /// Capture the current call stack into the record header.
    pub callstack: bool,
}

impl RecordOptions {
    pub fn compact() -> Self {
        Self {
            compact: true,
            callstack: false,
        }
    }

    pub fn with_callstack(mut self) -> Self {
        self.callstack = true;
        self
    }
}
