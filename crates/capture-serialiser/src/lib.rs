//! Tagged, length-prefixed record streams for capture files.
//!
//! A [`Serialiser`] runs one code path in both directions: writers append records to an
//! in-memory buffer and cut them into [`Chunk`]s, readers pull the same records back through a
//! bounded window over a file or memory. Streams are stored as the primary section of a small
//! sectioned container ([`SectionTable`]) next to optional auxiliary sections.

mod callstack;
mod chunk;
mod codec;
mod compress;
mod debug;
mod error;
mod fields;
mod format;
mod io;
mod options;
mod scope;
mod section;
mod serialiser;
mod window;

pub use crate::callstack::{CancelFlag, ResolverBuilder, StackCapture, Stackwalk, SymbolResolver};
pub use crate::chunk::{Chunk, ChunkCounters};
pub use crate::codec::{Decode, Encode};
pub use crate::compress::{default_transform, CompressionTransform, Lz4Block};
pub use crate::debug::{DebugSink, RecordNameLookup, Render};
pub use crate::error::{ErrorKind, Result, SerialiserError};
pub use crate::fields::{Decoded, Field};
pub use crate::format::{
    SectionFlags, SectionKind, CHUNK_ALIGNMENT, MAGIC_HEADER, MAX_CALLSTACK_LEVELS,
    MAX_RECORD_TAG, PADDING_RECORD_TAG, SERIALISE_VERSION,
};
pub use crate::options::{
    Compression, RecordOptions, SerialiserOptions, DEFAULT_BLOCK_SIZE, DEFAULT_WINDOW_SIZE,
};
pub use crate::scope::RecordScope;
pub use crate::section::{SectionEntry, SectionTable, SectionTableWriter, VerbatimSection};
pub use crate::serialiser::{Mode, RecordInfo, Serialiser};
pub use crate::window::{RegionSource, WindowSource};
