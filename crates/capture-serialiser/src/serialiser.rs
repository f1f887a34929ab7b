use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::callstack::{ResolverBuilder, ResolverTask, StackCapture, Stackwalk, SymbolResolver};
use crate::chunk::{Chunk, ChunkCounters};
use crate::compress::{self, CompressionTransform};
use crate::debug::{DebugSink, DebugTrace, RecordNameLookup, Render};
use crate::error::{ErrorKind, Result, SerialiserError};
use crate::format::{
    padding_for, SectionKind, CHUNK_ALIGNMENT, MAX_RECORD_TAG, PADDING_HEADER_LEN,
    PADDING_RECORD_TAG, RECORD_FLAG_CALLSTACK, RECORD_FLAG_COMPACT, RECORD_TAG_MASK,
};
use crate::options::{RecordOptions, SerialiserOptions};
use crate::section::{SectionTable, SectionTableWriter, VerbatimSection};
use crate::window::{AlignedBuf, ByteWindow, ReadWindow, RegionSource, WindowSource};

const LEN_PLACEHOLDER_U16: u16 = 0xBEEB;
const LEN_PLACEHOLDER_U32: u32 = 0xBEEB_FEED;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Reading,
    Writing,
}

/// What `push_record` found (reading) or emitted (writing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordInfo {
    pub tag: u32,
    /// Body length declared by the header. Always 0 when writing.
    pub len: u64,
    pub name: Option<&'static str>,
}

#[derive(Debug, Clone, Copy)]
struct Framing {
    len_pos: u64,
    body_start: u64,
    body_len: u64,
    compact: bool,
}

#[derive(Debug)]
struct OpenRecord {
    tag: u32,
    header_start: u64,
    /// `None` for header-less scopes and records pushed after a failure.
    framing: Option<Framing>,
    debug_mark: usize,
    aligned: bool,
}

enum Piece {
    Chunk(Chunk),
    Bytes(Vec<u8>),
}

impl Piece {
    fn bytes(&self) -> &[u8] {
        match self {
            Piece::Chunk(chunk) => chunk.data(),
            Piece::Bytes(bytes) => bytes,
        }
    }

    fn debug_text(&self) -> &str {
        match self {
            Piece::Chunk(chunk) => chunk.debug_text(),
            Piece::Bytes(_) => "",
        }
    }
}

/// Bidirectional record serialiser.
///
/// The same code path encodes and decodes: every value operation either appends to the write
/// buffer or consumes from the read window depending on [`Mode`]. The first failure is kept and
/// turns every later operation into a no-op that yields default values, so call sites never
/// branch on errors mid-record; check [`Serialiser::has_error`] once the pass is done.
pub struct Serialiser {
    mode: Mode,
    window: ByteWindow,
    /// Stream offset of the first byte still held in the write buffer.
    write_base: u64,
    pieces: Vec<Piece>,
    options: SerialiserOptions,
    error: Option<SerialiserError>,
    open: Vec<OpenRecord>,
    last_record_len: u64,
    aligned_data: bool,
    debug: DebugTrace,
    stack_capture: Option<Arc<dyn StackCapture>>,
    last_callstack: Option<Stackwalk>,
    resolver: Option<ResolverTask>,
    strings: BTreeSet<Arc<str>>,
    sections: Option<SectionTable>,
    section_data: [Option<Vec<u8>>; 4],
    carried: Vec<VerbatimSection>,
    path: Option<PathBuf>,
    counters: Arc<ChunkCounters>,
    transform: Arc<dyn CompressionTransform>,
}

impl Serialiser {
    fn blank(mode: Mode, window: ByteWindow, options: SerialiserOptions) -> Self {
        Self {
            mode,
            window,
            write_base: 0,
            pieces: Vec::new(),
            options,
            error: None,
            open: Vec::new(),
            last_record_len: 0,
            aligned_data: false,
            debug: DebugTrace::default(),
            stack_capture: None,
            last_callstack: None,
            resolver: None,
            strings: BTreeSet::new(),
            sections: None,
            section_data: Default::default(),
            carried: Vec::new(),
            path: None,
            counters: ChunkCounters::new(),
            transform: compress::default_transform(),
        }
    }

    /// In-memory writer with default options.
    pub fn new_writer() -> Self {
        Self::writer_with(SerialiserOptions::default())
    }

    pub fn writer_with(options: SerialiserOptions) -> Self {
        Self::blank(Mode::Writing, ByteWindow::Write(AlignedBuf::new()), options)
    }

    /// Reader over a raw record stream with no container around it.
    pub fn from_source(source: Box<dyn WindowSource>, options: SerialiserOptions) -> Self {
        let window = ReadWindow::new(source, options.window_size);
        Self::blank(Mode::Reading, ByteWindow::Read(window), options)
    }

    /// Reader over bytes in memory. With `file_header` the bytes are a full container and the
    /// primary section becomes the stream; otherwise they are the stream itself.
    pub fn from_memory(bytes: Vec<u8>, file_header: bool) -> Result<Self> {
        Self::from_memory_with(bytes, file_header, SerialiserOptions::default())
    }

    pub fn from_memory_with(
        bytes: Vec<u8>,
        file_header: bool,
        options: SerialiserOptions,
    ) -> Result<Self> {
        Self::from_memory_with_transform(bytes, file_header, options, compress::default_transform())
    }

    /// Like [`Serialiser::from_memory_with`], decompressing sections with `transform`. It must be
    /// the transform the file was written with.
    pub fn from_memory_with_transform(
        bytes: Vec<u8>,
        file_header: bool,
        options: SerialiserOptions,
        transform: Arc<dyn CompressionTransform>,
    ) -> Result<Self> {
        if !file_header {
            let len = bytes.len() as u64;
            let source = RegionSource::new(Cursor::new(bytes), 0, len);
            return Ok(Self::from_source(Box::new(source), options));
        }
        let shared: Arc<[u8]> = bytes.into();
        let table = SectionTable::read_from(&mut Cursor::new(shared.clone()))?;
        Self::from_table(table, || Ok(Cursor::new(shared.clone())), options, transform)
    }

    pub fn open(path: impl AsRef<Path>, mode: Mode) -> Result<Self> {
        Self::open_with(path, mode, SerialiserOptions::default())
    }

    /// Opens a capture file. Writers create the file on [`Serialiser::flush_to_disk`].
    pub fn open_with(
        path: impl AsRef<Path>,
        mode: Mode,
        options: SerialiserOptions,
    ) -> Result<Self> {
        Self::open_with_transform(path, mode, options, compress::default_transform())
    }

    /// Like [`Serialiser::open_with`], compressing or decompressing sections with `transform`.
    pub fn open_with_transform(
        path: impl AsRef<Path>,
        mode: Mode,
        options: SerialiserOptions,
        transform: Arc<dyn CompressionTransform>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut ser = match mode {
            Mode::Writing => {
                let mut ser = Self::writer_with(options);
                ser.transform = transform;
                ser
            }
            Mode::Reading => {
                let mut file = File::open(path)?;
                let table = SectionTable::read_from(&mut file)?;
                debug!(path = %path.display(), sections = table.entries().len(), "opened capture");
                Self::from_table(table, || Ok(file.try_clone()?), options, transform)?
            }
        };
        ser.path = Some(path.to_path_buf());
        Ok(ser)
    }

    fn from_table<R, F>(
        mut table: SectionTable,
        mut open_reader: F,
        options: SerialiserOptions,
        transform: Arc<dyn CompressionTransform>,
    ) -> Result<Self>
    where
        R: Read + Seek + Send + 'static,
        F: FnMut() -> Result<R>,
    {
        let source: Box<dyn WindowSource> = match table.find(SectionKind::PrimaryData).cloned() {
            Some(entry) => SectionTable::open_source(&entry, open_reader()?, transform.clone())?,
            None => Box::new(RegionSource::new(Cursor::new(Vec::new()), 0, 0)),
        };

        let mut section_data: [Option<Vec<u8>>; 4] = Default::default();
        for kind in [
            SectionKind::SymbolDatabase,
            SectionKind::Bookmarks,
            SectionKind::Notes,
        ] {
            let (Some(entry), Some(slot)) = (table.find(kind).cloned(), kind.index()) else {
                continue;
            };
            let mut reader = open_reader()?;
            match SectionTable::read_data(&entry, &mut reader, transform.clone()) {
                Ok(data) => section_data[slot] = Some(data),
                Err(err) => table.demote(kind, &err),
            }
        }

        let mut ser = Self::from_source(source, options);
        ser.transform = transform;
        ser.sections = Some(table);
        ser.section_data = section_data;
        Ok(ser)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_reading(&self) -> bool {
        self.mode == Mode::Reading
    }

    pub fn is_writing(&self) -> bool {
        self.mode == Mode::Writing
    }

    pub fn options(&self) -> &SerialiserOptions {
        &self.options
    }

    // ---- error state ----

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error_kind(&self) -> ErrorKind {
        self.error
            .as_ref()
            .map_or(ErrorKind::None, SerialiserError::kind)
    }

    pub fn error(&self) -> Option<&SerialiserError> {
        self.error.as_ref()
    }

    /// Records the first failure. Later failures are dropped.
    pub(crate) fn fail(&mut self, err: SerialiserError) {
        if self.error.is_none() {
            warn!(error = %err, depth = self.open.len(), "serialiser entered error state");
            self.error = Some(err);
        }
    }

    // ---- stream position ----

    pub fn offset(&self) -> u64 {
        match &self.window {
            ByteWindow::Write(buf) => self.write_base + buf.len() as u64,
            ByteWindow::Read(window) => window.offset(),
        }
    }

    pub fn size(&self) -> u64 {
        match &self.window {
            ByteWindow::Write(_) => self.offset(),
            ByteWindow::Read(window) => window.stream_len(),
        }
    }

    pub fn at_end(&self) -> bool {
        self.offset() >= self.size()
    }

    /// Bytes left to read. Always 0 when writing.
    pub fn remaining(&self) -> u64 {
        match &self.window {
            ByteWindow::Write(_) => 0,
            ByteWindow::Read(window) => window.remaining(),
        }
    }

    /// Moves the read position. Writers cannot seek.
    pub fn set_offset(&mut self, offset: u64) {
        if self.is_writing() {
            self.fail(SerialiserError::Corrupt("cannot seek a writing serialiser"));
            return;
        }
        self.with_read_window(|window| window.set_offset(offset));
    }

    /// Returns to the start of the stream, clearing debug text. Reading windows shrink back to
    /// their initial size; writers drop everything written so far.
    pub fn rewind(&mut self) {
        assert!(self.open.is_empty(), "rewind with open records");
        self.debug.clear();
        self.aligned_data = false;
        match &mut self.window {
            ByteWindow::Read(window) => window.rewind(),
            ByteWindow::Write(buf) => {
                buf.clear();
                self.pieces.clear();
                self.write_base = 0;
            }
        }
    }

    /// Loads everything from `offset` to the end of the stream into memory and seeks there.
    /// Useful before replaying the same region repeatedly.
    pub fn set_persistent_block(&mut self, offset: u64) {
        if self.is_reading() {
            self.with_read_window(|window| window.set_persistent_block(offset));
        }
    }

    /// Current read window size. Grows for oversized reads and shrinks back on rewind.
    pub fn window_capacity(&self) -> usize {
        match &self.window {
            ByteWindow::Read(window) => window.capacity(),
            ByteWindow::Write(_) => 0,
        }
    }

    /// Whether a persistent block is loaded and the stream position is inside it.
    pub fn in_persistent_block(&self) -> bool {
        match &self.window {
            ByteWindow::Read(window) => window.is_persistent(),
            ByteWindow::Write(_) => false,
        }
    }

    // ---- raw byte access ----

    fn with_read_window<T>(&mut self, op: impl FnOnce(&mut ReadWindow) -> Result<T>) -> Option<T> {
        if self.error.is_some() {
            return None;
        }
        let result = match &mut self.window {
            ByteWindow::Read(window) => op(window),
            ByteWindow::Write(_) => panic!("read on a writing serialiser"),
        };
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.fail(err);
                None
            }
        }
    }

    pub(crate) fn read_raw(&mut self, n: usize) -> Option<&[u8]> {
        self.with_read_window(|window| window.fill(n))?;
        match &mut self.window {
            ByteWindow::Read(window) => Some(window.consume(n)),
            ByteWindow::Write(_) => None,
        }
    }

    pub(crate) fn write_raw(&mut self, bytes: &[u8]) {
        if self.error.is_some() {
            return;
        }
        let result = match &mut self.window {
            ByteWindow::Write(buf) => buf.extend_from_slice(bytes),
            ByteWindow::Read(_) => panic!("write on a reading serialiser"),
        };
        if let Err(err) = result {
            self.fail(err);
        }
    }

    fn write_zeros(&mut self, mut len: usize) {
        const ZEROS: [u8; CHUNK_ALIGNMENT] = [0; CHUNK_ALIGNMENT];
        while len > 0 {
            let n = len.min(ZEROS.len());
            self.write_raw(&ZEROS[..n]);
            len -= n;
        }
    }

    /// Overwrites already-written bytes at stream offset `pos`.
    fn patch(&mut self, pos: u64, bytes: &[u8]) {
        if let ByteWindow::Write(buf) = &mut self.window {
            let start = (pos - self.write_base) as usize;
            buf.as_mut_slice()[start..start + bytes.len()].copy_from_slice(bytes);
        }
    }

    /// Fixed-size little-endian read; zeros once the serialiser has failed.
    pub(crate) fn read_scalar_bytes<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        if let Some(bytes) = self.read_raw(N) {
            out.copy_from_slice(bytes);
        }
        out
    }

    /// Writes bytes with no framing. The reader must consume exactly the same count.
    pub fn raw_write_bytes(&mut self, bytes: &[u8]) {
        self.write_raw(bytes);
    }

    /// Reads `len` bytes with no framing. `None` once the serialiser has failed.
    pub fn raw_read_bytes(&mut self, len: usize) -> Option<&[u8]> {
        self.read_raw(len)
    }

    // ---- element counts ----

    /// Writes a 32-bit count. Returns `false` when the elements must not follow.
    pub(crate) fn write_count_u32(&mut self, count: usize) -> bool {
        match u32::try_from(count) {
            Ok(count) => self.write_raw(&count.to_le_bytes()),
            Err(_) => self.fail(SerialiserError::CountOverflow {
                count: count as u64,
            }),
        }
        !self.has_error()
    }

    pub(crate) fn write_count_u64(&mut self, count: usize) -> bool {
        self.write_raw(&(count as u64).to_le_bytes());
        !self.has_error()
    }

    pub(crate) fn read_count_u32(&mut self, min_elem_len: usize) -> usize {
        let count = u32::from_le_bytes(self.read_scalar_bytes());
        self.check_count(u64::from(count), min_elem_len)
    }

    pub(crate) fn read_count_u64(&mut self, min_elem_len: usize) -> usize {
        let count = u64::from_le_bytes(self.read_scalar_bytes());
        self.check_count(count, min_elem_len)
    }

    /// Rejects counts whose elements could not fit in what is left of the stream, before
    /// anything is allocated for them.
    fn check_count(&mut self, count: u64, min_elem_len: usize) -> usize {
        if self.has_error() {
            return 0;
        }
        let fits = count
            .checked_mul(min_elem_len.max(1) as u64)
            .is_some_and(|needed| needed <= self.remaining());
        if !fits {
            self.fail(SerialiserError::Corrupt("element count exceeds remaining stream"));
            return 0;
        }
        match usize::try_from(count) {
            Ok(count) => count,
            Err(_) => {
                self.fail(SerialiserError::Corrupt("element count exceeds address space"));
                0
            }
        }
    }

    // ---- buffers ----

    /// Writes a length-prefixed byte buffer.
    pub fn write_buffer(&mut self, name: &str, bytes: &[u8]) {
        if !self.write_count_u32(bytes.len()) {
            return;
        }
        self.write_raw(bytes);
        self.debug_line(|| format!("{name}: <buffer, {} bytes>", bytes.len()));
    }

    /// Reads a length-prefixed byte buffer in place, without copying out of the read window.
    pub fn read_buffer_ref(&mut self, name: &str) -> Option<&[u8]> {
        let len = self.read_count_u32(1);
        if self.has_error() {
            return None;
        }
        self.debug_line(|| format!("{name}: <buffer, {len} bytes>"));
        self.read_raw(len)
    }

    pub fn read_buffer(&mut self, name: &str) -> Vec<u8> {
        self.read_buffer_ref(name)
            .map(<[u8]>::to_vec)
            .unwrap_or_default()
    }

    pub fn serialise_buffer(&mut self, name: &str, buf: &mut Vec<u8>) {
        match self.mode {
            Mode::Writing => self.write_buffer(name, buf),
            Mode::Reading => *buf = self.read_buffer(name),
        }
    }

    /// Pads so the bytes of the next buffer start at a multiple of `alignment` relative to the
    /// outermost open record. Both sides compute the same padding; nothing about it is stored.
    pub fn align_next_buffer(&mut self, alignment: usize) {
        if self.has_error() {
            return;
        }
        assert!(
            alignment > 0 && CHUNK_ALIGNMENT % alignment == 0,
            "buffer alignment must divide {CHUNK_ALIGNMENT}"
        );
        let anchor = self.open.first().map_or(0, |record| record.header_start);
        // The buffer's u32 length precedes its bytes.
        let pos = self.offset() - anchor + 4;
        let pad = padding_for(pos, alignment as u64) as usize;
        self.aligned_data = true;
        if let Some(outer) = self.open.first_mut() {
            outer.aligned = true;
        }
        match self.mode {
            Mode::Writing => self.write_zeros(pad),
            Mode::Reading => {
                self.read_raw(pad);
            }
        }
    }

    /// Whether any buffer in this stream was aligned with [`Serialiser::align_next_buffer`].
    pub fn has_aligned_data(&self) -> bool {
        self.aligned_data
    }

    // ---- records ----

    /// Number of open records and scopes.
    pub fn depth(&self) -> usize {
        self.open.len()
    }

    /// Body length of the record most recently opened for reading.
    pub fn last_record_len(&self) -> u64 {
        self.last_record_len
    }

    pub fn push_record(&mut self, label: &str, tag: u32) -> RecordInfo {
        self.push_record_with(label, tag, RecordOptions::default())
    }

    /// Opens a record. Tag 0 opens a header-less scope that only nests debug text.
    ///
    /// Writing emits the header for `tag`. Reading decodes the next header (skipping padding
    /// records) and reports its tag; the `tag` argument then only selects between a record and
    /// a header-less scope.
    pub fn push_record_with(&mut self, label: &str, tag: u32, options: RecordOptions) -> RecordInfo {
        match self.mode {
            Mode::Writing => self.push_write(label, tag, options),
            Mode::Reading => self.push_read(label, tag != 0, false),
        }
    }

    fn push_write(&mut self, label: &str, tag: u32, options: RecordOptions) -> RecordInfo {
        assert!(
            tag <= MAX_RECORD_TAG,
            "record tag {tag:#x} outside the 14-bit tag space"
        );
        let header_start = self.offset();
        let debug_mark = self.debug.len();
        let name = self.debug.record_name(tag);
        self.debug_push_lines(label, tag, name);

        let mut framing = None;
        if tag != 0 && !self.has_error() {
            let stack = if options.callstack {
                self.stack_capture
                    .as_ref()
                    .map(|capture| Stackwalk::new(capture.capture()))
            } else {
                None
            };
            let mut word = tag as u16;
            if options.compact {
                word |= RECORD_FLAG_COMPACT;
            }
            if stack.is_some() {
                word |= RECORD_FLAG_CALLSTACK;
            }
            self.write_raw(&word.to_le_bytes());
            if let Some(stack) = stack {
                self.write_raw(&[stack.num_levels() as u8]);
                for addr in stack.addrs() {
                    self.write_raw(&addr.to_le_bytes());
                }
                self.last_callstack = Some(stack);
            }
            let len_pos = self.offset();
            if options.compact {
                self.write_raw(&LEN_PLACEHOLDER_U16.to_le_bytes());
            } else {
                self.write_raw(&LEN_PLACEHOLDER_U32.to_le_bytes());
            }
            framing = Some(Framing {
                len_pos,
                body_start: self.offset(),
                body_len: 0,
                compact: options.compact,
            });
        }

        self.open.push(OpenRecord {
            tag,
            header_start,
            framing,
            debug_mark,
            aligned: false,
        });
        RecordInfo { tag, len: 0, name }
    }

    fn push_read(&mut self, label: &str, with_header: bool, quiet: bool) -> RecordInfo {
        let mut header_start = self.offset();
        let debug_mark = self.debug.len();
        let mut info = RecordInfo::default();
        let mut framing = None;

        while with_header && !self.has_error() {
            header_start = self.offset();
            let word = u16::from_le_bytes(self.read_scalar_bytes());
            if word & RECORD_FLAG_CALLSTACK != 0 {
                let levels = usize::from(self.read_scalar_bytes::<1>()[0]);
                let mut addrs = Vec::with_capacity(levels);
                for _ in 0..levels {
                    addrs.push(u64::from_le_bytes(self.read_scalar_bytes()));
                }
                if !self.has_error() {
                    self.last_callstack = Some(Stackwalk::new(addrs));
                }
            }
            let compact = word & RECORD_FLAG_COMPACT != 0;
            let len = if compact {
                u64::from(u16::from_le_bytes(self.read_scalar_bytes()))
            } else {
                u64::from(u32::from_le_bytes(self.read_scalar_bytes()))
            };
            if self.has_error() {
                break;
            }
            if len > self.remaining() {
                self.fail(SerialiserError::Corrupt("record length exceeds stream"));
                break;
            }

            let tag = u32::from(word & RECORD_TAG_MASK);
            if tag == PADDING_RECORD_TAG {
                self.with_read_window(|window| window.skip(len));
                continue;
            }
            framing = Some(Framing {
                len_pos: 0,
                body_start: self.offset(),
                body_len: len,
                compact,
            });
            self.last_record_len = len;
            info = RecordInfo {
                tag,
                len,
                name: self.debug.record_name(tag),
            };
            break;
        }

        if !quiet {
            let tag = if with_header { info.tag } else { 0 };
            self.debug_push_lines(label, tag, info.name);
        }
        self.open.push(OpenRecord {
            tag: info.tag,
            header_start,
            framing,
            debug_mark,
            aligned: false,
        });
        info
    }

    /// Closes the innermost record. Writing patches its length; reading moves to its end,
    /// skipping any fields the caller did not consume.
    ///
    /// # Panics
    ///
    /// Panics when no record is open.
    pub fn pop_record(&mut self) {
        self.pop_inner(false);
    }

    fn pop_inner(&mut self, quiet: bool) -> OpenRecord {
        let Some(record) = self.open.pop() else {
            panic!("pop_record without a matching push_record");
        };

        if let (Some(framing), false) = (record.framing, self.has_error()) {
            match self.mode {
                Mode::Writing => {
                    let body_len = self.offset() - framing.body_start;
                    if framing.compact {
                        match u16::try_from(body_len) {
                            Ok(len) => self.patch(framing.len_pos, &len.to_le_bytes()),
                            Err(_) => self.fail(SerialiserError::Corrupt(
                                "compact record body exceeds 65535 bytes",
                            )),
                        }
                    } else {
                        match u32::try_from(body_len) {
                            Ok(len) => self.patch(framing.len_pos, &len.to_le_bytes()),
                            Err(_) => {
                                self.fail(SerialiserError::CountOverflow { count: body_len })
                            }
                        }
                    }
                }
                Mode::Reading => {
                    let end = framing.body_start + framing.body_len;
                    let offset = self.offset();
                    if offset > end {
                        self.fail(SerialiserError::Corrupt(
                            "record body overran its declared length",
                        ));
                    } else if offset < end {
                        self.set_offset(end);
                    }
                }
            }
        }

        if !quiet {
            self.debug_line(|| "}".to_string());
        }
        record
    }

    /// Scans forward to the next record with `tag`, leaving the stream at that record's header so
    /// the following `push_record` opens it. Returns how many records were passed over, or `None`
    /// when the stream ends or fails first.
    pub fn skip_to_record(&mut self, tag: u32) -> Option<u64> {
        assert!(self.is_reading(), "skip_to_record on a writing serialiser");
        let mut skipped = 0;
        while !self.has_error() && !self.at_end() {
            let start = self.offset();
            let info = self.push_read("", true, true);
            if self.has_error() {
                self.open.pop();
                return None;
            }
            if info.tag == tag {
                self.open.pop();
                self.set_offset(start);
                return Some(skipped);
            }
            self.skip_current_record();
            self.pop_inner(true);
            skipped += 1;
        }
        None
    }

    /// Moves to the end of the innermost record being read.
    pub fn skip_current_record(&mut self) {
        if !self.is_reading() {
            return;
        }
        if let Some(framing) = self.open.last().and_then(|record| record.framing) {
            self.set_offset(framing.body_start + framing.body_len);
        }
    }

    /// Pops the innermost record and cuts its outermost span out of the write buffer as a
    /// [`Chunk`].
    pub(crate) fn finish_chunk(&mut self, temporary: bool) -> Option<Chunk> {
        assert!(self.is_writing(), "only writing serialisers produce chunks");
        let record = self.pop_inner(false);
        assert!(
            self.open.is_empty(),
            "only outermost records finish into chunks"
        );
        let debug_text = self.debug.split_off(record.debug_mark);
        let start = record.header_start.saturating_sub(self.write_base) as usize;
        let ByteWindow::Write(buf) = &mut self.window else {
            return None;
        };
        let bytes = buf.as_slice()[start..].to_vec();
        buf.truncate(start);

        if self.has_error() {
            return None;
        }
        match Chunk::new(
            bytes,
            record.aligned,
            record.tag,
            temporary,
            debug_text,
            self.counters.clone(),
        ) {
            Ok(chunk) => Some(chunk),
            Err(err) => {
                self.fail(err);
                None
            }
        }
    }

    /// Pops the innermost record, discarding everything written since it was pushed.
    pub(crate) fn abandon_record(&mut self) {
        let record = self.pop_inner(true);
        self.debug.split_off(record.debug_mark);
        if let ByteWindow::Write(buf) = &mut self.window {
            if let Some(start) = record.header_start.checked_sub(self.write_base) {
                buf.truncate(start as usize);
            }
        }
    }

    // ---- chunks and output ----

    /// Appends a finished chunk to the output stream. Temporary chunks are copied; others are
    /// retained as-is. Aligned chunks are preceded by a padding record so they start on a
    /// [`CHUNK_ALIGNMENT`] boundary of the stream.
    pub fn insert_chunk(&mut self, chunk: Chunk) {
        assert!(self.is_writing(), "insert_chunk on a reading serialiser");
        assert!(self.open.is_empty(), "insert_chunk with open records");
        if self.has_error() {
            return;
        }
        self.seal_write_buffer();

        if chunk.is_aligned() {
            let mut pad = padding_for(self.write_base, CHUNK_ALIGNMENT as u64) as usize;
            if pad > 0 {
                if pad < PADDING_HEADER_LEN {
                    pad += CHUNK_ALIGNMENT;
                }
                let mut filler = vec![0u8; pad];
                let word = PADDING_RECORD_TAG as u16 | RECORD_FLAG_COMPACT;
                filler[..2].copy_from_slice(&word.to_le_bytes());
                filler[2..4].copy_from_slice(&((pad - PADDING_HEADER_LEN) as u16).to_le_bytes());
                self.push_piece(Piece::Bytes(filler));
            }
            self.aligned_data = true;
        }

        let chunk = if chunk.is_temporary() {
            match chunk.retained_copy() {
                Ok(copy) => copy,
                Err(err) => {
                    self.fail(err);
                    return;
                }
            }
        } else {
            chunk
        };
        self.push_piece(Piece::Chunk(chunk));
    }

    fn push_piece(&mut self, piece: Piece) {
        self.write_base += piece.bytes().len() as u64;
        self.pieces.push(piece);
    }

    /// Moves bytes written directly (outside any chunk) into the piece list so chunk order is
    /// preserved.
    fn seal_write_buffer(&mut self) {
        let ByteWindow::Write(buf) = &mut self.window else {
            return;
        };
        if buf.len() == 0 {
            return;
        }
        let bytes = buf.as_slice().to_vec();
        buf.clear();
        self.push_piece(Piece::Bytes(bytes));
    }

    /// Retained chunks in insertion order.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.pieces.iter().filter_map(|piece| match piece {
            Piece::Chunk(chunk) => Some(chunk),
            Piece::Bytes(_) => None,
        })
    }

    /// The complete record stream written so far.
    pub fn stream_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size() as usize);
        for piece in &self.pieces {
            out.extend_from_slice(piece.bytes());
        }
        if let ByteWindow::Write(buf) = &self.window {
            out.extend_from_slice(buf.as_slice());
        }
        out
    }

    /// Writes a complete container: the record stream as the primary section, followed by any
    /// auxiliary and carried sections.
    pub fn write_to<W: Write + Seek>(&self, w: &mut W) -> Result<()> {
        if self.is_reading() {
            return Err(SerialiserError::Corrupt("cannot save a reading serialiser"));
        }
        if self.has_error() {
            return Err(SerialiserError::Corrupt(
                "cannot save a serialiser in an error state",
            ));
        }
        if !self.open.is_empty() {
            return Err(SerialiserError::Corrupt("cannot save with open records"));
        }

        let mut pieces: Vec<&[u8]> = self.pieces.iter().map(Piece::bytes).collect();
        if let ByteWindow::Write(buf) = &self.window {
            if buf.len() > 0 {
                pieces.push(buf.as_slice());
            }
        }
        let text = self.options.store_debug_text.then(|| {
            let mut text: String = self.pieces.iter().map(Piece::debug_text).collect();
            text.push_str(self.debug.text());
            text
        });

        let compression = self.options.compression;
        let block_size = self.options.block_size;
        let mut writer = SectionTableWriter::new();
        writer.push_with_block_size(
            SectionKind::PrimaryData.default_name().unwrap_or_default(),
            SectionKind::PrimaryData,
            pieces,
            compression,
            block_size,
            text.as_deref(),
        );
        for kind in [
            SectionKind::SymbolDatabase,
            SectionKind::Bookmarks,
            SectionKind::Notes,
        ] {
            let data = kind.index().and_then(|slot| self.section_data[slot].as_deref());
            if let (Some(data), Some(name)) = (data, kind.default_name()) {
                writer.push_with_block_size(name, kind, vec![data], compression, block_size, None);
            }
        }
        for section in &self.carried {
            writer.push_verbatim(section.clone());
        }
        writer.write_to(w, &*self.transform)?;
        Ok(())
    }

    /// Writes the container to the path given to [`Serialiser::open`].
    pub fn flush_to_disk(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Err(SerialiserError::Corrupt("serialiser has no backing file"));
        };
        let mut w = BufWriter::new(File::create(path)?);
        self.write_to(&mut w)?;
        w.flush()?;
        debug!(path = %path.display(), bytes = self.size(), "flushed capture to disk");
        Ok(())
    }

    pub fn set_chunk_counters(&mut self, counters: Arc<ChunkCounters>) {
        self.counters = counters;
    }

    pub fn chunk_counters(&self) -> &Arc<ChunkCounters> {
        &self.counters
    }

    /// Replaces the block compressor used for written sections. Readers take theirs at
    /// construction, see [`Serialiser::from_memory_with_transform`].
    pub fn set_compression_transform(&mut self, transform: Arc<dyn CompressionTransform>) {
        self.transform = transform;
    }

    // ---- sections ----

    /// Directory of the container this reader was opened from.
    pub fn section_table(&self) -> Option<&SectionTable> {
        self.sections.as_ref()
    }

    /// Loaded (reading) or pending (writing) payload of an auxiliary section.
    pub fn section_data(&self, kind: SectionKind) -> Option<&[u8]> {
        match kind {
            SectionKind::PrimaryData | SectionKind::Unrecognized => None,
            _ => kind
                .index()
                .and_then(|slot| self.section_data[slot].as_deref()),
        }
    }

    /// Queues an auxiliary section for the next save.
    ///
    /// # Panics
    ///
    /// Panics for [`SectionKind::PrimaryData`], which is always the record stream, and for
    /// [`SectionKind::Unrecognized`]; use [`Serialiser::carry_section`] for those.
    pub fn set_section_data(&mut self, kind: SectionKind, bytes: Vec<u8>) {
        assert!(
            matches!(
                kind,
                SectionKind::SymbolDatabase | SectionKind::Bookmarks | SectionKind::Notes
            ),
            "{kind} is not an auxiliary section"
        );
        if let Some(slot) = kind.index() {
            self.section_data[slot] = Some(bytes);
        }
    }

    pub fn set_symbol_database(&mut self, bytes: Vec<u8>) {
        self.set_section_data(SectionKind::SymbolDatabase, bytes);
    }

    /// Queues a section copied byte for byte from another container.
    pub fn carry_section(&mut self, section: VerbatimSection) {
        self.carried.push(section);
    }

    // ---- callstacks ----

    pub fn set_stack_capture(&mut self, capture: Option<Arc<dyn StackCapture>>) {
        self.stack_capture = capture;
    }

    /// Overrides the stack reported by [`Serialiser::last_callstack`].
    pub fn set_callstack(&mut self, levels: &[u64]) {
        self.last_callstack = Some(Stackwalk::new(levels.to_vec()));
    }

    /// Stack attached to the most recent record that carried one.
    pub fn last_callstack(&self) -> Option<&Stackwalk> {
        self.last_callstack.as_ref().filter(|stack| !stack.is_empty())
    }

    pub fn has_callstacks(&self) -> bool {
        self.section_data(SectionKind::SymbolDatabase).is_some()
    }

    /// Starts building a resolver from the symbol database in the background. Returns `false`
    /// when there is no database.
    pub fn init_callstack_resolver(&mut self, builder: Arc<dyn ResolverBuilder>) -> Result<bool> {
        if self.resolver.is_some() {
            return Ok(true);
        }
        let Some(database) = self.section_data(SectionKind::SymbolDatabase) else {
            return Ok(false);
        };
        self.resolver = Some(ResolverTask::spawn(database.to_vec(), builder)?);
        Ok(true)
    }

    /// The resolver once its background build has completed.
    pub fn callstack_resolver(&self) -> Option<Arc<dyn SymbolResolver>> {
        self.resolver.as_ref().and_then(ResolverTask::resolver)
    }

    pub fn callstack_resolver_finished(&self) -> bool {
        self.resolver.as_ref().is_some_and(ResolverTask::is_finished)
    }

    /// Resolves one address; `None` until the resolver is ready.
    pub fn resolve_address(&self, addr: u64) -> Option<String> {
        self.resolver.as_ref().and_then(|task| task.resolve(addr))
    }

    // ---- debug text ----

    pub fn set_debug_text(&mut self, enabled: bool) {
        self.debug.set_enabled(enabled);
    }

    pub fn debug_text_enabled(&self) -> bool {
        self.debug.enabled()
    }

    /// Text accumulated since the last rewind, minus what finished chunks took with them.
    pub fn debug_text(&self) -> &str {
        self.debug.text()
    }

    pub fn set_record_name_lookup(&mut self, lookup: Option<RecordNameLookup>) {
        self.debug.set_lookup(lookup);
    }

    pub fn set_debug_sink(&mut self, sink: Option<DebugSink>) {
        self.debug.set_sink(sink);
    }

    /// Appends a free-form line to the debug text at the current nesting depth.
    pub fn debug_print(&mut self, text: &str) {
        self.debug_line(|| text.to_string());
    }

    pub(crate) fn debug_line(&mut self, line: impl FnOnce() -> String) {
        if self.debug.enabled() {
            let depth = self.open.len();
            let line = line();
            self.debug.line(depth, &line);
        }
    }

    pub(crate) fn debug_value<T: Render + ?Sized>(&mut self, name: &str, value: &T) {
        self.debug_line(|| format!("{name}: {}", value.render()));
    }

    /// `name[idx]` when debug text is on; empty otherwise so hot loops skip the formatting.
    pub(crate) fn element_name(&self, name: &str, idx: usize) -> String {
        if self.debug.enabled() {
            format!("{name}[{idx}]")
        } else {
            String::new()
        }
    }

    fn debug_push_lines(&mut self, label: &str, tag: u32, name: Option<&str>) {
        if !self.debug.enabled() {
            return;
        }
        let header = match (tag, name) {
            (0, _) => label.to_string(),
            (_, Some(name)) => format!("{label} = {name}"),
            (_, None) => format!("{label} = record {tag}"),
        };
        let depth = self.open.len();
        self.debug.line(depth, &header);
        self.debug.line(depth, "{");
    }

    // ---- interning ----

    /// Returns the shared copy of `text`, adding it on first sight.
    pub fn intern(&mut self, text: String) -> Arc<str> {
        if let Some(existing) = self.strings.get(text.as_str()) {
            return existing.clone();
        }
        let shared: Arc<str> = text.into();
        self.strings.insert(shared.clone());
        shared
    }

    pub fn interned_count(&self) -> usize {
        self.strings.len()
    }
}

impl std::fmt::Debug for Serialiser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Serialiser")
            .field("mode", &self.mode)
            .field("offset", &self.offset())
            .field("depth", &self.open.len())
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(bytes: Vec<u8>) -> Serialiser {
        Serialiser::from_memory(bytes, false).unwrap()
    }

    #[test]
    fn header_length_counts_body_bytes() {
        let mut ser = Serialiser::new_writer();
        ser.push_record("rec", 7);
        ser.raw_write_bytes(&[1, 2, 3]);
        ser.pop_record();
        assert_eq!(ser.stream_bytes(), vec![7, 0, 3, 0, 0, 0, 1, 2, 3]);
    }

    #[test]
    fn compact_header_uses_u16_length() {
        let mut ser = Serialiser::new_writer();
        ser.push_record_with("rec", 2, RecordOptions::compact());
        ser.raw_write_bytes(&[9]);
        ser.pop_record();
        assert_eq!(ser.stream_bytes(), vec![2, 0x40, 1, 0, 9]);
    }

    #[test]
    fn oversized_compact_record_fails_at_pop() {
        let mut ser = Serialiser::new_writer();
        ser.push_record_with("big", 2, RecordOptions::compact());
        ser.raw_write_bytes(&vec![0u8; 70_000]);
        ser.pop_record();
        assert_eq!(ser.error_kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn pop_skips_unread_body() {
        let mut w = Serialiser::new_writer();
        w.push_record("a", 1);
        w.raw_write_bytes(&[0xAA; 10]);
        w.pop_record();
        w.push_record("b", 2);
        w.pop_record();

        let mut r = reader(w.stream_bytes());
        assert_eq!(r.push_record("a", 1).len, 10);
        r.raw_read_bytes(2);
        r.pop_record();
        assert_eq!(r.push_record("b", 2).tag, 2);
        r.pop_record();
        assert!(r.at_end());
        assert!(!r.has_error());
    }

    #[test]
    fn reading_past_record_end_is_corrupt() {
        let mut w = Serialiser::new_writer();
        w.push_record("a", 1);
        w.raw_write_bytes(&[1]);
        w.pop_record();
        w.raw_write_bytes(&[0; 8]);

        let mut r = reader(w.stream_bytes());
        r.push_record("a", 1);
        r.raw_read_bytes(4);
        r.pop_record();
        assert_eq!(r.error_kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn headerless_scope_writes_nothing() {
        let mut ser = Serialiser::new_writer();
        ser.push_record("scope", 0);
        ser.raw_write_bytes(&[5]);
        ser.pop_record();
        assert_eq!(ser.stream_bytes(), vec![5]);
    }

    #[test]
    #[should_panic(expected = "pop_record without a matching push_record")]
    fn unbalanced_pop_panics() {
        Serialiser::new_writer().pop_record();
    }

    #[test]
    fn skip_to_record_leaves_stream_at_header() {
        let mut w = Serialiser::new_writer();
        for tag in [3, 4, 5] {
            w.push_record("r", tag);
            w.raw_write_bytes(&[tag as u8; 3]);
            w.pop_record();
        }
        let mut r = reader(w.stream_bytes());
        assert_eq!(r.skip_to_record(5), Some(2));
        assert_eq!(r.push_record("r", 5).tag, 5);
        r.pop_record();
        assert_eq!(r.skip_to_record(9), None);
        assert!(!r.has_error());
    }

    #[test]
    fn interning_returns_shared_copy() {
        let mut ser = Serialiser::new_writer();
        let a = ser.intern("shader".into());
        let b = ser.intern("shader".into());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(ser.interned_count(), 1);
    }

    #[test]
    fn seeking_a_writer_is_an_error() {
        let mut ser = Serialiser::new_writer();
        ser.set_offset(0);
        assert_eq!(ser.error_kind(), ErrorKind::Corrupt);
    }
}
