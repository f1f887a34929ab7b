//! File-level container: magic, version and a directory of named sections.
//!
//! ```text
//! u32 magic (MAGIC_HEADER)
//! u64 version (SERIALISE_VERSION)
//! u32 section_count
//! section_count x {
//!     u32 name_len, name
//!     u32 kind
//!     u32 flags
//!     u64 offset
//!     u64 stored_len
//!     u64 data_len
//!     u64 text_len
//! }
//! payloads
//! ```
//!
//! A payload is `stored_len` bytes (block-compressed when `LZ4_COMPRESSED` is set), followed by
//! `text_len` bytes of debug text when `DEBUG_TEXT` is set.

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::compress::{BlockWriter, CompressedSource, CompressionTransform};
use crate::error::{Result, SerialiserError};
use crate::format::{SectionFlags, SectionKind, MAGIC_HEADER, SERIALISE_VERSION};
use crate::io::{ReadLeExt, WriteLeExt};
use crate::options::{Compression, DEFAULT_BLOCK_SIZE};
use crate::window::{RegionSource, WindowSource};

const MAX_SECTION_COUNT: u32 = 4096;
const MAX_SECTION_NAME_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionEntry {
    pub name: String,
    pub kind: SectionKind,
    /// Kind exactly as stored, kept so unrecognized kinds survive a resave.
    pub raw_kind: u32,
    pub flags: SectionFlags,
    pub offset: u64,
    pub stored_len: u64,
    pub data_len: u64,
    pub text_len: u64,
}

impl SectionEntry {
    pub fn is_compressed(&self) -> bool {
        self.flags.contains(SectionFlags::LZ4_COMPRESSED)
    }

    pub fn has_debug_text(&self) -> bool {
        self.flags.contains(SectionFlags::DEBUG_TEXT) && self.text_len > 0
    }

    fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_string_u32(&self.name)?;
        w.write_u32_le(self.raw_kind)?;
        w.write_u32_le(self.flags.bits())?;
        w.write_u64_le(self.offset)?;
        w.write_u64_le(self.stored_len)?;
        w.write_u64_le(self.data_len)?;
        w.write_u64_le(self.text_len)?;
        Ok(())
    }

    fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let name = r.read_string_u32(MAX_SECTION_NAME_LEN)?;
        let raw_kind = r.read_u32_le()?;
        let flags = SectionFlags::from_bits_retain(r.read_u32_le()?);
        let offset = r.read_u64_le()?;
        let stored_len = r.read_u64_le()?;
        let data_len = r.read_u64_le()?;
        let text_len = r.read_u64_le()?;
        Ok(Self {
            name,
            kind: SectionKind::from_u32(raw_kind),
            raw_kind,
            flags,
            offset,
            stored_len,
            data_len,
            text_len,
        })
    }
}

/// A section's stored bytes, untouched, ready to be written into another file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerbatimSection {
    pub entry: SectionEntry,
    /// `stored_len` payload bytes followed by `text_len` text bytes.
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SectionTable {
    version: u64,
    entries: Vec<SectionEntry>,
    known: [Option<usize>; 4],
}

impl SectionTable {
    /// Reads and validates the header and directory. The version is checked before anything
    /// past it is read.
    pub fn read_from<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let file_len = r.seek(SeekFrom::End(0))?;
        r.seek(SeekFrom::Start(0))?;

        let magic = r.read_u32_le()?;
        if magic != MAGIC_HEADER {
            return Err(SerialiserError::InvalidMagic);
        }
        let version = r.read_u64_le()?;
        if version != SERIALISE_VERSION {
            return Err(SerialiserError::UnsupportedVersion(version));
        }

        let count = r.read_u32_le()?;
        if count > MAX_SECTION_COUNT {
            return Err(SerialiserError::Corrupt("too many sections"));
        }

        let mut entries = Vec::with_capacity(count as usize);
        let mut known = [None; 4];
        for idx in 0..count as usize {
            let mut entry = SectionEntry::decode(r)?;
            let end = entry
                .offset
                .checked_add(entry.stored_len)
                .and_then(|end| end.checked_add(entry.text_len))
                .ok_or(SerialiserError::Corrupt("section length overflow"))?;
            if end > file_len {
                return Err(SerialiserError::Corrupt("section out of bounds"));
            }
            if !entry.is_compressed() && entry.stored_len != entry.data_len {
                return Err(SerialiserError::Corrupt("uncompressed section length mismatch"));
            }
            if let Some(slot) = entry.kind.index() {
                if known[slot].is_none() {
                    known[slot] = Some(idx);
                } else {
                    // Only the first section of a kind is interpreted; later ones ride along.
                    entry.kind = SectionKind::Unrecognized;
                }
            }
            entries.push(entry);
        }

        debug!(sections = entries.len(), version, "read section table");
        Ok(Self {
            version,
            entries,
            known,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// All sections in file order.
    pub fn entries(&self) -> &[SectionEntry] {
        &self.entries
    }

    pub fn find(&self, kind: SectionKind) -> Option<&SectionEntry> {
        kind.index()
            .and_then(|slot| self.known[slot])
            .map(|idx| &self.entries[idx])
    }

    pub fn unrecognized(&self) -> impl Iterator<Item = &SectionEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.kind == SectionKind::Unrecognized)
    }

    /// Stops treating the section of `kind` as known. Later lookups report it absent; the
    /// bytes still ride along on resave.
    pub(crate) fn demote(&mut self, kind: SectionKind, reason: &SerialiserError) {
        let Some(slot) = kind.index() else {
            return;
        };
        if let Some(idx) = self.known[slot].take() {
            warn!(section = %self.entries[idx].name, %reason, "section failed to load");
            self.entries[idx].kind = SectionKind::Unrecognized;
        }
    }

    /// Random-access view of a section's uncompressed payload.
    pub fn open_source<R: Read + Seek + Send + 'static>(
        entry: &SectionEntry,
        reader: R,
        transform: Arc<dyn CompressionTransform>,
    ) -> Result<Box<dyn WindowSource>> {
        if entry.is_compressed() {
            Ok(Box::new(CompressedSource::open(
                reader,
                entry.offset,
                entry.stored_len,
                entry.data_len,
                transform,
            )?))
        } else {
            Ok(Box::new(RegionSource::new(
                reader,
                entry.offset,
                entry.data_len,
            )))
        }
    }

    /// Loads a section's whole uncompressed payload.
    pub fn read_data<R: Read + Seek + Send>(
        entry: &SectionEntry,
        reader: &mut R,
        transform: Arc<dyn CompressionTransform>,
    ) -> Result<Vec<u8>> {
        let len = usize::try_from(entry.data_len)
            .map_err(|_| SerialiserError::Corrupt("section too large"))?;
        if entry.is_compressed() {
            let mut source = CompressedSource::open(
                &mut *reader,
                entry.offset,
                entry.stored_len,
                entry.data_len,
                transform,
            )?;
            let mut out = Vec::new();
            out.try_reserve_exact(len)
                .map_err(|_| SerialiserError::OutOfMemory { len })?;
            out.resize(len, 0);
            source.read_at(0, &mut out)?;
            Ok(out)
        } else {
            reader.seek(SeekFrom::Start(entry.offset))?;
            reader.read_exact_vec(len)
        }
    }

    /// Reads the ASCII rendering stored next to a section, if any.
    pub fn read_text<R: Read + Seek>(entry: &SectionEntry, reader: &mut R) -> Result<Option<String>> {
        if !entry.has_debug_text() {
            return Ok(None);
        }
        let len = usize::try_from(entry.text_len)
            .map_err(|_| SerialiserError::Corrupt("section text too large"))?;
        reader.seek(SeekFrom::Start(entry.offset + entry.stored_len))?;
        let bytes = reader.read_exact_vec(len)?;
        Ok(Some(String::from_utf8(bytes)?))
    }

    pub fn read_verbatim<R: Read + Seek>(
        entry: &SectionEntry,
        reader: &mut R,
    ) -> Result<VerbatimSection> {
        let len = entry
            .stored_len
            .checked_add(entry.text_len)
            .and_then(|len| usize::try_from(len).ok())
            .ok_or(SerialiserError::Corrupt("section too large"))?;
        reader.seek(SeekFrom::Start(entry.offset))?;
        let bytes = reader.read_exact_vec(len)?;
        Ok(VerbatimSection {
            entry: entry.clone(),
            bytes,
        })
    }

    /// Writes every section back out unchanged.
    pub fn resave<R: Read + Seek, W: Write + Seek>(&self, reader: &mut R, w: &mut W) -> Result<()> {
        let mut writer = SectionTableWriter::new();
        for entry in &self.entries {
            writer.push_verbatim(Self::read_verbatim(entry, reader)?);
        }
        writer.write_to(w, &crate::compress::Lz4Block)?;
        Ok(())
    }
}

enum PendingContent<'a> {
    Fresh {
        pieces: Vec<&'a [u8]>,
        compression: Compression,
        block_size: u32,
        text: Option<&'a str>,
    },
    Verbatim(VerbatimSection),
}

struct PendingSection<'a> {
    name: String,
    raw_kind: u32,
    content: PendingContent<'a>,
}

/// Collects sections and writes a complete container in one pass, patching the directory once
/// every payload's offset and length is known.
#[derive(Default)]
pub struct SectionTableWriter<'a> {
    sections: Vec<PendingSection<'a>>,
}

impl<'a> SectionTableWriter<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a section whose payload is `pieces` concatenated.
    pub fn push(
        &mut self,
        name: impl Into<String>,
        kind: SectionKind,
        pieces: Vec<&'a [u8]>,
        compression: Compression,
        text: Option<&'a str>,
    ) {
        self.push_with_block_size(name, kind, pieces, compression, DEFAULT_BLOCK_SIZE, text);
    }

    pub fn push_with_block_size(
        &mut self,
        name: impl Into<String>,
        kind: SectionKind,
        pieces: Vec<&'a [u8]>,
        compression: Compression,
        block_size: u32,
        text: Option<&'a str>,
    ) {
        self.sections.push(PendingSection {
            name: name.into(),
            raw_kind: kind.to_u32(),
            content: PendingContent::Fresh {
                pieces,
                compression,
                block_size,
                text,
            },
        });
    }

    pub fn push_verbatim(&mut self, section: VerbatimSection) {
        self.sections.push(PendingSection {
            name: section.entry.name.clone(),
            raw_kind: section.entry.raw_kind,
            content: PendingContent::Verbatim(section),
        });
    }

    pub fn write_to<W: Write + Seek>(
        &self,
        w: &mut W,
        transform: &dyn CompressionTransform,
    ) -> Result<Vec<SectionEntry>> {
        let count = u32::try_from(self.sections.len())
            .map_err(|_| SerialiserError::Corrupt("too many sections"))?;
        w.write_u32_le(MAGIC_HEADER)?;
        w.write_u64_le(SERIALISE_VERSION)?;
        w.write_u32_le(count)?;

        let mut entries: Vec<SectionEntry> = self
            .sections
            .iter()
            .map(|section| SectionEntry {
                name: section.name.clone(),
                kind: SectionKind::from_u32(section.raw_kind),
                raw_kind: section.raw_kind,
                flags: SectionFlags::empty(),
                offset: 0,
                stored_len: 0,
                data_len: 0,
                text_len: 0,
            })
            .collect();

        let directory_pos = w.stream_position()?;
        for entry in &entries {
            entry.encode(w)?; // placeholder, patched below
        }

        for (section, entry) in self.sections.iter().zip(entries.iter_mut()) {
            entry.offset = w.stream_position()?;
            match &section.content {
                PendingContent::Fresh {
                    pieces,
                    compression,
                    block_size,
                    text,
                } => {
                    let data_len: u64 = pieces.iter().map(|p| p.len() as u64).sum();
                    entry.data_len = data_len;
                    match compression {
                        Compression::None => {
                            for piece in pieces {
                                w.write_bytes(piece)?;
                            }
                            entry.stored_len = data_len;
                        }
                        Compression::Lz4 => {
                            let mut blocks = BlockWriter::new(w, transform, *block_size)?;
                            for piece in pieces {
                                blocks.write_all(piece)?;
                            }
                            entry.stored_len = blocks.finish()?;
                            entry.flags |= SectionFlags::LZ4_COMPRESSED;
                        }
                    }
                    if let Some(text) = text.filter(|t| !t.is_empty()) {
                        w.write_bytes(text.as_bytes())?;
                        entry.text_len = text.len() as u64;
                        entry.flags |= SectionFlags::DEBUG_TEXT;
                    }
                }
                PendingContent::Verbatim(verbatim) => {
                    w.write_bytes(&verbatim.bytes)?;
                    entry.flags = verbatim.entry.flags;
                    entry.stored_len = verbatim.entry.stored_len;
                    entry.data_len = verbatim.entry.data_len;
                    entry.text_len = verbatim.entry.text_len;
                }
            }
        }

        let end = w.stream_position()?;
        w.seek(SeekFrom::Start(directory_pos))?;
        for entry in &entries {
            entry.encode(w)?;
        }
        w.seek(SeekFrom::Start(end))?;
        w.flush()?;
        debug!(sections = entries.len(), bytes = end, "wrote section table");
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::{default_transform, Lz4Block};
    use std::io::Cursor;

    fn sample_file() -> Vec<u8> {
        let records = vec![0xABu8; 5000];
        let mut writer = SectionTableWriter::new();
        writer.push(
            "capture/records",
            SectionKind::PrimaryData,
            vec![&records[..2000], &records[2000..]],
            Compression::Lz4,
            Some("rec: 1\n"),
        );
        writer.push(
            "vendor/extra",
            SectionKind::Unrecognized,
            vec![b"opaque"],
            Compression::None,
            None,
        );
        let mut out = Cursor::new(Vec::new());
        writer.write_to(&mut out, &Lz4Block).unwrap();
        out.into_inner()
    }

    #[test]
    fn directory_roundtrips() {
        let bytes = sample_file();
        let mut r = Cursor::new(bytes);
        let table = SectionTable::read_from(&mut r).unwrap();
        assert_eq!(table.entries().len(), 2);

        let primary = table.find(SectionKind::PrimaryData).unwrap().clone();
        assert!(primary.is_compressed());
        assert_eq!(primary.data_len, 5000);
        let data = SectionTable::read_data(&primary, &mut r, default_transform()).unwrap();
        assert_eq!(data, vec![0xABu8; 5000]);
        assert_eq!(
            SectionTable::read_text(&primary, &mut r).unwrap().as_deref(),
            Some("rec: 1\n")
        );

        let extra = table.unrecognized().next().unwrap().clone();
        assert_eq!(extra.name, "vendor/extra");
        let data = SectionTable::read_data(&extra, &mut r, default_transform()).unwrap();
        assert_eq!(data, b"opaque");
    }

    #[test]
    fn version_mismatch_stops_before_directory() {
        let mut bytes = sample_file();
        bytes[4..12].copy_from_slice(&(SERIALISE_VERSION + 1).to_le_bytes());
        // Trash the directory: a version check that reads further would report Corrupt instead.
        for b in &mut bytes[12..] {
            *b = 0xFF;
        }
        let err = SectionTable::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, SerialiserError::UnsupportedVersion(v) if v == SERIALISE_VERSION + 1));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = sample_file();
        bytes[0] ^= 0xFF;
        let err = SectionTable::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, SerialiserError::InvalidMagic));
    }

    #[test]
    fn out_of_bounds_section_is_corrupt() {
        let mut bytes = sample_file();
        let len = bytes.len();
        bytes.truncate(len - 3);
        let err = SectionTable::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, SerialiserError::Corrupt(_)));
    }

    #[test]
    fn resave_is_byte_identical() {
        let bytes = sample_file();
        let mut r = Cursor::new(bytes.clone());
        let table = SectionTable::read_from(&mut r).unwrap();
        let mut out = Cursor::new(Vec::new());
        table.resave(&mut r, &mut out).unwrap();
        assert_eq!(out.into_inner(), bytes);
    }

    #[test]
    fn duplicate_known_kinds_ride_along_as_unrecognized() {
        let mut writer = SectionTableWriter::new();
        writer.push("a", SectionKind::Notes, vec![b"one"], Compression::None, None);
        writer.push("b", SectionKind::Notes, vec![b"two"], Compression::None, None);
        let mut out = Cursor::new(Vec::new());
        writer.write_to(&mut out, &Lz4Block).unwrap();

        let table = SectionTable::read_from(&mut out).unwrap();
        assert_eq!(table.find(SectionKind::Notes).unwrap().name, "a");
        assert_eq!(table.unrecognized().count(), 1);
        assert_eq!(table.entries()[1].raw_kind, SectionKind::Notes.to_u32());
    }
}
