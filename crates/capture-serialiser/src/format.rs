use bitflags::bitflags;

/// `"CSER"` read as a little-endian `u32`.
pub const MAGIC_HEADER: u32 = u32::from_le_bytes(*b"CSER");

/// Version of the container and record framing. Bumping the meaning of individual record
/// payloads does not require bumping this; those carry their own versions.
pub const SERIALISE_VERSION: u64 = 0x0000_0032;

/// Largest tag a record header can carry.
pub const MAX_RECORD_TAG: u32 = 0x3FFE;

/// Tag of the filler records the file writer emits in front of aligned chunks.
pub const PADDING_RECORD_TAG: u32 = 0x3FFF;

pub(crate) const RECORD_TAG_MASK: u16 = 0x3FFF;
pub(crate) const RECORD_FLAG_COMPACT: u16 = 0x4000;
pub(crate) const RECORD_FLAG_CALLSTACK: u16 = 0x8000;

/// Compact padding record header: 16-bit word + 16-bit length.
pub(crate) const PADDING_HEADER_LEN: usize = 4;

/// Alignment aligned chunks are placed at inside a file stream, and the granularity the read
/// window refills at.
pub const CHUNK_ALIGNMENT: usize = 64;

/// Maximum number of return addresses a record header can carry.
pub const MAX_CALLSTACK_LEVELS: usize = u8::MAX as usize;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct SectionFlags: u32 {
        const DEBUG_TEXT = 1 << 0;
        const LZ4_COMPRESSED = 1 << 1;
    }
}

/// Section kinds the engine understands. Everything else is carried as [`SectionKind::Unrecognized`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    Unrecognized,
    PrimaryData,
    SymbolDatabase,
    Bookmarks,
    Notes,
}

impl SectionKind {
    pub const KNOWN: [SectionKind; 4] = [
        SectionKind::PrimaryData,
        SectionKind::SymbolDatabase,
        SectionKind::Bookmarks,
        SectionKind::Notes,
    ];

    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => SectionKind::PrimaryData,
            2 => SectionKind::SymbolDatabase,
            3 => SectionKind::Bookmarks,
            4 => SectionKind::Notes,
            _ => SectionKind::Unrecognized,
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            SectionKind::Unrecognized => 0,
            SectionKind::PrimaryData => 1,
            SectionKind::SymbolDatabase => 2,
            SectionKind::Bookmarks => 3,
            SectionKind::Notes => 4,
        }
    }

    /// Canonical section name written for each known kind.
    pub fn default_name(self) -> Option<&'static str> {
        match self {
            SectionKind::Unrecognized => None,
            SectionKind::PrimaryData => Some("capture/records"),
            SectionKind::SymbolDatabase => Some("capture/symbol-db"),
            SectionKind::Bookmarks => Some("ui/bookmarks"),
            SectionKind::Notes => Some("ui/notes"),
        }
    }

    pub(crate) fn index(self) -> Option<usize> {
        match self {
            SectionKind::Unrecognized => None,
            SectionKind::PrimaryData => Some(0),
            SectionKind::SymbolDatabase => Some(1),
            SectionKind::Bookmarks => Some(2),
            SectionKind::Notes => Some(3),
        }
    }
}

impl core::fmt::Display for SectionKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.default_name() {
            Some(name) => write!(f, "{name}({})", self.to_u32()),
            None => write!(f, "unrecognized"),
        }
    }
}

/// Padding needed so that `pos` becomes a multiple of `align`. `align == 0` means none.
pub(crate) fn padding_for(pos: u64, align: u64) -> u64 {
    if align == 0 {
        return 0;
    }
    (align - pos % align) % align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_kind_numbers_are_stable() {
        for (kind, num) in [
            (SectionKind::PrimaryData, 1u32),
            (SectionKind::SymbolDatabase, 2),
            (SectionKind::Bookmarks, 3),
            (SectionKind::Notes, 4),
        ] {
            assert_eq!(kind.to_u32(), num);
            assert_eq!(SectionKind::from_u32(num), kind);
        }
        assert_eq!(SectionKind::from_u32(99), SectionKind::Unrecognized);
    }

    #[test]
    fn padding_rounds_up_to_alignment() {
        assert_eq!(padding_for(0, 64), 0);
        assert_eq!(padding_for(1, 64), 63);
        assert_eq!(padding_for(64, 64), 0);
        assert_eq!(padding_for(70, 16), 10);
        assert_eq!(padding_for(13, 0), 0);
    }
}
