use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SerialiserError>;

#[derive(Debug, Error)]
pub enum SerialiserError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("out of memory allocating {len} bytes")]
    OutOfMemory { len: usize },

    #[error("invalid capture magic")]
    InvalidMagic,

    #[error("unsupported serialise version {0:#x}")]
    UnsupportedVersion(u64),

    #[error("corrupt stream: {0}")]
    Corrupt(&'static str),

    #[error("element count {count} does not fit the 32-bit wire count")]
    CountOverflow { count: u64 },

    #[error("lz4 decompression failed: {0}")]
    Lz4Decompress(#[from] lz4_flex::block::DecompressError),

    #[error("utf-8 decoding failed: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Coarse error classification kept by a [`crate::Serialiser`] once a pass fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorKind {
    #[default]
    None,
    Io,
    Corrupt,
    UnsupportedVersion,
}

impl SerialiserError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SerialiserError::Io(_) => ErrorKind::Io,
            SerialiserError::UnsupportedVersion(_) => ErrorKind::UnsupportedVersion,
            SerialiserError::OutOfMemory { .. }
            | SerialiserError::InvalidMagic
            | SerialiserError::Corrupt(_)
            | SerialiserError::CountOverflow { .. }
            | SerialiserError::Lz4Decompress(_)
            | SerialiserError::Utf8(_) => ErrorKind::Corrupt,
        }
    }
}

pub(crate) fn unexpected_eof(what: &'static str) -> SerialiserError {
    SerialiserError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, what))
}
