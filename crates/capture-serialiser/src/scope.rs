use std::ops::{Deref, DerefMut};

use crate::chunk::Chunk;
use crate::options::RecordOptions;
use crate::serialiser::{RecordInfo, Serialiser};

/// An open record that closes itself when dropped.
///
/// Derefs to the [`Serialiser`], so fields are written straight through the scope. A writing
/// scope can instead [`finish`](RecordScope::finish) into a [`Chunk`] or
/// [`abandon`](RecordScope::abandon) everything written inside it.
pub struct RecordScope<'a> {
    ser: &'a mut Serialiser,
    info: RecordInfo,
    depth: usize,
    closed: bool,
}

impl Serialiser {
    pub fn record(&mut self, label: &str, tag: u32) -> RecordScope<'_> {
        self.record_with(label, tag, RecordOptions::default())
    }

    pub fn record_with(&mut self, label: &str, tag: u32, options: RecordOptions) -> RecordScope<'_> {
        let info = self.push_record_with(label, tag, options);
        let depth = self.depth();
        RecordScope {
            ser: self,
            info,
            depth,
            closed: false,
        }
    }
}

impl RecordScope<'_> {
    pub fn info(&self) -> RecordInfo {
        self.info
    }

    pub fn tag(&self) -> u32 {
        self.info.tag
    }

    fn assert_innermost(&self) {
        assert_eq!(
            self.ser.depth(),
            self.depth,
            "record scope closed while a nested record is still open"
        );
    }

    /// Closes the record and returns its encoded span as a chunk. `None` once the serialiser
    /// has failed.
    ///
    /// # Panics
    ///
    /// Panics when reading, or when the record is not outermost.
    pub fn finish(mut self, temporary: bool) -> Option<Chunk> {
        self.assert_innermost();
        self.closed = true;
        self.ser.finish_chunk(temporary)
    }

    /// Closes the record and drops every byte written since it opened.
    pub fn abandon(mut self) {
        self.assert_innermost();
        self.closed = true;
        self.ser.abandon_record();
    }

    /// Closes the record, leaving its bytes in the stream.
    pub fn end(mut self) {
        self.assert_innermost();
        self.closed = true;
        self.ser.pop_record();
    }
}

impl Deref for RecordScope<'_> {
    type Target = Serialiser;

    fn deref(&self) -> &Serialiser {
        self.ser
    }
}

impl DerefMut for RecordScope<'_> {
    fn deref_mut(&mut self) -> &mut Serialiser {
        self.ser
    }
}

impl Drop for RecordScope<'_> {
    fn drop(&mut self) {
        if !self.closed && !std::thread::panicking() {
            self.ser.pop_record();
        }
    }
}
