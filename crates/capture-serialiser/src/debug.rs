//! Human-readable mirror of the encode/decode stream.

use std::sync::{Arc, Mutex, PoisonError};

/// Maps a record tag to a display name for debug text.
pub type RecordNameLookup = fn(u32) -> Option<&'static str>;

/// Text rendering of a value for debug output.
pub trait Render {
    fn render(&self) -> String;
}

macro_rules! render_display {
    ($($t:ty),* $(,)?) => {
        $(
            impl Render for $t {
                fn render(&self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

render_display!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64, bool, char, usize);

impl Render for str {
    fn render(&self) -> String {
        format!("{self:?}")
    }
}

impl Render for String {
    fn render(&self) -> String {
        self.as_str().render()
    }
}

impl<A: Render, B: Render> Render for (A, B) {
    fn render(&self) -> String {
        format!("({}, {})", self.0.render(), self.1.render())
    }
}

/// Shared debug-text sink. Several serialisers may append to the same sink; each append takes
/// the sink's lock for the duration of the copy only.
#[derive(Debug, Clone, Default)]
pub struct DebugSink {
    inner: Arc<Mutex<String>>,
}

impl DebugSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, text: &str) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.push_str(text);
    }

    pub fn contents(&self) -> String {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn take(&self) -> String {
        std::mem::take(&mut *self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[derive(Debug, Default)]
pub(crate) struct DebugTrace {
    enabled: bool,
    text: String,
    sink: Option<DebugSink>,
    lookup: Option<RecordNameLookup>,
}

impl DebugTrace {
    pub(crate) fn enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub(crate) fn set_sink(&mut self, sink: Option<DebugSink>) {
        self.sink = sink;
    }

    pub(crate) fn set_lookup(&mut self, lookup: Option<RecordNameLookup>) {
        self.lookup = lookup;
    }

    pub(crate) fn record_name(&self, tag: u32) -> Option<&'static str> {
        self.lookup.and_then(|lookup| lookup(tag))
    }

    pub(crate) fn text(&self) -> &str {
        &self.text
    }

    pub(crate) fn len(&self) -> usize {
        self.text.len()
    }

    /// Removes and returns everything appended since byte offset `from`.
    pub(crate) fn split_off(&mut self, from: usize) -> String {
        if from >= self.text.len() {
            return String::new();
        }
        self.text.split_off(from)
    }

    pub(crate) fn clear(&mut self) {
        self.text.clear();
    }

    /// Appends one line indented by four spaces per nesting level.
    pub(crate) fn line(&mut self, depth: usize, line: &str) {
        if !self.enabled {
            return;
        }
        let mut full = String::with_capacity(depth * 4 + line.len() + 1);
        full.push_str(&" ".repeat(depth * 4));
        full.push_str(line);
        full.push('\n');
        if let Some(sink) = &self.sink {
            sink.append(&full);
        }
        self.text.push_str(&full);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_are_indented_by_depth() {
        let mut trace = DebugTrace::default();
        trace.set_enabled(true);
        trace.line(0, "a: 1");
        trace.line(2, "b: 2");
        assert_eq!(trace.text(), "a: 1\n        b: 2\n");
    }

    #[test]
    fn disabled_trace_records_nothing() {
        let mut trace = DebugTrace::default();
        trace.line(0, "ignored");
        assert_eq!(trace.text(), "");
    }

    #[test]
    fn shared_sink_sees_every_instance() {
        let sink = DebugSink::new();
        let mut a = DebugTrace::default();
        let mut b = DebugTrace::default();
        for t in [&mut a, &mut b] {
            t.set_enabled(true);
            t.set_sink(Some(sink.clone()));
        }
        a.line(0, "from a");
        b.line(1, "from b");
        assert_eq!(sink.contents(), "from a\n    from b\n");
        assert_eq!(a.text(), "from a\n");
    }

    #[test]
    fn split_off_returns_tail() {
        let mut trace = DebugTrace::default();
        trace.set_enabled(true);
        trace.line(0, "head");
        let mark = trace.len();
        trace.line(0, "tail");
        assert_eq!(trace.split_off(mark), "tail\n");
        assert_eq!(trace.text(), "head\n");
    }

    #[test]
    fn render_pairs_and_strings() {
        assert_eq!((1u32, String::from("x")).render(), "(1, \"x\")");
    }
}
