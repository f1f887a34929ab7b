use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use capture_serialiser::{
    CancelFlag, RecordOptions, ResolverBuilder, Serialiser, StackCapture, SymbolResolver,
};

struct FixedStack(Vec<u64>);

impl StackCapture for FixedStack {
    fn capture(&self) -> Vec<u64> {
        self.0.clone()
    }
}

struct MapResolver(HashMap<u64, String>);

impl SymbolResolver for MapResolver {
    fn resolve(&self, addr: u64) -> Option<String> {
        self.0.get(&addr).cloned()
    }
}

/// Database format: lines of `addr=name`.
struct TextDbBuilder;

impl ResolverBuilder for TextDbBuilder {
    fn build(&self, database: &[u8], cancel: &CancelFlag) -> Option<Arc<dyn SymbolResolver>> {
        let text = std::str::from_utf8(database).ok()?;
        let mut map = HashMap::new();
        for line in text.lines() {
            if cancel.is_cancelled() {
                return None;
            }
            let (addr, name) = line.split_once('=')?;
            map.insert(u64::from_str_radix(addr, 16).ok()?, name.to_string());
        }
        Some(Arc::new(MapResolver(map)))
    }
}

fn captured_file() -> Vec<u8> {
    let mut w = Serialiser::new_writer();
    w.set_stack_capture(Some(Arc::new(FixedStack(vec![0x1000, 0x2000]))));
    w.push_record_with("draw", 7, RecordOptions::default().with_callstack());
    w.write("count", &3u32);
    w.pop_record();
    w.push_record("plain", 8);
    w.pop_record();
    assert_eq!(w.last_callstack().unwrap().addrs(), &[0x1000, 0x2000]);
    w.set_symbol_database(b"1000=main\n2000=draw_frame".to_vec());

    let mut out = Cursor::new(Vec::new());
    w.write_to(&mut out).unwrap();
    out.into_inner()
}

#[test]
fn callstacks_ride_in_record_headers() {
    let mut r = Serialiser::from_memory(captured_file(), true).unwrap();
    assert!(r.has_callstacks());
    assert!(r.last_callstack().is_none());

    assert_eq!(r.push_record("draw", 7).tag, 7);
    assert_eq!(r.read::<u32>("count"), 3);
    r.pop_record();
    assert_eq!(r.last_callstack().unwrap().addrs(), &[0x1000, 0x2000]);

    assert_eq!(r.push_record("plain", 8).tag, 8);
    r.pop_record();
    assert!(!r.has_error());
}

#[test]
fn resolver_builds_in_background() {
    let mut r = Serialiser::from_memory(captured_file(), true).unwrap();
    assert!(r.init_callstack_resolver(Arc::new(TextDbBuilder)).unwrap());

    let deadline = Instant::now() + Duration::from_secs(10);
    while !r.callstack_resolver_finished() {
        assert!(Instant::now() < deadline, "resolver never finished");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(r.callstack_resolver().is_some());
    assert_eq!(r.resolve_address(0x2000).as_deref(), Some("draw_frame"));
    assert_eq!(r.resolve_address(0x3000), None);
}

#[test]
fn no_database_means_no_resolver() {
    let mut w = Serialiser::new_writer();
    w.push_record("rec", 1);
    w.pop_record();
    let mut out = Cursor::new(Vec::new());
    w.write_to(&mut out).unwrap();

    let mut r = Serialiser::from_memory(out.into_inner(), true).unwrap();
    assert!(!r.has_callstacks());
    assert!(!r.init_callstack_resolver(Arc::new(TextDbBuilder)).unwrap());
    assert!(r.callstack_resolver().is_none());
}
