//! Per-record call stacks and background symbol resolution.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use tracing::debug;

use crate::error::Result;
use crate::format::MAX_CALLSTACK_LEVELS;

/// Return addresses captured for one record, innermost frame first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Stackwalk {
    addrs: Vec<u64>,
}

impl Stackwalk {
    /// Keeps at most [`MAX_CALLSTACK_LEVELS`] frames.
    pub fn new(mut addrs: Vec<u64>) -> Self {
        addrs.truncate(MAX_CALLSTACK_LEVELS);
        Self { addrs }
    }

    pub fn addrs(&self) -> &[u64] {
        &self.addrs
    }

    pub fn num_levels(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

/// Captures the calling thread's stack.
pub trait StackCapture: Send + Sync {
    fn capture(&self) -> Vec<u64>;
}

/// Address to symbol lookup built from a capture's symbol database.
pub trait SymbolResolver: Send + Sync {
    fn resolve(&self, addr: u64) -> Option<String>;
}

/// Builds a [`SymbolResolver`] from symbol database bytes. Implementations should poll
/// `cancel` while working and return `None` once it is set.
pub trait ResolverBuilder: Send + Sync {
    fn build(&self, database: &[u8], cancel: &CancelFlag) -> Option<Arc<dyn SymbolResolver>>;
}

#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Resolver construction running on its own thread. Lookups never wait for it.
pub(crate) struct ResolverTask {
    cancel: CancelFlag,
    slot: Arc<OnceLock<Arc<dyn SymbolResolver>>>,
    finished: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ResolverTask {
    pub(crate) fn spawn(database: Vec<u8>, builder: Arc<dyn ResolverBuilder>) -> Result<Self> {
        let cancel = CancelFlag::new();
        let slot: Arc<OnceLock<Arc<dyn SymbolResolver>>> = Arc::new(OnceLock::new());
        let finished = Arc::new(AtomicBool::new(false));

        let handle = {
            let cancel = cancel.clone();
            let slot = slot.clone();
            let finished = finished.clone();
            std::thread::Builder::new()
                .name("callstack-resolver".into())
                .spawn(move || {
                    debug!(db_len = database.len(), "building callstack resolver");
                    match builder.build(&database, &cancel) {
                        Some(resolver) if !cancel.is_cancelled() => {
                            let _ = slot.set(resolver);
                            debug!("callstack resolver ready");
                        }
                        _ => debug!("callstack resolver build cancelled"),
                    }
                    finished.store(true, Ordering::Release);
                })?
        };

        Ok(Self {
            cancel,
            slot,
            finished,
            handle: Some(handle),
        })
    }

    pub(crate) fn resolver(&self) -> Option<Arc<dyn SymbolResolver>> {
        self.slot.get().cloned()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn resolve(&self, addr: u64) -> Option<String> {
        self.slot.get().and_then(|resolver| resolver.resolve(addr))
    }
}

impl Drop for ResolverTask {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
