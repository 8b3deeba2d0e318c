//! Buffered page cache seam
//!
//! The mini allocator talks to the page cache through [`PageCache`] and
//! never sees block I/O, eviction, or checkpointing. What it relies on
//! is the four-step access protocol, always entered in order and left
//! in reverse:
//!
//! ```text
//! get ────→ pinned    page stays resident, reads allowed, may block on I/O
//! claim ──→ claimed   exclusive upgrade intent, non-blocking, may fail
//! lock ───→ locked    writer exclusion, page bytes may change
//! unlock / unclaim / unget
//! ```
//!
//! A failed claim means another thread holds the upgrade intent; the
//! caller drops its pin, backs off, and retries. [`PageWriteGuard`]
//! packages the whole sequence as an RAII scope. [`MemCache`] is the
//! in-memory reference implementation.

pub mod guard;
pub mod memory;

pub use guard::PageWriteGuard;
pub use memory::{CacheConfig, CacheStats, MemCache};

use crate::extent::ExtentAllocator;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

/// Page type tag, recorded per page for cache accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageType {
    /// Pages of a tree stream
    Branch,
    /// Log stream pages
    Log,
    /// Filter pages
    Filter,
    /// Untyped pages; metadata chains are traversed as misc
    Misc,
}

/// One resident page: its bytes plus the protocol state
#[derive(Debug)]
pub(crate) struct Frame {
    data: RwLock<Box<[u8]>>,
    pins: AtomicU32,
    claimed: AtomicBool,
    locked: AtomicBool,
    dirty: AtomicBool,
}

impl Frame {
    fn new(page_size: usize) -> Self {
        Self {
            data: RwLock::new(vec![0u8; page_size].into_boxed_slice()),
            pins: AtomicU32::new(0),
            claimed: AtomicBool::new(false),
            locked: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
        }
    }
}

/// Pinned reference to a cached page
///
/// A handle is one pin; it is surrendered through [`PageCache::unget`].
pub struct PageHandle {
    addr: u64,
    frame: Arc<Frame>,
}

impl PageHandle {
    /// Disk address of the pinned page
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Read the page bytes. Requires only the pin.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.frame.data.read().unwrap();
        f(&data)
    }

    /// Mutate the page bytes. The caller must hold the page lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        assert!(
            self.frame.locked.load(Ordering::Acquire),
            "page update without the lock"
        );
        let mut data = self.frame.data.write().unwrap();
        f(&mut data)
    }
}

/// The buffered page cache interface the mini allocator consumes
pub trait PageCache: Send + Sync {
    /// Size of one page in bytes
    fn page_size(&self) -> u64;

    /// Size of one extent in bytes, a multiple of the page size
    fn extent_size(&self) -> u64;

    /// Create a brand-new page at `addr`. The returned handle is
    /// already pinned, claimed, and locked; the creator owns the page
    /// exclusively until it runs the release sequence.
    fn alloc(&self, addr: u64, ty: PageType) -> PageHandle;

    /// Pin an existing page, reading it in if necessary
    fn get(&self, addr: u64, blocking: bool, ty: PageType) -> PageHandle;

    /// Non-blocking upgrade intent; false if another thread holds it
    fn claim(&self, handle: &PageHandle) -> bool;

    /// Writer exclusion; requires a successful claim
    fn lock(&self, handle: &PageHandle);

    fn unlock(&self, handle: &PageHandle);

    fn unclaim(&self, handle: &PageHandle);

    fn unget(&self, handle: PageHandle);

    /// Record that the page must reach disk before it can be evicted
    fn mark_dirty(&self, handle: &PageHandle);

    /// Drop one reference on an extent; true iff the refcount reached
    /// zero and its pages were discarded
    fn dealloc(&self, base_addr: u64, ty: PageType) -> bool;

    /// Queue write-back for the extent's dirty pages, accumulating the
    /// number of pages now in flight
    fn extent_sync(&self, base_addr: u64, pages_outstanding: &mut u64);

    /// Begin reading the extent's pages in
    fn prefetch(&self, base_addr: u64, ty: PageType);

    /// The extent allocator this cache is built over
    fn allocator(&self) -> Arc<dyn ExtentAllocator>;
}
