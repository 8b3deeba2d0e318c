//! Reference-counted extent allocator
//!
//! Bump-allocates extent bases and recycles freed ones through a
//! min-heap free list, so the lowest freed base is reused first. Extent
//! 0 is never handed out; it is reserved for a superblock, which also
//! keeps addresses 0 and 1 free to serve as sentinels elsewhere.

use super::ExtentAllocator;
use crate::error::{Error, Result};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use tracing::{debug, trace};

/// Reference-counted extent allocator over a bounded extent space
pub struct RefCountAllocator {
    extent_size: u64,
    max_extents: u64,
    inner: Mutex<Inner>,
}

struct Inner {
    /// Next never-used base
    next_base: u64,
    /// Live extents and their reference counts
    refcounts: HashMap<u64, u8>,
    /// Freed bases available for reuse
    free_bases: BinaryHeap<Reverse<u64>>,
    /// Every base whose refcount reached zero, in order
    freed_log: Vec<u64>,
}

impl RefCountAllocator {
    /// Create an allocator for `max_extents` extents of `extent_size`
    /// bytes each
    pub fn new(extent_size: u64, max_extents: u64) -> Self {
        assert!(extent_size > 0);
        debug!(extent_size, max_extents, "extent allocator ready");
        Self {
            extent_size,
            max_extents,
            inner: Mutex::new(Inner {
                // extent 0 is the superblock's
                next_base: extent_size,
                refcounts: HashMap::new(),
                free_bases: BinaryHeap::new(),
                freed_log: Vec::new(),
            }),
        }
    }

    /// Snapshot of the allocator state
    pub fn stats(&self) -> AllocatorStats {
        let inner = self.inner.lock().unwrap();
        AllocatorStats {
            live_extents: inner.refcounts.len(),
            high_water: inner.next_base / self.extent_size,
            freed: inner.freed_log.clone(),
        }
    }
}

impl ExtentAllocator for RefCountAllocator {
    fn alloc_extent(&self) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let base = if let Some(Reverse(base)) = inner.free_bases.pop() {
            base
        } else {
            let base = inner.next_base;
            if base / self.extent_size > self.max_extents {
                return Err(Error::Allocator(format!(
                    "extent space exhausted ({} extents)",
                    self.max_extents
                )));
            }
            inner.next_base += self.extent_size;
            base
        };
        inner.refcounts.insert(base, 1);
        trace!(base, "allocated extent");
        Ok(base)
    }

    fn inc_refcount(&self, addr: u64) {
        debug_assert_eq!(addr % self.extent_size, 0, "unaligned extent address");
        let mut inner = self.inner.lock().unwrap();
        let rc = inner
            .refcounts
            .get_mut(&addr)
            .expect("inc_refcount on unallocated extent");
        *rc += 1;
    }

    fn dec_refcount(&self, addr: u64) -> u8 {
        debug_assert_eq!(addr % self.extent_size, 0, "unaligned extent address");
        let mut inner = self.inner.lock().unwrap();
        let rc = inner
            .refcounts
            .get_mut(&addr)
            .expect("dec_refcount on unallocated extent");
        *rc -= 1;
        let remaining = *rc;
        if remaining == 0 {
            inner.refcounts.remove(&addr);
            inner.free_bases.push(Reverse(addr));
            inner.freed_log.push(addr);
            trace!(addr, "extent refcount reached zero");
        }
        remaining
    }

    fn get_refcount(&self, addr: u64) -> u8 {
        let inner = self.inner.lock().unwrap();
        inner.refcounts.get(&addr).copied().unwrap_or(0)
    }
}

/// Snapshot of allocator state, mostly for tests and diagnostics
#[derive(Debug, Clone)]
pub struct AllocatorStats {
    /// Extents with a nonzero refcount
    pub live_extents: usize,
    /// Extents ever carved from the bump cursor (including extent 0)
    pub high_water: u64,
    /// Bases whose refcount reached zero, in order of release
    pub freed: Vec<u64>,
}
