//! In-memory page cache
//!
//! Reference implementation of the page protocol over plain memory.
//! Every frame stays resident (no eviction, no checkpointing), which is
//! all the allocator layers need; a production cache would put block
//! I/O behind the same trait. Getting a page in a never-written or
//! freed extent yields a zero-filled frame, the way a recycled region
//! of a zeroed volume would read back.

use super::{Frame, PageCache, PageHandle, PageType};
use crate::error::{Error, Result};
use crate::extent::{ExtentAllocator, RefCountAllocator};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Cache geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Size of each page in bytes
    pub page_size: u64,
    /// Size of each extent in bytes; must be a multiple of the page size
    pub extent_size: u64,
    /// Extent-space capacity handed to the extent allocator
    pub max_extents: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            extent_size: 131072,
            max_extents: 4096,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.extent_size == 0 {
            return Err(Error::Config(
                "page and extent sizes must be nonzero".to_string(),
            ));
        }
        if self.extent_size % self.page_size != 0 {
            return Err(Error::Config(format!(
                "extent size {} is not a multiple of page size {}",
                self.extent_size, self.page_size
            )));
        }
        Ok(())
    }

    pub fn pages_per_extent(&self) -> u64 {
        self.extent_size / self.page_size
    }
}

/// In-memory page cache over a refcounting extent allocator
pub struct MemCache {
    cfg: CacheConfig,
    allocator: Arc<RefCountAllocator>,
    frames: Mutex<HashMap<u64, Arc<Frame>>>,
    gets: AtomicU64,
    allocs: AtomicU64,
    claim_failures: AtomicU64,
    deallocs: AtomicU64,
    prefetched_extents: AtomicU64,
}

impl MemCache {
    pub fn new(cfg: CacheConfig) -> Result<Self> {
        cfg.validate()?;
        let allocator = Arc::new(RefCountAllocator::new(cfg.extent_size, cfg.max_extents));
        debug!(
            page_size = cfg.page_size,
            extent_size = cfg.extent_size,
            "opened in-memory page cache"
        );
        Ok(Self {
            cfg,
            allocator,
            frames: Mutex::new(HashMap::new()),
            gets: AtomicU64::new(0),
            allocs: AtomicU64::new(0),
            claim_failures: AtomicU64::new(0),
            deallocs: AtomicU64::new(0),
            prefetched_extents: AtomicU64::new(0),
        })
    }

    fn frame(&self, addr: u64) -> Arc<Frame> {
        debug_assert_eq!(addr % self.cfg.page_size, 0, "unaligned page address");
        let mut frames = self.frames.lock().unwrap();
        frames
            .entry(addr)
            .or_insert_with(|| Arc::new(Frame::new(self.cfg.page_size as usize)))
            .clone()
    }

    /// Snapshot of cache counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            gets: self.gets.load(Ordering::Relaxed),
            allocs: self.allocs.load(Ordering::Relaxed),
            claim_failures: self.claim_failures.load(Ordering::Relaxed),
            deallocs: self.deallocs.load(Ordering::Relaxed),
            prefetched_extents: self.prefetched_extents.load(Ordering::Relaxed),
        }
    }

    /// The concrete extent allocator, with its stats surface
    pub fn extent_allocator(&self) -> &RefCountAllocator {
        &self.allocator
    }
}

impl PageCache for MemCache {
    fn page_size(&self) -> u64 {
        self.cfg.page_size
    }

    fn extent_size(&self) -> u64 {
        self.cfg.extent_size
    }

    fn alloc(&self, addr: u64, _ty: PageType) -> PageHandle {
        self.allocs.fetch_add(1, Ordering::Relaxed);
        let frame = self.frame(addr);
        frame.pins.fetch_add(1, Ordering::AcqRel);
        let claimed = frame
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        assert!(claimed, "allocating a page that is already claimed");
        frame.locked.store(true, Ordering::Release);
        frame.data.write().unwrap().fill(0);
        trace!(addr, "cache alloc");
        PageHandle { addr, frame }
    }

    fn get(&self, addr: u64, _blocking: bool, _ty: PageType) -> PageHandle {
        self.gets.fetch_add(1, Ordering::Relaxed);
        let frame = self.frame(addr);
        frame.pins.fetch_add(1, Ordering::AcqRel);
        PageHandle { addr, frame }
    }

    fn claim(&self, handle: &PageHandle) -> bool {
        let ok = handle
            .frame
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !ok {
            self.claim_failures.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    fn lock(&self, handle: &PageHandle) {
        assert!(
            handle.frame.claimed.load(Ordering::Acquire),
            "lock without a claim"
        );
        handle.frame.locked.store(true, Ordering::Release);
    }

    fn unlock(&self, handle: &PageHandle) {
        let was = handle.frame.locked.swap(false, Ordering::AcqRel);
        assert!(was, "unlock without the lock");
    }

    fn unclaim(&self, handle: &PageHandle) {
        let was = handle.frame.claimed.swap(false, Ordering::AcqRel);
        assert!(was, "unclaim without a claim");
    }

    fn unget(&self, handle: PageHandle) {
        let prev = handle.frame.pins.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "unget without a pin");
    }

    fn mark_dirty(&self, handle: &PageHandle) {
        assert!(
            handle.frame.locked.load(Ordering::Acquire),
            "mark_dirty without the lock"
        );
        handle.frame.dirty.store(true, Ordering::Release);
    }

    fn dealloc(&self, base_addr: u64, _ty: PageType) -> bool {
        debug_assert_eq!(base_addr % self.cfg.extent_size, 0, "unaligned extent base");
        self.deallocs.fetch_add(1, Ordering::Relaxed);
        if self.allocator.dec_refcount(base_addr) > 0 {
            return false;
        }
        let mut frames = self.frames.lock().unwrap();
        let mut addr = base_addr;
        while addr < base_addr + self.cfg.extent_size {
            if let Some(frame) = frames.remove(&addr) {
                assert_eq!(
                    frame.pins.load(Ordering::Acquire),
                    0,
                    "deallocating a pinned page"
                );
            }
            addr += self.cfg.page_size;
        }
        trace!(base_addr, "extent refcount reached zero, frames dropped");
        true
    }

    fn extent_sync(&self, base_addr: u64, pages_outstanding: &mut u64) {
        let frames = self.frames.lock().unwrap();
        let mut addr = base_addr;
        while addr < base_addr + self.cfg.extent_size {
            if let Some(frame) = frames.get(&addr) {
                // write-back is instantaneous in memory; the page still
                // counts as issued
                if frame.dirty.swap(false, Ordering::AcqRel) {
                    *pages_outstanding += 1;
                }
            }
            addr += self.cfg.page_size;
        }
    }

    fn prefetch(&self, base_addr: u64, _ty: PageType) {
        self.prefetched_extents.fetch_add(1, Ordering::Relaxed);
        let mut addr = base_addr;
        while addr < base_addr + self.cfg.extent_size {
            self.frame(addr);
            addr += self.cfg.page_size;
        }
    }

    fn allocator(&self) -> Arc<dyn ExtentAllocator> {
        self.allocator.clone()
    }
}

/// Cache counters
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub gets: u64,
    pub allocs: u64,
    pub claim_failures: u64,
    pub deallocs: u64,
    pub prefetched_extents: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> MemCache {
        MemCache::new(CacheConfig {
            page_size: 4096,
            extent_size: 16384,
            max_extents: 64,
        })
        .unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(CacheConfig::default().validate().is_ok());
        let bad = CacheConfig {
            page_size: 4096,
            extent_size: 6000,
            max_extents: 64,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_alloc_is_exclusively_owned() {
        let cc = cache();
        let base = cc.allocator.alloc_extent().unwrap();
        let page = cc.alloc(base, PageType::Misc);
        // a freshly allocated page can be written immediately
        page.update(|buf| buf[0] = 7);
        cc.mark_dirty(&page);
        cc.unlock(&page);
        cc.unclaim(&page);
        cc.unget(page);

        let page = cc.get(base, true, PageType::Misc);
        assert_eq!(page.read(|buf| buf[0]), 7);
        cc.unget(page);
    }

    #[test]
    fn test_claim_contention() {
        let cc = cache();
        let base = cc.allocator.alloc_extent().unwrap();
        let a = cc.get(base, true, PageType::Misc);
        let b = cc.get(base, true, PageType::Misc);

        assert!(cc.claim(&a));
        // the second claim fails instead of blocking
        assert!(!cc.claim(&b));
        assert_eq!(cc.stats().claim_failures, 1);

        cc.unclaim(&a);
        assert!(cc.claim(&b));
        cc.unclaim(&b);
        cc.unget(a);
        cc.unget(b);
    }

    #[test]
    fn test_dealloc_follows_refcount() {
        let cc = cache();
        let base = cc.allocator.alloc_extent().unwrap();
        cc.allocator.inc_refcount(base);

        assert!(!cc.dealloc(base, PageType::Misc));
        assert!(cc.dealloc(base, PageType::Misc));
        assert_eq!(cc.allocator.get_refcount(base), 0);
    }

    #[test]
    fn test_dealloc_drops_frames() {
        let cc = cache();
        let base = cc.allocator.alloc_extent().unwrap();
        let page = cc.alloc(base, PageType::Misc);
        page.update(|buf| buf[0] = 9);
        cc.mark_dirty(&page);
        cc.unlock(&page);
        cc.unclaim(&page);
        cc.unget(page);

        assert!(cc.dealloc(base, PageType::Misc));

        // re-reading the freed page sees zeroed bytes again
        let page = cc.get(base, true, PageType::Misc);
        assert_eq!(page.read(|buf| buf[0]), 0);
        cc.unget(page);
    }

    #[test]
    fn test_extent_sync_counts_dirty_pages() {
        let cc = cache();
        let base = cc.allocator.alloc_extent().unwrap();
        for i in 0..2 {
            let page = cc.alloc(base + i * 4096, PageType::Misc);
            page.update(|buf| buf[0] = 1);
            cc.mark_dirty(&page);
            cc.unlock(&page);
            cc.unclaim(&page);
            cc.unget(page);
        }

        let mut outstanding = 0;
        cc.extent_sync(base, &mut outstanding);
        assert_eq!(outstanding, 2);

        // a second sync has nothing left to queue
        cc.extent_sync(base, &mut outstanding);
        assert_eq!(outstanding, 2);
    }

    #[test]
    fn test_prefetch_materializes_frames() {
        let cc = cache();
        let base = cc.allocator.alloc_extent().unwrap();
        cc.prefetch(base, PageType::Misc);
        assert_eq!(cc.frames.lock().unwrap().len(), 4);
        assert_eq!(cc.stats().prefetched_extents, 1);
    }

    #[test]
    #[should_panic(expected = "page update without the lock")]
    fn test_update_requires_lock() {
        let cc = cache();
        let base = cc.allocator.alloc_extent().unwrap();
        let page = cc.get(base, true, PageType::Misc);
        page.update(|buf| buf[0] = 1);
    }
}
