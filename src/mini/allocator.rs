//! Per-page allocation out of reserved extents
//!
//! A `MiniAllocator` owns one allocation stream. Each of its batches
//! advances an independent page cursor through whole extents reserved
//! from the extent allocator, and every refill appends an entry to the
//! stream's metadata chain recording which extent was taken and for
//! which key range. One extent is always held in reserve per batch so a
//! refill never has to wait on the extent allocator while it holds a
//! metadata page lock.

use super::meta::{self, MetaHdr, MAX_INLINE_KEY_SIZE};
use crate::cache::guard::backoff;
use crate::cache::{PageCache, PageType, PageWriteGuard};
use crate::data::DataConfig;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Most independent allocation cursors one mini allocator can carry
pub const MINI_MAX_BATCHES: usize = 8;

/// Sentinel installed in a batch cursor while one caller holds it.
/// Distinguishable from any page address, which is always a nonzero
/// multiple of the page size.
const MINI_WAIT: u64 = 1;

struct Batch {
    /// Next page to hand out; `MINI_WAIT` while a caller owns the
    /// cursor; an extent-aligned value means the next alloc refills
    next_addr: AtomicU64,
    /// Extent held in reserve for the next refill
    next_extent: AtomicU64,
    /// Page and byte offset of this batch's most recent entry, where
    /// the end-key backfill lands
    last_meta_addr: AtomicU64,
    last_meta_pos: AtomicU32,
}

/// Fine-grained allocator for one stream of pages
pub struct MiniAllocator {
    cache: Arc<dyn PageCache>,
    data_cfg: Arc<dyn DataConfig>,
    page_type: PageType,
    meta_head: u64,
    /// Tail of the metadata chain; shared by every batch and only
    /// rewritten under the tail page's lock
    meta_tail: AtomicU64,
    batches: Vec<Batch>,
}

impl MiniAllocator {
    /// Create (`meta_tail == 0`) or load a mini allocator whose
    /// metadata chain starts at `meta_head`.
    ///
    /// On return one fresh extent is held in reserve per batch, and the
    /// tail page is ready for `alloc` to extend. `reserved_extent(0)`
    /// read right after construction is the address the first
    /// allocation of batch 0 will hand out; callers typically record it
    /// as the root of the structure they are building.
    pub fn new(
        cache: Arc<dyn PageCache>,
        data_cfg: Arc<dyn DataConfig>,
        meta_head: u64,
        meta_tail: u64,
        num_batches: usize,
        page_type: PageType,
    ) -> Self {
        assert!(
            (1..=MINI_MAX_BATCHES).contains(&num_batches),
            "num_batches out of range"
        );

        let allocator = cache.allocator();
        let tail_guard = if meta_tail == 0 {
            // new stream: the head page is created here
            let guard = PageWriteGuard::adopt(cache.as_ref(), cache.alloc(meta_head, page_type));
            guard.update(|page| MetaHdr::empty().write(page));
            guard
        } else {
            // existing stream: take the tail so the reserves are in
            // place before any concurrent alloc extends the chain
            let guard = PageWriteGuard::acquire(cache.as_ref(), meta_tail, page_type);
            guard.mark_dirty();
            guard
        };

        let batches: Vec<Batch> = (0..num_batches)
            .map(|_| Batch {
                next_addr: AtomicU64::new(0),
                next_extent: AtomicU64::new(
                    allocator
                        .alloc_extent()
                        .expect("extent allocator exhausted during init"),
                ),
                last_meta_addr: AtomicU64::new(0),
                last_meta_pos: AtomicU32::new(0),
            })
            .collect();

        let tail = if meta_tail == 0 { meta_head } else { meta_tail };
        drop(tail_guard);

        debug!(meta_head, meta_tail = tail, num_batches, "mini allocator ready");
        Self {
            cache,
            data_cfg,
            page_type,
            meta_head,
            meta_tail: AtomicU64::new(tail),
            batches,
        }
    }

    pub fn meta_head(&self) -> u64 {
        self.meta_head
    }

    pub fn meta_tail(&self) -> u64 {
        self.meta_tail.load(Ordering::Acquire)
    }

    pub fn num_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    pub fn data_config(&self) -> &Arc<dyn DataConfig> {
        &self.data_cfg
    }

    /// Extent currently held in reserve for `batch`
    pub fn reserved_extent(&self, batch: usize) -> u64 {
        self.batches[batch].next_extent.load(Ordering::Acquire)
    }

    /// Log the stream's metadata chain through the data config's key
    /// formatter
    pub fn dump(&self) {
        super::range::dump(self.cache.as_ref(), self.data_cfg.as_ref(), self.meta_head);
    }

    /// Hand out the next free page of `batch` and advance its cursor.
    ///
    /// `key` is the lower bound of what the caller will write into the
    /// page; it becomes the start key of a new metadata entry when this
    /// call refills from a fresh extent, and `None` skips key
    /// bookkeeping for the entry. When `next_extent_out` is given it
    /// receives the extent now held in reserve, which callers use to
    /// start prefetching ahead of the cursor.
    pub fn alloc(
        &self,
        batch: usize,
        key: Option<&[u8]>,
        next_extent_out: Option<&mut u64>,
    ) -> u64 {
        assert!(batch < self.batches.len(), "batch index out of range");
        if let Some(k) = key {
            assert!(
                k.len() <= MAX_INLINE_KEY_SIZE,
                "key longer than the inline maximum"
            );
        }

        let page_size = self.cache.page_size();
        let extent_size = self.cache.extent_size();
        let state = &self.batches[batch];

        // take the batch cursor by swapping in the wait sentinel
        let mut wait = 1;
        let mut next_addr = state.next_addr.load(Ordering::Acquire);
        while next_addr == MINI_WAIT
            || state
                .next_addr
                .compare_exchange(next_addr, MINI_WAIT, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            backoff(&mut wait);
            next_addr = state.next_addr.load(Ordering::Acquire);
        }

        if next_addr % extent_size != 0 {
            // the current extent still has room
            if let Some(out) = next_extent_out {
                *out = state.next_extent.load(Ordering::Acquire);
            }
            state.next_addr.store(next_addr + page_size, Ordering::Release);
            return next_addr;
        }

        // refill: consume the reserve and replenish it before the
        // cursor is released, so every observer finds a reserve in place
        let page = state.next_extent.load(Ordering::Acquire);
        let new_reserve = self
            .cache
            .allocator()
            .alloc_extent()
            .expect("extent allocator exhausted");
        state.next_extent.store(new_reserve, Ordering::Release);
        if let Some(out) = next_extent_out {
            *out = new_reserve;
        }
        // the cursor is released before any page lock is taken
        state.next_addr.store(page + page_size, Ordering::Release);
        trace!(batch, page, new_reserve, "refilled batch from reserve");

        self.append_entry(batch, page, key);
        page
    }

    /// Take the metadata tail with the standard claim idiom. The tail
    /// can move while we wait, so re-check it after every pin.
    fn lock_meta_tail(&self) -> PageWriteGuard<'_> {
        let mut wait = 1;
        loop {
            let tail = self.meta_tail.load(Ordering::Acquire);
            let handle = self.cache.get(tail, true, self.page_type);
            if tail == self.meta_tail.load(Ordering::Acquire) && self.cache.claim(&handle) {
                self.cache.lock(&handle);
                return PageWriteGuard::adopt(self.cache.as_ref(), handle);
            }
            self.cache.unget(handle);
            backoff(&mut wait);
        }
    }

    /// Record a consumed extent on the metadata chain and close the
    /// batch's previous entry with this allocation's key
    fn append_entry(&self, batch: usize, extent_addr: u64, key: Option<&[u8]>) {
        let page_size = self.cache.page_size() as usize;
        let extent_size = self.cache.extent_size();
        let key_len = key.map_or(0, <[u8]>::len);
        let state = &self.batches[batch];

        let mut tail = self.lock_meta_tail();
        let mut hdr = tail.read(MetaHdr::read);

        if hdr.pos as usize + meta::entry_size(key_len) > page_size {
            // the tail is full: link a fresh page and switch to it
            let mut new_meta_tail = self.meta_tail.load(Ordering::Acquire) + page_size as u64;
            if new_meta_tail % extent_size == 0 {
                // crossed out of the current metadata extent
                new_meta_tail = self
                    .cache
                    .allocator()
                    .alloc_extent()
                    .expect("extent allocator exhausted");
            }
            hdr.next_meta_addr = new_meta_tail;
            tail.update(|page| hdr.write(page));

            let new_tail = PageWriteGuard::adopt(
                self.cache.as_ref(),
                self.cache.alloc(new_meta_tail, self.page_type),
            );
            self.meta_tail.store(new_meta_tail, Ordering::Release);
            drop(tail);
            tail = new_tail;
            hdr = MetaHdr::empty();
            tail.update(|page| hdr.write(page));
            debug!(new_meta_tail, "linked new metadata tail page");
        }
        assert!(hdr.pos as usize + meta::entry_size(key_len) <= page_size);

        let entry_pos = hdr.pos as usize;
        let meta_addr = tail.addr();
        tail.update(|page| {
            meta::write_entry(page, entry_pos, extent_addr, key, self.data_cfg.as_ref())
        });

        if let Some(k) = key {
            // the previous entry of this batch ends where this one
            // begins
            let last_addr = state.last_meta_addr.load(Ordering::Acquire);
            if last_addr != 0 {
                let last_pos = state.last_meta_pos.load(Ordering::Acquire) as usize;
                if last_addr == meta_addr {
                    tail.update(|page| {
                        meta::set_end_key(page, last_pos, k, self.data_cfg.as_ref())
                    });
                } else {
                    // tail first, then the prior page; the fixed order
                    // keeps two-page holds deadlock free
                    let prior =
                        PageWriteGuard::acquire(self.cache.as_ref(), last_addr, self.page_type);
                    prior.update(|page| {
                        meta::set_end_key(page, last_pos, k, self.data_cfg.as_ref())
                    });
                }
            }
            state.last_meta_pos.store(entry_pos as u32, Ordering::Release);
            state.last_meta_addr.store(meta_addr, Ordering::Release);
        }

        hdr.pos = (entry_pos + meta::entry_size(key_len)) as u32;
        hdr.num_entries += 1;
        tail.update(|page| hdr.write(page));
        trace!(batch, extent_addr, meta_addr, entry_pos, "appended metadata entry");
    }

    /// Close the stream: deallocate every batch's untouched reserve and
    /// backfill the last entry of each batch with `key` as its upper
    /// bound. The extents the stream consumed stay live; handing those
    /// back is [`release_range`](super::range::release_range).
    pub fn release(self, key: Option<&[u8]>) {
        if let Some(k) = key {
            assert!(
                k.len() <= MAX_INLINE_KEY_SIZE,
                "key longer than the inline maximum"
            );
        }

        for state in &self.batches {
            let reserve = state.next_extent.load(Ordering::Acquire);
            self.cache.dealloc(reserve, self.page_type);

            // a stream torn down without a final bound leaves its last
            // entry's end key empty
            let last_addr = state.last_meta_addr.load(Ordering::Acquire);
            if let Some(k) = key {
                if last_addr != 0 {
                    let last_pos = state.last_meta_pos.load(Ordering::Acquire) as usize;
                    let prior =
                        PageWriteGuard::acquire(self.cache.as_ref(), last_addr, self.page_type);
                    prior.update(|page| {
                        meta::set_end_key(page, last_pos, k, self.data_cfg.as_ref())
                    });
                }
            }
        }
        debug!(meta_head = self.meta_head, "released mini allocator");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, MemCache};
    use crate::data::LexicalKeyConfig;
    use crate::extent::ExtentAllocator;

    const PAGE: u64 = 4096;
    const EXTENT: u64 = 16384;

    fn cache() -> Arc<MemCache> {
        Arc::new(
            MemCache::new(CacheConfig {
                page_size: PAGE,
                extent_size: EXTENT,
                max_extents: 256,
            })
            .unwrap(),
        )
    }

    fn mini(cache: &Arc<MemCache>, num_batches: usize) -> (MiniAllocator, u64) {
        let meta_head = cache.allocator().alloc_extent().unwrap();
        let mini = MiniAllocator::new(
            cache.clone(),
            Arc::new(LexicalKeyConfig),
            meta_head,
            0,
            num_batches,
            PageType::Branch,
        );
        (mini, meta_head)
    }

    #[test]
    fn test_init_reserves_one_extent_per_batch() {
        let cc = cache();
        let (mini, _) = mini(&cc, 3);
        let reserves: Vec<u64> = (0..3).map(|b| mini.reserved_extent(b)).collect();
        for (i, r) in reserves.iter().enumerate() {
            assert_eq!(r % EXTENT, 0);
            assert_eq!(cc.extent_allocator().get_refcount(*r), 1);
            for other in &reserves[..i] {
                assert_ne!(r, other);
            }
        }
    }

    #[test]
    fn test_first_alloc_consumes_the_init_reserve() {
        let cc = cache();
        let (mini, _) = mini(&cc, 1);
        let root = mini.reserved_extent(0);
        assert_eq!(mini.alloc(0, Some(b"a"), None), root);
        // a fresh reserve replaced the consumed one
        assert_ne!(mini.reserved_extent(0), root);
    }

    #[test]
    fn test_fast_path_advances_by_one_page() {
        let cc = cache();
        let (mini, _) = mini(&cc, 1);
        let first = mini.alloc(0, Some(b"a"), None);
        assert_eq!(mini.alloc(0, Some(b"a"), None), first + PAGE);
        assert_eq!(mini.alloc(0, Some(b"a"), None), first + 2 * PAGE);
    }

    #[test]
    fn test_fast_path_reports_the_reserve() {
        let cc = cache();
        let (mini, _) = mini(&cc, 1);
        mini.alloc(0, Some(b"a"), None);
        let mut reported = 0;
        mini.alloc(0, Some(b"a"), Some(&mut reported));
        assert_eq!(reported, mini.reserved_extent(0));
    }

    #[test]
    fn test_batches_do_not_share_extents() {
        let cc = cache();
        let (mini, _) = mini(&cc, 2);
        let a = mini.alloc(0, Some(b"a"), None);
        let b = mini.alloc(1, Some(b"a"), None);
        assert_ne!(a / EXTENT, b / EXTENT);
    }

    #[test]
    fn test_release_frees_the_reserves() {
        let cc = cache();
        let (mini, _) = mini(&cc, 2);
        mini.alloc(0, Some(b"a"), None);
        let reserves = [mini.reserved_extent(0), mini.reserved_extent(1)];
        mini.release(Some(b"z"));
        for r in reserves {
            assert_eq!(cc.extent_allocator().get_refcount(r), 0);
        }
    }

    #[test]
    fn test_load_continues_the_chain() {
        let cc = cache();
        let (first, meta_head) = mini(&cc, 1);
        first.alloc(0, Some(b"a"), None);
        let tail = first.meta_tail();
        first.release(Some(b"b"));

        let loaded = MiniAllocator::new(
            cc.clone(),
            Arc::new(LexicalKeyConfig),
            meta_head,
            tail,
            1,
            PageType::Branch,
        );
        loaded.alloc(0, Some(b"c"), None);

        // both entries landed on the same chain page
        let page = cc.get(meta_head, true, PageType::Misc);
        let entries = page.read(|p| meta::entries(p));
        cc.unget(page);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1.start_key, b"a");
        assert_eq!(entries[1].1.start_key, b"c");
    }

    #[test]
    #[should_panic(expected = "batch index out of range")]
    fn test_alloc_rejects_bad_batch() {
        let cc = cache();
        let (mini, _) = mini(&cc, 1);
        mini.alloc(1, None, None);
    }

    #[test]
    #[should_panic(expected = "num_batches out of range")]
    fn test_init_rejects_too_many_batches() {
        let cc = cache();
        let meta_head = cc.allocator().alloc_extent().unwrap();
        MiniAllocator::new(
            cc,
            Arc::new(LexicalKeyConfig),
            meta_head,
            0,
            MINI_MAX_BATCHES + 1,
            PageType::Branch,
        );
    }
}
