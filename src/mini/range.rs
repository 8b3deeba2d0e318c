//! Metadata chain traversal and the range operations built on it
//!
//! Everything that reads or releases a stream in bulk goes through
//! [`for_each`]: it walks the chain under claim+lock, picks the entries
//! whose stored key range intersects the query, applies one action per
//! extent, and notices when the walk released the last live entry so
//! the chain's own extents can be handed back too. The public range
//! operations are thin specializations that choose the action and
//! interpret the result.

use super::meta::{self, MetaEntry, MetaHdr};
use crate::cache::{PageCache, PageHandle, PageType, PageWriteGuard};
use crate::data::DataConfig;
use std::cmp::Ordering;
use tracing::{debug, error, info, trace};

fn addrs_share_extent(extent_size: u64, left: u64, right: u64) -> bool {
    left / extent_size == right / extent_size
}

/// Does the entry's stored `[start_key, end_key]` intersect the query
/// range? Empty stored keys are unbounded on their side, `None` query
/// bounds likewise, and a missing end bound makes the query a point
/// query on its start key.
fn entry_in_range(
    data_cfg: Option<&dyn DataConfig>,
    entry: &MetaEntry,
    start_key: Option<&[u8]>,
    end_key: Option<&[u8]>,
) -> bool {
    let cfg = match data_cfg {
        Some(cfg) => cfg,
        None => return true,
    };
    let entry_start = (!entry.start_key.is_empty()).then_some(entry.start_key.as_slice());
    let entry_end = (!entry.end_key.is_empty()).then_some(entry.end_key.as_slice());

    let starts_before_entry_end = match (start_key, entry_end) {
        (Some(s), Some(e)) => cfg.key_compare(s, e) != Ordering::Greater,
        _ => true,
    };
    // with no end bound the query collapses to a point on start_key
    let upper = end_key.or(start_key);
    let entry_starts_before_upper = match (entry_start, upper) {
        (Some(s), Some(u)) => cfg.key_compare(s, u) != Ordering::Greater,
        _ => true,
    };
    starts_before_entry_end && entry_starts_before_upper
}

/// Walk the chain and apply `action` to every in-range entry's extent,
/// recording each verdict in the entry's released flag.
///
/// Returns whether every entry across the chain is now released. When
/// that holds, the chain's own extents are passed to `action` as well:
/// they are not represented as entries and would otherwise leak, and
/// consecutive pages sharing an extent yield one call for it.
///
/// Actions that only read (sync, prefetch, count, refcount increment)
/// return `false`, which keeps `fully_released` false on any chain with
/// entries and so suppresses the metadata teardown.
pub fn for_each<F>(
    cache: &dyn PageCache,
    data_cfg: Option<&dyn DataConfig>,
    meta_head: u64,
    start_key: Option<&[u8]>,
    end_key: Option<&[u8]>,
    mut action: F,
) -> bool
where
    F: FnMut(u64) -> bool,
{
    assert!(
        data_cfg.is_some() || (start_key.is_none() && end_key.is_none()),
        "keyed query without a data config"
    );

    let mut fully_released = true;
    let mut saw_entries = false;
    let mut next_meta_addr = meta_head;
    while next_meta_addr != 0 {
        // the walk flips released flags, so every page goes through the
        // full claim+lock even for read-style actions
        let page = PageWriteGuard::acquire(cache, next_meta_addr, PageType::Misc);
        for (pos, entry) in page.read(|p| meta::entries(p)) {
            saw_entries = true;
            let released = if entry_in_range(data_cfg, &entry, start_key, end_key) {
                if entry.released {
                    error!(extent_addr = entry.extent_addr, "entry released twice");
                }
                assert!(!entry.released, "entry released twice");
                let released = action(entry.extent_addr);
                page.update(|p| meta::set_released(p, pos, released));
                released
            } else {
                entry.released
            };
            fully_released = fully_released && released;
        }
        page.mark_dirty();
        next_meta_addr = page.read(MetaHdr::read).next_meta_addr;
    }

    if fully_released && saw_entries {
        // the stream is dead; free the chain's own extents
        let extent_size = cache.extent_size();
        let mut next_meta_addr = meta_head;
        while next_meta_addr != 0 {
            let page = cache.get(next_meta_addr, true, PageType::Misc);
            let last_meta_addr = next_meta_addr;
            next_meta_addr = page.read(MetaHdr::read).next_meta_addr;
            cache.unget(page);
            if !addrs_share_extent(extent_size, last_meta_addr, next_meta_addr) {
                let base = last_meta_addr / extent_size * extent_size;
                action(base);
                trace!(base, "released metadata extent");
            }
        }
        debug!(meta_head, "metadata chain fully released");
    }

    fully_released
}

/// Hand back every extent in `[start_key, end_key]` through the cache.
///
/// Returns true iff the whole stream is now dead, in which case the
/// metadata chain's extents have been freed as well.
pub fn release_range(
    cache: &dyn PageCache,
    data_cfg: &dyn DataConfig,
    page_type: PageType,
    meta_head: u64,
    start_key: Option<&[u8]>,
    end_key: Option<&[u8]>,
) -> bool {
    for_each(cache, Some(data_cfg), meta_head, start_key, end_key, |base| {
        cache.dealloc(base, page_type)
    })
}

/// Take an extra reference on every extent in range; used when a
/// subrange of one stream is adopted by another
pub fn inc_range(
    cache: &dyn PageCache,
    data_cfg: &dyn DataConfig,
    meta_head: u64,
    start_key: Option<&[u8]>,
    end_key: Option<&[u8]>,
) {
    let allocator = cache.allocator();
    for_each(cache, Some(data_cfg), meta_head, start_key, end_key, |base| {
        allocator.inc_refcount(base);
        false
    });
}

/// Queue write-back for every extent of the stream, accumulating the
/// number of pages still in flight
pub fn sync(cache: &dyn PageCache, meta_head: u64, pages_outstanding: &mut u64) {
    for_each(cache, None, meta_head, None, None, |base| {
        cache.extent_sync(base, pages_outstanding);
        false
    });
}

/// Start reading the stream's extents in
pub fn prefetch(cache: &dyn PageCache, page_type: PageType, meta_head: u64) {
    for_each(cache, None, meta_head, None, None, |base| {
        cache.prefetch(base, page_type);
        false
    });
}

/// Number of extents whose key range intersects the query range
pub fn count_in_range(
    cache: &dyn PageCache,
    data_cfg: &dyn DataConfig,
    meta_head: u64,
    start_key: Option<&[u8]>,
    end_key: Option<&[u8]>,
) -> u64 {
    let mut count = 0;
    for_each(cache, Some(data_cfg), meta_head, start_key, end_key, |_| {
        count += 1;
        false
    });
    count
}

/// Total extents the stream still holds: one per metadata page plus one
/// per entry not yet released. A read-only walk; pages sharing a
/// metadata extent are counted individually.
pub fn extent_count(cache: &dyn PageCache, meta_head: u64) -> u64 {
    let mut count = 0;
    let mut next_meta_addr = meta_head;
    while next_meta_addr != 0 {
        let page = cache.get(next_meta_addr, true, PageType::Misc);
        count += 1;
        let (next, live) = page.read(|p| {
            let live = meta::entries(p)
                .iter()
                .filter(|(_, e)| !e.released)
                .count() as u64;
            (MetaHdr::read(p).next_meta_addr, live)
        });
        count += live;
        next_meta_addr = next;
        cache.unget(page);
    }
    count
}

/// Log the chain page by page: every entry with its key bounds rendered
/// through the data config and its live refcount
pub fn dump(cache: &dyn PageCache, data_cfg: &dyn DataConfig, meta_head: u64) {
    let allocator = cache.allocator();
    let mut next_meta_addr = meta_head;
    while next_meta_addr != 0 {
        let page = cache.get(next_meta_addr, true, PageType::Misc);
        info!(meta_addr = next_meta_addr, "metadata page");
        let (next, entries) = page.read(|p| (MetaHdr::read(p).next_meta_addr, meta::entries(p)));
        for (i, (_, entry)) in entries.iter().enumerate() {
            info!(
                index = i,
                extent_addr = entry.extent_addr,
                start_key = %data_cfg.key_to_string(&entry.start_key),
                end_key = %data_cfg.key_to_string(&entry.end_key),
                released = entry.released,
                refcount = allocator.get_refcount(entry.extent_addr),
                "entry"
            );
        }
        next_meta_addr = next;
        cache.unget(page);
    }
}

/// Pin the chain root, keeping the stream structurally alive without a
/// traversal. Pair with [`unhold`].
pub fn hold(cache: &dyn PageCache, meta_head: u64) -> PageHandle {
    cache.get(meta_head, true, PageType::Misc)
}

/// Drop a pin taken with [`hold`]
pub fn unhold(cache: &dyn PageCache, handle: PageHandle) {
    cache.unget(handle);
}
