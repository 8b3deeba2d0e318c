//! Mini allocator
//!
//! Fine-grained per-page allocation on top of the coarse extent
//! allocator and the buffered page cache. One mini allocator manages
//! one allocation stream (a B-tree, a log) by carving single pages out
//! of whole extents, while a persistent chain of metadata pages records
//! which extents the stream owns and over what key ranges.
//!
//! # Architecture
//!
//! ```text
//! MiniAllocator (one per stream)
//!   ├─→ batch 0: next_addr cursor → page, page, ...   next_extent → reserve
//!   ├─→ batch 1: ...                    (batches allocate in parallel)
//!   │
//!   │ every refill appends one entry
//!   ▼
//! meta_head → [hdr | entry entry ...] → [hdr | entry ...] → 0
//!               entry: extent_addr, [start_key, end_key], released
//! ```
//!
//! Batches hand out strictly increasing page addresses and never block
//! each other; the only shared write point is the chain's tail page,
//! serialized by the cache's claim+lock. Bulk operations (release,
//! refcount adoption, sync, prefetch, counting) are range
//! specializations of the traversal engine in [`range`].

pub mod allocator;
pub mod meta;
pub mod range;

pub use allocator::{MiniAllocator, MINI_MAX_BATCHES};
pub use meta::{MetaEntry, MetaHdr, MAX_INLINE_KEY_SIZE};
pub use range::{
    count_in_range, dump, extent_count, for_each, hold, inc_range, prefetch, release_range, sync,
    unhold,
};
