//! Pin→claim→lock scope
//!
//! Every path that writes a page follows the same sequence, and every
//! exit from that path has to run the release steps in reverse order
//! exactly once. The guard makes that a drop impl instead of a
//! convention.

use super::{PageCache, PageHandle, PageType};
use std::thread;
use std::time::Duration;

/// Backoff cap for contended claims
pub(crate) const BACKOFF_CAP: u64 = 1024;

/// Sleep for `wait` units, then double it up to [`BACKOFF_CAP`]
pub(crate) fn backoff(wait: &mut u64) {
    thread::sleep(Duration::from_nanos(*wait));
    *wait = (*wait * 2).min(BACKOFF_CAP);
}

/// Write access to one page, released in reverse order on drop
pub struct PageWriteGuard<'a> {
    cache: &'a dyn PageCache,
    handle: Option<PageHandle>,
}

impl<'a> PageWriteGuard<'a> {
    /// Pin, claim, and lock the page at `addr`. A failed claim drops
    /// the pin before backing off, then the whole sequence retries.
    pub fn acquire(cache: &'a dyn PageCache, addr: u64, ty: PageType) -> Self {
        let mut wait = 1;
        loop {
            let handle = cache.get(addr, true, ty);
            if cache.claim(&handle) {
                cache.lock(&handle);
                return Self {
                    cache,
                    handle: Some(handle),
                };
            }
            cache.unget(handle);
            backoff(&mut wait);
        }
    }

    /// Wrap a handle that is already pinned, claimed, and locked;
    /// freshly allocated pages arrive in that state
    pub fn adopt(cache: &'a dyn PageCache, handle: PageHandle) -> Self {
        Self {
            cache,
            handle: Some(handle),
        }
    }

    pub fn addr(&self) -> u64 {
        self.handle.as_ref().unwrap().addr()
    }

    pub fn handle(&self) -> &PageHandle {
        self.handle.as_ref().unwrap()
    }

    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.handle().read(f)
    }

    /// Mutate the page and mark it dirty, so the dirty bit is always
    /// set before the unlock that drop performs
    pub fn update<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let r = self.handle().update(f);
        self.cache.mark_dirty(self.handle());
        r
    }

    pub fn mark_dirty(&self) {
        self.cache.mark_dirty(self.handle());
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cache.unlock(&handle);
            self.cache.unclaim(&handle);
            self.cache.unget(handle);
        }
    }
}
