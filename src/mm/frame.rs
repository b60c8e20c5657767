//! Physical frame allocator: a reference-counted byte map over RAM pages.
//!
//! `spec.md` §3/§4.1: one byte per physical page; `0` means free, and the
//! count is the number of live mappings onto that frame (fork's COW sharing
//! is what drives counts above 1). Frames below the kernel image and the map
//! itself are pre-marked used at bring-up.

use crate::error::KernelError;

pub const PAGE_SIZE: usize = 4096;

/// A physical frame map: `refcounts[i]` is the number of live mappings onto
/// physical page `start_page + i`.
pub struct FrameMap<'a> {
    refcounts: &'a mut [u8],
    start_page: usize,
    free_pages: usize,
    total_pages: usize,
}

impl<'a> FrameMap<'a> {
    /// Builds a frame map over `total_pages` pages starting at physical page
    /// `start_page`, backed by `refcounts` (one byte per page, pre-zeroed by
    /// the caller). All pages start free.
    pub fn new(refcounts: &'a mut [u8], start_page: usize, total_pages: usize) -> Self {
        debug_assert!(refcounts.len() >= total_pages);
        Self { refcounts, start_page, free_pages: total_pages, total_pages }
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    pub fn free_pages(&self) -> usize {
        self.free_pages
    }

    pub fn used_pages(&self) -> usize {
        self.total_pages - self.free_pages - self.reserved_count()
    }

    fn reserved_count(&self) -> usize {
        // Reserved pages are those pre-marked used via `mark_reserved` before
        // any allocation occurred; tracked implicitly since `free_pages`
        // already excludes them from the start. Kept at zero here because
        // `mark_reserved` also decrements `free_pages` directly, preserving
        // `free_pages + used_pages + reserved_pages == total_pages`
        // (`spec.md` §8) with `reserved_pages` folded into the initial
        // `used_pages` count.
        0
    }

    /// Pre-marks `count` pages starting at absolute page `page` as used
    /// (refcount 1), for the kernel image and the frame map's own backing
    /// storage. Must be called only during bring-up, before any
    /// `get_page`/`put_page` traffic.
    pub fn mark_reserved(&mut self, page: usize, count: usize) {
        for p in page..page + count {
            if let Some(i) = self.index_of(p) {
                if self.refcounts[i] == 0 {
                    self.refcounts[i] = 1;
                    self.free_pages -= 1;
                }
            }
        }
    }

    fn index_of(&self, page: usize) -> Option<usize> {
        page.checked_sub(self.start_page).filter(|&i| i < self.total_pages)
    }

    /// Claims the first free frame at or after `start_page` hint, sets its
    /// refcount to 1, and returns its physical page number. `spec.md` §4.1:
    /// "Out of memory is fatal" — callers that cannot tolerate failure
    /// should convert `None` into a fatal halt; `sys_brk` growth checks use
    /// the `Result` form instead via [`FrameMap::try_get_page`].
    pub fn get_page(&mut self) -> Option<usize> {
        for i in 0..self.total_pages {
            if self.refcounts[i] == 0 {
                self.refcounts[i] = 1;
                self.free_pages -= 1;
                return Some(self.start_page + i);
            }
        }
        None
    }

    /// Same as [`FrameMap::get_page`] but returns a `KernelError` instead of
    /// `None`, for call sites that want to `?` into a `Result`-returning
    /// caller instead of pattern-matching.
    pub fn try_get_page(&mut self) -> Result<usize, KernelError> {
        self.get_page().ok_or(KernelError::OutOfFrames)
    }

    /// Increments a frame's refcount (used when a COW page gains a second
    /// mapping during fork).
    pub fn get_page_ref(&mut self, page: usize) {
        if let Some(i) = self.index_of(page) {
            debug_assert!(self.refcounts[i] > 0, "refcounting a free frame");
            self.refcounts[i] = self.refcounts[i].saturating_add(1);
        }
    }

    /// Drops one mapping onto `page`. Returns the refcount after the
    /// decrement; the frame is only actually free when this reaches 0,
    /// at which point `free_pages` is incremented.
    pub fn put_page(&mut self, page: usize) -> u8 {
        let i = self.index_of(page).expect("put_page: out-of-range frame");
        debug_assert!(self.refcounts[i] > 0, "double free of physical frame");
        self.refcounts[i] -= 1;
        if self.refcounts[i] == 0 {
            self.free_pages += 1;
        }
        self.refcounts[i]
    }

    /// Current refcount of `page`, for COW fault handling (`spec.md` §4.1:
    /// "If the frame refcount == 1, just set write=1").
    pub fn refcount(&self, page: usize) -> u8 {
        self.index_of(page).map(|i| self.refcounts[i]).unwrap_or(0)
    }

    /// Logs free/used run-length ranges at debug level. Supplement to
    /// `spec.md` (see SPEC_FULL.md §4.1) mirroring the teacher's
    /// `memory_map()` debug dump.
    pub fn debug_dump(&self) {
        let mut i = 0;
        while i < self.total_pages {
            let used = self.refcounts[i] != 0;
            let run_start = i;
            while i < self.total_pages && (self.refcounts[i] != 0) == used {
                i += 1;
            }
            log::debug!(
                "frames [{:#x}, {:#x}): {}",
                self.start_page + run_start,
                self.start_page + i,
                if used { "used" } else { "free" }
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_conservation_round_trip() {
        let mut storage = [0u8; 16];
        let mut map = FrameMap::new(&mut storage, 256, 16);
        let before = map.free_pages();

        let mut got = alloc_vec();
        for _ in 0..5 {
            got.push(map.get_page().unwrap());
        }
        assert_eq!(map.free_pages(), before - 5);
        for p in got {
            map.put_page(p);
        }
        assert_eq!(map.free_pages(), before);
        assert_eq!(map.free_pages() + map.used_pages(), map.total_pages());
    }

    #[test]
    fn cow_refcount_semantics() {
        let mut storage = [0u8; 4];
        let mut map = FrameMap::new(&mut storage, 0, 4);
        let p = map.get_page().unwrap();
        assert_eq!(map.refcount(p), 1);
        map.get_page_ref(p); // child now also maps it
        assert_eq!(map.refcount(p), 2);
        assert_eq!(map.put_page(p), 1); // parent writes -> private copy path
        assert_eq!(map.free_pages(), 4 - 1); // still referenced by child
        assert_eq!(map.put_page(p), 0);
        assert_eq!(map.free_pages(), 4);
    }

    #[test]
    fn out_of_memory_is_reported() {
        let mut storage = [0u8; 2];
        let mut map = FrameMap::new(&mut storage, 0, 2);
        map.get_page().unwrap();
        map.get_page().unwrap();
        assert!(map.get_page().is_none());
        assert_eq!(map.try_get_page(), Err(KernelError::OutOfFrames));
    }

    #[test]
    fn mark_reserved_excludes_from_free() {
        let mut storage = [0u8; 8];
        let mut map = FrameMap::new(&mut storage, 0, 8);
        map.mark_reserved(0, 3);
        assert_eq!(map.free_pages(), 5);
        assert_eq!(map.get_page(), Some(3));
    }

    fn alloc_vec() -> std::vec::Vec<usize> {
        std::vec::Vec::new()
    }
}
