//! The installed physical memory.
//!
//! Physical memory is one page-aligned arena allocated at boot. A physical
//! page number is an index into this arena; page frames have stable
//! kernel-visible addresses for their whole lifetime.
//!
//! The arena hands out raw page slices with interior mutability. It performs
//! no synchronization of its own: exclusive access to a frame's contents is
//! guaranteed by its owner (the page allocator until the frame is handed
//! out, then the frame cache's busy/pin discipline, or a page table that
//! holds the frame as table structure).

use alloc::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};

use config::mm::PAGE_SIZE;

use crate::address::PhysPageNum;

/// The physical memory arena.
#[derive(Debug)]
pub struct Ram {
    base: *mut u8,
    pages: usize,
}

// SAFETY: the arena is a plain byte region; access discipline is the
// owners' responsibility (see the module documentation).
unsafe impl Send for Ram {}
unsafe impl Sync for Ram {}

impl Ram {
    /// Allocates an arena of `pages` page frames.
    ///
    /// # Panics
    /// Panics if `pages` is zero or the host allocation fails.
    pub fn new(pages: usize) -> Self {
        assert!(pages > 0, "cannot install zero pages of RAM");
        let layout = Self::layout(pages);
        // SAFETY: `layout` has non-zero size.
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            handle_alloc_error(layout);
        }
        Self { base, pages }
    }

    fn layout(pages: usize) -> Layout {
        Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).expect("bad RAM layout")
    }

    /// Number of installed page frames.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Returns the contents of the frame `ppn`.
    pub fn page_slice(&self, ppn: PhysPageNum) -> &[u8; PAGE_SIZE] {
        assert!(ppn.to_usize() < self.pages, "frame {ppn:?} out of range");
        // SAFETY: in range, and the arena outlives the borrow.
        unsafe { &*(self.base.add(ppn.to_usize() * PAGE_SIZE) as *const [u8; PAGE_SIZE]) }
    }

    /// Returns the contents of the frame `ppn`, mutably.
    ///
    /// Callers must hold exclusive ownership of the frame (see the module
    /// documentation); the arena itself does not check.
    #[allow(clippy::mut_from_ref)]
    pub fn page_slice_mut(&self, ppn: PhysPageNum) -> &mut [u8; PAGE_SIZE] {
        assert!(ppn.to_usize() < self.pages, "frame {ppn:?} out of range");
        // SAFETY: in range, and the arena outlives the borrow.
        unsafe { &mut *(self.base.add(ppn.to_usize() * PAGE_SIZE) as *mut [u8; PAGE_SIZE]) }
    }
}

impl Drop for Ram {
    fn drop(&mut self) {
        // SAFETY: `base` was allocated with this exact layout.
        unsafe { dealloc(self.base, Self::layout(self.pages)) };
    }
}
