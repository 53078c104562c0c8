//! The page allocator.
//!
//! The allocator owns the installed RAM and hands out page frames from the
//! part of it that is not reserved for the kernel's small-object allocator.
//! Returned frames are page-aligned and exclusively owned by the caller
//! until freed. There is no zeroing guarantee: a freshly allocated frame may
//! contain garbage from its previous use.
//!
//! Two interfaces are provided:
//! - raw `alloc_one`/`free_one` pairs, used by the frame cache, whose frames
//!   outlive any single call frame and move between cache lists;
//! - the RAII [`FrameTracker`], used for page-table structure pages, which
//!   frees its frame when dropped.

use alloc::sync::Arc;

use bitmap_allocator::{BitAlloc, BitAlloc64K};

use config::mm::PAGE_SIZE;
use mutex::SpinLock;
use systype::{SysError, SysResult};

use crate::{address::PhysPageNum, ram::Ram};

/// The page allocator. One instance per machine; shared via `Arc`.
pub struct FrameAllocator {
    ram: Ram,
    /// First page number that enters the pool; frames below it are the
    /// kernel reserve and are never handed out.
    offset: usize,
    usable: usize,
    inner: SpinLock<FrameAllocInner>,
}

struct FrameAllocInner {
    bits: BitAlloc64K,
    free: usize,
}

impl FrameAllocator {
    /// Builds an allocator over `installed` pages of fresh RAM, keeping the
    /// first `reserved` pages out of the pool.
    ///
    /// # Panics
    /// Panics if the reserve swallows all of RAM, or the pool exceeds what
    /// the bitmap can track.
    pub fn new(installed: usize, reserved: usize) -> Self {
        assert!(reserved < installed, "kernel reserve leaves no usable pages");
        let usable = installed - reserved;
        assert!(usable <= BitAlloc64K::CAP, "RAM too large for the frame bitmap");
        let mut bits = BitAlloc64K::DEFAULT;
        bits.insert(0..usable);
        log::debug!(
            "page allocator: {usable} usable frames at {:#x}, {reserved} reserved",
            reserved * PAGE_SIZE
        );
        Self {
            ram: Ram::new(installed),
            offset: reserved,
            usable,
            inner: SpinLock::new(FrameAllocInner { bits, free: usable }),
        }
    }

    /// Allocates one page frame, or `None` when the pool is exhausted.
    pub fn alloc_one(&self) -> Option<PhysPageNum> {
        let mut inner = self.inner.lock();
        let bit = inner.bits.alloc()?;
        inner.free -= 1;
        Some(PhysPageNum::new(self.offset + bit))
    }

    /// Allocates `count` physically contiguous frames, returning the first,
    /// or `None` when no contiguous run is free.
    pub fn alloc_contig(&self, count: usize) -> Option<PhysPageNum> {
        let mut inner = self.inner.lock();
        let base = inner.bits.alloc_contiguous(None, count, 0)?;
        inner.free -= count;
        Some(PhysPageNum::new(self.offset + base))
    }

    /// Returns one frame to the pool. `ppn` must have come from
    /// [`alloc_one`](Self::alloc_one) and not have been freed since.
    pub fn free_one(&self, ppn: PhysPageNum) {
        let bit = ppn.to_usize() - self.offset;
        let mut inner = self.inner.lock();
        inner.bits.dealloc(bit);
        inner.free += 1;
    }

    /// Returns `count` contiguous frames starting at `base` to the pool.
    pub fn free_contig(&self, base: PhysPageNum, count: usize) {
        let first = base.to_usize() - self.offset;
        let mut inner = self.inner.lock();
        for bit in first..first + count {
            inner.bits.dealloc(bit);
        }
        inner.free += count;
    }

    /// Number of free frames remaining in the pool.
    ///
    /// Note that `alloc_contig(n)` may fail even while `free_count() >= n`.
    pub fn free_count(&self) -> usize {
        self.inner.lock().free
    }

    /// Size of the pool: installed frames minus the kernel reserve.
    pub fn total_usable(&self) -> usize {
        self.usable
    }

    /// Returns the contents of an allocated frame.
    pub fn frame_slice(&self, ppn: PhysPageNum) -> &[u8; PAGE_SIZE] {
        self.ram.page_slice(ppn)
    }

    /// Returns the contents of an allocated frame, mutably. The caller must
    /// own the frame exclusively.
    #[allow(clippy::mut_from_ref)]
    pub fn frame_slice_mut(&self, ppn: PhysPageNum) -> &mut [u8; PAGE_SIZE] {
        self.ram.page_slice_mut(ppn)
    }
}

/// RAII guard for one allocated frame.
///
/// Constructing a `FrameTracker` allocates a frame; dropping it frees the
/// frame. Used for page-table structure pages, whose lifetime coincides with
/// their owner's.
pub struct FrameTracker {
    ppn: PhysPageNum,
    alloc: Arc<FrameAllocator>,
}

impl FrameTracker {
    /// Allocates a frame.
    ///
    /// # Errors
    /// Returns `ENOMEM` when the pool is exhausted.
    pub fn build(alloc: &Arc<FrameAllocator>) -> SysResult<Self> {
        let ppn = alloc.alloc_one().ok_or(SysError::ENOMEM)?;
        Ok(Self {
            ppn,
            alloc: Arc::clone(alloc),
        })
    }

    /// The physical page number of the frame.
    pub fn ppn(&self) -> PhysPageNum {
        self.ppn
    }

    /// The frame's contents.
    pub fn as_slice(&self) -> &[u8; PAGE_SIZE] {
        self.alloc.frame_slice(self.ppn)
    }

    /// The frame's contents, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8; PAGE_SIZE] {
        self.alloc.frame_slice_mut(self.ppn)
    }
}

impl Drop for FrameTracker {
    fn drop(&mut self) {
        self.alloc.free_one(self.ppn);
    }
}
