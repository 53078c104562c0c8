//! The page-table facade.
//!
//! One [`PageTable`] per address space. The translation structure is the
//! classic two-level tree of a 32-bit machine: a root directory frame whose
//! entries point to table frames, each holding 1024 32-bit entries. Both
//! levels are real page frames taken from the page allocator, so installing
//! a mapping can genuinely fail with `ENOMEM` when the pool is dry.
//!
//! The facade does not flush the TLB on its own; callers invalidate through
//! [`Tlb`] whenever they remove or demote an entry of the active address
//! space.

use alloc::{collections::BTreeMap, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;

use config::mm::{PAGE_SIZE, USER_MEM_HIGH, USER_MEM_LOW};
use mm::{
    address::{PhysAddr, PhysPageNum, VirtAddr, VirtPageNum, page_aligned},
    frame::{FrameAllocator, FrameTracker},
};
use systype::{SysError, SysResult};

use alloc::sync::Arc;

/// Entries per table frame.
const ENTRIES: usize = PAGE_SIZE / size_of::<u32>();

bitflags! {
    /// Bits of a page-table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        /// Abstract execute permission; the 32-bit original had no such bit,
        /// the facade models it so exec faults can be policed.
        const EXEC = 1 << 9;
    }
}

const FLAG_MASK: u32 = (PAGE_SIZE - 1) as u32;

/// The translation structure of one address space.
pub struct PageTable {
    frames: Arc<FrameAllocator>,
    root: FrameTracker,
    /// Second-level table frames, keyed by directory index. Dropping the
    /// table frees only this structure, never the frames leaf entries point
    /// to.
    tables: BTreeMap<usize, FrameTracker>,
}

impl PageTable {
    /// Creates an empty translation: the kernel template with no user
    /// mappings.
    ///
    /// # Errors
    /// Returns `ENOMEM` if the root frame cannot be allocated.
    pub fn build(frames: &Arc<FrameAllocator>) -> SysResult<Self> {
        let mut root = FrameTracker::build(frames)?;
        root.as_mut_slice().fill(0);
        Ok(Self {
            frames: Arc::clone(frames),
            root,
            tables: BTreeMap::new(),
        })
    }

    #[allow(clippy::mut_from_ref)]
    fn entries_of(&self, ppn: PhysPageNum) -> &mut [u32; ENTRIES] {
        let bytes = self.frames.frame_slice_mut(ppn);
        // SAFETY: a frame is page-aligned and exactly ENTRIES u32s large.
        unsafe { &mut *(bytes.as_mut_ptr() as *mut [u32; ENTRIES]) }
    }

    fn indices(vaddr: VirtAddr) -> (usize, usize) {
        let vpn = vaddr.page_number().to_usize();
        (vpn >> 10, vpn & (ENTRIES - 1))
    }

    /// Installs a mapping from `vaddr` to `paddr` with the given
    /// permissions, replacing any previous entry for `vaddr`. Both addresses
    /// must be page-aligned and `vaddr` must lie in the user range.
    ///
    /// # Errors
    /// Returns `ENOMEM` if an intermediate table frame cannot be allocated.
    pub fn map(&mut self, vaddr: VirtAddr, paddr: PhysAddr, flags: PteFlags) -> SysResult<()> {
        debug_assert!(page_aligned(vaddr.to_usize()) && page_aligned(paddr.to_usize()));
        debug_assert!(
            (USER_MEM_LOW..USER_MEM_HIGH).contains(&vaddr.to_usize()),
            "mapping outside the user range: {vaddr:?}"
        );
        let (dir, idx) = Self::indices(vaddr);
        if !self.tables.contains_key(&dir) {
            let mut table = FrameTracker::build(&self.frames)?;
            table.as_mut_slice().fill(0);
            self.entries_of(self.root.ppn())[dir] =
                ((table.ppn().to_usize() as u32) << 12) | PteFlags::PRESENT.bits();
            self.tables.insert(dir, table);
        }
        let table_ppn = self.tables[&dir].ppn();
        self.entries_of(table_ppn)[idx] =
            ((paddr.to_usize() as u32) & !FLAG_MASK) | (flags | PteFlags::PRESENT).bits();
        Ok(())
    }

    /// Removes the mapping for `vaddr`, if any.
    pub fn unmap(&mut self, vaddr: VirtAddr) {
        debug_assert!(page_aligned(vaddr.to_usize()));
        let (dir, idx) = Self::indices(vaddr);
        if let Some(table) = self.tables.get(&dir) {
            self.entries_of(table.ppn())[idx] = 0;
        }
    }

    /// Removes every mapping in `[lo, hi)`.
    pub fn unmap_range(&mut self, lo: VirtAddr, hi: VirtAddr) {
        debug_assert!(page_aligned(lo.to_usize()) && page_aligned(hi.to_usize()));
        if lo >= hi {
            return;
        }
        let lo_vpn = lo.page_number().to_usize();
        let hi_vpn = hi.page_number().to_usize();
        for (&dir, table) in self.tables.range(lo_vpn >> 10..=(hi_vpn - 1) >> 10) {
            let entries = self.entries_of(table.ppn());
            let first = lo_vpn.max(dir << 10) - (dir << 10);
            let last = hi_vpn.min((dir + 1) << 10) - (dir << 10);
            for entry in &mut entries[first..last] {
                *entry = 0;
            }
        }
    }

    /// Clears the write bit on every present entry in `[lo, hi)`, so the
    /// next write through those pages faults.
    pub fn demote_write(&mut self, lo: VirtAddr, hi: VirtAddr) {
        debug_assert!(page_aligned(lo.to_usize()) && page_aligned(hi.to_usize()));
        if lo >= hi {
            return;
        }
        let lo_vpn = lo.page_number().to_usize();
        let hi_vpn = hi.page_number().to_usize();
        for (&dir, table) in self.tables.range(lo_vpn >> 10..=(hi_vpn - 1) >> 10) {
            let entries = self.entries_of(table.ppn());
            let first = lo_vpn.max(dir << 10) - (dir << 10);
            let last = hi_vpn.min((dir + 1) << 10) - (dir << 10);
            for entry in &mut entries[first..last] {
                if *entry & PteFlags::PRESENT.bits() != 0 {
                    *entry &= !PteFlags::WRITE.bits();
                }
            }
        }
    }

    /// Looks up the entry for a virtual page.
    pub fn entry(&self, vpn: VirtPageNum) -> Option<(PhysPageNum, PteFlags)> {
        let (dir, idx) = Self::indices(vpn.address());
        let table = self.tables.get(&dir)?;
        let raw = self.entries_of(table.ppn())[idx];
        if raw & PteFlags::PRESENT.bits() == 0 {
            return None;
        }
        Some((
            PhysPageNum::new((raw >> 12) as usize),
            PteFlags::from_bits_truncate(raw),
        ))
    }

    /// Resolves a mapped virtual address to its physical address. Returns
    /// `None` if `vaddr` is unmapped.
    pub fn virt_to_phys(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        let (ppn, _) = self.entry(vaddr.page_number())?;
        Some(PhysAddr::new(ppn.address().to_usize() + vaddr.page_offset()))
    }

    /// Every present user mapping, for diagnostics and invariant checks.
    pub fn present_entries(&self) -> Vec<(VirtPageNum, PhysPageNum, PteFlags)> {
        let mut out = Vec::new();
        for (&dir, table) in &self.tables {
            let entries = self.entries_of(table.ppn());
            for (idx, &raw) in entries.iter().enumerate() {
                if raw & PteFlags::PRESENT.bits() != 0 {
                    out.push((
                        VirtPageNum::new((dir << 10) | idx),
                        PhysPageNum::new((raw >> 12) as usize),
                        PteFlags::from_bits_truncate(raw),
                    ));
                }
            }
        }
        out
    }
}

/// The (simulated) translation look-aside buffer.
///
/// Invalidations are counted rather than performed; a host build has no TLB,
/// but the counters let tests assert that the coherence protocol was
/// followed.
#[derive(Debug, Default)]
pub struct Tlb {
    one: AtomicUsize,
    all: AtomicUsize,
}

impl Tlb {
    pub const fn new() -> Self {
        Self {
            one: AtomicUsize::new(0),
            all: AtomicUsize::new(0),
        }
    }

    /// Invalidates any entry translating `vaddr`.
    pub fn flush_one(&self, vaddr: usize) {
        let _ = vaddr;
        self.one.fetch_add(1, Ordering::Relaxed);
    }

    /// Invalidates the entire TLB.
    pub fn flush_all(&self) {
        self.all.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of single-entry invalidations issued so far.
    pub fn one_count(&self) -> usize {
        self.one.load(Ordering::Relaxed)
    }

    /// Number of full invalidations issued so far.
    pub fn all_count(&self) -> usize {
        self.all.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Arc<FrameAllocator>, PageTable) {
        let frames = Arc::new(FrameAllocator::new(32, 0));
        let pt = PageTable::build(&frames).unwrap();
        (frames, pt)
    }

    #[test]
    fn map_and_translate() {
        let (_frames, mut pt) = fixture();
        let va = VirtAddr::new(0x40_0000);
        let pa = PhysAddr::new(0x5000);
        pt.map(va, pa, PteFlags::USER | PteFlags::WRITE).unwrap();
        assert_eq!(
            pt.virt_to_phys(VirtAddr::new(0x40_0123)),
            Some(PhysAddr::new(0x5123))
        );
        let (ppn, flags) = pt.entry(va.page_number()).unwrap();
        assert_eq!(ppn.to_usize(), 5);
        assert!(flags.contains(PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITE));
    }

    #[test]
    fn unmap_range_spans_tables() {
        let (_frames, mut pt) = fixture();
        // Two pages in different second-level tables.
        let a = VirtAddr::new(0x40_0000);
        let b = VirtAddr::new(0x80_0000);
        pt.map(a, PhysAddr::new(0x1000), PteFlags::USER).unwrap();
        pt.map(b, PhysAddr::new(0x2000), PteFlags::USER).unwrap();
        pt.unmap_range(VirtAddr::new(0x40_0000), VirtAddr::new(0xc0_0000));
        assert!(pt.virt_to_phys(a).is_none());
        assert!(pt.virt_to_phys(b).is_none());
    }

    #[test]
    fn demote_clears_write() {
        let (_frames, mut pt) = fixture();
        let va = VirtAddr::new(0x40_0000);
        pt.map(va, PhysAddr::new(0x3000), PteFlags::USER | PteFlags::WRITE)
            .unwrap();
        pt.demote_write(va, VirtAddr::new(0x40_1000));
        let (_, flags) = pt.entry(va.page_number()).unwrap();
        assert!(!flags.contains(PteFlags::WRITE));
    }

    #[test]
    fn map_fails_when_pool_exhausted() {
        let frames = Arc::new(FrameAllocator::new(4, 3));
        let mut pt = PageTable::build(&frames).unwrap();
        // The only frame went to the root; the intermediate table cannot be
        // allocated.
        assert_eq!(
            pt.map(
                VirtAddr::new(0x40_0000),
                PhysAddr::new(0x1000),
                PteFlags::USER
            ),
            Err(SysError::ENOMEM)
        );
    }

    #[test]
    fn destroy_frees_only_structure() {
        let frames = Arc::new(FrameAllocator::new(8, 0));
        let before = frames.free_count();
        {
            let mut pt = PageTable::build(&frames).unwrap();
            pt.map(
                VirtAddr::new(0x40_0000),
                PhysAddr::new(0x1000),
                PteFlags::USER,
            )
            .unwrap();
            assert_eq!(frames.free_count(), before - 2);
        }
        // Root and table frames returned; the leaf target was never owned by
        // the page table.
        assert_eq!(frames.free_count(), before);
    }
}
