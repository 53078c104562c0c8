//! Per-process address-space maps.
//!
//! An address space is an ordered set of non-overlapping virtual areas plus
//! the page table translating them. Areas are values in a `BTreeMap` keyed
//! by starting page, which keeps them sorted for lookup, gap search and
//! splitting.
//!
//! Removing mappings only edits the area set; page-table and TLB cleanup
//! for the removed range is the caller's job, through the page-table
//! facade. (The exception is the targeted invalidation the frame cache
//! requests through [`AddrSpace::unmap_frame_of_area`] when it evicts or
//! cleans a frame.)

use alloc::{
    collections::BTreeMap,
    format,
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};

use config::mm::{PAGE_SIZE, USER_MEM_HIGH, USER_MEM_LOW};
use mm::address::{PhysAddr, PhysPageNum, VirtAddr, VirtPageNum};
use mutex::SpinLock;
use systype::{
    SysError, SysResult,
    memory_flags::{MemPerm, MmapFlags},
};

use crate::{
    fs::Vnode,
    runtime::MemSystem,
    vm::{
        memobj::{AreaBinding, MemObj},
        page_table::{PageTable, PteFlags},
        vm_area::{AreaId, AreaView, VmArea},
    },
};

/// First virtual page of the user range.
pub const USER_LOW_PN: usize = USER_MEM_LOW / PAGE_SIZE;
/// One past the last virtual page of the user range.
pub const USER_HIGH_PN: usize = USER_MEM_HIGH / PAGE_SIZE;

pub type SpaceId = u64;

/// Search direction for [`AddrSpace::find_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocDir {
    LowToHigh,
    /// Search downward from the top of user space; used to position the
    /// interpreter image and other mappings that should stay out of the
    /// program's way.
    HighToLow,
}

/// One process's map of virtual areas.
pub struct AddrSpace {
    id: SpaceId,
    areas: SpinLock<BTreeMap<VirtPageNum, VmArea>>,
    pt: SpinLock<PageTable>,
}

impl AddrSpace {
    /// Creates an empty address space with a fresh translation.
    ///
    /// # Errors
    /// Returns `ENOMEM` if the page-table root cannot be allocated.
    pub fn build(sys: &Arc<MemSystem>) -> SysResult<Arc<Self>> {
        Ok(Arc::new(Self {
            id: sys.alloc_space_id(),
            areas: SpinLock::new(BTreeMap::new()),
            pt: SpinLock::new(PageTable::build(&sys.frames)?),
        }))
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// Finds the unique area containing `vpn`, if any.
    pub fn lookup(&self, vpn: VirtPageNum) -> Option<AreaView> {
        let areas = self.areas.lock();
        areas
            .range(..=vpn)
            .next_back()
            .filter(|(_, area)| area.contains(vpn))
            .map(|(_, area)| AreaView::from(area))
    }

    /// Locates a gap of `npages` free virtual pages in the user range.
    pub fn find_range(&self, npages: usize, dir: AllocDir) -> Option<VirtPageNum> {
        if npages == 0 || npages > USER_HIGH_PN - USER_LOW_PN {
            return None;
        }
        let areas = self.areas.lock();
        match dir {
            AllocDir::LowToHigh => {
                let mut cursor = USER_LOW_PN;
                for area in areas.values() {
                    if area.start().to_usize() >= cursor + npages {
                        break;
                    }
                    cursor = cursor.max(area.end().to_usize());
                }
                (cursor + npages <= USER_HIGH_PN).then(|| VirtPageNum::new(cursor))
            }
            AllocDir::HighToLow => {
                let mut cursor = USER_HIGH_PN;
                for area in areas.values().rev() {
                    if area.end().to_usize() + npages <= cursor {
                        break;
                    }
                    cursor = cursor.min(area.start().to_usize());
                }
                (USER_LOW_PN + npages <= cursor).then(|| VirtPageNum::new(cursor - npages))
            }
        }
    }

    /// Returns whether no area intersects `[lopage, lopage + npages)`.
    pub fn is_range_empty(&self, lopage: VirtPageNum, npages: usize) -> bool {
        let hi = lopage + npages;
        let areas = self.areas.lock();
        if areas.range(lopage..hi).next().is_some() {
            return false;
        }
        match areas.range(..lopage).next_back() {
            Some((_, area)) => area.end() <= lopage,
            None => true,
        }
    }

    /// Creates a mapping.
    ///
    /// With `lopage` given, the mapping is placed exactly there, unmapping
    /// whatever it overlaps; otherwise a gap is found in direction `dir`.
    /// A vnode makes the mapping file-backed at page offset `off_pages`;
    /// private file mappings are backed by a fresh shadow over the file's
    /// object, so writes divert instead of reaching the file. Without a
    /// vnode the backing is anonymous-zero.
    ///
    /// Returns the first mapped page.
    ///
    /// # Errors
    /// `EINVAL` for a zero-length or out-of-range fixed placement;
    /// `ENOMEM` when no gap fits.
    #[allow(clippy::too_many_arguments)]
    pub fn map(
        self: &Arc<Self>,
        sys: &Arc<MemSystem>,
        vnode: Option<Arc<dyn Vnode>>,
        lopage: Option<VirtPageNum>,
        npages: usize,
        prot: MemPerm,
        flags: MmapFlags,
        off_pages: usize,
        dir: AllocDir,
    ) -> SysResult<VirtPageNum> {
        if npages == 0 {
            return Err(SysError::EINVAL);
        }
        debug_assert!(
            flags.contains(MmapFlags::MAP_SHARED) != flags.contains(MmapFlags::MAP_PRIVATE),
            "exactly one sharing type required"
        );
        let start = match lopage {
            Some(lo) => {
                if lo.to_usize() < USER_LOW_PN || lo.to_usize() + npages > USER_HIGH_PN {
                    return Err(SysError::EINVAL);
                }
                if !self.is_range_empty(lo, npages) {
                    self.remove(sys, lo, npages)?;
                }
                lo
            }
            None => self.find_range(npages, dir).ok_or(SysError::ENOMEM)?,
        };
        let obj = match vnode {
            Some(vnode) => {
                let file_obj = sys.file_object(&vnode);
                if flags.contains(MmapFlags::MAP_PRIVATE) {
                    MemObj::new_shadow(sys, file_obj)
                } else {
                    file_obj
                }
            }
            None => MemObj::new_anon(sys),
        };
        let area = VmArea::new(sys, start, start + npages, off_pages, prot, flags, obj);
        log::debug!("vmmap {}: map {area:?}", self.id);
        self.insert_area(area);
        Ok(start)
    }

    fn insert_area(self: &Arc<Self>, area: VmArea) {
        area.obj().bottom_object().register_area(AreaBinding {
            space: Arc::downgrade(self),
            area: area.id(),
        });
        let mut areas = self.areas.lock();
        debug_assert!(
            !areas
                .range(..area.end())
                .next_back()
                .is_some_and(|(_, prev)| prev.end() > area.start()),
            "inserting an overlapping area"
        );
        areas.insert(area.start(), area);
    }

    /// Removes every mapping in `[lopage, lopage + npages)`. Areas wholly
    /// inside the range are deleted, areas overlapping one end are
    /// truncated, and an area spanning the whole range is split in two.
    ///
    /// Page-table entries and TLB state for the range are the caller's to
    /// clean up.
    pub fn remove(
        self: &Arc<Self>,
        sys: &Arc<MemSystem>,
        lopage: VirtPageNum,
        npages: usize,
    ) -> SysResult<()> {
        let hi = lopage + npages;
        let mut dropped: Vec<VmArea> = Vec::new();
        {
            let mut areas = self.areas.lock();
            let mut keys: Vec<VirtPageNum> = areas.range(lopage..hi).map(|(&k, _)| k).collect();
            if let Some((&key, area)) = areas.range(..lopage).next_back() {
                if area.end() > lopage {
                    keys.push(key);
                }
            }
            for key in keys {
                let mut area = areas.remove(&key).expect("key vanished");
                if lopage <= area.start && area.end <= hi {
                    dropped.push(area);
                } else if area.start < lopage && hi < area.end {
                    // Interior overlap: keep both ends, drop the middle.
                    let tail = VmArea::new(
                        sys,
                        hi,
                        area.end,
                        area.off + (hi - area.start),
                        area.prot,
                        area.flags,
                        Arc::clone(&area.obj),
                    );
                    area.end = lopage;
                    areas.insert(area.start, area);
                    let tail_binding = AreaBinding {
                        space: Arc::downgrade(self),
                        area: tail.id(),
                    };
                    tail.obj().bottom_object().register_area(tail_binding);
                    areas.insert(tail.start, tail);
                } else if area.start < lopage {
                    area.end = lopage;
                    areas.insert(area.start, area);
                } else {
                    area.off += hi - area.start;
                    area.start = hi;
                    areas.insert(area.start, area);
                }
            }
        }
        for area in dropped {
            log::debug!("vmmap {}: unmap {area:?}", self.id);
            area.obj().bottom_object().deregister_area(area.id());
            // Dropping the area drops its reference to the backing object.
        }
        Ok(())
    }

    /// Reads `buf.len()` bytes of the map's contents starting at `vaddr`,
    /// faulting pages in as needed. May suspend.
    ///
    /// # Errors
    /// `EFAULT` if any byte of the range is unmapped.
    pub async fn read(
        self: &Arc<Self>,
        sys: &Arc<MemSystem>,
        vaddr: usize,
        buf: &mut [u8],
    ) -> SysResult<()> {
        let mut addr = vaddr;
        let mut done = 0;
        while done < buf.len() {
            let va = VirtAddr::new(addr);
            let vpn = va.page_number();
            let view = self.lookup(vpn).ok_or(SysError::EFAULT)?;
            let pagenum = view.page_index(vpn);
            let frame = view.obj.lookup_page(sys, pagenum, false).await?;
            let take = (PAGE_SIZE - va.page_offset()).min(buf.len() - done);
            let ppn = sys.cache.frame_ppn(frame);
            let page = sys.frames.frame_slice(ppn);
            buf[done..done + take]
                .copy_from_slice(&page[va.page_offset()..va.page_offset() + take]);
            done += take;
            addr += take;
        }
        Ok(())
    }

    /// Writes `buf` into the map starting at `vaddr`, driving any needed
    /// fills and copy-on-write diversions, and dirtying each touched frame
    /// before modifying it. May suspend.
    ///
    /// # Errors
    /// `EFAULT` if any byte of the range is unmapped; whatever the backing
    /// objects report (`ENOSPC`, I/O errors).
    pub async fn write(
        self: &Arc<Self>,
        sys: &Arc<MemSystem>,
        vaddr: usize,
        buf: &[u8],
    ) -> SysResult<()> {
        let mut addr = vaddr;
        let mut done = 0;
        while done < buf.len() {
            let va = VirtAddr::new(addr);
            let vpn = va.page_number();
            let view = self.lookup(vpn).ok_or(SysError::EFAULT)?;
            let pagenum = view.page_index(vpn);
            let take = (PAGE_SIZE - va.page_offset()).min(buf.len() - done);
            loop {
                let frame = view.obj.lookup_page(sys, pagenum, true).await?;
                match sys.cache.dirty(frame).await {
                    Ok(()) => {
                        // No suspension between the dirtying above and this
                        // copy, so the frame cannot move under us.
                        let ppn = sys.cache.frame_ppn(frame);
                        let page = sys.frames.frame_slice_mut(ppn);
                        page[va.page_offset()..va.page_offset() + take]
                            .copy_from_slice(&buf[done..done + take]);
                        break;
                    }
                    // The frame was reclaimed while settling; resolve again.
                    Err(SysError::EAGAIN) => continue,
                    Err(err) => return Err(err),
                }
            }
            done += take;
            addr += take;
        }
        Ok(())
    }

    /// Clones the map for `fork`.
    ///
    /// Shared areas are cloned by reference. Each private writable area and
    /// its clone get fresh shadow objects over the now-shared backing, and
    /// write permission is revoked from the source's existing page-table
    /// entries so the next write on either side faults and diverts. The
    /// clone's page table starts empty and demand-faults.
    ///
    /// # Errors
    /// Returns `ENOMEM` if the new space cannot be allocated.
    pub fn clone_map(self: &Arc<Self>, sys: &Arc<MemSystem>) -> SysResult<Arc<AddrSpace>> {
        let new_space = AddrSpace::build(sys)?;
        let mut bindings: Vec<(Arc<MemObj>, AreaId)> = Vec::new();
        let mut demoted = false;
        {
            let mut areas = self.areas.lock();
            let mut pt = self.pt.lock();
            let mut new_areas = BTreeMap::new();
            for area in areas.values_mut() {
                let child_obj = if area.is_private() && area.prot.contains(MemPerm::W) {
                    let parent = Arc::clone(&area.obj);
                    area.obj = MemObj::new_shadow(sys, Arc::clone(&parent));
                    pt.demote_write(area.start.address(), area.end.address());
                    demoted = true;
                    MemObj::new_shadow(sys, parent)
                } else {
                    Arc::clone(&area.obj)
                };
                let child = VmArea::new(
                    sys,
                    area.start,
                    area.end,
                    area.off,
                    area.prot,
                    area.flags,
                    child_obj,
                );
                bindings.push((child.obj().bottom_object(), child.id()));
                new_areas.insert(child.start, child);
            }
            *new_space.areas.lock() = new_areas;
        }
        for (bottom, area) in bindings {
            bottom.register_area(AreaBinding {
                space: Arc::downgrade(&new_space),
                area,
            });
        }
        // The demotions must be visible before either side runs user code.
        if demoted && sys.is_active(self) {
            sys.tlb.flush_all();
        }
        Ok(new_space)
    }

    /// Checks that `vaddr` may be accessed with every bit of `perm`.
    pub fn addr_perm(&self, vaddr: usize, perm: MemPerm) -> bool {
        self.lookup(VirtAddr::new(vaddr).page_number())
            .is_some_and(|view| view.prot.contains(perm))
    }

    /// Checks that every byte of `[vaddr, vaddr + len)` may be accessed
    /// with every bit of `perm`.
    pub fn range_perm(&self, vaddr: usize, len: usize, perm: MemPerm) -> bool {
        if len == 0 {
            return true;
        }
        let Some(last) = vaddr.checked_add(len - 1) else {
            return false;
        };
        let end = VirtAddr::new(last).page_number();
        let mut vpn = VirtAddr::new(vaddr).page_number();
        loop {
            if !self.addr_perm(vpn.address().to_usize(), perm) {
                return false;
            }
            if vpn == end {
                return true;
            }
            vpn = vpn + 1;
        }
    }

    /// Resolves a virtual address through the page table.
    pub fn translate(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        self.pt.lock().virt_to_phys(vaddr)
    }

    /// Every present page-table entry, for diagnostics and tests.
    pub fn pt_entries(&self) -> Vec<(VirtPageNum, PhysPageNum, PteFlags)> {
        self.pt.lock().present_entries()
    }

    /// Runs `f` on the page table.
    pub(crate) fn with_pt<R>(&self, f: impl FnOnce(&mut PageTable) -> R) -> R {
        f(&mut self.pt.lock())
    }

    /// Runs `f` on each area in ascending order.
    pub fn for_each_area(&self, mut f: impl FnMut(&VmArea)) {
        for area in self.areas.lock().values() {
            f(area);
        }
    }

    /// Invalidates the page-table entry through which `area_id` maps page
    /// `pagenum` of its backing chain, if it does. Called by the frame
    /// cache during eviction and cleaning.
    pub(crate) fn unmap_frame_of_area(&self, sys: &MemSystem, area_id: AreaId, pagenum: usize) {
        let vpn = {
            let areas = self.areas.lock();
            let Some(area) = areas.values().find(|a| a.id() == area_id) else {
                return;
            };
            if pagenum < area.off() || pagenum >= area.off() + area.npages() {
                return;
            }
            area.start() + (pagenum - area.off())
        };
        self.pt.lock().unmap(vpn.address());
        if sys.is_active(self) {
            sys.tlb.flush_one(vpn.address().to_usize());
        }
    }

    /// A human-readable dump of the map, for the debug log.
    pub fn mapping_info(&self) -> String {
        let mut out = String::new();
        for area in self.areas.lock().values() {
            out.push_str(&format!("{area:?}\n"));
        }
        out
    }
}

impl Drop for AddrSpace {
    fn drop(&mut self) {
        let areas = core::mem::take(&mut *self.areas.lock());
        for area in areas.values() {
            area.obj().bottom_object().deregister_area(area.id());
        }
        // Dropping the map drops each area's reference to its backing
        // object; objects with no remaining references free their frames.
    }
}
