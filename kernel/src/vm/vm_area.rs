//! Virtual memory areas.
//!
//! An area is a half-open range of virtual pages backed by a memory object
//! at some page offset, with a protection mask and a sharing mode. Areas
//! never overlap within one address space.

use alloc::sync::Arc;
use core::fmt;

use mm::address::VirtPageNum;
use systype::memory_flags::{MemPerm, MmapFlags};

use crate::{runtime::MemSystem, vm::memobj::MemObj};

pub type AreaId = u64;

/// One mapped region of an address space.
pub struct VmArea {
    pub(crate) id: AreaId,
    /// First mapped virtual page.
    pub(crate) start: VirtPageNum,
    /// One past the last mapped virtual page.
    pub(crate) end: VirtPageNum,
    /// Offset into the backing object, in pages.
    pub(crate) off: usize,
    pub(crate) prot: MemPerm,
    pub(crate) flags: MmapFlags,
    /// The object pages are read from and written to (modulo COW).
    pub(crate) obj: Arc<MemObj>,
}

impl VmArea {
    pub(crate) fn new(
        sys: &Arc<MemSystem>,
        start: VirtPageNum,
        end: VirtPageNum,
        off: usize,
        prot: MemPerm,
        flags: MmapFlags,
        obj: Arc<MemObj>,
    ) -> Self {
        debug_assert!(start < end);
        debug_assert!(off.checked_add(end - start).is_some());
        Self {
            id: sys.alloc_area_id(),
            start,
            end,
            off,
            prot,
            flags,
            obj,
        }
    }

    pub fn id(&self) -> AreaId {
        self.id
    }

    pub fn start(&self) -> VirtPageNum {
        self.start
    }

    pub fn end(&self) -> VirtPageNum {
        self.end
    }

    pub fn npages(&self) -> usize {
        self.end - self.start
    }

    pub fn off(&self) -> usize {
        self.off
    }

    pub fn prot(&self) -> MemPerm {
        self.prot
    }

    pub fn flags(&self) -> MmapFlags {
        self.flags
    }

    pub fn obj(&self) -> &Arc<MemObj> {
        &self.obj
    }

    pub fn contains(&self, vpn: VirtPageNum) -> bool {
        self.start <= vpn && vpn < self.end
    }

    pub fn is_private(&self) -> bool {
        self.flags.contains(MmapFlags::MAP_PRIVATE)
    }

    pub fn is_shared(&self) -> bool {
        self.flags.contains(MmapFlags::MAP_SHARED)
    }

    /// The backing-object page index of a virtual page in this area.
    pub fn page_index(&self, vpn: VirtPageNum) -> usize {
        debug_assert!(self.contains(vpn));
        self.off + (vpn - self.start)
    }
}

impl fmt::Debug for VmArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = |bit, c| if self.prot.contains(bit) { c } else { '-' };
        write!(
            f,
            "{:#x}-{:#x} {}{}{} {} off {:#x} obj {}",
            self.start.to_usize(),
            self.end.to_usize(),
            p(MemPerm::R, 'r'),
            p(MemPerm::W, 'w'),
            p(MemPerm::X, 'x'),
            if self.is_shared() { "shared" } else { "private" },
            self.off,
            self.obj.id(),
        )
    }
}

/// A snapshot of an area, with the backing object kept alive. Returned by
/// lookups so callers can work without holding the area table lock.
#[derive(Clone)]
pub struct AreaView {
    pub id: AreaId,
    pub start: VirtPageNum,
    pub end: VirtPageNum,
    pub off: usize,
    pub prot: MemPerm,
    pub flags: MmapFlags,
    pub obj: Arc<MemObj>,
}

impl AreaView {
    pub fn is_private(&self) -> bool {
        self.flags.contains(MmapFlags::MAP_PRIVATE)
    }

    /// The backing-object page index of a virtual page in this area.
    pub fn page_index(&self, vpn: VirtPageNum) -> usize {
        self.off + (vpn - self.start)
    }
}

impl From<&VmArea> for AreaView {
    fn from(area: &VmArea) -> Self {
        Self {
            id: area.id,
            start: area.start,
            end: area.end,
            off: area.off,
            prot: area.prot,
            flags: area.flags,
            obj: Arc::clone(&area.obj),
        }
    }
}
