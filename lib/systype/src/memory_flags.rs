//! Shared memory permission and mapping flag types.

use bitflags::bitflags;

bitflags! {
    /// Protection bits of a virtual memory area, and the access type of a
    /// memory reference.
    ///
    /// As a protection mask, any combination of bits may be set (an empty
    /// mask is `PROT_NONE`: the area may not be accessed at all). As an
    /// access type, exactly one bit is set.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemPerm: u8 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
    }
}

bitflags! {
    /// Memory protection flags as passed to `mmap`.
    ///
    /// `MemPerm` is the kernel-internal representation; `MmapProt` is the
    /// userland interface value.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MmapProt: u32 {
        /// Pages may be read.
        const PROT_READ = 0x1;
        /// Pages may be written.
        const PROT_WRITE = 0x2;
        /// Pages may be executed.
        const PROT_EXEC = 0x4;
    }
}

impl MmapProt {
    /// `PROT_NONE`: no access at all.
    pub const PROT_NONE: MmapProt = MmapProt::empty();
}

bitflags! {
    /// Flags for the `mmap` system call.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MmapFlags: u32 {
        /// Updates to the mapping are visible to every process mapping the
        /// same region of the same file, and are carried through to the file.
        const MAP_SHARED = 0x1;
        /// Updates to the mapping stay private to the process (copy-on-write).
        const MAP_PRIVATE = 0x2;
        /// Mask over the two sharing types, of which exactly one is required.
        const MAP_TYPE = 0x3;
        /// Place the mapping at exactly the given address.
        const MAP_FIXED = 0x4;
        /// The mapping is not backed by any file.
        const MAP_ANON = 0x8;
    }
}

impl From<MmapProt> for MemPerm {
    fn from(prot: MmapProt) -> Self {
        let mut perm = MemPerm::empty();
        if prot.contains(MmapProt::PROT_READ) {
            perm |= MemPerm::R;
        }
        if prot.contains(MmapProt::PROT_WRITE) {
            perm |= MemPerm::W;
        }
        if prot.contains(MmapProt::PROT_EXEC) {
            perm |= MemPerm::X;
        }
        perm
    }
}

impl From<MemPerm> for MmapProt {
    fn from(perm: MemPerm) -> Self {
        let mut prot = MmapProt::empty();
        if perm.contains(MemPerm::R) {
            prot |= MmapProt::PROT_READ;
        }
        if perm.contains(MemPerm::W) {
            prot |= MmapProt::PROT_WRITE;
        }
        if perm.contains(MemPerm::X) {
            prot |= MmapProt::PROT_EXEC;
        }
        prot
    }
}
