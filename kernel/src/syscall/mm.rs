//! Memory-management system calls: `mmap`, `munmap`, `brk` and `sync`.

use alloc::sync::Arc;

use config::mm::{PAGE_SIZE, USER_MEM_HIGH, USER_MEM_LOW};
use mm::address::{VirtAddr, VirtPageNum, page_align_up, page_aligned};
use systype::{
    SysError, SysResult, SyscallResult,
    memory_flags::{MemPerm, MmapFlags, MmapProt},
};

use crate::{
    fs::{FileMode, VnodeKind},
    runtime::MemSystem,
    task::Process,
    vm::{addr_space::AllocDir, uaccess},
};

/// `mmap()` creates a new mapping in the calling process's address space.
///
/// Exactly one of `MAP_SHARED` and `MAP_PRIVATE` is required. Without
/// `MAP_FIXED` the kernel picks the address, searching down from the top of
/// user space; with it, `addr` is used exactly and any existing mappings it
/// overlaps are discarded. `MAP_ANON` maps zero-filled memory with no file
/// behind it; otherwise `fd` names an open file mapped from page-aligned
/// offset `off`.
#[allow(clippy::too_many_arguments)]
pub fn do_mmap(
    sys: &Arc<MemSystem>,
    proc: &Arc<Process>,
    addr: usize,
    len: usize,
    prot: MmapProt,
    flags: MmapFlags,
    fd: i32,
    off: usize,
) -> SysResult<usize> {
    let sharing = flags & MmapFlags::MAP_TYPE;
    if sharing != MmapFlags::MAP_SHARED && sharing != MmapFlags::MAP_PRIVATE {
        return Err(SysError::EINVAL);
    }
    if len == 0 || len > i32::MAX as usize {
        return Err(SysError::EINVAL);
    }
    if !page_aligned(off) {
        return Err(SysError::EINVAL);
    }
    // An anonymous mapping has nothing an offset could refer to.
    if flags.contains(MmapFlags::MAP_ANON) && off != 0 {
        return Err(SysError::EINVAL);
    }
    if (off as u64) + (len as u64) > u32::MAX as u64 {
        return Err(SysError::EOVERFLOW);
    }

    let npages = page_align_up(len) / PAGE_SIZE;
    let lopage = if flags.contains(MmapFlags::MAP_FIXED) {
        if !page_aligned(addr) {
            return Err(SysError::EINVAL);
        }
        if addr < USER_MEM_LOW || addr + npages * PAGE_SIZE > USER_MEM_HIGH {
            return Err(SysError::EINVAL);
        }
        Some(VirtAddr::new(addr).page_number())
    } else {
        None
    };

    let vnode = if flags.contains(MmapFlags::MAP_ANON) {
        None
    } else {
        let file = proc.with_fds(|fds| fds.get(fd))?;
        if !file.mode.contains(FileMode::READ) {
            return Err(SysError::EACCES);
        }
        if flags.contains(MmapFlags::MAP_SHARED)
            && prot.contains(MmapProt::PROT_WRITE)
            && !file.mode.contains(FileMode::WRITE)
        {
            return Err(SysError::EACCES);
        }
        if file.vnode.kind() != VnodeKind::Regular {
            return Err(SysError::EACCES);
        }
        Some(Arc::clone(&file.vnode))
    };

    let space = proc.space();
    let start = space.map(
        sys,
        vnode,
        lopage,
        npages,
        MemPerm::from(prot),
        flags,
        off / PAGE_SIZE,
        AllocDir::HighToLow,
    )?;
    if flags.contains(MmapFlags::MAP_FIXED) {
        // Translations of whatever the mapping replaced must go.
        let lo = start.address();
        let hi = VirtAddr::new(lo.to_usize() + npages * PAGE_SIZE);
        space.with_pt(|pt| pt.unmap_range(lo, hi));
        if sys.is_active(&space) {
            sys.tlb.flush_all();
        }
    }
    log::debug!(
        "[{}] mmap len {len:#x} -> {:#x}",
        proc.pid(),
        start.address().to_usize()
    );
    Ok(start.address().to_usize())
}

/// `munmap()` removes every mapping in the given range; later references
/// to it fault.
pub fn do_munmap(
    sys: &Arc<MemSystem>,
    proc: &Arc<Process>,
    addr: usize,
    len: usize,
) -> SysResult<usize> {
    if !page_aligned(addr) || len == 0 || len > i32::MAX as usize {
        return Err(SysError::EINVAL);
    }
    let end = addr
        .checked_add(page_align_up(len))
        .ok_or(SysError::EINVAL)?;
    if addr < USER_MEM_LOW || end > USER_MEM_HIGH {
        return Err(SysError::EINVAL);
    }
    let npages = (end - addr) / PAGE_SIZE;
    let space = proc.space();
    space.remove(sys, VirtAddr::new(addr).page_number(), npages)?;
    space.with_pt(|pt| pt.unmap_range(VirtAddr::new(addr), VirtAddr::new(end)));
    if sys.is_active(&space) {
        sys.tlb.flush_all();
    }
    Ok(0)
}

/// `brk()` moves the process break, growing or shrinking the data region.
/// With `addr == 0` it reports the current break. Returns the new break.
pub fn do_brk(sys: &Arc<MemSystem>, proc: &Arc<Process>, addr: usize) -> SysResult<usize> {
    let range = proc.brk_range();
    if addr == 0 {
        return Ok(range.brk);
    }
    if range.start == 0 {
        // No image was ever loaded; there is no data region to move.
        return Err(SysError::ENOMEM);
    }
    if addr < range.start || addr > USER_MEM_HIGH {
        return Err(SysError::ENOMEM);
    }

    let cur_page = page_align_up(range.brk) / PAGE_SIZE;
    let new_page = page_align_up(addr) / PAGE_SIZE;
    let space = proc.space();
    if new_page > cur_page {
        let grow = new_page - cur_page;
        if !space.is_range_empty(VirtPageNum::new(cur_page), grow) {
            return Err(SysError::ENOMEM);
        }
        space.map(
            sys,
            None,
            Some(VirtPageNum::new(cur_page)),
            grow,
            MemPerm::R | MemPerm::W,
            MmapFlags::MAP_PRIVATE | MmapFlags::MAP_FIXED,
            0,
            AllocDir::LowToHigh,
        )?;
    } else if new_page < cur_page {
        space.remove(sys, VirtPageNum::new(new_page), cur_page - new_page)?;
        space.with_pt(|pt| {
            pt.unmap_range(
                VirtPageNum::new(new_page).address(),
                VirtPageNum::new(cur_page).address(),
            )
        });
        if sys.is_active(&space) {
            sys.tlb.flush_all();
        }
    }
    proc.set_brk(addr);
    Ok(addr)
}

/// Marshalling wrapper for `mmap`. The argument struct is six 32-bit
/// fields: address, length, protection, flags, descriptor, offset.
pub async fn sys_mmap(sys: &Arc<MemSystem>, proc: &Arc<Process>, argp: usize) -> SyscallResult {
    let mut raw = [0u8; 24];
    uaccess::copy_from_user(sys, proc, &mut raw, argp).await?;
    let word = |i: usize| u32::from_le_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap());
    do_mmap(
        sys,
        proc,
        word(0) as usize,
        word(1) as usize,
        MmapProt::from_bits_truncate(word(2)),
        MmapFlags::from_bits_truncate(word(3)),
        word(4) as i32,
        word(5) as usize,
    )
}

/// Marshalling wrapper for `munmap`: address and length.
pub async fn sys_munmap(sys: &Arc<MemSystem>, proc: &Arc<Process>, argp: usize) -> SyscallResult {
    let mut raw = [0u8; 8];
    uaccess::copy_from_user(sys, proc, &mut raw, argp).await?;
    let addr = u32::from_le_bytes(raw[..4].try_into().unwrap()) as usize;
    let len = u32::from_le_bytes(raw[4..].try_into().unwrap()) as usize;
    do_munmap(sys, proc, addr, len)
}

/// `brk` takes the requested break as a bare argument.
pub async fn sys_brk(sys: &Arc<MemSystem>, proc: &Arc<Process>, addr: usize) -> SyscallResult {
    do_brk(sys, proc, addr)
}

/// `sync` writes every dirty cached page back to its backing store.
pub async fn sys_sync(sys: &Arc<MemSystem>) -> SyscallResult {
    sys.sync().await?;
    Ok(0)
}
