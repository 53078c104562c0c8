//! The page-fault handler.
//!
//! The interrupt trampoline is abstracted to a single entry function taking
//! the faulting address and the cause bits; the caller resumes the thread
//! on [`FaultOutcome::Resumed`] and reaps the process otherwise. Faults are
//! never reported to userland as errors: either a mapping is installed, or
//! the process dies.

use alloc::sync::Arc;

use bitflags::bitflags;

use systype::{SysError, SysResult, memory_flags::MemPerm};

use crate::{
    runtime::MemSystem,
    task::Process,
    vm::page_table::PteFlags,
};

bitflags! {
    /// Cause bits of a page fault, as delivered by the MMU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultCause: u32 {
        /// The faulting translation was present (a permission fault).
        const PRESENT = 0x01;
        /// The access was a write.
        const WRITE = 0x02;
        /// The access came from user mode.
        const USER = 0x04;
        const RESERVED = 0x08;
        /// The access was an instruction fetch.
        const EXEC = 0x10;
    }
}

/// What became of the faulting thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A mapping was installed; re-run the faulting instruction.
    Resumed,
    /// The process was terminated with the given error.
    Terminated(SysError),
}

/// Entry point for user page faults. Resolves the fault or terminates the
/// process.
///
/// # Panics
/// A fault taken in kernel mode is a kernel bug.
pub async fn handle_page_fault(
    sys: &Arc<MemSystem>,
    proc: &Arc<Process>,
    vaddr: usize,
    cause: FaultCause,
) -> FaultOutcome {
    assert!(
        cause.contains(FaultCause::USER),
        "kernel-mode page fault at {vaddr:#x} ({cause:?})"
    );
    match resolve(sys, proc, vaddr, cause).await {
        Ok(()) => FaultOutcome::Resumed,
        Err(err) => {
            log::warn!(
                "[{}:{}] fault at {vaddr:#x} ({cause:?}): {err:?}",
                proc.pid(),
                proc.name()
            );
            proc.terminate(err);
            FaultOutcome::Terminated(err)
        }
    }
}

/// Resolves one fault: find the area, police the access, get the page from
/// the backing object, install a page-table entry, invalidate the TLB.
async fn resolve(
    sys: &Arc<MemSystem>,
    proc: &Arc<Process>,
    vaddr: usize,
    cause: FaultCause,
) -> SysResult<()> {
    let space = proc.space();
    let vpn = mm::address::VirtAddr::new(vaddr).page_number();
    let view = space.lookup(vpn).ok_or(SysError::EFAULT)?;

    // The access must satisfy the area's protection.
    let access = if cause.contains(FaultCause::WRITE) {
        MemPerm::W
    } else if cause.contains(FaultCause::EXEC) {
        MemPerm::X
    } else {
        MemPerm::R
    };
    if !view.prot.contains(access) {
        return Err(SysError::EFAULT);
    }

    let pagenum = view.page_index(vpn);
    let for_write = cause.contains(FaultCause::WRITE) && view.is_private();
    loop {
        let frame = view.obj.lookup_page(sys, pagenum, for_write).await?;
        if cause.contains(FaultCause::WRITE) {
            // Dirty before the write becomes visible; the object may need
            // to reserve backing storage.
            match sys.cache.dirty(frame).await {
                Ok(()) => {}
                // Reclaimed while settling; resolve again.
                Err(SysError::EAGAIN) => continue,
                Err(err) => return Err(err),
            }
        }

        // Map with the area's protection, masked by the frame's dirty
        // state: a clean page of a writable area goes in read-only so the
        // first write refaults and dirties it exactly once.
        let mut flags = PteFlags::USER;
        if view.prot.contains(MemPerm::X) {
            flags |= PteFlags::EXEC;
        }
        if view.prot.contains(MemPerm::W) && sys.cache.is_dirty(frame) {
            flags |= PteFlags::WRITE;
        }
        let paddr = sys.cache.frame_ppn(frame).address();
        space.with_pt(|pt| pt.map(vpn.address(), paddr, flags))?;
        if sys.is_active(&space) {
            sys.tlb.flush_one(vaddr);
        }
        return Ok(());
    }
}
