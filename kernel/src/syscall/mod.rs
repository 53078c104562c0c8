//! The system-call surface.
//!
//! The dispatcher receives a call number and the user address of a
//! call-specific argument struct, marshals arguments in through the
//! user-memory bridge, invokes the map/fault/loader machinery, and copies
//! results back out. Errors become `-1` with the error code stored in the
//! calling process's errno slot. Kernel copies made on the way in are
//! reclaimed on every exit path.

pub mod mm;
pub mod process;

use alloc::sync::Arc;

use systype::SysError;

use crate::{runtime::MemSystem, task::Process};

pub const SYS_FORK: u32 = 2;
pub const SYS_EXECVE: u32 = 10;
pub const SYS_SYNC: u32 = 15;
pub const SYS_MMAP: u32 = 24;
pub const SYS_MUNMAP: u32 = 26;
pub const SYS_BRK: u32 = 44;

/// Dispatches one system call for `proc`. `arg` is the user address of the
/// call's argument struct (or the argument itself, for calls taking a bare
/// value).
pub async fn syscall_dispatch(
    sys: &Arc<MemSystem>,
    proc: &Arc<Process>,
    sysnum: u32,
    arg: usize,
) -> isize {
    let result = match sysnum {
        SYS_FORK => process::sys_fork(sys, proc).await,
        SYS_EXECVE => process::sys_execve(sys, proc, arg).await,
        SYS_SYNC => mm::sys_sync(sys).await,
        SYS_MMAP => mm::sys_mmap(sys, proc, arg).await,
        SYS_MUNMAP => mm::sys_munmap(sys, proc, arg).await,
        SYS_BRK => mm::sys_brk(sys, proc, arg).await,
        _ => {
            log::warn!("[{}] unknown syscall {sysnum}", proc.pid());
            Err(SysError::ENOSYS)
        }
    };
    match result {
        Ok(value) => value as isize,
        Err(err) => {
            proc.set_errno(err);
            -1
        }
    }
}
