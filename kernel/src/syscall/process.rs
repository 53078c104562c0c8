//! Process-image system calls: `fork` and `execve`.

use alloc::{string::String, sync::Arc, vec::Vec};

use systype::{SysResult, SyscallResult};

use crate::{
    runtime::MemSystem,
    task::Process,
    vm::{
        elf,
        uaccess::{self, UserStr, UserVec},
    },
};

/// Forks the calling process.
///
/// The child gets a copy-on-write clone of the address space (the
/// two-shadow protocol of the map's `clone_map`), a duplicate of the file
/// table, and the parent's saved registers with the return-value register
/// zeroed, and becomes runnable.
pub fn do_fork(sys: &Arc<MemSystem>, proc: &Arc<Process>) -> SysResult<Arc<Process>> {
    let child_space = proc.space().clone_map(sys)?;
    let child = Process::fork_from(sys, proc, child_space);
    log::info!("[{}] forked child {}", proc.pid(), child.pid());
    Ok(child)
}

pub async fn sys_fork(sys: &Arc<MemSystem>, proc: &Arc<Process>) -> SyscallResult {
    let child = do_fork(sys, proc)?;
    Ok(child.pid() as usize)
}

/// Marshalling wrapper for `execve`. The argument struct is a filename
/// descriptor followed by the argv and envp vector descriptors.
///
/// On success the caller's image is gone; the dispatcher's zero return is
/// delivered into the fresh image's return-value register.
pub async fn sys_execve(sys: &Arc<MemSystem>, proc: &Arc<Process>, argp: usize) -> SyscallResult {
    let mut raw = [0u8; 24];
    uaccess::copy_from_user(sys, proc, &mut raw, argp).await?;
    let word = |i: usize| u32::from_le_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap());
    let filename = UserStr {
        ptr: word(0),
        len: word(1),
    };
    let argv = UserVec {
        ptr: word(2),
        len: word(3),
    };
    let envp = UserVec {
        ptr: word(4),
        len: word(5),
    };

    let path = uaccess::user_strdup(sys, proc, filename).await?;
    let argv: Vec<String> = if argv.ptr != 0 {
        uaccess::user_vecdup(sys, proc, argv).await?
    } else {
        Vec::new()
    };
    let envp: Vec<String> = if envp.ptr != 0 {
        uaccess::user_vecdup(sys, proc, envp).await?
    } else {
        Vec::new()
    };
    // The kernel copies above are reclaimed on every path out of here.
    elf::do_execve(sys, proc, &path, &argv, &envp).await?;
    Ok(0)
}
