//! The user/kernel memory bridge.
//!
//! Every system call that names a user pointer goes through this module;
//! the kernel never dereferences user addresses ad hoc. A copy checks that
//! the whole range is mapped with the required permission (every byte must
//! satisfy every requested bit) and then moves the bytes through the
//! address-space map, which faults pages in as needed. Unlike a raw memory
//! copy, these operations may suspend.
//!
//! Strings and string vectors arrive from userland as `(pointer, length)`
//! descriptors with the 32-bit target's pointer size.

use alloc::{string::String, sync::Arc, vec, vec::Vec};

use config::mm::USER_PTR_SIZE;
use systype::{SysError, SysResult, memory_flags::MemPerm};

use crate::{runtime::MemSystem, task::Process};

/// A userland string descriptor: pointer and length, excluding the
/// terminating NUL.
#[derive(Debug, Clone, Copy)]
pub struct UserStr {
    pub ptr: u32,
    pub len: u32,
}

/// A userland string-vector descriptor: pointer to an array of [`UserStr`]
/// terminated by a null entry, and its length excluding that entry.
#[derive(Debug, Clone, Copy)]
pub struct UserVec {
    pub ptr: u32,
    pub len: u32,
}

/// Copies `kbuf.len()` bytes from the current process's user range
/// `[uaddr, uaddr + len)` into a kernel buffer. May suspend.
///
/// # Errors
/// `EFAULT` unless the whole range is mapped readable.
pub async fn copy_from_user(
    sys: &Arc<MemSystem>,
    proc: &Arc<Process>,
    kbuf: &mut [u8],
    uaddr: usize,
) -> SysResult<()> {
    let space = proc.space();
    if !space.range_perm(uaddr, kbuf.len(), MemPerm::R) {
        return Err(SysError::EFAULT);
    }
    space.read(sys, uaddr, kbuf).await
}

/// Copies a kernel buffer into the current process's user range
/// `[uaddr, uaddr + len)`. May suspend.
///
/// # Errors
/// `EFAULT` unless the whole range is mapped writable.
pub async fn copy_to_user(
    sys: &Arc<MemSystem>,
    proc: &Arc<Process>,
    uaddr: usize,
    kbuf: &[u8],
) -> SysResult<()> {
    let space = proc.space();
    if !space.range_perm(uaddr, kbuf.len(), MemPerm::W) {
        return Err(SysError::EFAULT);
    }
    space.write(sys, uaddr, kbuf).await
}

/// Duplicates a user string into the kernel, NUL and all.
///
/// # Errors
/// `EFAULT` on a bad range, `EINVAL` if the bytes are not valid UTF-8.
pub async fn user_strdup(
    sys: &Arc<MemSystem>,
    proc: &Arc<Process>,
    ustr: UserStr,
) -> SysResult<String> {
    let len = ustr.len as usize;
    let mut buf = vec![0u8; len + 1];
    copy_from_user(sys, proc, &mut buf, ustr.ptr as usize).await?;
    buf.truncate(len);
    String::from_utf8(buf).map_err(|_| SysError::EINVAL)
}

/// Duplicates a whole vector of user strings into the kernel.
///
/// Reads the `len + 1` descriptors (including the null terminator), then
/// duplicates each string. Partial allocations are reclaimed automatically
/// on any failure.
pub async fn user_vecdup(
    sys: &Arc<MemSystem>,
    proc: &Arc<Process>,
    uvec: UserVec,
) -> SysResult<Vec<String>> {
    let count = uvec.len as usize;
    let entry = 2 * USER_PTR_SIZE;
    let mut raw = vec![0u8; (count + 1) * entry];
    copy_from_user(sys, proc, &mut raw, uvec.ptr as usize).await?;

    let mut strings = Vec::with_capacity(count);
    for chunk in raw.chunks_exact(entry).take(count) {
        let descr = UserStr {
            ptr: u32::from_le_bytes(chunk[..4].try_into().unwrap()),
            len: u32::from_le_bytes(chunk[4..8].try_into().unwrap()),
        };
        strings.push(user_strdup(sys, proc, descr).await?);
    }
    Ok(strings)
}

/// Reads one user-sized (32-bit) word.
pub async fn read_user_u32(
    sys: &Arc<MemSystem>,
    proc: &Arc<Process>,
    uaddr: usize,
) -> SysResult<u32> {
    let mut buf = [0u8; 4];
    copy_from_user(sys, proc, &mut buf, uaddr).await?;
    Ok(u32::from_le_bytes(buf))
}

/// Checks that `vaddr` is valid for every operation in `perm` in the
/// current process.
pub fn addr_perm(proc: &Arc<Process>, vaddr: usize, perm: MemPerm) -> bool {
    proc.space().addr_perm(vaddr, perm)
}

/// Range version of [`addr_perm`]: every byte must satisfy every requested
/// bit.
pub fn range_perm(proc: &Arc<Process>, vaddr: usize, len: usize, perm: MemPerm) -> bool {
    proc.space().range_perm(vaddr, len, perm)
}
