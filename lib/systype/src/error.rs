use alloc::boxed::Box;
use core::{future::Future, pin::Pin};

use strum::FromRepr;

/// Type alias for syscall results. A syscall returns a `usize` if successful.
pub type SyscallResult = Result<usize, SysError>;
/// Type alias for results of general kernel functions.
pub type SysResult<T> = Result<T, SysError>;

/// A boxed future, used by operations that may suspend and whose concrete
/// future type cannot be named (polymorphic dispatch, recursion).
pub type SysFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A boxed future that resolves to a general result.
pub type ASysResult<'a, T> = SysFuture<'a, SysResult<T>>;

/// Kernel error codes, following the conventional `errno` numbering.
///
/// Only the errors this kernel can actually raise are listed; the numeric
/// values still match `errno.h` so they can be reported to userland as-is.
#[derive(FromRepr, Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum SysError {
    /// Operation not permitted
    EPERM = 1,
    /// No such file or directory
    ENOENT = 2,
    /// Interrupted system call
    EINTR = 4,
    /// I/O error
    EIO = 5,
    /// Argument list too long
    E2BIG = 7,
    /// Exec format error
    ENOEXEC = 8,
    /// Bad file number
    EBADF = 9,
    /// Try again
    EAGAIN = 11,
    /// Out of memory
    ENOMEM = 12,
    /// Permission denied
    EACCES = 13,
    /// Bad address
    EFAULT = 14,
    /// Device or resource busy
    EBUSY = 16,
    /// File exists
    EEXIST = 17,
    /// No such device
    ENODEV = 19,
    /// Not a directory
    ENOTDIR = 20,
    /// Is a directory
    EISDIR = 21,
    /// Invalid argument
    EINVAL = 22,
    /// File table overflow
    ENFILE = 23,
    /// Too many open files
    EMFILE = 24,
    /// No space left on device
    ENOSPC = 28,
    /// Read-only file system
    EROFS = 30,
    /// File name too long
    ENAMETOOLONG = 36,
    /// Function not implemented
    ENOSYS = 38,
    /// Value too large for defined data type
    EOVERFLOW = 75,
}

impl SysError {
    /// The numeric `errno` value reported to userland.
    pub fn code(self) -> i32 {
        self as i32
    }
}
