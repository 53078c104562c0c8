#![no_std]

extern crate alloc;

pub mod error;
pub mod memory_flags;

pub use error::{ASysResult, SysError, SysFuture, SysResult, SyscallResult};
