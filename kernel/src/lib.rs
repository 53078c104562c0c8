#![no_std]

//! The virtual-memory and process-image subsystem of a small teaching
//! kernel.
//!
//! The subsystem is hosted and architecture-abstract: physical memory is an
//! arena handed to the page allocator at boot, the page-table facade is a
//! software translation tree, and everything that may block is an `async fn`
//! driven by the cooperative executor. All machine state lives in a
//! [`runtime::MemSystem`] passed explicitly to the core entry points, so a
//! test can boot a machine with a handful of pages.

extern crate alloc;

pub mod fs;
pub mod runtime;
pub mod syscall;
pub mod task;
pub mod vm;
