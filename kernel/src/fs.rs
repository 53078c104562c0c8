//! Interfaces to the filesystem collaborator.
//!
//! The VM subsystem does not implement a filesystem. It consumes one through
//! the [`Vnode`] and [`Vfs`] traits: file-backed memory objects fill their
//! pages with `read_at` and clean them with `write_at`, and the program
//! loader resolves pathnames through [`Vfs::open`]. Open files and the
//! per-process file table live here as well, because `mmap` takes file
//! descriptors and `fork` duplicates the table.

use alloc::{boxed::Box, sync::Arc, vec::Vec};

use async_trait::async_trait;
use bitflags::bitflags;

use config::process::NFILES;
use systype::{SysError, SysResult};

/// What kind of file a vnode is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeKind {
    Regular,
    Directory,
    Device,
}

/// An in-core inode, implemented by the filesystem collaborator.
#[async_trait]
pub trait Vnode: Send + Sync {
    /// A stable identifier, unique among live vnodes. Used to key the
    /// per-inode memory object registry.
    fn ino(&self) -> u64;

    /// The kind of the file.
    fn kind(&self) -> VnodeKind;

    /// Current length of the file in bytes.
    fn len(&self) -> usize;

    /// Reads at most `buf.len()` bytes starting at byte offset `off`.
    /// Returns the number of bytes read; zero means end of file.
    async fn read_at(&self, off: usize, buf: &mut [u8]) -> SysResult<usize>;

    /// Writes `buf` starting at byte offset `off`, extending the file if
    /// needed. Returns the number of bytes written.
    async fn write_at(&self, off: usize, buf: &[u8]) -> SysResult<usize>;

    /// Reserves backing storage for a coming write of `len` bytes at `off`.
    ///
    /// Called when a page over this range is about to be dirtied, so the
    /// filesystem can fail early with `ENOSPC` instead of losing data at
    /// writeback time.
    async fn reserve_at(&self, _off: usize, _len: usize) -> SysResult<()> {
        Ok(())
    }
}

/// The filesystem name space, implemented by the collaborator.
#[async_trait]
pub trait Vfs: Send + Sync {
    /// Resolves `path` to a vnode.
    async fn open(&self, path: &str) -> SysResult<Arc<dyn Vnode>>;
}

bitflags! {
    /// Access mode of an open file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileMode: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
    }
}

/// An open file: a vnode plus the access mode it was opened with.
pub struct File {
    pub vnode: Arc<dyn Vnode>,
    pub mode: FileMode,
}

impl File {
    pub fn new(vnode: Arc<dyn Vnode>, mode: FileMode) -> Arc<Self> {
        Arc::new(Self { vnode, mode })
    }
}

/// The per-process table of open files.
///
/// `fork` duplicates the table; parent and child then share the open file
/// descriptions behind the descriptors.
pub struct FdTable {
    files: Vec<Option<Arc<File>>>,
}

impl FdTable {
    pub fn new() -> Self {
        let mut files = Vec::new();
        files.resize_with(NFILES, || None);
        Self { files }
    }

    /// Looks up an open file by descriptor.
    ///
    /// # Errors
    /// Returns `EBADF` if `fd` does not name an open file.
    pub fn get(&self, fd: i32) -> SysResult<Arc<File>> {
        usize::try_from(fd)
            .ok()
            .and_then(|fd| self.files.get(fd))
            .and_then(|slot| slot.clone())
            .ok_or(SysError::EBADF)
    }

    /// Installs a file at the lowest free descriptor.
    ///
    /// # Errors
    /// Returns `EMFILE` if the table is full.
    pub fn install(&mut self, file: Arc<File>) -> SysResult<i32> {
        for (fd, slot) in self.files.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return Ok(fd as i32);
            }
        }
        Err(SysError::EMFILE)
    }

    /// Closes a descriptor.
    ///
    /// # Errors
    /// Returns `EBADF` if `fd` does not name an open file.
    pub fn close(&mut self, fd: i32) -> SysResult<()> {
        let slot = usize::try_from(fd)
            .ok()
            .and_then(|fd| self.files.get_mut(fd))
            .ok_or(SysError::EBADF)?;
        slot.take().map(|_| ()).ok_or(SysError::EBADF)
    }

    /// Duplicates the table for a forked child. The open file descriptions
    /// themselves are shared.
    pub fn duplicate(&self) -> Self {
        Self {
            files: self.files.clone(),
        }
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}
