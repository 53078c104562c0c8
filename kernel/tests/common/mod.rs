//! Shared fixtures for the integration tests: a console logger, an
//! in-memory filesystem double standing in for the VFS collaborator, a
//! machine-boot helper, and a little ELF32 image builder.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use log::LevelFilter;

use kernel::fs::{Vfs, Vnode, VnodeKind};
use kernel::runtime::{MemConfig, MemSystem};
use mutex::SpinLock;
use systype::{SysError, SysResult};

struct TestLogger;

impl log::Log for TestLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        eprintln!("[{:>5}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: TestLogger = TestLogger;

pub fn init_logger() {
    let level = if std::env::var_os("TEST_LOG").is_some() {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(level));
}

/// An in-memory regular file.
pub struct RamVnode {
    ino: u64,
    kind: VnodeKind,
    data: SpinLock<Vec<u8>>,
    fail_reserve: AtomicBool,
}

impl RamVnode {
    /// Snapshot of the file's contents, as a descriptor read would see them.
    pub fn content(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Makes every later `reserve_at` fail with `ENOSPC`, simulating a full
    /// disk.
    pub fn set_fail_reserve(&self, fail: bool) {
        self.fail_reserve.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl Vnode for RamVnode {
    fn ino(&self) -> u64 {
        self.ino
    }

    fn kind(&self) -> VnodeKind {
        self.kind
    }

    fn len(&self) -> usize {
        self.data.lock().len()
    }

    async fn read_at(&self, off: usize, buf: &mut [u8]) -> SysResult<usize> {
        let data = self.data.lock();
        if off >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - off);
        buf[..n].copy_from_slice(&data[off..off + n]);
        Ok(n)
    }

    async fn write_at(&self, off: usize, buf: &[u8]) -> SysResult<usize> {
        let mut data = self.data.lock();
        if data.len() < off + buf.len() {
            data.resize(off + buf.len(), 0);
        }
        data[off..off + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    async fn reserve_at(&self, _off: usize, _len: usize) -> SysResult<()> {
        if self.fail_reserve.load(Ordering::Relaxed) {
            return Err(SysError::ENOSPC);
        }
        Ok(())
    }
}

/// The filesystem double: a flat path → vnode namespace.
pub struct RamFs {
    files: SpinLock<std::collections::BTreeMap<String, Arc<RamVnode>>>,
    next_ino: AtomicU64,
}

impl RamFs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            files: SpinLock::new(std::collections::BTreeMap::new()),
            next_ino: AtomicU64::new(1),
        })
    }

    pub fn create(&self, path: &str, data: Vec<u8>) -> Arc<RamVnode> {
        self.create_kind(path, data, VnodeKind::Regular)
    }

    pub fn create_kind(&self, path: &str, data: Vec<u8>, kind: VnodeKind) -> Arc<RamVnode> {
        let vnode = Arc::new(RamVnode {
            ino: self.next_ino.fetch_add(1, Ordering::Relaxed),
            kind,
            data: SpinLock::new(data),
            fail_reserve: AtomicBool::new(false),
        });
        self.files
            .lock()
            .insert(path.to_string(), Arc::clone(&vnode));
        vnode
    }
}

#[async_trait]
impl Vfs for RamFs {
    async fn open(&self, path: &str) -> SysResult<Arc<dyn Vnode>> {
        self.files
            .lock()
            .get(path)
            .map(|v| Arc::clone(v) as Arc<dyn Vnode>)
            .ok_or(SysError::ENOENT)
    }
}

/// Boots a machine over `ram_pages` frames with no kernel reserve, so the
/// whole budget is visible to the tests.
pub fn boot(ram_pages: usize) -> (Arc<MemSystem>, Arc<RamFs>) {
    boot_with(MemConfig {
        ram_pages,
        kernel_reserved: Some(0),
        ..Default::default()
    })
}

pub fn boot_with(config: MemConfig) -> (Arc<MemSystem>, Arc<RamFs>) {
    init_logger();
    let fs = RamFs::new();
    let sys = MemSystem::new(config, Arc::clone(&fs) as Arc<dyn Vfs>);
    (sys, fs)
}

// --- A minimal ELF32 little-endian image builder ------------------------

pub const PAGE: usize = 4096;
pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;
pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;
const PT_LOAD: u32 = 1;
const PT_INTERP: u32 = 3;

/// One loadable segment of a built image. `filesz` is `data.len()`.
pub struct Seg {
    pub vaddr: u32,
    pub data: Vec<u8>,
    pub memsz: u32,
    pub flags: u32,
}

fn put16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

/// Builds a valid ELF32 executable (or shared object, for interpreters)
/// whose segment file offsets are congruent to their virtual addresses
/// modulo the page size, as the loader demands.
pub fn build_elf(e_type: u16, entry: u32, segs: &[Seg], interp: Option<&str>) -> Vec<u8> {
    build_elf_with(e_type, entry, segs, interp, PAGE as u32)
}

/// Like [`build_elf`], with an explicit `p_align` for every load segment
/// (the loader rejects anything but the page size).
pub fn build_elf_with(
    e_type: u16,
    entry: u32,
    segs: &[Seg],
    interp: Option<&str>,
    align: u32,
) -> Vec<u8> {
    let phnum = segs.len() + interp.is_some() as usize;
    let phoff = 52usize;
    let mut out = vec![0u8; phoff + phnum * 32];

    out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    out[4] = 1; // ELFCLASS32
    out[5] = 1; // little-endian
    out[6] = 1; // EV_CURRENT
    put16(&mut out, 16, e_type);
    put16(&mut out, 18, 3); // EM_386
    put32(&mut out, 20, 1);
    put32(&mut out, 24, entry);
    put32(&mut out, 28, phoff as u32);
    put16(&mut out, 40, 52); // e_ehsize
    put16(&mut out, 42, 32); // e_phentsize
    put16(&mut out, 44, phnum as u16);

    let mut ph = 0usize;
    let phent = |out: &mut Vec<u8>,
                     idx: usize,
                     ty: u32,
                     off: u32,
                     vaddr: u32,
                     filesz: u32,
                     memsz: u32,
                     flags: u32,
                     align: u32| {
        let base = phoff + idx * 32;
        put32(out, base, ty);
        put32(out, base + 4, off);
        put32(out, base + 8, vaddr);
        put32(out, base + 12, vaddr);
        put32(out, base + 16, filesz);
        put32(out, base + 20, memsz);
        put32(out, base + 24, flags);
        put32(out, base + 28, align);
    };

    if let Some(path) = interp {
        let off = out.len() as u32;
        let len = path.len() as u32 + 1;
        out.extend_from_slice(path.as_bytes());
        out.push(0);
        phent(&mut out, ph, PT_INTERP, off, 0, len, len, PF_R, 1);
        ph += 1;
    }

    for seg in segs {
        // Place the data so its file offset matches the vaddr modulo a page.
        let mut off = (out.len() + PAGE - 1) / PAGE * PAGE + seg.vaddr as usize % PAGE;
        if off < out.len() {
            off += PAGE;
        }
        out.resize(off, 0);
        out.extend_from_slice(&seg.data);
        phent(
            &mut out,
            ph,
            PT_LOAD,
            off as u32,
            seg.vaddr,
            seg.data.len() as u32,
            seg.memsz,
            seg.flags,
            align,
        );
        ph += 1;
    }
    out
}
