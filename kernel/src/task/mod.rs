//! The process model, reduced to what the VM subsystem needs.
//!
//! Scheduling proper is a collaborator: syscall and fault entry points take
//! the current process explicitly, and "make runnable" is a state change the
//! external scheduler acts on. What lives here is the per-process state the
//! memory system owns or mutates: the address space, the break, the file
//! table, the saved user registers, and the errno slot.

pub mod wait_queue;

use alloc::{
    string::{String, ToString},
    sync::Arc,
};
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use config::process::PROC_NAME_LEN;
use mutex::SpinLock;
use systype::{SysError, SysResult};

use crate::{fs::FdTable, runtime::MemSystem, vm::addr_space::AddrSpace};

pub type Pid = u32;

/// Saved user-mode registers, as handed to the kernel by the trap
/// trampoline. Only the registers the VM subsystem manipulates are modelled.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    /// User instruction pointer.
    pub ip: usize,
    /// User stack pointer.
    pub sp: usize,
    /// The register a syscall's return value is delivered in.
    pub ret: usize,
}

/// Lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Runnable,
    /// Terminated; carries the exit status reported to the parent.
    Exited(i32),
}

/// The extent of a process's data region.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrkRange {
    /// The break set by the program loader; the break may never go below it.
    pub start: usize,
    /// The current break.
    pub brk: usize,
}

pub struct Process {
    pid: Pid,
    parent: Option<Pid>,
    name: SpinLock<String>,
    space: SpinLock<Arc<AddrSpace>>,
    fds: SpinLock<FdTable>,
    /// Current working directory, as a path in the collaborator's name
    /// space.
    cwd: SpinLock<String>,
    brk: SpinLock<BrkRange>,
    regs: SpinLock<TrapFrame>,
    errno: AtomicI32,
    state: SpinLock<ProcState>,
    cancelled: AtomicBool,
}

impl Process {
    /// Creates a process with a fresh, empty address space and registers it
    /// with the system.
    ///
    /// # Errors
    /// Returns `ENOMEM` if the address space cannot be allocated.
    pub fn spawn(sys: &Arc<MemSystem>, name: &str) -> SysResult<Arc<Self>> {
        let space = AddrSpace::build(sys)?;
        let proc = Arc::new(Self {
            pid: sys.alloc_pid(),
            parent: None,
            name: SpinLock::new(truncate_name(name)),
            space: SpinLock::new(space),
            fds: SpinLock::new(FdTable::new()),
            cwd: SpinLock::new(String::from("/")),
            brk: SpinLock::new(BrkRange::default()),
            regs: SpinLock::new(TrapFrame::default()),
            errno: AtomicI32::new(0),
            state: SpinLock::new(ProcState::Runnable),
            cancelled: AtomicBool::new(false),
        });
        sys.register_process(&proc);
        Ok(proc)
    }

    /// Creates the child of `parent` over an already-cloned address space.
    /// The child inherits the name, the file table, the break, and the
    /// parent's saved registers with the return-value register zeroed.
    pub(crate) fn fork_from(
        sys: &Arc<MemSystem>,
        parent: &Arc<Process>,
        space: Arc<AddrSpace>,
    ) -> Arc<Self> {
        let mut regs = parent.regs();
        regs.ret = 0;
        let child = Arc::new(Self {
            pid: sys.alloc_pid(),
            parent: Some(parent.pid),
            name: SpinLock::new(parent.name()),
            space: SpinLock::new(space),
            fds: SpinLock::new(parent.fds.lock().duplicate()),
            cwd: SpinLock::new(parent.cwd()),
            brk: SpinLock::new(*parent.brk.lock()),
            regs: SpinLock::new(regs),
            errno: AtomicI32::new(0),
            state: SpinLock::new(ProcState::Runnable),
            cancelled: AtomicBool::new(false),
        });
        sys.register_process(&child);
        child
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock() = truncate_name(name);
    }

    /// The process's address space.
    pub fn space(&self) -> Arc<AddrSpace> {
        Arc::clone(&self.space.lock())
    }

    /// Replaces the address space, returning the old one. Used by the
    /// `execve` commit step.
    pub(crate) fn swap_space(&self, new: Arc<AddrSpace>) -> Arc<AddrSpace> {
        core::mem::replace(&mut *self.space.lock(), new)
    }

    /// Runs `f` on the file table.
    pub fn with_fds<R>(&self, f: impl FnOnce(&mut FdTable) -> R) -> R {
        f(&mut self.fds.lock())
    }

    pub fn cwd(&self) -> String {
        self.cwd.lock().clone()
    }

    pub fn set_cwd(&self, cwd: &str) {
        *self.cwd.lock() = String::from(cwd);
    }

    pub fn brk_range(&self) -> BrkRange {
        *self.brk.lock()
    }

    pub(crate) fn set_brk(&self, brk: usize) {
        self.brk.lock().brk = brk;
    }

    /// Resets the data region after `execve`: break and starting break both
    /// sit at the first page above the loaded image.
    pub(crate) fn reset_brk(&self, start: usize) {
        *self.brk.lock() = BrkRange { start, brk: start };
    }

    pub fn regs(&self) -> TrapFrame {
        *self.regs.lock()
    }

    pub fn set_regs(&self, regs: TrapFrame) {
        *self.regs.lock() = regs;
    }

    /// The errno slot syscall errors are reported through.
    pub fn errno(&self) -> i32 {
        self.errno.load(Ordering::Relaxed)
    }

    pub fn set_errno(&self, err: SysError) {
        self.errno.store(err.code(), Ordering::Relaxed);
    }

    pub fn state(&self) -> ProcState {
        *self.state.lock()
    }

    /// Terminates the process with `err` as its exit status. Used by the
    /// fault path; the scheduler collaborator reaps the process.
    pub fn terminate(&self, err: SysError) {
        log::warn!(
            "[{}:{}] terminated: {err:?}",
            self.pid,
            &*self.name.lock()
        );
        *self.state.lock() = ProcState::Exited(err.code());
    }

    pub fn is_exited(&self) -> bool {
        matches!(self.state(), ProcState::Exited(_))
    }

    /// Flags the process as cancelled; cancellable sleeps observe the flag
    /// and unwind.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

fn truncate_name(name: &str) -> String {
    match name.char_indices().nth(PROC_NAME_LEN) {
        Some((idx, _)) => name[..idx].to_string(),
        None => name.to_string(),
    }
}
