//! The memory system's runtime context.
//!
//! All machine-wide state (installed RAM, the page allocator, the frame
//! cache, the pageout daemon's channels, the simulated TLB, the process
//! table) hangs off one [`MemSystem`] value passed explicitly to the core
//! entry points. There is no ambient global state, so a test can construct
//! a machine with a tiny memory budget, and several machines can coexist.

use alloc::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use config::mm::{kernel_reserved_frames, pageout_free_min, pageout_free_target};
use executor::Task;
use mm::frame::FrameAllocator;
use mutex::SpinLock;
use systype::SysResult;

use crate::{
    fs::{Vfs, Vnode},
    task::{Pid, Process},
    vm::{
        addr_space::{AddrSpace, SpaceId},
        frame_cache::FrameCache,
        memobj::{MemObj, ObjId},
        page_table::Tlb,
        pageout::{self, PageoutControl},
        vm_area::AreaId,
    },
};

/// Boot-time tunables of a [`MemSystem`].
#[derive(Debug, Clone)]
pub struct MemConfig {
    /// Installed RAM, in page frames.
    pub ram_pages: usize,
    /// Frames kept back for the kernel's small-object allocator; defaults
    /// to the configured fraction of installed RAM.
    pub kernel_reserved: Option<usize>,
    /// Low watermark of free frames; defaults to a fraction of the usable
    /// pool.
    pub freepages_min: Option<usize>,
    /// Free-frame count the pageout daemon reclaims up to; defaults to a
    /// fraction of the usable pool.
    pub freepages_target: Option<usize>,
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            ram_pages: 8192,
            kernel_reserved: None,
            freepages_min: None,
            freepages_target: None,
        }
    }
}

/// One machine's memory system.
pub struct MemSystem {
    pub frames: Arc<FrameAllocator>,
    pub cache: FrameCache,
    pub pageout: PageoutControl,
    pub tlb: Tlb,
    /// The filesystem collaborator.
    pub vfs: Arc<dyn Vfs>,
    /// Per-inode memory objects, so every mapping of one file aliases one
    /// object. The references are weak: an object's lifetime is driven by
    /// the areas and shadows referencing it, never by the registry, and a
    /// dying object unregisters itself.
    file_objs: SpinLock<BTreeMap<u64, (ObjId, Weak<MemObj>)>>,
    procs: SpinLock<BTreeMap<Pid, Arc<Process>>>,
    current_space: SpinLock<Option<SpaceId>>,
    pageoutd_task: SpinLock<Option<Task<()>>>,
    next_obj_id: AtomicU64,
    next_space_id: AtomicU64,
    next_area_id: AtomicU64,
    next_pid: AtomicU32,
}

impl MemSystem {
    /// Boots a memory system over fresh RAM.
    pub fn new(config: MemConfig, vfs: Arc<dyn Vfs>) -> Arc<Self> {
        let reserved = config
            .kernel_reserved
            .unwrap_or_else(|| kernel_reserved_frames(config.ram_pages));
        let frames = Arc::new(FrameAllocator::new(config.ram_pages, reserved));
        let usable = frames.total_usable();
        let min = config.freepages_min.unwrap_or_else(|| pageout_free_min(usable));
        let target = config
            .freepages_target
            .unwrap_or_else(|| pageout_free_target(usable))
            .max(min);
        log::info!(
            "mem: {} frames installed, {usable} usable, watermarks {min}/{target}",
            config.ram_pages
        );
        Arc::new(Self {
            cache: FrameCache::new(Arc::clone(&frames)),
            pageout: PageoutControl::new(min, target),
            tlb: Tlb::new(),
            vfs,
            frames,
            file_objs: SpinLock::new(BTreeMap::new()),
            procs: SpinLock::new(BTreeMap::new()),
            current_space: SpinLock::new(None),
            pageoutd_task: SpinLock::new(None),
            next_obj_id: AtomicU64::new(1),
            next_space_id: AtomicU64::new(1),
            next_area_id: AtomicU64::new(1),
            next_pid: AtomicU32::new(1),
        })
    }

    pub(crate) fn alloc_obj_id(&self) -> ObjId {
        self.next_obj_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn alloc_space_id(&self) -> SpaceId {
        self.next_space_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn alloc_area_id(&self) -> AreaId {
        self.next_area_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn alloc_pid(&self) -> Pid {
        self.next_pid.fetch_add(1, Ordering::Relaxed)
    }

    /// The memory object of an inode, created on first use. Every mapping
    /// of one file shares this object, which is what makes `MAP_SHARED`
    /// coherent across processes. An inode whose object has died gets a
    /// fresh one.
    pub fn file_object(self: &Arc<Self>, vnode: &Arc<dyn Vnode>) -> Arc<MemObj> {
        let mut objs = self.file_objs.lock();
        if let Some((_, weak)) = objs.get(&vnode.ino()) {
            if let Some(obj) = weak.upgrade() {
                return obj;
            }
        }
        let obj = MemObj::new_file(self, Arc::clone(vnode));
        objs.insert(vnode.ino(), (obj.id(), Arc::downgrade(&obj)));
        obj
    }

    /// Unregisters a dying file object. A newer object for the same inode
    /// is left alone.
    pub(crate) fn forget_file_object(&self, ino: u64, id: ObjId) {
        let mut objs = self.file_objs.lock();
        if objs.get(&ino).is_some_and(|(cur, _)| *cur == id) {
            objs.remove(&ino);
        }
    }

    pub(crate) fn register_process(&self, proc: &Arc<Process>) {
        self.procs.lock().insert(proc.pid(), Arc::clone(proc));
    }

    pub fn process(&self, pid: Pid) -> Option<Arc<Process>> {
        self.procs.lock().get(&pid).cloned()
    }

    /// Drops the system's reference to a process; called by the scheduler
    /// collaborator when the process is reaped.
    pub fn reap_process(&self, pid: Pid) {
        self.procs.lock().remove(&pid);
    }

    /// Makes `space`'s translation current. Does not flush the TLB; the
    /// caller invalidates what it must.
    pub fn activate(&self, space: &AddrSpace) {
        *self.current_space.lock() = Some(space.id());
    }

    pub fn is_active(&self, space: &AddrSpace) -> bool {
        *self.current_space.lock() == Some(space.id())
    }

    /// Spawns the pageout daemon onto the executor.
    pub fn start_pageoutd(self: &Arc<Self>) {
        let task = executor::spawn(pageout::pageoutd(Arc::clone(self)));
        *self.pageoutd_task.lock() = Some(task);
    }

    /// Cancels the pageout daemon and waits for it to exit.
    pub async fn stop_pageoutd(&self) {
        let task = self.pageoutd_task.lock().take();
        if let Some(task) = task {
            self.pageout.cancel();
            task.await;
        }
    }

    /// Writes every dirty cached frame back to its backing store.
    pub async fn sync(self: &Arc<Self>) -> SysResult<()> {
        self.cache.clean_all(self).await
    }
}
