//! Memory objects: the polymorphic sources of pages.
//!
//! A memory object answers one question: what are the current contents of
//! page `n`? Three kinds exist:
//! - *file-backed*: pages come from a vnode and dirty pages are written
//!   back to it;
//! - *anonymous-zero*: pages start out zero-filled and are pinned, since no
//!   other copy of their data exists;
//! - *shadow*: a copy-on-write overlay in front of a parent object. Reads
//!   fall through to the parent until the first write diverts a private
//!   copy into the shadow.
//!
//! Objects are reference-counted with `Arc`; the inbound references are
//! virtual areas and child shadows' parent links. Cached frames and the
//! per-inode registry hold only weak back-references, so dropping the last
//! real reference destroys the object and frees all of its resident
//! frames; a dying file object also unregisters its inode.
//!
//! Shadow chains deepen on every fork. They are collapsed lazily during
//! lookup: when a shadow's parent is itself a shadow referenced by nothing
//! but this one child, the parent's frames migrate down into the child
//! (skipping pages the child already owns, which are newer) and the parent
//! is unlinked. Migration is the frame cache's `migrate` operation and is
//! the only operation that mutates another object's resident set.

use alloc::{
    boxed::Box,
    collections::BTreeSet,
    sync::{Arc, Weak},
    vec::Vec,
};

use config::mm::PAGE_SIZE;
use mm::address::PhysPageNum;
use mutex::SpinLock;
use systype::{ASysResult, SysError, SysResult};

use crate::{
    fs::Vnode,
    runtime::MemSystem,
    vm::{addr_space::AddrSpace, frame_cache::FrameId, vm_area::AreaId},
};

pub type ObjId = u64;

/// A virtual area registered on the bottom object of its backing chain.
/// Used to find and invalidate page-table entries when a frame of the
/// chain is evicted or cleaned.
pub struct AreaBinding {
    pub space: Weak<AddrSpace>,
    pub area: AreaId,
}

/// A source of pages. See the module documentation.
pub struct MemObj {
    id: ObjId,
    sys: Weak<MemSystem>,
    kind: MemObjKind,
    /// Frames of this object currently resident in the frame cache.
    /// Maintained by the cache.
    resident: SpinLock<BTreeSet<FrameId>>,
    /// Areas whose backing chain bottoms out at this object.
    bottom_areas: SpinLock<Vec<AreaBinding>>,
}

/// The variant-specific state of a memory object.
pub enum MemObjKind {
    File { vnode: Arc<dyn Vnode> },
    Anon,
    Shadow { parent: SpinLock<Arc<MemObj>> },
}

impl MemObj {
    fn build(sys: &Arc<MemSystem>, kind: MemObjKind) -> Arc<Self> {
        Arc::new(Self {
            id: sys.alloc_obj_id(),
            sys: Arc::downgrade(sys),
            kind,
            resident: SpinLock::new(BTreeSet::new()),
            bottom_areas: SpinLock::new(Vec::new()),
        })
    }

    /// Creates an anonymous-zero object.
    pub fn new_anon(sys: &Arc<MemSystem>) -> Arc<Self> {
        Self::build(sys, MemObjKind::Anon)
    }

    /// Creates a shadow overlaying `parent`.
    pub fn new_shadow(sys: &Arc<MemSystem>, parent: Arc<MemObj>) -> Arc<Self> {
        Self::build(
            sys,
            MemObjKind::Shadow {
                parent: SpinLock::new(parent),
            },
        )
    }

    /// Creates a file-backed object. Callers go through
    /// [`MemSystem::file_object`] so each inode aliases one object.
    pub(crate) fn new_file(sys: &Arc<MemSystem>, vnode: Arc<dyn Vnode>) -> Arc<Self> {
        Self::build(sys, MemObjKind::File { vnode })
    }

    pub fn id(&self) -> ObjId {
        self.id
    }

    pub fn is_shadow(&self) -> bool {
        matches!(self.kind, MemObjKind::Shadow { .. })
    }

    /// Whether this object's pages are pinned while resident. Anonymous and
    /// shadow pages have no backing store to reload them from.
    pub fn pins_pages(&self) -> bool {
        !matches!(self.kind, MemObjKind::File { .. })
    }

    /// The shadow's current parent, if this is a shadow.
    pub fn parent(&self) -> Option<Arc<MemObj>> {
        match &self.kind {
            MemObjKind::Shadow { parent } => Some(parent.lock().clone()),
            _ => None,
        }
    }

    /// Walks to the bottom of the backing chain.
    pub fn bottom_object(self: &Arc<Self>) -> Arc<MemObj> {
        let mut cur = Arc::clone(self);
        loop {
            let next = match &cur.kind {
                MemObjKind::Shadow { parent } => parent.lock().clone(),
                _ => return cur,
            };
            cur = next;
        }
    }

    /// Number of this object's pages resident in the cache.
    pub fn resident_count(&self) -> usize {
        self.resident.lock().len()
    }

    pub(crate) fn resident_frames(&self) -> Vec<FrameId> {
        self.resident.lock().iter().copied().collect()
    }

    pub(crate) fn note_resident_insert(&self, frame: FrameId) {
        self.resident.lock().insert(frame);
    }

    pub(crate) fn note_resident_remove(&self, frame: FrameId) {
        self.resident.lock().remove(&frame);
    }

    pub(crate) fn register_area(&self, binding: AreaBinding) {
        self.bottom_areas.lock().push(binding);
    }

    pub(crate) fn deregister_area(&self, area: AreaId) {
        self.bottom_areas.lock().retain(|b| b.area != area);
    }

    pub(crate) fn with_bindings(&self, mut f: impl FnMut(&AreaBinding)) {
        for binding in self.bottom_areas.lock().iter() {
            f(binding);
        }
    }

    /// Returns a frame holding the current contents of page `pagenum`.
    ///
    /// With `for_write` set on a shadow, the returned frame belongs to the
    /// shadow itself: a miss copies the page from the parent chain into a
    /// fresh private frame. Without it, the topmost resident copy on the
    /// chain is returned, falling through to the bottom object.
    ///
    /// May suspend to fill pages or to reclaim memory.
    pub fn lookup_page(
        self: &Arc<Self>,
        sys: &Arc<MemSystem>,
        pagenum: usize,
        for_write: bool,
    ) -> ASysResult<'static, FrameId> {
        let obj = Arc::clone(self);
        let sys = Arc::clone(sys);
        Box::pin(async move {
            if !obj.is_shadow() {
                return sys.cache.get(&sys, &obj, pagenum).await;
            }
            collapse_chain(&obj, &sys).await?;
            if for_write {
                return sys.cache.get(&sys, &obj, pagenum).await;
            }
            let mut cur = Arc::clone(&obj);
            loop {
                if !cur.is_shadow() {
                    return sys.cache.get(&sys, &cur, pagenum).await;
                }
                if let Some(frame) = sys.cache.get_resident_settled(&cur, pagenum).await {
                    return Ok(frame);
                }
                let next = cur.parent().expect("walked off a shadow chain");
                cur = next;
            }
        })
    }

    /// Populates a freshly allocated, busy frame with page `pagenum`'s
    /// data. Called by the frame cache on a miss; may suspend.
    pub(crate) fn fill_page(
        self: &Arc<Self>,
        sys: &Arc<MemSystem>,
        pagenum: usize,
        frame: FrameId,
    ) -> ASysResult<'static, ()> {
        let obj = Arc::clone(self);
        let sys = Arc::clone(sys);
        Box::pin(async move {
            match &obj.kind {
                MemObjKind::Anon => {
                    let ppn = sys.cache.frame_ppn(frame);
                    sys.frames.frame_slice_mut(ppn).fill(0);
                    sys.cache.pin(frame);
                    Ok(())
                }
                MemObjKind::File { vnode } => {
                    let off = pagenum * PAGE_SIZE;
                    if off >= vnode.len() {
                        return Err(SysError::EFAULT);
                    }
                    let ppn = sys.cache.frame_ppn(frame);
                    let buf = sys.frames.frame_slice_mut(ppn);
                    let n = vnode.read_at(off, buf).await?;
                    buf[n..].fill(0);
                    Ok(())
                }
                MemObjKind::Shadow { parent } => {
                    let src_obj = parent.lock().clone();
                    let src = src_obj.lookup_page(&sys, pagenum, false).await?;
                    let src_ppn = sys.cache.frame_ppn(src);
                    let dst_ppn = sys.cache.frame_ppn(frame);
                    // No suspension between the lookup and this copy, so the
                    // source frame cannot be reclaimed under us.
                    sys.frames
                        .frame_slice_mut(dst_ppn)
                        .copy_from_slice(sys.frames.frame_slice(src_ppn));
                    sys.cache.pin(frame);
                    Ok(())
                }
            }
        })
    }

    /// Called before a frame of page `pagenum` is first modified, letting
    /// the object reserve backing storage.
    ///
    /// # Errors
    /// File-backed objects may fail with `ENOSPC`.
    pub(crate) async fn dirty_page(&self, pagenum: usize) -> SysResult<()> {
        match &self.kind {
            MemObjKind::File { vnode } => vnode.reserve_at(pagenum * PAGE_SIZE, PAGE_SIZE).await,
            _ => Ok(()),
        }
    }

    /// Writes a frame's contents back to the object's canonical store.
    /// A no-op for anonymous and shadow objects, whose frames are the only
    /// copy.
    pub(crate) async fn clean_page(
        &self,
        sys: &MemSystem,
        pagenum: usize,
        ppn: PhysPageNum,
    ) -> SysResult<()> {
        match &self.kind {
            MemObjKind::File { vnode } => {
                let off = pagenum * PAGE_SIZE;
                let len = vnode.len().saturating_sub(off).min(PAGE_SIZE);
                if len == 0 {
                    return Ok(());
                }
                let data = sys.frames.frame_slice(ppn);
                vnode.write_at(off, &data[..len]).await.map(|_| ())
            }
            _ => Ok(()),
        }
    }

}

impl Drop for MemObj {
    fn drop(&mut self) {
        if let Some(sys) = self.sys.upgrade() {
            if let MemObjKind::File { vnode } = &self.kind {
                sys.forget_file_object(vnode.ino(), self.id);
            }
            sys.cache.release_object_frames(self);
        }
    }
}

/// Collapses the top of a shadow chain.
///
/// While `top`'s parent is itself a shadow referenced only through `top`,
/// the parent's frames migrate into `top` and `top` is relinked to its
/// grandparent. Both children of a fork keep correct views: pages `top`
/// already owned are newer and win; everything else was visible through the
/// parent before and is visible in `top` after.
pub(crate) async fn collapse_chain(top: &Arc<MemObj>, sys: &Arc<MemSystem>) -> SysResult<()> {
    loop {
        let parent = match &top.kind {
            MemObjKind::Shadow { parent } => parent.lock().clone(),
            _ => return Ok(()),
        };
        if !parent.is_shadow() {
            return Ok(());
        }
        // Two counted references: the chain link and our local clone.
        // Anything more means another area or child still sees the parent.
        if Arc::strong_count(&parent) > 2 {
            return Ok(());
        }
        log::debug!("shadow {}: collapsing into {}", parent.id, top.id);
        for frame in parent.resident_frames() {
            sys.cache.migrate(sys, frame, top).await?;
        }
        let grand = parent.parent().expect("collapsed parent is a shadow");
        match &top.kind {
            MemObjKind::Shadow { parent: link } => *link.lock() = grand,
            _ => unreachable!("collapse walked off a shadow"),
        }
        // The parent's last reference drops here; it has no frames left.
    }
}
